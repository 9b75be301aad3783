/*!
 * Connection state
 *
 * A `Conn` is one in-flight HTTP exchange: the transport sock, the parsed
 * request, both header sets, byte accounting and the per-connection storage
 * slots. A Conn is owned by exactly one thread from dequeue until close; the
 * slot table is only ever touched by that thread.
 */

use std::io::{self, Write as _};
use std::time::{Instant, SystemTime};

use base64::Engine as _;
use bitflags::bitflags;
use thiserror::Error;

use crate::cls::ClsSlots;
use crate::config::{HeaderCase, LimitsSection};
use crate::driver::{DriverRef, Sock};
use crate::http::response::reason_phrase;
use crate::http::{error_body, HeaderSet, HttpVersion, ProtocolError, Request};
use crate::script::InterpHandle;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ConnFlags: u32 {
        /// The exchange is finished; the sock is gone.
        const CLOSED   = 0b00001;
        /// Do not emit the status line and headers.
        const SKIPHDRS = 0b00010;
        /// Do not emit the response body (HEAD requests).
        const SKIPBODY = 0b00100;
        /// The response was marked eligible for keep-alive.
        const KEEPALIVE = 0b01000;
        /// Admission control queued this connection past the soft limit.
        const OVERFLOW = 0b10000;
    }
}

/// Failures while reading a request: transport errors and protocol errors
/// part ways here, because only the latter get a 4xx response.
#[derive(Debug, Error)]
pub enum ConnReadError {
    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

const READAHEAD: usize = 4096;

/// One HTTP request/response exchange.
pub struct Conn {
    pub id: u64,
    pub driver: DriverRef,
    sock: Option<Box<dyn Sock>>,
    pub start: Instant,
    pub start_time: SystemTime,

    pub request: Option<Request>,
    pub headers: HeaderSet,
    pub output_headers: HeaderSet,
    pub auth_user: Option<String>,
    pub auth_password: Option<String>,

    pub content_length: Option<u64>,
    content_read: u64,
    content_sent: u64,
    pub response_status: u16,
    pub response_length: Option<u64>,
    pub(crate) recursion: u32,

    pub flags: ConnFlags,
    headers_flushed: bool,
    pub cls: ClsSlots,
    pub interp: Option<Box<dyn InterpHandle>>,

    // read-ahead buffer consumed before the sock is touched again
    read_buf: Vec<u8>,
    read_pos: usize,
}

impl Conn {
    pub fn new(id: u64, driver: DriverRef, sock: Box<dyn Sock>, case: HeaderCase) -> Self {
        Conn {
            id,
            driver,
            sock: Some(sock),
            start: Instant::now(),
            start_time: SystemTime::now(),
            request: None,
            headers: HeaderSet::new(case),
            output_headers: HeaderSet::new(case),
            auth_user: None,
            auth_password: None,
            content_length: None,
            content_read: 0,
            content_sent: 0,
            response_status: 200,
            response_length: None,
            recursion: 0,
            flags: ConnFlags::empty(),
            headers_flushed: false,
            cls: ClsSlots::new(),
            interp: None,
            read_buf: Vec::new(),
            read_pos: 0,
        }
    }

    pub fn peer(&self) -> Option<std::net::SocketAddr> {
        self.sock.as_ref().and_then(|s| s.peer())
    }

    pub fn content_read(&self) -> u64 {
        self.content_read
    }

    pub fn content_sent(&self) -> u64 {
        self.content_sent
    }

    pub fn headers_flushed(&self) -> bool {
        self.headers_flushed
    }

    fn sock(&mut self) -> io::Result<&mut Box<dyn Sock>> {
        self.sock
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection closed"))
    }

    /// Read into `buf`, serving buffered read-ahead bytes first.
    pub fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.read_pos < self.read_buf.len() {
            let n = (self.read_buf.len() - self.read_pos).min(buf.len());
            buf[..n].copy_from_slice(&self.read_buf[self.read_pos..self.read_pos + n]);
            self.read_pos += n;
            return Ok(n);
        }
        self.sock()?.read(buf)
    }

    fn fill(&mut self) -> io::Result<usize> {
        if self.read_pos == self.read_buf.len() {
            self.read_buf.clear();
            self.read_pos = 0;
        }
        let mut chunk = [0u8; READAHEAD];
        let n = self.sock()?.read(&mut chunk)?;
        self.read_buf.extend_from_slice(&chunk[..n]);
        Ok(n)
    }

    /// Read one line, stripped of CRLF. `Ok(None)` means EOF before any
    /// byte. A line longer than `maxline` is a protocol error.
    pub fn read_line(&mut self, maxline: usize) -> Result<Option<String>, ConnReadError> {
        loop {
            if let Some(nl) = self.read_buf[self.read_pos..].iter().position(|&b| b == b'\n') {
                let mut line: Vec<u8> =
                    self.read_buf[self.read_pos..self.read_pos + nl].to_vec();
                self.read_pos += nl + 1;
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                // the budget is on the line proper, CRLF excluded
                if line.len() > maxline {
                    return Err(ProtocolError::LineTooLong(maxline).into());
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }
            if self.read_buf.len() - self.read_pos > maxline + 2 {
                return Err(ProtocolError::LineTooLong(maxline).into());
            }
            if self.fill()? == 0 {
                if self.read_pos < self.read_buf.len() {
                    // trailing line without newline
                    let line = String::from_utf8_lossy(&self.read_buf[self.read_pos..])
                        .into_owned();
                    self.read_pos = self.read_buf.len();
                    return Ok(Some(line));
                }
                return Ok(None);
            }
        }
    }

    /// Read the request line and headers, enforcing the per-line and total
    /// byte budgets, and capture content length and basic credentials.
    pub fn read_request(&mut self, limits: &LimitsSection) -> Result<(), ConnReadError> {
        let line = self
            .read_line(limits.maxline)?
            .ok_or(ProtocolError::BadRequestLine)?;
        let mut budget = limits
            .maxheaders
            .checked_sub(line.len())
            .ok_or(ProtocolError::HeadersTooLarge(limits.maxheaders))?;
        let request = Request::parse(&line)?;
        let is_09 = request.version == HttpVersion::V09;
        self.request = Some(request);
        if is_09 {
            // no headers follow an HTTP/0.9 request line
            return Ok(());
        }

        loop {
            let line = match self.read_line(limits.maxline)? {
                Some(line) => line,
                None => break,
            };
            if line.is_empty() {
                break;
            }
            budget = budget
                .checked_sub(line.len())
                .ok_or(ProtocolError::HeadersTooLarge(limits.maxheaders))?;
            if line.starts_with(' ') || line.starts_with('\t') {
                // folded continuation of the previous field
                self.headers.extend_last(line.trim());
                continue;
            }
            if !self.headers.parse_add(&line) {
                return Err(ProtocolError::BadHeader(line).into());
            }
        }

        if let Some(value) = self.headers.get("Content-Length") {
            let length: u64 = value
                .trim()
                .parse()
                .map_err(|_| ProtocolError::BadContentLength(value.to_string()))?;
            self.content_length = Some(length);
        }
        self.parse_authorization();
        Ok(())
    }

    fn parse_authorization(&mut self) {
        let Some(value) = self.headers.get("Authorization") else {
            return;
        };
        let Some(encoded) = value.strip_prefix("Basic ").map(str::trim) else {
            return;
        };
        let Ok(decoded) = base64::engine::general_purpose::STANDARD.decode(encoded) else {
            return;
        };
        let decoded = String::from_utf8_lossy(&decoded).into_owned();
        match decoded.split_once(':') {
            Some((user, password)) => {
                self.auth_user = Some(user.to_string());
                self.auth_password = Some(password.to_string());
            }
            None => self.auth_user = Some(decoded),
        }
    }

    /// Read request content, never past the declared content length.
    pub fn read_content(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = match self.content_length {
            Some(length) => length.saturating_sub(self.content_read),
            None => 0,
        };
        if remaining == 0 {
            return Ok(0);
        }
        let want = (remaining as usize).min(buf.len());
        let n = self.read(&mut buf[..want])?;
        self.content_read += n as u64;
        Ok(n)
    }

    /// Consume any request content left unread.
    pub fn drain_content(&mut self) -> io::Result<u64> {
        let mut drained = 0u64;
        let mut buf = [0u8; READAHEAD];
        loop {
            let n = self.read_content(&mut buf)?;
            if n == 0 {
                return Ok(drained);
            }
            drained += n as u64;
        }
    }

    /// Write the whole buffer, looping over short writes.
    pub fn write(&mut self, mut buf: &[u8]) -> io::Result<()> {
        let sock = self.sock()?;
        while !buf.is_empty() {
            let n = sock.write(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "peer gone"));
            }
            buf = &buf[n..];
        }
        Ok(())
    }

    /// Write response content, counting bytes toward the declared length.
    pub fn write_content(&mut self, buf: &[u8]) -> io::Result<()> {
        self.write(buf)?;
        self.content_sent += buf.len() as u64;
        Ok(())
    }

    /// Send file content as the response body.
    pub fn send_file(&mut self, file: &mut std::fs::File, nbytes: u64) -> io::Result<u64> {
        let sent = self.sock()?.send_file(file, nbytes)?;
        self.content_sent += sent;
        Ok(sent)
    }

    /// Whether the response qualifies for keep-alive at header time: feature
    /// on, `GET`, a declared length, status 200, and the client asked for it.
    /// The final length check happens at close.
    fn wants_keepalive(&self, keepalive_enabled: bool) -> bool {
        let Some(request) = self.request.as_ref() else {
            return false;
        };
        keepalive_enabled
            && request.version != HttpVersion::V09
            && request.method == "GET"
            && self.response_status == 200
            && self.response_length.is_some()
            && self
                .headers
                .get("Connection")
                .is_some_and(|v| v.eq_ignore_ascii_case("keep-alive"))
    }

    /// Emit `HTTP/1.0 <status> <reason>`, the output headers in insertion
    /// order, and the connection header. A second call is a no-op, as is the
    /// whole thing for HTTP/0.9 requests and `SKIPHDRS` connections.
    pub fn flush_headers(&mut self, keepalive_enabled: bool) -> io::Result<()> {
        if self.headers_flushed {
            return Ok(());
        }
        self.headers_flushed = true;
        if self.flags.contains(ConnFlags::SKIPHDRS) {
            return Ok(());
        }
        if let Some(request) = self.request.as_ref() {
            if request.version == HttpVersion::V09 {
                return Ok(());
            }
        }

        if self.wants_keepalive(keepalive_enabled) {
            self.flags.insert(ConnFlags::KEEPALIVE);
        }
        let mut out = Vec::with_capacity(256);
        write!(
            out,
            "HTTP/1.0 {} {}\r\n",
            self.response_status,
            reason_phrase(self.response_status)
        )?;
        if let Some(length) = self.response_length {
            if self.output_headers.get("Content-Length").is_none() {
                write!(out, "Content-Length: {}\r\n", length)?;
            }
        }
        for (name, value) in self.output_headers.iter() {
            write!(out, "{}: {}\r\n", name, value)?;
        }
        let connection = if self.flags.contains(ConnFlags::KEEPALIVE) {
            "keep-alive"
        } else {
            "close"
        };
        write!(out, "Connection: {}\r\n\r\n", connection)?;
        self.write(&out)
    }

    /// Complete response helper: status, content type, body.
    pub fn return_data(
        &mut self,
        status: u16,
        content_type: &str,
        body: &[u8],
        keepalive_enabled: bool,
    ) -> io::Result<()> {
        self.response_status = status;
        self.response_length = Some(body.len() as u64);
        self.output_headers.set("Content-Type", content_type);
        self.flush_headers(keepalive_enabled)?;
        if !self.flags.contains(ConnFlags::SKIPBODY) {
            self.write_content(body)?;
        }
        Ok(())
    }

    /// Short HTML error response, padded to the configured minimum size.
    pub fn return_error(&mut self, status: u16, min_size: usize) -> io::Result<()> {
        let body = error_body(status, min_size);
        self.return_data(status, "text/html", body.as_bytes(), false)
    }

    /// Respond with `length` bytes from an open file. Bodies at or above
    /// `sendfdmin` go down the transport's descriptor fast path; smaller
    /// ones through the buffered loop.
    pub fn return_file(
        &mut self,
        status: u16,
        content_type: &str,
        file: &mut std::fs::File,
        length: u64,
        limits: &LimitsSection,
        keepalive_enabled: bool,
    ) -> io::Result<()> {
        self.response_status = status;
        self.response_length = Some(length);
        self.output_headers.set("Content-Type", content_type);
        self.flush_headers(keepalive_enabled)?;
        if self.flags.contains(ConnFlags::SKIPBODY) {
            return Ok(());
        }
        if length >= limits.sendfdmin {
            self.send_file(file, length)?;
        } else {
            use std::io::Read as _;
            let mut remaining = length;
            let mut buf = [0u8; READAHEAD];
            while remaining > 0 {
                let want = (remaining as usize).min(buf.len());
                let n = file.read(&mut buf[..want])?;
                if n == 0 {
                    break;
                }
                self.write_content(&buf[..n])?;
                remaining -= n as u64;
            }
        }
        Ok(())
    }

    /// Keep-alive is final only when the declared length matches what was
    /// actually sent.
    pub fn keepalive_ready(&self) -> bool {
        self.flags.contains(ConnFlags::KEEPALIVE)
            && self.response_length == Some(self.content_sent)
            && self.sock_parkable()
    }

    /// Whether the transport can be detached and watched by descriptor.
    pub fn sock_parkable(&self) -> bool {
        self.sock
            .as_ref()
            .is_some_and(|s| s.detachable() && s.raw_fd().is_some())
    }

    /// Detach the transport state for the keep-alive waiter.
    pub fn detach_sock(&mut self) -> Option<Box<dyn Sock>> {
        self.sock.take()
    }

    /// Run slot cleanups and drop the sock if still attached.
    pub fn close(&mut self) {
        self.cls.cleanup();
        self.sock = None;
        self.flags.insert(ConnFlags::CLOSED);
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("driver", &self.driver.name())
            .field("request", &self.request.as_ref().map(|r| r.line.clone()))
            .field("status", &self.response_status)
            .field("flags", &self.flags)
            .finish()
    }
}
