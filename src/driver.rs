/*!
 * Transport drivers
 *
 * A driver binds connections to a concrete transport. The listener side
 * ([`Driver`]) accepts sockets and describes the endpoint; the per-connection
 * side ([`Sock`]) carries the transport-private state and does the actual
 * I/O. Alternate transports (TLS, unix sockets) implement the same pair of
 * traits; the engine never touches a raw socket outside of them.
 */

use std::fs::File;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;

/// Per-connection transport state.
///
/// Closing a sock is dropping it. A sock whose [`raw_fd`](Sock::raw_fd)
/// returns `None`, or that is not [`detachable`](Sock::detachable), cannot be
/// parked in the keep-alive waiter.
pub trait Sock: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    fn peer(&self) -> Option<SocketAddr>;

    /// Raw descriptor for event-loop monitoring.
    fn raw_fd(&self) -> Option<RawFd>;

    /// Whether the sock may be detached from its connection and parked
    /// between requests. Transports with buffered state say no.
    fn detachable(&self) -> bool;

    /// Send `nbytes` from an open file down the transport.
    fn send_file(&mut self, file: &mut File, nbytes: u64) -> io::Result<u64> {
        let mut sent = 0u64;
        let mut buf = [0u8; 16 * 1024];
        while sent < nbytes {
            let want = ((nbytes - sent) as usize).min(buf.len());
            let n = file.read(&mut buf[..want])?;
            if n == 0 {
                break;
            }
            let mut off = 0;
            while off < n {
                off += self.write(&buf[off..n])?;
            }
            sent += n as u64;
        }
        Ok(sent)
    }
}

/// A named transport endpoint.
pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn host(&self) -> &str;

    fn port(&self) -> u16;

    /// Location URL for redirects, e.g. `http://host:8080`.
    fn location(&self) -> String {
        if self.port() == 80 {
            format!("http://{}", self.host())
        } else {
            format!("http://{}:{}", self.host(), self.port())
        }
    }

    /// Wrap an accepted stream in this driver's transport state.
    fn wrap(&self, stream: TcpStream, peer: SocketAddr) -> Box<dyn Sock>;
}

/// Plain TCP driver.
#[derive(Debug)]
pub struct TcpDriver {
    name: String,
    host: String,
    port: u16,
    /// Receive timeout applied to accepted sockets; slow clients cannot pin
    /// a worker forever.
    recv_timeout: Option<Duration>,
}

impl TcpDriver {
    pub fn new(name: &str, host: &str, port: u16, recv_timeout: Option<Duration>) -> Self {
        TcpDriver {
            name: name.to_string(),
            host: host.to_string(),
            port,
            recv_timeout,
        }
    }
}

impl Driver for TcpDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn host(&self) -> &str {
        &self.host
    }

    fn port(&self) -> u16 {
        self.port
    }

    fn wrap(&self, stream: TcpStream, peer: SocketAddr) -> Box<dyn Sock> {
        // listeners poll nonblocking; workers read blocking
        let _ = stream.set_nonblocking(false);
        let _ = stream.set_nodelay(true);
        let _ = stream.set_read_timeout(self.recv_timeout);
        Box::new(TcpSock { stream, peer })
    }
}

/// Plain TCP per-connection state.
pub struct TcpSock {
    stream: TcpStream,
    peer: SocketAddr,
}

impl TcpSock {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        TcpSock { stream, peer }
    }
}

impl Sock for TcpSock {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.stream.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream.write(buf)
    }

    fn peer(&self) -> Option<SocketAddr> {
        Some(self.peer)
    }

    fn raw_fd(&self) -> Option<RawFd> {
        Some(self.stream.as_raw_fd())
    }

    fn detachable(&self) -> bool {
        true
    }

    #[cfg(target_os = "linux")]
    fn send_file(&mut self, file: &mut File, nbytes: u64) -> io::Result<u64> {
        let out_fd = self.stream.as_raw_fd();
        let in_fd = file.as_raw_fd();
        let mut sent = 0u64;
        while sent < nbytes {
            let want = (nbytes - sent).min(0x7fff_f000) as usize;
            let n = unsafe { libc::sendfile(out_fd, in_fd, std::ptr::null_mut(), want) };
            if n < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            if n == 0 {
                break;
            }
            sent += n as u64;
        }
        Ok(sent)
    }
}

/// Open the listening socket for a driver, preferring a pre-bound descriptor
/// handed over by the registry.
pub fn open_listener(host: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{}:{}", host, port)
        .parse()
        .map_err(|e| crate::error::ServerError::Config(format!("bad address {host}:{port}: {e}")))?;
    if let Some(socket) = crate::prebind::take_bound(&addr) {
        socket.listen(128)?;
        return Ok(socket.into());
    }
    Ok(TcpListener::bind(addr)?)
}

/// Bytes readable on a descriptor without blocking. Zero means the peer
/// closed or sent nothing; keep-alive treats both as "close".
pub fn pending_bytes(fd: RawFd) -> io::Result<usize> {
    let mut n: libc::c_int = 0;
    let rc = unsafe { libc::ioctl(fd, libc::FIONREAD, &mut n) };
    if rc != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n.max(0) as usize)
}

/// Shared driver handle.
pub type DriverRef = Arc<dyn Driver>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::net::TcpListener;

    #[test]
    fn test_location_elides_default_port() {
        let driver = TcpDriver::new("web", "example.com", 80, None);
        assert_eq!(driver.location(), "http://example.com");
        let driver = TcpDriver::new("web", "example.com", 8080, None);
        assert_eq!(driver.location(), "http://example.com:8080");
    }

    #[test]
    fn test_tcp_sock_roundtrip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let driver = TcpDriver::new("web", "127.0.0.1", addr.port(), None);

        let client = std::thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream.write_all(b"ping").unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"pong");
        });

        let (stream, peer) = listener.accept().unwrap();
        let mut sock = driver.wrap(stream, peer);
        assert!(sock.detachable());
        assert!(sock.peer().is_some());

        let mut buf = [0u8; 4];
        let mut got = 0;
        while got < 4 {
            got += sock.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"ping");
        sock.write(b"pong").unwrap();
        client.join().unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_pending_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        let (stream, _) = listener.accept().unwrap();

        client.write_all(b"abc").unwrap();
        // give the kernel a moment to land the bytes
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(pending_bytes(stream.as_raw_fd()).unwrap(), 3);
    }
}
