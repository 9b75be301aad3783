/*!
 * Request service pipeline
 *
 * What a worker runs for each dequeued connection: read the request if the
 * listener has not already, enforce the body limit, dispatch to the
 * registered handler, make sure headers went out, optionally drain unread
 * content, and finally either park the socket in the keep-alive waiter or
 * close it.
 */

use std::io;

use tracing::{debug, error, warn};

use crate::conn::{Conn, ConnFlags, ConnReadError};
use crate::http::response::MAX_REDIRECT_RECURSION;
use crate::server::ServerCore;

/// The configured request dispatcher. Handlers build the response through
/// the `Conn` helpers; anything they leave unflushed the pipeline completes.
pub trait RequestHandler: Send + Sync {
    fn handle(&self, conn: &mut Conn) -> crate::error::Result<()>;
}

/// Serve one connection to completion, then recycle or close it.
pub fn serve(core: &ServerCore, conn: &mut Conn, pool: &str) {
    match pipeline(core, conn) {
        Ok(()) => {}
        Err(err) => {
            // transport failure mid-exchange: nothing to send, just close
            debug!(conn = conn.id, pool, "connection i/o error: {}", err);
        }
    }

    if conn.keepalive_ready() && core.keepalive_handoff(conn, pool) {
        debug!(conn = conn.id, pool, "socket parked for keep-alive");
        return;
    }
    conn.close();
}

fn pipeline(core: &ServerCore, conn: &mut Conn) -> io::Result<()> {
    if conn.request.is_none() {
        match conn.read_request(&core.limits) {
            Ok(()) => {}
            Err(ConnReadError::Protocol(err)) => {
                warn!(conn = conn.id, "protocol error: {}", err);
                respond_error(core, conn, err.status());
                return Ok(());
            }
            Err(ConnReadError::Io(err)) => return Err(err),
        }
    }
    if conn.request.is_none() {
        return Ok(());
    }

    if let Some(length) = conn.content_length {
        if length > core.limits.maxpost {
            warn!(
                conn = conn.id,
                length,
                maxpost = core.limits.maxpost,
                "request body over limit"
            );
            respond_error(core, conn, 413);
            return Ok(());
        }
    }

    if conn.flags.contains(ConnFlags::OVERFLOW) {
        respond_error(core, conn, 503);
        return Ok(());
    }

    match core.handler.handle(conn) {
        Ok(()) => {}
        Err(err) => {
            error!(conn = conn.id, "handler failed: {}", err);
            respond_error(core, conn, 500);
        }
    }

    // synthesize headers the handler never flushed
    if !conn.headers_flushed() {
        conn.flush_headers(core.keepalive_cfg.enabled)?;
    }

    if core.limits.flushcontent {
        let _ = conn.drain_content();
    }
    Ok(())
}

/// Error response with redirect support: a registered URL for the status is
/// dispatched internally instead of the canned body, bounded by the
/// recursion cap so a failing error page ends in a plain body.
pub fn respond_error(core: &ServerCore, conn: &mut Conn, status: u16) {
    conn.response_status = status;
    if conn.headers_flushed() {
        // too late for a clean error response
        return;
    }
    if let Some(url) = core.redirects.lookup(status).map(str::to_string) {
        conn.recursion += 1;
        if conn.recursion > MAX_REDIRECT_RECURSION {
            error!(
                status,
                "failed to redirect: exceeded recursion limit of {}", MAX_REDIRECT_RECURSION
            );
        } else {
            redirect(core, conn, &url);
            return;
        }
    }
    if let Err(err) = conn.return_error(status, core.limits.errorminsize) {
        debug!(conn = conn.id, "error response failed: {}", err);
    }
}

/// Internally re-dispatch the connection to `url`.
fn redirect(core: &ServerCore, conn: &mut Conn, url: &str) {
    let Some(request) = conn.request.as_mut() else {
        let _ = conn.return_error(conn.response_status, core.limits.errorminsize);
        return;
    };
    request.url = url.to_string();
    request.query = None;
    request.urlv = url
        .split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    conn.response_status = 200;
    conn.response_length = None;

    match core.handler.handle(conn) {
        Ok(()) => {
            if !conn.headers_flushed() {
                let _ = conn.flush_headers(core.keepalive_cfg.enabled);
            }
        }
        Err(err) => {
            error!(conn = conn.id, url, "redirect target failed: {}", err);
            respond_error(core, conn, 500);
        }
    }
}
