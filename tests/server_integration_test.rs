/*!
 * Integration tests for the connection lifecycle engine
 *
 * These tests start a real server on a loopback ephemeral port with a stub
 * request dispatcher and drive it over plain TCP sockets: pool saturation,
 * keep-alive socket reuse, admission control, body limits, and the redirect
 * recursion cap.
 */

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use starport::config::{PoolSection, ServerConfig};
use starport::script::NullEngine;
use starport::serve::RequestHandler;
use starport::server::Server;
use starport::{Conn, ServerError};

/// Dispatcher with a handful of well-known URLs and call counters.
struct StubHandler {
    slow_sleep: Duration,
    err_calls: AtomicUsize,
}

impl StubHandler {
    fn new() -> Arc<Self> {
        Arc::new(StubHandler {
            slow_sleep: Duration::from_millis(600),
            err_calls: AtomicUsize::new(0),
        })
    }
}

impl RequestHandler for StubHandler {
    fn handle(&self, conn: &mut Conn) -> starport::Result<()> {
        let url = conn.request.as_ref().map(|r| r.url.clone()).unwrap_or_default();
        match url.as_str() {
            "/small" => {
                conn.return_data(200, "text/plain", b"hello world", true)?;
                Ok(())
            }
            "/slow" => {
                thread::sleep(self.slow_sleep);
                conn.return_data(200, "text/plain", b"slowly", true)?;
                Ok(())
            }
            "/body" => {
                let drained = conn.drain_content()?;
                let body = format!("read {drained} bytes");
                conn.return_data(200, "text/plain", body.as_bytes(), true)?;
                Ok(())
            }
            "/boom" | "/err" => {
                self.err_calls.fetch_add(1, Ordering::SeqCst);
                Err(ServerError::Other(format!("{url} always fails")))
            }
            _ => {
                conn.return_error(404, 514)?;
                Ok(())
            }
        }
    }
}

fn base_config(home: &TempDir) -> ServerConfig {
    let mut config = ServerConfig::default();
    config.server.name = "test".to_string();
    config.server.address = "127.0.0.1".to_string();
    config.server.port = 0;
    config.server.home = home.path().to_string_lossy().into_owned();
    config.server.shutdown_timeout = 5;
    config.keepalive.timeout = 5;
    config
}

fn start_server(config: ServerConfig, handler: Arc<StubHandler>) -> (Server, SocketAddr) {
    let mut server = Server::new(config, handler, Arc::new(NullEngine), HashMap::new()).unwrap();
    server.start().unwrap();
    let addr = server.local_addr().unwrap();
    (server, addr)
}

fn get(addr: SocketAddr, path: &str) -> String {
    let mut stream = TcpStream::connect(addr).unwrap();
    write!(stream, "GET {path} HTTP/1.0\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    response
}

#[test]
fn test_basic_request_cycle() {
    let home = TempDir::new().unwrap();
    let (mut server, addr) = start_server(base_config(&home), StubHandler::new());

    let response = get(addr, "/small");
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.contains("Content-Length: 11"));
    assert!(response.ends_with("hello world"));

    let response = get(addr, "/nowhere");
    assert!(response.starts_with("HTTP/1.0 404 Not Found\r\n"));

    server.stop();
}

/// Saturated pool defers the second connection until the first completes.
#[test]
fn test_saturated_pool_defers_connection() {
    let home = TempDir::new().unwrap();
    let mut config = base_config(&home);
    config.pools.push(PoolSection {
        name: "default".to_string(),
        minthreads: 0,
        maxthreads: 1,
        maxconns: 0,
        timeout: 60,
    });
    let (mut server, addr) = start_server(config, StubHandler::new());

    let started = Instant::now();
    let (tx, rx) = crossbeam_channel::unbounded();
    let slow_tx = tx.clone();
    let slow = thread::spawn(move || {
        let response = get(addr, "/slow");
        slow_tx.send(("slow", Instant::now())).unwrap();
        response
    });
    thread::sleep(Duration::from_millis(100));
    let fast = thread::spawn(move || {
        let response = get(addr, "/small");
        tx.send(("fast", Instant::now())).unwrap();
        response
    });

    assert!(slow.join().unwrap().contains("200 OK"));
    assert!(fast.join().unwrap().contains("200 OK"));
    // the single worker finishes /slow before /small is even started
    let (first, _) = rx.recv().unwrap();
    let (second, at) = rx.recv().unwrap();
    assert_eq!(first, "slow");
    assert_eq!(second, "fast");
    assert!(at.duration_since(started) >= Duration::from_millis(600));

    let stats = server.pools().get("default").unwrap().stats();
    assert_eq!(stats.maxthreads, 1);
    assert!(stats.current <= 1, "never more than one worker");

    server.stop();
}

/// Keep-alive parks the socket and serves a second request on it.
#[test]
fn test_keepalive_reuses_socket() {
    let home = TempDir::new().unwrap();
    let (mut server, addr) = start_server(base_config(&home), StubHandler::new());

    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    write!(stream, "GET /small HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
    let first = read_one_response(&mut stream);
    assert!(first.starts_with("HTTP/1.0 200 OK\r\n"), "{first}");
    assert!(first.contains("Connection: keep-alive"), "{first}");

    // the socket is parked with the waiter between requests
    thread::sleep(Duration::from_millis(100));
    assert_eq!(server.keepalive().pending(), 1);

    write!(stream, "GET /small HTTP/1.0\r\nConnection: keep-alive\r\n\r\n").unwrap();
    let second = read_one_response(&mut stream);
    assert!(second.starts_with("HTTP/1.0 200 OK\r\n"), "{second}");

    drop(stream); // peer close: the waiter reaps the slot
    thread::sleep(Duration::from_millis(200));
    assert_eq!(server.keepalive().pending(), 0);

    server.stop();
}

/// Reads headers plus exactly Content-Length bytes of body.
fn read_one_response(stream: &mut TcpStream) -> String {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        let header_end = buf.windows(4).position(|w| w == b"\r\n\r\n");
        if let Some(end) = header_end {
            let headers = String::from_utf8_lossy(&buf[..end]).into_owned();
            let length: usize = headers
                .lines()
                .find_map(|l| l.strip_prefix("Content-Length: "))
                .map(|v| v.parse().unwrap())
                .unwrap_or(0);
            let body_start = end + 4;
            while buf.len() < body_start + length {
                let n = stream.read(&mut chunk).unwrap();
                assert!(n > 0, "peer closed mid-body");
                buf.extend_from_slice(&chunk[..n]);
            }
            return String::from_utf8_lossy(&buf).into_owned();
        }
        let n = stream.read(&mut chunk).unwrap();
        assert!(n > 0, "peer closed mid-headers");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// A body one byte over maxpost is refused with 413 before it is read.
#[test]
fn test_maxpost_boundary_yields_413() {
    let home = TempDir::new().unwrap();
    let mut config = base_config(&home);
    config.limits.maxpost = 64;
    let (mut server, addr) = start_server(config, StubHandler::new());

    let mut stream = TcpStream::connect(addr).unwrap();
    write!(stream, "POST /body HTTP/1.0\r\nContent-Length: 65\r\n\r\n").unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(
        response.starts_with("HTTP/1.0 413 Request Entity Too Large\r\n"),
        "{response}"
    );

    // exactly at the limit is fine
    let mut stream = TcpStream::connect(addr).unwrap();
    let body = vec![b'x'; 64];
    write!(stream, "POST /body HTTP/1.0\r\nContent-Length: 64\r\n\r\n").unwrap();
    stream.write_all(&body).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.0 200 OK\r\n"), "{response}");
    assert!(response.contains("read 64 bytes"));

    server.stop();
}

/// A failing error page cannot recurse forever: after the cap, a plain
/// error body goes out.
#[test]
fn test_redirect_loop_is_capped() {
    let home = TempDir::new().unwrap();
    let mut config = base_config(&home);
    config
        .redirects
        .insert("500".to_string(), "/err".to_string());
    let handler = StubHandler::new();
    let (mut server, addr) = start_server(config, handler.clone());

    let response = get(addr, "/boom");
    assert!(
        response.starts_with("HTTP/1.0 500 Internal Server Error\r\n"),
        "{response}"
    );
    assert!(response.contains("<h2>Internal Server Error</h2>"));

    // /boom once, then /err up to the recursion cap of 3
    let calls = handler.err_calls.load(Ordering::SeqCst);
    assert!(calls >= 2, "the error url was attempted");
    assert!(calls <= 4, "the recursion cap bounds the attempts, saw {calls}");

    server.stop();
}

/// Connections past the queue soft limit overflow into the error pool and
/// answer 503.
#[test]
fn test_overflow_connection_gets_503() {
    let home = TempDir::new().unwrap();
    let mut config = base_config(&home);
    config.limits.maxqueued = 1;
    config.pools.push(PoolSection {
        name: "default".to_string(),
        minthreads: 0,
        maxthreads: 1,
        maxconns: 0,
        timeout: 60,
    });
    let (mut server, addr) = start_server(config, StubHandler::new());

    // occupy the single worker
    let slow = thread::spawn(move || get(addr, "/slow"));
    thread::sleep(Duration::from_millis(100));
    // fill the queue
    let queued = thread::spawn(move || get(addr, "/small"));
    thread::sleep(Duration::from_millis(100));
    // and overflow
    let overflow = get(addr, "/small");
    assert!(
        overflow.starts_with("HTTP/1.0 503 Service Unavailable\r\n"),
        "{overflow}"
    );

    assert!(slow.join().unwrap().contains("200 OK"));
    assert!(queued.join().unwrap().contains("200 OK"));
    server.stop();
}

/// The pid file appears at start and disappears at stop.
#[test]
fn test_pid_file_lifecycle() {
    let home = TempDir::new().unwrap();
    let (mut server, _addr) = start_server(base_config(&home), StubHandler::new());

    let pid_path = home.path().join("test.pid");
    let content = std::fs::read_to_string(&pid_path).unwrap();
    assert_eq!(content, format!("{}\n", std::process::id()));

    server.stop();
    assert!(!pid_path.exists(), "pid file removed at shutdown");
}

/// A pre-bound port is consumed by the listener that asks for it.
#[test]
fn test_prebound_port_feeds_listener() {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);

    starport::prebind::prebind(&format!("127.0.0.1:{port}"));

    let home = TempDir::new().unwrap();
    let mut config = base_config(&home);
    config.server.port = port;
    let (mut server, addr) = start_server(config, StubHandler::new());
    assert_eq!(addr.port(), port);

    // the registry entry was consumed by the listener
    let again = starport::prebind::take_bound(&addr);
    assert!(again.is_none());

    let response = get(addr, "/small");
    assert!(response.contains("200 OK"));
    server.stop();
}

/// URL-routed pools serve their registered subtree.
#[test]
fn test_url_routing_to_named_pool() {
    let home = TempDir::new().unwrap();
    let mut config = base_config(&home);
    config.pools.push(PoolSection {
        name: "slowlane".to_string(),
        minthreads: 0,
        maxthreads: 2,
        maxconns: 0,
        timeout: 60,
    });
    config.routes.push(starport::config::RouteSection {
        method: "GET".to_string(),
        url: "/slow".to_string(),
        pool: "slowlane".to_string(),
    });
    let (mut server, addr) = start_server(config, StubHandler::new());

    let response = get(addr, "/slow");
    assert!(response.contains("200 OK"));

    let stats = server.pools().get("slowlane").unwrap().stats();
    assert_eq!(stats.maxthreads, 2);
    assert!(stats.current >= 1, "the routed pool served the request");

    let default_stats = server.pools().get("default").unwrap().stats();
    assert_eq!(default_stats.current, 0, "default pool stayed cold");

    server.stop();
}

/// Graceful shutdown drains queued work before workers exit.
#[test]
fn test_shutdown_drains_inflight_requests() {
    let home = TempDir::new().unwrap();
    let (mut server, addr) = start_server(base_config(&home), StubHandler::new());

    let slow = thread::spawn(move || get(addr, "/slow"));
    thread::sleep(Duration::from_millis(100));
    server.stop();
    let response = slow.join().unwrap();
    assert!(
        response.contains("200 OK"),
        "in-flight request completes during shutdown: {response}"
    );
}
