/*!
 * Pre-bound socket registry
 *
 * Privileged ports must be bound while the process still has the privilege,
 * which is long before drivers start listening. The registry binds each
 * requested address at startup (without listening) and hands the socket out
 * exactly once when a driver later asks for that address. Whatever is left
 * at teardown is closed and logged as unused.
 */

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::net::SocketAddr;
use std::path::Path;

use once_cell::sync::Lazy;
use socket2::{Domain, Protocol, Socket, Type};
use tracing::{error, info, warn};

use crate::sync::NamedMutex;

static PREBOUND: Lazy<NamedMutex<HashMap<SocketAddr, Socket>>> =
    Lazy::new(|| NamedMutex::new("ns", "binder", HashMap::new()));

/// Parse and bind a comma-separated `[addr:]port` list. Bad entries are
/// logged and skipped; duplicates are rejected.
pub fn prebind(spec: &str) {
    for entry in spec.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        match parse_entry(entry) {
            Ok(addr) => bind_entry(entry, addr),
            Err(err) => error!("prebind: invalid entry: {}: {}", entry, err),
        }
    }
}

/// Read one prebind entry per line from a file.
pub fn prebind_file<P: AsRef<Path>>(path: P) -> std::io::Result<()> {
    let file = File::open(path)?;
    for line in BufReader::new(file).lines() {
        let line = line?;
        let line = line.trim();
        if !line.is_empty() {
            prebind(line);
        }
    }
    Ok(())
}

fn parse_entry(entry: &str) -> Result<SocketAddr, String> {
    let (addr, port) = match entry.rsplit_once(':') {
        Some((addr, port)) => (addr, port),
        None => ("0.0.0.0", entry),
    };
    let port: u16 = port.parse().map_err(|_| "invalid port".to_string())?;
    if port == 0 {
        return Err("invalid port".to_string());
    }
    format!("{}:{}", addr, port)
        .parse()
        .map_err(|_| "invalid address".to_string())
}

fn bind_entry(entry: &str, addr: SocketAddr) {
    let mut prebound = PREBOUND.lock();
    if prebound.contains_key(&addr) {
        error!("prebind: invalid entry: {}: duplicate entry", entry);
        return;
    }
    let domain = Domain::for_address(addr);
    let socket = match Socket::new(domain, Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => socket,
        Err(err) => {
            error!("prebind: invalid entry: {}: {}", entry, err);
            return;
        }
    };
    let _ = socket.set_reuse_address(true);
    if let Err(err) = socket.bind(&addr.into()) {
        error!("prebind: invalid entry: {}: {}", entry, err);
        return;
    }
    info!("prebind: bound: {}", entry);
    prebound.insert(addr, socket);
}

/// Remove and return the pre-bound socket for `addr`, if any. A second call
/// for the same address comes back empty.
pub fn take_bound(addr: &SocketAddr) -> Option<Socket> {
    PREBOUND.lock().remove(addr)
}

/// Close every socket still in the registry.
pub fn close_all() {
    let mut prebound = PREBOUND.lock();
    for (addr, socket) in prebound.drain() {
        warn!("prebind: closed unused: {}", addr);
        drop(socket);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // the registry is process-wide; close_all in one test must not race
    // another test's bind/take window
    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_parse_entries() {
        assert_eq!(
            parse_entry("8080").unwrap(),
            "0.0.0.0:8080".parse().unwrap()
        );
        assert_eq!(
            parse_entry("127.0.0.1:9090").unwrap(),
            "127.0.0.1:9090".parse().unwrap()
        );
        assert!(parse_entry("0").is_err());
        assert!(parse_entry("notaport").is_err());
        assert!(parse_entry("nota.nhost:80").is_err());
    }

    #[test]
    fn test_bind_take_once() {
        let _guard = TEST_LOCK.lock().unwrap();
        // an ephemeral pick: bind port 0 is rejected, so find a free port
        // by binding and releasing a listener first
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        prebind(&format!("127.0.0.1:{}", addr.port()));
        let socket = take_bound(&addr);
        assert!(socket.is_some(), "first take returns the socket");
        assert!(take_bound(&addr).is_none(), "second take comes back empty");

        // the socket is bound but not listening; listen completes the chain
        let socket = socket.unwrap();
        socket.listen(4).unwrap();
        let listener: std::net::TcpListener = socket.into();
        let peer = std::net::TcpStream::connect(addr);
        assert!(peer.is_ok());
        drop(listener);
    }

    #[test]
    fn test_duplicate_rejected() {
        let _guard = TEST_LOCK.lock().unwrap();
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let spec = format!("127.0.0.1:{}", addr.port());
        prebind(&spec);
        prebind(&spec); // duplicate: logged, not double-bound
        assert!(take_bound(&addr).is_some());
        assert!(take_bound(&addr).is_none());
    }

    #[test]
    fn test_prebind_file() {
        let _guard = TEST_LOCK.lock().unwrap();
        use std::io::Write;
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "127.0.0.1:{}", addr.port()).unwrap();
        writeln!(file).unwrap();
        prebind_file(file.path()).unwrap();
        assert!(take_bound(&addr).is_some());
    }

    #[test]
    fn test_close_all_clears() {
        let _guard = TEST_LOCK.lock().unwrap();
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = probe.local_addr().unwrap();
        drop(probe);

        prebind(&format!("127.0.0.1:{}", addr.port()));
        close_all();
        assert!(take_bound(&addr).is_none());
    }
}
