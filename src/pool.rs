/*!
 * Connection worker pools
 *
 * Each pool owns a FIFO wait queue of connections and a set of worker
 * threads bounded by min/max counts. Queueing a connection wakes an idle
 * worker or spawns a new one; idle workers above the minimum retire after
 * the pool's idle timeout; a worker that has served `maxconns` connections
 * retires so its thread is recycled. Shutdown is cooperative: a flag plus a
 * broadcast, then a bounded wait for the queue to drain and the workers to
 * exit.
 */

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{PoolSection, ServerConfig};
use crate::conn::{Conn, ConnFlags};
use crate::error::{PoolError, WaitOutcome};
use crate::serve;
use crate::server::ServerCore;
use crate::sync::{Cond, NamedMutex, RwLock};
use crate::urlspace::UrlSpace;

/// Name of the pool serving unrouted requests.
pub const DEFAULT_POOL: &str = "default";
/// Name of the pool serving overflow connections.
pub const ERROR_POOL: &str = "error";

#[derive(Debug)]
struct Threads {
    min: usize,
    max: usize,
    current: usize,
    idle: usize,
    maxconns: usize,
    timeout: Duration,
}

#[derive(Debug)]
struct PoolState {
    wait: VecDeque<Conn>,
    queued: usize,
    nactive: usize,
    threads: Threads,
    next_conn_id: u64,
    next_thread_id: u64,
    shutdown: bool,
}

/// Counter snapshot of one pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub minthreads: usize,
    pub maxthreads: usize,
    pub current: usize,
    pub idle: usize,
    pub queued: usize,
    pub active: usize,
    pub maxconns: usize,
    pub timeout_secs: u64,
}

/// A named worker pool.
pub struct Pool {
    name: String,
    state: NamedMutex<PoolState>,
    cond: Cond,
    core: Arc<ServerCore>,
}

impl Pool {
    fn new(section: &PoolSection, core: Arc<ServerCore>) -> Arc<Self> {
        Arc::new(Pool {
            name: section.name.clone(),
            state: NamedMutex::new(
                "pool",
                &section.name,
                PoolState {
                    wait: VecDeque::new(),
                    queued: 0,
                    nactive: 0,
                    threads: Threads {
                        min: section.minthreads,
                        max: section.maxthreads.max(1),
                        current: 0,
                        idle: 0,
                        maxconns: section.maxconns,
                        timeout: Duration::from_secs(section.timeout),
                    },
                    next_conn_id: 0,
                    next_thread_id: 0,
                    shutdown: false,
                },
            ),
            cond: Cond::new(),
            core,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            minthreads: state.threads.min,
            maxthreads: state.threads.max,
            current: state.threads.current,
            idle: state.threads.idle,
            queued: state.queued,
            active: state.nactive,
            maxconns: state.threads.maxconns,
            timeout_secs: state.threads.timeout.as_secs(),
        }
    }

    pub fn queued(&self) -> usize {
        self.state.lock().queued
    }

    /// Append a connection to the wait queue, spawning a worker when nobody
    /// idle can take it. Fails once shutdown has begun.
    pub fn queue(self: &Arc<Self>, mut conn: Conn) -> Result<(), (Conn, PoolError)> {
        let spawn = {
            let mut state = self.state.lock();
            if state.shutdown {
                drop(state);
                return Err((conn, PoolError::Shutdown(self.name.clone())));
            }
            conn.id = state.next_conn_id;
            state.next_conn_id += 1;
            state.wait.push_back(conn);
            state.queued += 1;
            let spawn = state.threads.idle == 0 && state.threads.current < state.threads.max;
            if spawn {
                state.threads.current += 1;
                state.next_thread_id += 1;
            }
            self.cond.broadcast();
            spawn.then_some(state.next_thread_id)
        };
        if let Some(thread_id) = spawn {
            self.spawn_worker(thread_id);
        }
        Ok(())
    }

    /// Start the configured minimum number of workers.
    fn start(self: &Arc<Self>) {
        let min = {
            let mut state = self.state.lock();
            state.threads.current = state.threads.min;
            state.threads.idle = 0;
            state.next_thread_id = state.threads.min as u64;
            state.threads.min
        };
        for n in 0..min {
            self.spawn_worker(n as u64);
        }
    }

    fn spawn_worker(self: &Arc<Self>, thread_id: u64) {
        let pool = self.clone();
        let name = format!("pool:{}-{}", self.name, thread_id);
        thread::Builder::new()
            .name(name)
            .spawn(move || pool.worker())
            .expect("failed to spawn pool worker");
    }

    /// Worker loop: dequeue, serve, repeat; retire on shutdown, on idle
    /// timeout above the minimum, or after maxconns connections.
    fn worker(self: Arc<Self>) {
        debug!(pool = %self.name, "worker starting");
        let mut served: usize = 0;
        let mut state = self.state.lock();
        state.threads.idle += 1;
        loop {
            let deadline = Instant::now() + state.threads.timeout;
            let mut timed_out = false;
            while state.wait.is_empty() && !state.shutdown && !timed_out {
                let (guard, outcome) = self.cond.timed_wait(state, Some(deadline));
                state = guard;
                timed_out = outcome == WaitOutcome::TimedOut;
            }

            if state.shutdown
                || (state.wait.is_empty() && timed_out && state.threads.current > state.threads.min)
            {
                state.threads.idle -= 1;
                state.threads.current -= 1;
                self.cond.broadcast();
                drop(state);
                debug!(pool = %self.name, served, "worker exiting");
                return;
            }
            let Some(mut conn) = state.wait.pop_front() else {
                // idle timeout at or below the minimum: keep waiting
                continue;
            };
            state.queued -= 1;
            state.threads.idle -= 1;
            state.nactive += 1;
            drop(state);

            serve::serve(&self.core, &mut conn, &self.name);
            served += 1;

            state = self.state.lock();
            state.nactive -= 1;
            state.threads.idle += 1;
            if state.threads.maxconns > 0 && served >= state.threads.maxconns {
                state.threads.idle -= 1;
                state.threads.current -= 1;
                self.cond.broadcast();
                drop(state);
                debug!(pool = %self.name, served, "worker retiring at maxconns");
                return;
            }
        }
    }

    /// Flag shutdown and wake every worker.
    fn stop(&self) {
        let mut state = self.state.lock();
        state.shutdown = true;
        self.cond.broadcast();
    }

    /// Wait until the queue is empty and all workers have exited.
    fn wait_drained(&self, deadline: Instant) {
        let mut state = self.state.lock();
        loop {
            if state.wait.is_empty() && state.threads.current == 0 {
                return;
            }
            let (guard, outcome) = self.cond.timed_wait(state, Some(deadline));
            state = guard;
            if outcome.timed_out()
                && !(state.wait.is_empty() && state.threads.current == 0)
            {
                warn!(pool = %self.name, "timeout waiting for connection thread exit");
                return;
            }
        }
    }

    /// Update limits in place.
    pub fn set_limits(&self, section: &PoolSection) {
        let mut state = self.state.lock();
        state.threads.min = section.minthreads;
        state.threads.max = section.maxthreads.max(1);
        state.threads.maxconns = section.maxconns;
        state.threads.timeout = Duration::from_secs(section.timeout);
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool").field("name", &self.name).finish()
    }
}

/// Registry of pools plus the URL routing table.
pub struct PoolSet {
    server: String,
    pools: RwLock<HashMap<String, Arc<Pool>>>,
    routes: RwLock<UrlSpace<String>>,
    core: Arc<ServerCore>,
}

impl PoolSet {
    /// Build the pool table from configuration. The `default` and `error`
    /// pools always exist.
    pub fn new(core: Arc<ServerCore>, config: &ServerConfig) -> Arc<Self> {
        let set = Arc::new(PoolSet {
            server: config.server.name.clone(),
            pools: RwLock::new(HashMap::new()),
            routes: RwLock::new(UrlSpace::new()),
            core,
        });
        for name in [DEFAULT_POOL, ERROR_POOL] {
            let section = config
                .pool(name)
                .cloned()
                .unwrap_or_else(|| PoolSection::named(name));
            set.create(&section);
        }
        for section in &config.pools {
            set.create(section);
        }
        for route in &config.routes {
            set.register_route(&route.method, &route.url, &route.pool);
        }
        set
    }

    /// Create a pool, or update the limits of an existing one.
    pub fn create(&self, section: &PoolSection) -> Arc<Pool> {
        {
            let pools = self.pools.read();
            if let Some(pool) = pools.get(&section.name) {
                pool.set_limits(section);
                return pool.clone();
            }
        }
        let mut pools = self.pools.write();
        if let Some(pool) = pools.get(&section.name) {
            pool.set_limits(section);
            return pool.clone();
        }
        let pool = Pool::new(section, self.core.clone());
        pools.insert(section.name.clone(), pool.clone());
        pool
    }

    pub fn get(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Route a (method, url) pattern to a pool by name.
    pub fn register_route(&self, method: &str, pattern: &str, pool: &str) {
        self.routes
            .write()
            .register(&self.server, method, pattern, pool.to_string());
    }

    /// Pool for a connection: overflow goes to the error pool, routed
    /// requests to their mapped pool, everything else to the default pool.
    pub fn pool_for(&self, conn: &Conn) -> Arc<Pool> {
        if conn.flags.contains(ConnFlags::OVERFLOW) {
            return self.get(ERROR_POOL).expect("error pool exists");
        }
        if let Some(request) = conn.request.as_ref() {
            let routes = self.routes.read();
            if let Some(name) = routes.lookup(&self.server, &request.method, &request.url) {
                if let Some(pool) = self.get(name) {
                    return pool;
                }
            }
        }
        self.get(DEFAULT_POOL).expect("default pool exists")
    }

    /// Admission control plus queueing: flag overflow past the soft limit,
    /// then queue to the selected pool.
    pub fn queue_conn(&self, mut conn: Conn) -> Result<(), (Conn, PoolError)> {
        let maxqueued = self.core.limits.maxqueued;
        if maxqueued > 0 && !conn.flags.contains(ConnFlags::OVERFLOW) {
            let target = self.pool_for(&conn);
            if target.queued() >= maxqueued {
                conn.flags.insert(ConnFlags::OVERFLOW);
            }
        }
        self.pool_for(&conn).queue(conn)
    }

    /// Wrap a raw transport (a keep-alive pickup or a test fixture) as a new
    /// connection and queue it directly to the named pool. The request is
    /// read by the worker.
    pub fn queue_sock(
        &self,
        driver: crate::driver::DriverRef,
        sock: Box<dyn crate::driver::Sock>,
        pool: &str,
    ) -> Result<(), PoolError> {
        let target = self
            .get(pool)
            .ok_or_else(|| PoolError::NoSuchPool(pool.to_string()))?;
        let conn = Conn::new(0, driver, sock, self.core.header_case);
        target.queue(conn).map_err(|(_conn, err)| err)
    }

    /// Start minimum workers in every pool.
    pub fn start(&self) {
        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        for pool in &pools {
            pool.start();
        }
        info!(pools = pools.len(), "connection pools started");
    }

    /// Stop every pool: broadcast shutdown, then wait out the drain.
    pub fn shutdown(&self, timeout: Duration) {
        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        for pool in &pools {
            pool.stop();
        }
        let deadline = Instant::now() + timeout;
        for pool in &pools {
            pool.wait_drained(deadline);
        }
        info!("connection pools stopped");
    }
}

impl std::fmt::Debug for PoolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolSet").field("server", &self.server).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::Driver as _;
    use crate::serve::RequestHandler;
    use std::io::{Read as _, Write as _};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    struct RecordingHandler {
        served: Mutex<Vec<String>>,
    }

    impl RecordingHandler {
        fn new() -> Arc<Self> {
            Arc::new(RecordingHandler {
                served: Mutex::new(Vec::new()),
            })
        }
    }

    impl RequestHandler for RecordingHandler {
        fn handle(&self, conn: &mut Conn) -> crate::error::Result<()> {
            let url = conn.request.as_ref().unwrap().url.clone();
            self.served.lock().unwrap().push(url);
            conn.return_data(200, "text/plain", b"ok", false)?;
            Ok(())
        }
    }

    fn config_with_default_pool(maxthreads: usize) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.pools.push(PoolSection {
            name: DEFAULT_POOL.to_string(),
            minthreads: 0,
            maxthreads,
            maxconns: 0,
            timeout: 60,
        });
        config
    }

    /// A loopback sock with one request already sent by the client.
    fn sock_with_request(
        path: &str,
    ) -> (crate::driver::DriverRef, Box<dyn crate::driver::Sock>, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let mut client = TcpStream::connect(addr).unwrap();
        write!(client, "GET {path} HTTP/1.0\r\n\r\n").unwrap();
        client.shutdown(std::net::Shutdown::Write).unwrap();
        let (stream, peer) = listener.accept().unwrap();
        let driver: crate::driver::DriverRef = Arc::new(crate::driver::TcpDriver::new(
            "test",
            "127.0.0.1",
            addr.port(),
            None,
        ));
        let sock = driver.wrap(stream, peer);
        (driver, sock, client)
    }

    #[test]
    fn test_single_worker_serves_fifo() {
        let handler = RecordingHandler::new();
        let core = ServerCore::stub(handler.clone());
        let pools = PoolSet::new(core, &config_with_default_pool(1));

        let mut clients = Vec::new();
        for i in 0..4 {
            let (driver, sock, client) = sock_with_request(&format!("/r{i}"));
            pools.queue_sock(driver, sock, DEFAULT_POOL).unwrap();
            clients.push(client);
        }
        for mut client in clients {
            let mut response = String::new();
            client.read_to_string(&mut response).unwrap();
            assert!(response.contains("200 OK"));
        }
        assert_eq!(
            *handler.served.lock().unwrap(),
            vec!["/r0", "/r1", "/r2", "/r3"],
            "a single worker drains the queue in order"
        );
        pools.shutdown(Duration::from_secs(2));
    }

    #[test]
    fn test_queue_refused_after_shutdown() {
        let core = ServerCore::stub(RecordingHandler::new());
        let pools = PoolSet::new(core, &config_with_default_pool(2));
        pools.shutdown(Duration::from_millis(100));

        let (driver, sock, _client) = sock_with_request("/late");
        match pools.queue_sock(driver, sock, DEFAULT_POOL) {
            Err(PoolError::Shutdown(name)) => assert_eq!(name, DEFAULT_POOL),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn test_create_updates_existing_limits() {
        let core = ServerCore::stub(RecordingHandler::new());
        let pools = PoolSet::new(core, &ServerConfig::default());

        let mut section = PoolSection::named("api");
        section.maxthreads = 3;
        pools.create(&section);
        assert_eq!(pools.get("api").unwrap().stats().maxthreads, 3);

        section.maxthreads = 7;
        section.maxconns = 5;
        pools.create(&section);
        let stats = pools.get("api").unwrap().stats();
        assert_eq!(stats.maxthreads, 7);
        assert_eq!(stats.maxconns, 5);

        let mut names = pools.list();
        names.retain(|n| n == "api" || n == DEFAULT_POOL || n == ERROR_POOL);
        assert_eq!(names.len(), 3, "default and error pools always exist");
    }

    #[test]
    fn test_routing_and_overflow_selection() {
        let core = ServerCore::stub(RecordingHandler::new());
        let pools = PoolSet::new(core.clone(), &ServerConfig::default());
        pools.create(&PoolSection::named("api"));
        pools.register_route("GET", "/api/*", "api");

        let (driver, sock, _client) = sock_with_request("/api/users");
        let mut conn = Conn::new(0, driver, sock, core.header_case);
        conn.read_request(&core.limits).unwrap();
        assert_eq!(pools.pool_for(&conn).name(), "api");

        conn.flags.insert(ConnFlags::OVERFLOW);
        assert_eq!(pools.pool_for(&conn).name(), ERROR_POOL);

        let (driver, sock, _client) = sock_with_request("/other");
        let mut conn = Conn::new(0, driver, sock, core.header_case);
        conn.read_request(&core.limits).unwrap();
        assert_eq!(pools.pool_for(&conn).name(), DEFAULT_POOL);
    }
}
