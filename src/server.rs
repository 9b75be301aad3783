/*!
 * Server orchestration
 *
 * Wires the subsystems together and owns their lifecycle: pre-bound ports
 * are claimed, the scheduler and pools start, the listener begins accepting,
 * and shutdown walks everything back down in order with bounded waits. The
 * pid file appears at start and disappears at exit.
 */

use std::collections::HashMap;
use std::fs;
use std::io::Write as _;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use once_cell::sync::OnceCell;
use std::os::unix::io::AsRawFd;
use tracing::{debug, error, info, warn};

use crate::config::{HeaderCase, KeepaliveSection, LimitsSection, ServerConfig};
use crate::conn::Conn;
use crate::db::{DbDriver, DbPoolSet};
use crate::driver::{open_listener, DriverRef, TcpDriver};
use crate::error::Result;
use crate::http::RedirectTable;
use crate::jobs::JobQueues;
use crate::keepalive::Keepalive;
use crate::pool::PoolSet;
use crate::prebind;
use crate::sched::Scheduler;
use crate::script::ScriptEngine;
use crate::serve::{self, RequestHandler};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Everything a worker needs while serving a connection.
pub struct ServerCore {
    pub server_name: String,
    pub limits: LimitsSection,
    pub header_case: HeaderCase,
    pub keepalive_cfg: KeepaliveSection,
    pub redirects: RedirectTable,
    pub handler: Arc<dyn RequestHandler>,
    pub engine: Arc<dyn ScriptEngine>,
    keepalive: OnceCell<Arc<Keepalive>>,
}

impl ServerCore {
    /// Hand a finished connection's socket to the keep-alive waiter.
    /// False means the caller closes it instead.
    pub(crate) fn keepalive_handoff(&self, conn: &mut Conn, pool: &str) -> bool {
        match self.keepalive.get() {
            Some(keepalive) => keepalive.keepalive_for_pool(conn, pool),
            None => false,
        }
    }
}

impl ServerCore {
    /// Core with default limits and no keep-alive wiring, for subsystem
    /// tests.
    #[cfg(test)]
    pub(crate) fn stub(handler: Arc<dyn RequestHandler>) -> Arc<Self> {
        Arc::new(ServerCore {
            server_name: "starport".to_string(),
            limits: LimitsSection::default(),
            header_case: HeaderCase::Preserve,
            keepalive_cfg: KeepaliveSection::default(),
            redirects: RedirectTable::default(),
            handler,
            engine: Arc::new(crate::script::NullEngine),
            keepalive: OnceCell::new(),
        })
    }
}

impl std::fmt::Debug for ServerCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerCore")
            .field("server", &self.server_name)
            .finish()
    }
}

/// Accept thread for one driver endpoint.
struct Listener {
    waker: Arc<Waker>,
    stop: Arc<AtomicBool>,
    thread: Option<std::thread::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl Listener {
    fn start(
        driver: DriverRef,
        listener: std::net::TcpListener,
        pools: Arc<PoolSet>,
        core: Arc<ServerCore>,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        poll.registry().register(
            &mut SourceFd(&listener.as_raw_fd()),
            LISTENER_TOKEN,
            Interest::READABLE,
        )?;
        let stop = Arc::new(AtomicBool::new(false));

        let thread = {
            let stop = stop.clone();
            let name = format!("-listen:{}-", driver.name());
            std::thread::Builder::new()
                .name(name)
                .spawn(move || accept_loop(poll, listener, driver, pools, core, stop))
                .expect("failed to spawn listener thread")
        };
        info!(%local_addr, "listening");
        Ok(Listener {
            waker,
            stop,
            thread: Some(thread),
            local_addr,
        })
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

/// Accept, pre-read the request for routing, and queue to a pool.
fn accept_loop(
    mut poll: Poll,
    listener: std::net::TcpListener,
    driver: DriverRef,
    pools: Arc<PoolSet>,
    core: Arc<ServerCore>,
    stop: Arc<AtomicBool>,
) {
    let mut events = Events::with_capacity(64);
    loop {
        match poll.poll(&mut events, None) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(err) => {
                error!("listener poll failed: {}", err);
                return;
            }
        }
        if stop.load(Ordering::SeqCst) {
            debug!("listener exiting");
            return;
        }
        loop {
            match listener.accept() {
                Ok((stream, peer)) => {
                    let sock = driver.wrap(stream, peer);
                    let conn = Conn::new(0, driver.clone(), sock, core.header_case);
                    admit(&core, &pools, conn);
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    warn!("accept failed: {}", err);
                    break;
                }
            }
        }
    }
}

/// Read the request line and headers so routing has a URL, then queue.
/// Failures are answered inline; the connection never reaches a pool.
fn admit(core: &Arc<ServerCore>, pools: &Arc<PoolSet>, mut conn: Conn) {
    use crate::conn::ConnReadError;

    match conn.read_request(&core.limits) {
        Ok(()) => {}
        Err(ConnReadError::Protocol(err)) => {
            warn!("protocol error at admission: {}", err);
            serve::respond_error(core, &mut conn, err.status());
            conn.close();
            return;
        }
        Err(ConnReadError::Io(err)) => {
            debug!("connection dropped at admission: {}", err);
            return;
        }
    }
    if let Err((mut conn, err)) = pools.queue_conn(conn) {
        warn!("queue refused: {}", err);
        let _ = conn.return_error(503, core.limits.errorminsize);
        conn.close();
    }
}

/// The assembled server.
pub struct Server {
    config: ServerConfig,
    core: Arc<ServerCore>,
    pools: Arc<PoolSet>,
    keepalive: Arc<Keepalive>,
    scheduler: Arc<Scheduler>,
    jobs: Arc<JobQueues>,
    dbpools: Arc<DbPoolSet>,
    listener: Option<Listener>,
    pid_path: Option<PathBuf>,
}

impl Server {
    /// Assemble a server from configuration and its external collaborators:
    /// the request dispatcher, the script engine, and the db drivers.
    pub fn new(
        config: ServerConfig,
        handler: Arc<dyn RequestHandler>,
        engine: Arc<dyn ScriptEngine>,
        db_drivers: HashMap<String, Arc<dyn DbDriver>>,
    ) -> Result<Self> {
        config.validate()?;
        let core = Arc::new(ServerCore {
            server_name: config.server.name.clone(),
            limits: config.limits.clone(),
            header_case: config.limits.header_case,
            keepalive_cfg: config.keepalive.clone(),
            redirects: RedirectTable::new(config.parsed_redirects()?),
            handler,
            engine: engine.clone(),
            keepalive: OnceCell::new(),
        });
        let pools = PoolSet::new(core.clone(), &config);
        let keepalive = Keepalive::new(&config.keepalive, Arc::downgrade(&pools));
        core.keepalive
            .set(keepalive.clone())
            .expect("keepalive set once");
        let scheduler = Scheduler::new();
        let jobs = JobQueues::new(engine);
        let dbpools = DbPoolSet::new(&config, &db_drivers);

        Ok(Server {
            config,
            core,
            pools,
            keepalive,
            scheduler,
            jobs,
            dbpools,
            listener: None,
            pid_path: None,
        })
    }

    /// Bind any configured prebind addresses. Call before dropping
    /// privileges; harmless to call again.
    pub fn prebind(&self) {
        if let Some(spec) = self.config.server.prebind.as_deref() {
            prebind::prebind(spec);
        }
        if let Some(path) = self.config.server.prebind_file.as_deref() {
            if let Err(err) = prebind::prebind_file(path) {
                error!("prebind file {}: {}", path, err);
            }
        }
    }

    /// Start everything: pid file, scheduler (with the db sweep tick),
    /// pools, the listener, and finally release job workers.
    pub fn start(&mut self) -> Result<()> {
        self.write_pid_file()?;

        self.scheduler.start();
        if let Some(interval) = self.dbpools.check_interval() {
            let dbpools = self.dbpools.clone();
            self.scheduler
                .schedule(interval, Arc::new(move || dbpools.check_all()))
                .expect("db sweep registration");
        }

        self.pools.start();

        let driver: DriverRef = Arc::new(TcpDriver::new(
            "sock",
            &self.config.server.address,
            self.config.server.port,
            Some(Duration::from_secs(30)),
        ));
        let listener = open_listener(&self.config.server.address, self.config.server.port)?;
        self.listener = Some(Listener::start(
            driver,
            listener,
            self.pools.clone(),
            self.core.clone(),
        )?);

        self.jobs.mark_started();
        info!(server = %self.config.server.name, "startup complete");
        Ok(())
    }

    /// Stop in order: no new connections, then cooperative shutdown of every
    /// subsystem with a bounded drain, then teardown of leftover state.
    pub fn stop(&mut self) {
        let timeout = Duration::from_secs(self.config.server.shutdown_timeout.max(1));
        info!(server = %self.config.server.name, "shutdown pending");

        if let Some(mut listener) = self.listener.take() {
            listener.stop();
        }

        self.keepalive.begin_shutdown();
        self.scheduler.begin_shutdown();
        self.jobs.begin_shutdown();

        self.pools.shutdown(timeout);

        self.keepalive.wait_shutdown(timeout);
        self.scheduler.wait_shutdown(timeout);
        self.jobs.wait_shutdown(timeout);

        prebind::close_all();
        self.remove_pid_file();
        info!(server = %self.config.server.name, "shutdown complete");
    }

    /// Address the listener actually bound (relevant with port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.as_ref().map(|l| l.local_addr)
    }

    pub fn pools(&self) -> &Arc<PoolSet> {
        &self.pools
    }

    pub fn dbpools(&self) -> &Arc<DbPoolSet> {
        &self.dbpools
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    pub fn jobs(&self) -> &Arc<JobQueues> {
        &self.jobs
    }

    pub fn keepalive(&self) -> &Arc<Keepalive> {
        &self.keepalive
    }

    pub fn core(&self) -> &Arc<ServerCore> {
        &self.core
    }

    fn write_pid_file(&mut self) -> Result<()> {
        let path = PathBuf::from(&self.config.server.home)
            .join(format!("{}.pid", self.config.server.name));
        let mut file = fs::File::create(&path)?;
        writeln!(file, "{}", std::process::id())?;
        self.pid_path = Some(path);
        Ok(())
    }

    fn remove_pid_file(&mut self) {
        if let Some(path) = self.pid_path.take() {
            if let Err(err) = fs::remove_file(&path) {
                warn!("failed to remove pid file {}: {}", path.display(), err);
            }
        }
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("name", &self.config.server.name)
            .field("addr", &self.local_addr())
            .finish()
    }
}
