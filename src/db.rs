/*!
 * Database handle pools
 *
 * Fixed-capacity pools of reusable database connections. Acquisition is a
 * fair, deadline-bounded grab of N handles at once: one acquirer at a time
 * holds the `waiting` baton (serialized on `wait_cond`), then collects
 * handles as they land on the free list (`get_cond`). Handles age out on
 * idle and open time, an administrative bounce forces reconnection through a
 * generation counter, and a per-thread ownership count refuses nested
 * acquisition from the same pool, which is how the classic two-thread
 * deadlock is kept out of handler code.
 */

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use crate::config::{DbPoolSection, ServerConfig};
use crate::error::DbError;
use crate::sync::{Cond, NamedMutex};

thread_local! {
    /// Handles owned by this thread, per pool name.
    static OWNED: RefCell<HashMap<String, usize>> = RefCell::new(HashMap::new());
}

fn owned_from(pool: &str) -> usize {
    OWNED.with(|owned| owned.borrow().get(pool).copied().unwrap_or(0))
}

fn add_owned(pool: &str, delta: isize) {
    OWNED.with(|owned| {
        let mut owned = owned.borrow_mut();
        let count = owned.entry(pool.to_string()).or_insert(0);
        *count = (*count as isize + delta).max(0) as usize;
    });
}

/// A live database connection, owned by one handle at a time.
pub trait DbConn: Send {
    /// Discard any pending rows/statement state.
    fn flush(&mut self) {}

    /// Reset session state between checkouts.
    fn reset(&mut self) {}
}

/// A database driver: opens connections for a datasource.
pub trait DbDriver: Send + Sync {
    fn name(&self) -> &str;

    fn open(
        &self,
        datasource: &str,
        user: Option<&str>,
        password: Option<&str>,
    ) -> Result<Box<dyn DbConn>, DbError>;
}

/// Internal handle record; lives on the free list or inside a checked-out
/// [`DbHandle`].
struct HandleInner {
    conn: Option<Box<dyn DbConn>>,
    connected: bool,
    opened: Option<Instant>,
    accessed: Option<Instant>,
    stale: bool,
    /// Pool generation captured at connect time
    stale_on_close: u64,
    exception_code: String,
    exception_msg: String,
}

impl HandleInner {
    fn new() -> Self {
        HandleInner {
            conn: None,
            connected: false,
            opened: None,
            accessed: None,
            stale: false,
            stale_on_close: 0,
            exception_code: String::new(),
            exception_msg: String::new(),
        }
    }

    fn disconnect(&mut self) {
        self.conn = None;
        self.connected = false;
        self.opened = None;
        self.accessed = None;
        self.stale = false;
    }
}

struct DbPoolState {
    free: VecDeque<HandleInner>,
    /// One multi-handle acquisition in progress
    waiting: bool,
    /// Bounce generation
    stale_on_close: u64,
}

/// A named pool of database handles.
pub struct DbPool {
    name: String,
    description: Option<String>,
    datasource: String,
    user: Option<String>,
    password: Option<String>,
    driver: Arc<dyn DbDriver>,
    nhandles: usize,
    max_idle: Duration,
    max_open: Duration,
    verbose: bool,
    log_sql_errors: bool,
    state: NamedMutex<DbPoolState>,
    wait_cond: Cond,
    get_cond: Cond,
}

impl DbPool {
    fn new(section: &DbPoolSection, driver: Arc<dyn DbDriver>) -> Arc<Self> {
        let mut free = VecDeque::with_capacity(section.connections);
        for _ in 0..section.connections {
            free.push_back(HandleInner::new());
        }
        Arc::new(DbPool {
            name: section.name.clone(),
            description: section.description.clone(),
            datasource: section.datasource.clone(),
            user: section.user.clone(),
            password: section.password.clone(),
            driver,
            nhandles: section.connections,
            max_idle: Duration::from_secs(section.maxidle),
            max_open: Duration::from_secs(section.maxopen),
            verbose: section.verbose,
            log_sql_errors: section.logsqlerrors,
            state: NamedMutex::new(
                "nsdb",
                &section.name,
                DbPoolState {
                    free,
                    waiting: false,
                    stale_on_close: 0,
                },
            ),
            wait_cond: Cond::new(),
            get_cond: Cond::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    pub fn capacity(&self) -> usize {
        self.nhandles
    }

    pub fn available(&self) -> usize {
        self.state.lock().free.len()
    }

    /// Acquire `nwant` handles, waiting at most `wait` (None = forever).
    ///
    /// Partial acquisition never escapes: on timeout or connect failure every
    /// collected handle goes back and the call fails. A thread that already
    /// owns handles from this pool is refused outright.
    pub fn acquire(
        self: &Arc<Self>,
        nwant: usize,
        wait: Option<Duration>,
    ) -> Result<Vec<DbHandle>, DbError> {
        if nwant > self.nhandles {
            error!(
                pool = %self.name,
                nwant, nhandles = self.nhandles,
                "refusing to acquire more handles than the pool holds"
            );
            return Err(DbError::TooManyWanted {
                pool: self.name.clone(),
                wanted: nwant,
                capacity: self.nhandles,
            });
        }
        let owned = owned_from(&self.name);
        if owned > 0 {
            error!(
                pool = %self.name,
                owned, "db handle limit exceeded: thread already owns handles"
            );
            return Err(DbError::AlreadyOwner {
                pool: self.name.clone(),
                owned,
            });
        }
        let deadline = wait.map(|w| Instant::now() + w);

        let mut got: Vec<HandleInner> = Vec::with_capacity(nwant);
        let mut timed_out = false;
        {
            let mut state = self.state.lock();
            // serialize multi-handle acquirers
            while state.waiting {
                let (guard, outcome) = self.wait_cond.timed_wait(state, deadline);
                state = guard;
                if outcome.timed_out() && state.waiting {
                    return Err(DbError::Timeout(self.name.clone()));
                }
            }
            state.waiting = true;
            while !timed_out && got.len() < nwant {
                while !timed_out && state.free.is_empty() {
                    let (guard, outcome) = self.get_cond.timed_wait(state, deadline);
                    state = guard;
                    if outcome.timed_out() && state.free.is_empty() {
                        timed_out = true;
                    }
                }
                if let Some(handle) = state.free.pop_front() {
                    got.push(handle);
                }
            }
            state.waiting = false;
            self.wait_cond.signal();
        }

        // the last handle may have landed exactly as the wait timed out
        if timed_out && got.len() == nwant {
            timed_out = false;
        }

        let mut connect_err = None;
        if !timed_out {
            for handle in got.iter_mut() {
                if !handle.connected {
                    if let Err(err) = self.connect(handle) {
                        connect_err = Some(err);
                        break;
                    }
                }
            }
        }

        if timed_out || connect_err.is_some() {
            let mut state = self.state.lock();
            for handle in got.drain(..) {
                Self::push_free(&mut state, handle);
            }
            if state.waiting {
                self.get_cond.signal();
            }
            drop(state);
            return Err(match connect_err {
                Some(err) => err,
                None => DbError::Timeout(self.name.clone()),
            });
        }

        add_owned(&self.name, nwant as isize);
        Ok(got
            .into_iter()
            .map(|inner| DbHandle {
                inner: Some(inner),
                pool: self.clone(),
            })
            .collect())
    }

    /// Acquire a single handle.
    pub fn acquire_one(self: &Arc<Self>) -> Result<DbHandle, DbError> {
        self.acquire_one_timed(None)
    }

    pub fn acquire_one_timed(self: &Arc<Self>, wait: Option<Duration>) -> Result<DbHandle, DbError> {
        let mut handles = self.acquire(1, wait)?;
        Ok(handles.pop().expect("acquire(1) yields one handle"))
    }

    fn connect(&self, handle: &mut HandleInner) -> Result<(), DbError> {
        match self
            .driver
            .open(&self.datasource, self.user.as_deref(), self.password.as_deref())
        {
            Ok(conn) => {
                handle.conn = Some(conn);
                handle.connected = true;
                let now = Instant::now();
                handle.opened = Some(now);
                handle.accessed = Some(now);
                handle.stale = false;
                handle.stale_on_close = self.state.lock().stale_on_close;
                Ok(())
            }
            Err(err) => {
                handle.disconnect();
                Err(err)
            }
        }
    }

    /// Connected handles go to the head so callers prefer warm handles;
    /// disconnected ones go to the tail.
    fn push_free(state: &mut DbPoolState, handle: HandleInner) {
        if handle.connected {
            state.free.push_front(handle);
        } else {
            state.free.push_back(handle);
        }
    }

    fn is_stale(&self, handle: &HandleInner, generation: u64, now: Instant) -> bool {
        if !handle.connected {
            return false;
        }
        let idle_expired = self.max_idle > Duration::ZERO
            && handle
                .accessed
                .is_some_and(|at| now.duration_since(at) > self.max_idle);
        let open_expired = self.max_open > Duration::ZERO
            && handle
                .opened
                .is_some_and(|at| now.duration_since(at) > self.max_open);
        if idle_expired || open_expired || handle.stale || handle.stale_on_close < generation {
            if self.verbose {
                info!(
                    pool = %self.name,
                    "closing {} handle",
                    if idle_expired { "idle" } else { "old" }
                );
            }
            return true;
        }
        false
    }

    /// Return a checked-out handle. Called from [`DbHandle`] drop.
    fn release(&self, mut handle: HandleInner) {
        if let Some(conn) = handle.conn.as_mut() {
            conn.flush();
            conn.reset();
        }
        handle.exception_code.clear();
        handle.exception_msg.clear();

        let generation = self.state.lock().stale_on_close;
        if self.is_stale(&handle, generation, Instant::now()) {
            handle.disconnect();
        } else if handle.connected {
            handle.accessed = Some(Instant::now());
        }

        let mut state = self.state.lock();
        Self::push_free(&mut state, handle);
        if state.waiting {
            self.get_cond.signal();
        }
        drop(state);
        add_owned(&self.name, -1);
    }

    /// Mark every connected handle stale, forcing reconnection on next use.
    /// Handles checked out right now pick it up at release through the
    /// generation counter.
    pub fn bounce(self: &Arc<Self>) {
        {
            let mut state = self.state.lock();
            state.stale_on_close += 1;
            let generation = state.stale_on_close;
            for handle in state.free.iter_mut() {
                if handle.connected {
                    handle.stale = true;
                }
                handle.stale_on_close = generation;
            }
        }
        self.check();
    }

    /// Disconnect stale free handles. The whole list is drained, examined
    /// outside the lock, and returned.
    pub fn check(self: &Arc<Self>) {
        let (mut drained, generation) = {
            let mut state = self.state.lock();
            let drained: Vec<HandleInner> = state.free.drain(..).collect();
            (drained, state.stale_on_close)
        };
        let now = Instant::now();
        for handle in drained.iter_mut() {
            if self.is_stale(handle, generation, now) {
                handle.disconnect();
            }
        }
        let mut state = self.state.lock();
        for handle in drained {
            Self::push_free(&mut state, handle);
        }
        if state.waiting {
            self.get_cond.signal();
        }
    }

    /// Log a statement or its failure per the pool's verbosity.
    pub fn log_sql(&self, handle: &DbHandle, sql: &str) {
        let exception = handle.exception_msg();
        if !exception.is_empty() {
            if self.log_sql_errors || self.verbose {
                error!(
                    pool = %self.name,
                    datasource = %self.datasource,
                    exception, "sql error: '{}'", sql
                );
            }
        } else if self.verbose {
            info!(pool = %self.name, datasource = %self.datasource, "sql: '{}'", sql);
        }
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("name", &self.name)
            .field("nhandles", &self.nhandles)
            .finish()
    }
}

/// A checked-out database handle. Returns itself to the pool on drop.
pub struct DbHandle {
    inner: Option<HandleInner>,
    pool: Arc<DbPool>,
}

impl DbHandle {
    pub fn pool_name(&self) -> &str {
        self.pool.name()
    }

    pub fn connected(&self) -> bool {
        self.inner.as_ref().is_some_and(|h| h.connected)
    }

    /// The live connection.
    pub fn conn(&mut self) -> &mut dyn DbConn {
        self.inner
            .as_mut()
            .and_then(|h| h.conn.as_deref_mut())
            .expect("checked-out handle is connected")
    }

    /// Flag this handle for disconnect at release.
    pub fn set_stale(&mut self) {
        if let Some(inner) = self.inner.as_mut() {
            inner.stale = true;
        }
    }

    pub fn set_exception(&mut self, code: &str, msg: &str) {
        if let Some(inner) = self.inner.as_mut() {
            inner.exception_code = code.to_string();
            inner.exception_msg = msg.to_string();
        }
    }

    pub fn exception_code(&self) -> &str {
        self.inner
            .as_ref()
            .map_or("", |h| h.exception_code.as_str())
    }

    pub fn exception_msg(&self) -> &str {
        self.inner.as_ref().map_or("", |h| h.exception_msg.as_str())
    }
}

impl Drop for DbHandle {
    fn drop(&mut self) {
        if let Some(inner) = self.inner.take() {
            self.pool.release(inner);
        }
    }
}

impl std::fmt::Debug for DbHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbHandle")
            .field("pool", &self.pool.name)
            .field("connected", &self.connected())
            .finish()
    }
}

/// Directory of configured pools.
pub struct DbPoolSet {
    pools: HashMap<String, Arc<DbPool>>,
    default_pool: Option<String>,
    /// Smallest non-zero maxidle across pools, for the sweep interval
    check_interval: Option<Duration>,
}

impl DbPoolSet {
    /// Build pools from configuration. Pools whose driver is missing are
    /// logged and skipped, like any other bad pool entry.
    pub fn new(config: &ServerConfig, drivers: &HashMap<String, Arc<dyn DbDriver>>) -> Arc<Self> {
        let allowed = config.allowed_dbpools();
        let mut pools = HashMap::new();
        let mut check_interval: Option<Duration> = None;
        for section in &config.dbpools {
            if !allowed.contains(&section.name) {
                continue;
            }
            let Some(driver) = drivers.get(&section.driver) else {
                error!(pool = %section.name, driver = %section.driver, "no such db driver");
                continue;
            };
            if section.maxidle > 0 {
                let idle = Duration::from_secs(section.maxidle);
                check_interval = Some(check_interval.map_or(idle, |min| min.min(idle)));
            }
            pools.insert(section.name.clone(), DbPool::new(section, driver.clone()));
        }

        let default_pool = match config.db.defaultpool.clone() {
            Some(name) if !pools.contains_key(&name) => {
                error!(pool = %name, "no such default db pool");
                None
            }
            other => other,
        };

        if pools.is_empty() {
            info!("no configured db pools");
        }
        Arc::new(DbPoolSet {
            pools,
            default_pool,
            check_interval,
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<DbPool>> {
        self.pools.get(name).cloned()
    }

    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn default_pool(&self) -> Option<&str> {
        self.default_pool.as_deref()
    }

    pub fn allowable(&self, name: &str) -> bool {
        self.pools.contains_key(name)
    }

    /// Interval for the periodic stale-handle sweep, if any pool ages.
    pub fn check_interval(&self) -> Option<Duration> {
        self.check_interval
    }

    /// Sweep every pool for stale handles.
    pub fn check_all(&self) {
        for pool in self.pools.values() {
            pool.check();
        }
    }

    /// Bounce every pool.
    pub fn bounce_all(&self) {
        for pool in self.pools.values() {
            pool.bounce();
        }
        warn!("all db pools bounced");
    }
}

impl std::fmt::Debug for DbPoolSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPoolSet")
            .field("pools", &self.list())
            .finish()
    }
}
