/*!
 * Starport - multi-threaded HTTP application server core
 *
 * The concurrency and resource-management engine of an application server:
 * - Connection lifecycle: accept, queue, dispatch to worker pools, respond,
 *   recycle idle sockets through a keep-alive waiter
 * - Worker pools with min/max threads, idle timeout and per-worker
 *   connection limits, routed by URL
 * - Pre-bound privileged ports handed across the privilege drop
 * - Database handle pools with fair timed multi-acquire and aging
 * - A scheduler for one-shot, periodic, daily and weekly work
 * - Named background job queues for ad-hoc script evaluation
 * - Metered synchronization primitives and per-connection storage
 *
 * Request handlers, the script interpreter and database drivers are
 * external collaborators plugged in through traits.
 */

pub mod cls;
pub mod config;
pub mod conn;
pub mod db;
pub mod driver;
pub mod error;
pub mod http;
pub mod jobs;
pub mod keepalive;
pub mod logging;
pub mod pool;
pub mod prebind;
pub mod sched;
pub mod script;
pub mod serve;
pub mod server;
pub mod sync;
pub mod urlspace;

// Re-export commonly used types for convenience
pub use config::{HeaderCase, LogLevel, ServerConfig};
pub use conn::{Conn, ConnFlags};
pub use db::{DbConn, DbDriver, DbHandle, DbPool, DbPoolSet};
pub use driver::{Driver, Sock, TcpDriver};
pub use error::{DbError, JobError, PoolError, Result, SchedError, ServerError, WaitOutcome};
pub use http::{HeaderSet, HttpVersion, Request};
pub use jobs::{JobQueue, JobQueues};
pub use keepalive::Keepalive;
pub use pool::{Pool, PoolSet, PoolStats};
pub use sched::Scheduler;
pub use script::{InterpHandle, ScriptEngine, ScriptOutcome};
pub use serve::RequestHandler;
pub use server::{Server, ServerCore};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
