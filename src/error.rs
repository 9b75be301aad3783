/*!
 * Error types for starport
 */

use std::io;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, ServerError>;

/// Top-level server error.
///
/// Subsystems carry their own error enums; this type is what startup,
/// shutdown and the binary surface to the operator.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration error. Fatal at startup.
    #[error("config: {0}")]
    Config(String),

    /// I/O error
    #[error("i/o: {0}")]
    Io(#[from] io::Error),

    /// Worker pool error
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Database pool error
    #[error(transparent)]
    Db(#[from] DbError),

    /// Scheduler error
    #[error(transparent)]
    Sched(#[from] SchedError),

    /// Background job queue error
    #[error(transparent)]
    Job(#[from] JobError),

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by the connection worker pools.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool is shutting down and refuses new connections.
    #[error("pool '{0}' is shutting down")]
    Shutdown(String),

    /// No pool registered under this name.
    #[error("no such pool: '{0}'")]
    NoSuchPool(String),
}

/// Errors surfaced by the database handle pools.
///
/// Timeout is distinct from failure: callers that supplied a deadline must be
/// able to tell "not yet" apart from "never".
#[derive(Debug, Error)]
pub enum DbError {
    /// No pool registered under this name.
    #[error("no such db pool: '{0}'")]
    NoSuchPool(String),

    /// More handles requested than the pool will ever hold.
    #[error("requested {wanted} handles from db pool '{pool}' of only {capacity}")]
    TooManyWanted {
        pool: String,
        wanted: usize,
        capacity: usize,
    },

    /// The calling thread already owns handles from this pool. Granting more
    /// could deadlock against another thread doing the same.
    #[error("thread already owns {owned} handle(s) from db pool '{pool}'")]
    AlreadyOwner { pool: String, owned: usize },

    /// The deadline expired before all requested handles became available.
    #[error("timed out acquiring handles from db pool '{0}'")]
    Timeout(String),

    /// The driver failed to open a connection.
    #[error("db connect failed: {0}")]
    Connect(String),

    /// Access to the pool is not allowed for this server.
    #[error("db pool not allowed: '{0}'")]
    NotAllowed(String),
}

/// Errors surfaced by the scheduler.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Out-of-range hour/minute/day at registration.
    #[error("invalid schedule time: {0}")]
    InvalidTime(String),

    /// Unknown job id.
    #[error("no such scheduled job: {0}")]
    NoSuchJob(i32),

    /// The scheduler is shutting down.
    #[error("scheduler is shutting down")]
    Shutdown,
}

/// Errors surfaced by the named background job queues.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    /// Queue name already taken at create.
    #[error("queue already exists: '{0}'")]
    QueueExists(String),

    /// Unknown queue name.
    #[error("no such queue: '{0}'")]
    NoSuchQueue(String),

    /// Unknown job id within a queue.
    #[error("no such job: '{0}'")]
    NoSuchJob(String),

    /// The queue (or the whole server) is stopping.
    #[error("server stopping")]
    Stopping,
}

/// Outcome of a bounded wait.
///
/// `TimedOut` is not an error: a caller holding a predicate loop re-checks and
/// decides. Spurious wakeups report as `Signaled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Signaled,
    TimedOut,
}

impl WaitOutcome {
    pub fn timed_out(self) -> bool {
        self == WaitOutcome::TimedOut
    }
}
