/*!
 * Synchronization primitives with metering
 *
 * Thin layers over `std::sync` that add what the server needs for
 * introspection and deadline handling: named mutexes with lock/contention
 * counters and a process-wide registry, condition variables with
 * absolute-deadline waits, a writer-priority read/write lock, a counting
 * semaphore, and a recursive critical section.
 *
 * Failure of an underlying lock operation (poisoning) is a programming fault
 * and panics; no server code path catches it.
 */

pub mod cond;
pub mod critical;
pub mod mutex;
pub mod rwlock;
pub mod semaphore;

pub use cond::Cond;
pub use critical::Critical;
pub use mutex::{enumerate, MutexGuard, MutexInfo, NamedMutex};
pub use rwlock::RwLock;
pub use semaphore::Semaphore;
