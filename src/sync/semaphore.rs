//! Counting semaphore.

use std::sync::{Condvar, Mutex};

/// A counting semaphore. Created with an initial count; [`wait`](Semaphore::wait)
/// blocks until the count is positive, [`post`](Semaphore::post) releases `n`
/// units at once.
pub struct Semaphore {
    count: Mutex<usize>,
    cond: Condvar,
}

impl Semaphore {
    pub fn new(initial: usize) -> Self {
        Semaphore {
            count: Mutex::new(initial),
            cond: Condvar::new(),
        }
    }

    /// Decrement the count, blocking while it is zero.
    pub fn wait(&self) {
        let mut count = self.count.lock().unwrap();
        while *count == 0 {
            count = self.cond.wait(count).unwrap();
        }
        *count -= 1;
    }

    /// Decrement without blocking; false when the count is zero.
    pub fn try_wait(&self) -> bool {
        let mut count = self.count.lock().unwrap();
        if *count > 0 {
            *count -= 1;
            true
        } else {
            false
        }
    }

    /// Increment the count by `n`, waking up to `n` waiters.
    pub fn post(&self, n: usize) {
        let mut count = self.count.lock().unwrap();
        *count += n;
        if n == 1 {
            self.cond.notify_one();
        } else {
            self.cond.notify_all();
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock().unwrap()
    }
}

impl std::fmt::Debug for Semaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Semaphore")
            .field("count", &self.count())
            .finish()
    }
}
