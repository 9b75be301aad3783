//! Writer-priority read/write lock.
//!
//! Multiple readers or one writer. A waiting writer blocks new readers, so
//! write-heavy registries cannot be starved by a steady reader stream.

use std::cell::UnsafeCell;
use std::sync::{Condvar, Mutex};

struct RwState {
    /// Number of active readers, or -1 while a writer holds the lock.
    lockcnt: isize,
    /// Writers waiting for the lock.
    nwriters: usize,
}

/// Read/write lock with writer priority.
pub struct RwLock<T> {
    sync: Mutex<RwState>,
    readers_ok: Condvar,
    writer_ok: Condvar,
    data: UnsafeCell<T>,
}

unsafe impl<T: Send> Send for RwLock<T> {}
unsafe impl<T: Send + Sync> Sync for RwLock<T> {}

impl<T> RwLock<T> {
    pub fn new(value: T) -> Self {
        RwLock {
            sync: Mutex::new(RwState {
                lockcnt: 0,
                nwriters: 0,
            }),
            readers_ok: Condvar::new(),
            writer_ok: Condvar::new(),
            data: UnsafeCell::new(value),
        }
    }

    /// Acquire shared read access. Blocks while a writer holds or waits.
    pub fn read(&self) -> RwReadGuard<'_, T> {
        let mut state = self.sync.lock().unwrap();
        while state.lockcnt < 0 || state.nwriters > 0 {
            state = self.readers_ok.wait(state).unwrap();
        }
        state.lockcnt += 1;
        RwReadGuard { lock: self }
    }

    /// Acquire exclusive write access.
    pub fn write(&self) -> RwWriteGuard<'_, T> {
        let mut state = self.sync.lock().unwrap();
        state.nwriters += 1;
        while state.lockcnt != 0 {
            state = self.writer_ok.wait(state).unwrap();
        }
        state.nwriters -= 1;
        state.lockcnt = -1;
        RwWriteGuard { lock: self }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for RwLock<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("RwLock")
    }
}

pub struct RwReadGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Drop for RwReadGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.sync.lock().unwrap();
        state.lockcnt -= 1;
        if state.lockcnt == 0 && state.nwriters > 0 {
            self.lock.writer_ok.notify_one();
        }
    }
}

impl<T> std::ops::Deref for RwReadGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

pub struct RwWriteGuard<'a, T> {
    lock: &'a RwLock<T>,
}

impl<T> Drop for RwWriteGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.lock.sync.lock().unwrap();
        state.lockcnt = 0;
        if state.nwriters > 0 {
            self.lock.writer_ok.notify_one();
        } else {
            self.lock.readers_ok.notify_all();
        }
    }
}

impl<T> std::ops::Deref for RwWriteGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> std::ops::DerefMut for RwWriteGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_many_readers() {
        let lock = Arc::new(RwLock::new(7u32));
        let concurrent = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..8 {
            let lock = lock.clone();
            let concurrent = concurrent.clone();
            let peak = peak.clone();
            handles.push(thread::spawn(move || {
                let guard = lock.read();
                let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                assert_eq!(*guard, 7);
                thread::sleep(Duration::from_millis(20));
                concurrent.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) > 1, "readers should overlap");
    }

    #[test]
    fn test_writer_excludes_all() {
        let lock = Arc::new(RwLock::new(0u32));
        let mut handles = vec![];
        for _ in 0..4 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    let mut guard = lock.write();
                    let v = *guard;
                    // a racing writer would make this increment lossy
                    thread::yield_now();
                    *guard = v + 1;
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(*lock.read(), 400);
    }

    #[test]
    fn test_waiting_writer_blocks_new_readers() {
        let lock = Arc::new(RwLock::new(0u32));
        let order = Arc::new(Mutex::new(Vec::new()));

        let first_reader = lock.read();

        let writer = {
            let lock = lock.clone();
            let order = order.clone();
            thread::spawn(move || {
                let mut guard = lock.write();
                *guard = 1;
                order.lock().unwrap().push("writer");
            })
        };
        // let the writer queue up
        thread::sleep(Duration::from_millis(30));

        let late_reader = {
            let lock = lock.clone();
            let order = order.clone();
            thread::spawn(move || {
                let guard = lock.read();
                order.lock().unwrap().push(if *guard == 1 {
                    "reader-after-writer"
                } else {
                    "reader-before-writer"
                });
            })
        };
        thread::sleep(Duration::from_millis(30));
        drop(first_reader);

        writer.join().unwrap();
        late_reader.join().unwrap();
        assert_eq!(
            *order.lock().unwrap(),
            vec!["writer", "reader-after-writer"]
        );
    }
}
