//! Recursive critical section.
//!
//! Re-entry by the owning thread is a no-op beyond a depth count; other
//! threads block until the depth returns to zero.

use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

struct CsState {
    owner: Option<ThreadId>,
    depth: usize,
}

/// A recursive lock.
pub struct Critical {
    state: Mutex<CsState>,
    cond: Condvar,
}

impl Default for Critical {
    fn default() -> Self {
        Self::new()
    }
}

impl Critical {
    pub fn new() -> Self {
        Critical {
            state: Mutex::new(CsState {
                owner: None,
                depth: 0,
            }),
            cond: Condvar::new(),
        }
    }

    /// Enter the section, blocking unless this thread already owns it.
    pub fn enter(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        if state.owner == Some(me) {
            state.depth += 1;
            return;
        }
        while state.depth > 0 {
            state = self.cond.wait(state).unwrap();
        }
        state.owner = Some(me);
        state.depth = 1;
    }

    /// Leave the section. Panics if the calling thread is not the owner.
    pub fn leave(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.owner, Some(me), "leave() by non-owning thread");
        state.depth -= 1;
        if state.depth == 0 {
            state.owner = None;
            self.cond.notify_one();
        }
    }

    /// Run `f` inside the section.
    pub fn section<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter();
        let result = f();
        self.leave();
        result
    }
}

impl std::fmt::Debug for Critical {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Critical")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_reentrant() {
        let cs = Critical::new();
        cs.enter();
        cs.enter();
        cs.leave();
        cs.leave();
        // fully released: another enter proceeds
        cs.section(|| ());
    }

    #[test]
    fn test_excludes_other_threads_until_depth_zero() {
        let cs = Arc::new(Critical::new());
        cs.enter();
        cs.enter();

        let other = {
            let cs = cs.clone();
            thread::spawn(move || {
                cs.section(|| ());
            })
        };

        thread::sleep(Duration::from_millis(30));
        assert!(!other.is_finished(), "still held at depth 2");
        cs.leave();
        thread::sleep(Duration::from_millis(30));
        assert!(!other.is_finished(), "still held at depth 1");
        cs.leave();
        other.join().unwrap();
    }

    #[test]
    #[should_panic(expected = "non-owning")]
    fn test_leave_without_enter_panics() {
        let cs = Critical::new();
        cs.leave();
    }
}
