/*!
 * Per-connection local storage
 *
 * Connection-scoped storage in the shape of thread-local storage: modules
 * allocate an integer key once at init together with a cleanup callback, then
 * stash per-connection values under that key. Slots belong to the single
 * thread serving the connection; cleanup runs on that thread at close.
 */

use std::any::Any;
use std::sync::Arc;
use std::sync::Mutex;

use once_cell::sync::Lazy;

/// Cleanup passes run at most this many times, so callbacks that repopulate
/// slots terminate.
const CLEANUP_PASSES: usize = 5;

/// Cleanup callback: receives the slot table (so it may set other slots) and
/// the value being destroyed.
pub type ClsCleanup = Arc<dyn Fn(&mut ClsSlots, Box<dyn Any + Send>) + Send + Sync>;

static CLEANUPS: Lazy<Mutex<Vec<Option<ClsCleanup>>>> = Lazy::new(|| {
    // slot 0 is reserved; keys start at 1
    Mutex::new(vec![None])
});

/// Key into a connection's slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClsKey(usize);

/// Allocate the next key, registering an optional cleanup callback.
pub fn alloc(cleanup: Option<ClsCleanup>) -> ClsKey {
    let mut cleanups = CLEANUPS.lock().unwrap();
    let key = cleanups.len();
    cleanups.push(cleanup);
    ClsKey(key)
}

fn cleanup_for(key: usize) -> Option<ClsCleanup> {
    CLEANUPS.lock().unwrap().get(key).cloned().flatten()
}

fn registered_keys() -> usize {
    CLEANUPS.lock().unwrap().len()
}

/// The per-connection slot table. Grows on demand; never shared between
/// threads.
#[derive(Default)]
pub struct ClsSlots {
    slots: Vec<Option<Box<dyn Any + Send>>>,
}

impl ClsSlots {
    pub fn new() -> Self {
        ClsSlots { slots: Vec::new() }
    }

    /// Store a value under `key`, replacing any previous value without
    /// running its cleanup.
    pub fn set<V: Any + Send>(&mut self, key: ClsKey, value: V) {
        if self.slots.len() <= key.0 {
            self.slots.resize_with(key.0 + 1, || None);
        }
        self.slots[key.0] = Some(Box::new(value));
    }

    /// Borrow the value under `key`, if present and of type `V`.
    pub fn get<V: Any + Send>(&self, key: ClsKey) -> Option<&V> {
        self.slots
            .get(key.0)
            .and_then(Option::as_ref)
            .and_then(|v| v.downcast_ref())
    }

    /// Remove and return the value under `key` without running cleanup.
    pub fn take<V: Any + Send>(&mut self, key: ClsKey) -> Option<V> {
        let boxed = self.slots.get_mut(key.0).and_then(Option::take)?;
        match boxed.downcast::<V>() {
            Ok(v) => Some(*v),
            Err(boxed) => {
                // wrong type requested; put it back
                self.slots[key.0] = Some(boxed);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }

    /// Run registered cleanups for every occupied slot, retrying while
    /// callbacks repopulate slots, up to [`CLEANUP_PASSES`] passes.
    pub fn cleanup(&mut self) {
        let nkeys = registered_keys().max(self.slots.len());
        for _ in 0..CLEANUP_PASSES {
            let mut ran = false;
            let mut key = nkeys;
            while key > 0 {
                key -= 1;
                let value = match self.slots.get_mut(key).and_then(Option::take) {
                    Some(value) => value,
                    None => continue,
                };
                match cleanup_for(key) {
                    Some(cleanup) => {
                        cleanup(self, value);
                        ran = true;
                    }
                    None => drop(value),
                }
            }
            if !ran {
                return;
            }
        }
    }
}

impl std::fmt::Debug for ClsSlots {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClsSlots")
            .field("occupied", &self.slots.iter().filter(|s| s.is_some()).count())
            .finish()
    }
}
