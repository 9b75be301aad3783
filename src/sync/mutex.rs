//! Named mutexes with lock and contention counters.
//!
//! Every [`NamedMutex`] registers itself in a process-wide list so the
//! running set can be enumerated with [`enumerate`] together with the
//! counters and the current owner, which is what makes lock contention
//! visible from the outside of a long-lived server.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard as StdMutexGuard, Weak};

use once_cell::sync::Lazy;

/// Display names are truncated to this many bytes.
const NAME_MAX: usize = 32;

static NEXT_ID: AtomicUsize = AtomicUsize::new(1);

/// Registry of all live mutex meters, for enumeration.
static REGISTRY: Lazy<StdMutex<Vec<Weak<Meter>>>> = Lazy::new(|| StdMutex::new(Vec::new()));

/// Counters and identity shared between a mutex and the registry.
pub(crate) struct Meter {
    id: usize,
    name: StdMutex<String>,
    nlock: AtomicU64,
    nbusy: AtomicU64,
    owner: StdMutex<Option<String>>,
}

impl Meter {
    fn new(name: String) -> Arc<Self> {
        let meter = Arc::new(Meter {
            id: NEXT_ID.fetch_add(1, Ordering::Relaxed),
            name: StdMutex::new(truncate(&name)),
            nlock: AtomicU64::new(0),
            nbusy: AtomicU64::new(0),
            owner: StdMutex::new(None),
        });
        let mut registry = REGISTRY.lock().unwrap();
        registry.retain(|w| w.strong_count() > 0);
        registry.push(Arc::downgrade(&meter));
        meter
    }

    pub(crate) fn note_acquired(&self) {
        self.nlock.fetch_add(1, Ordering::Relaxed);
        self.set_owner();
    }

    pub(crate) fn note_contended(&self) {
        self.nbusy.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn set_owner(&self) {
        let name = std::thread::current()
            .name()
            .unwrap_or("unnamed")
            .to_string();
        *self.owner.lock().unwrap() = Some(name);
    }

    pub(crate) fn clear_owner(&self) {
        *self.owner.lock().unwrap() = None;
    }
}

fn truncate(name: &str) -> String {
    name.chars().take(NAME_MAX).collect()
}

/// Snapshot of one mutex for enumeration visitors.
#[derive(Debug, Clone)]
pub struct MutexInfo {
    pub id: usize,
    pub name: String,
    /// Total successful acquires
    pub nlock: u64,
    /// Acquires that found the lock held
    pub nbusy: u64,
    /// Thread name of the current holder, if any
    pub owner: Option<String>,
}

/// Visit every live named mutex.
pub fn enumerate<F: FnMut(&MutexInfo)>(mut visitor: F) {
    let metas: Vec<Arc<Meter>> = {
        let registry = REGISTRY.lock().unwrap();
        registry.iter().filter_map(Weak::upgrade).collect()
    };
    for meter in metas {
        let info = MutexInfo {
            id: meter.id,
            name: meter.name.lock().unwrap().clone(),
            nlock: meter.nlock.load(Ordering::Relaxed),
            nbusy: meter.nbusy.load(Ordering::Relaxed),
            owner: meter.owner.lock().unwrap().clone(),
        };
        visitor(&info);
    }
}

/// A mutex with a display name and acquire/contention counters.
pub struct NamedMutex<T> {
    inner: StdMutex<T>,
    pub(crate) meter: Arc<Meter>,
}

impl<T> NamedMutex<T> {
    /// Create a mutex named `prefix:name`.
    pub fn new(prefix: &str, name: &str, value: T) -> Self {
        NamedMutex {
            inner: StdMutex::new(value),
            meter: Meter::new(format!("{}:{}", prefix, name)),
        }
    }

    /// Update the display name.
    pub fn set_name(&self, prefix: &str, name: &str) {
        *self.meter.name.lock().unwrap() = truncate(&format!("{}:{}", prefix, name));
    }

    /// Acquire the lock, counting contention when the fast path fails.
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let guard = match self.inner.try_lock() {
            Ok(guard) => guard,
            Err(std::sync::TryLockError::WouldBlock) => {
                self.meter.note_contended();
                self.inner.lock().unwrap()
            }
            Err(std::sync::TryLockError::Poisoned(e)) => panic!("poisoned mutex: {}", e),
        };
        self.meter.note_acquired();
        MutexGuard {
            inner: Some(guard),
            mutex: self,
        }
    }

    pub fn nlock(&self) -> u64 {
        self.meter.nlock.load(Ordering::Relaxed)
    }

    pub fn nbusy(&self) -> u64 {
        self.meter.nbusy.load(Ordering::Relaxed)
    }
}

impl<T> std::fmt::Debug for NamedMutex<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedMutex")
            .field("id", &self.meter.id)
            .field("name", &*self.meter.name.lock().unwrap())
            .finish()
    }
}

/// Guard for a [`NamedMutex`]; clears the recorded owner on release.
pub struct MutexGuard<'a, T> {
    // Only None transiently inside a condition wait or during drop.
    inner: Option<StdMutexGuard<'a, T>>,
    pub(crate) mutex: &'a NamedMutex<T>,
}

impl<'a, T> MutexGuard<'a, T> {
    /// Release the std guard for a condition wait. The caller must rewrap.
    pub(crate) fn into_std(mut self) -> StdMutexGuard<'a, T> {
        self.mutex.meter.clear_owner();
        self.inner.take().unwrap()
    }

    /// Rewrap after a condition wait. Counters are untouched: a wait is not
    /// a fresh acquire.
    pub(crate) fn rewrap(guard: StdMutexGuard<'a, T>, mutex: &'a NamedMutex<T>) -> Self {
        mutex.meter.set_owner();
        MutexGuard {
            inner: Some(guard),
            mutex,
        }
    }
}

impl<T> Drop for MutexGuard<'_, T> {
    fn drop(&mut self) {
        if self.inner.is_some() {
            self.mutex.meter.clear_owner();
        }
    }
}

impl<T> std::ops::Deref for MutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.inner.as_ref().unwrap()
    }
}

impl<T> std::ops::DerefMut for MutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        self.inner.as_mut().unwrap()
    }
}
