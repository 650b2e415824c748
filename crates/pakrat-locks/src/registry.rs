//! Keyed, reference-counted advisory lock registry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};

use pakrat_sync::Monitor;
use tracing::{debug, trace};

/// Process-wide mapping from resource key to a reference-counted lock entry.
///
/// Handles for the same key share one entry; the entry lives exactly as long
/// as its newest handle. Construct one registry before the worker threads
/// start and pass it (`Arc`) to everything that needs it.
pub struct NamedLockRegistry {
    entries: Monitor<HashMap<String, Arc<NamedEntry>>>,
}

struct NamedEntry {
    /// Live-handle count. Read and written only while the registry lock is
    /// held; the atomic exists for shared mutation through the `Arc`, not
    /// for cross-thread ordering.
    refs: AtomicUsize,
    state: Monitor<EntryState>,
}

#[derive(Default)]
struct EntryState {
    locked: bool,
    owner: Option<ThreadId>,
    mmap_mode: bool,
}

impl NamedEntry {
    fn new() -> Self {
        Self {
            refs: AtomicUsize::new(1),
            state: Monitor::new(EntryState::default()),
        }
    }
}

impl NamedLockRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: Monitor::new(HashMap::new()),
        })
    }

    /// Check out a handle for `key`.
    ///
    /// The lookup and the fresh-entry insert happen under the registry lock,
    /// so two threads racing on the same key always end up sharing one entry.
    /// The handle does not hold the per-key lock yet; see
    /// [`NamedLock::lock`].
    pub fn acquire(self: &Arc<Self>, key: &str) -> NamedLock {
        let mut entries = self.entries.lock();
        let entry = match entries.get(key) {
            Some(entry) => {
                entry.refs.fetch_add(1, Ordering::Relaxed);
                Arc::clone(entry)
            }
            None => {
                debug!(key, "creating named-lock entry");
                let entry = Arc::new(NamedEntry::new());
                entries.insert(key.to_owned(), Arc::clone(&entry));
                entry
            }
        };
        NamedLock {
            registry: Arc::clone(self),
            key: key.to_owned(),
            entry,
            held: false,
        }
    }

    /// Number of live entries (keys with at least one handle).
    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    /// Live-handle count for `key`, if any handle exists.
    pub fn handle_count(&self, key: &str) -> Option<usize> {
        let entries = self.entries.lock();
        entries.get(key).map(|e| e.refs.load(Ordering::Relaxed))
    }

    fn release(&self, key: &str, entry: &NamedEntry) {
        let mut entries = self.entries.lock();
        if entry.refs.fetch_sub(1, Ordering::Relaxed) == 1 {
            debug!(key, "destroying named-lock entry");
            entries.remove(key);
        }
    }
}

/// A checked-out reference to one registry entry.
///
/// The key is bound at construction and cannot be rebound; dropping the
/// handle releases its registry reference (and the per-key lock, if held).
/// The per-key lock is not reentrant; a second `lock()` from the same
/// thread through another handle deadlocks, like any mutex.
pub struct NamedLock {
    registry: Arc<NamedLockRegistry>,
    key: String,
    entry: Arc<NamedEntry>,
    held: bool,
}

impl NamedLock {
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Block until this handle holds the per-key lock, then record the
    /// calling thread as owner.
    ///
    /// `for_mmap` marks the hold as covering a memory-map operation. The
    /// contract for such holds is advisory: the holding thread may be torn
    /// down externally mid-operation, and the next holder must not assume
    /// the protected state is consistent. The recorded owner and flag feed
    /// diagnostics and recovery heuristics only.
    ///
    /// # Panics
    ///
    /// Panics if this handle already holds the lock.
    pub fn lock(&mut self, for_mmap: bool) {
        assert!(!self.held, "handle already holds the lock for {:?}", self.key);
        let mut state = self.entry.state.lock();
        while state.locked {
            trace!(key = %self.key, "waiting for named lock");
            self.entry.state.wait(&mut state);
        }
        state.locked = true;
        state.owner = Some(thread::current().id());
        state.mmap_mode = for_mmap;
        self.held = true;
        trace!(key = %self.key, for_mmap, "named lock acquired");
    }

    /// Release the per-key lock. No-op if this handle never locked (or
    /// already unlocked).
    pub fn unlock(&mut self) {
        if !self.held {
            return;
        }
        {
            let mut state = self.entry.state.lock();
            state.locked = false;
            state.owner = None;
            state.mmap_mode = false;
        }
        self.entry.state.notify_one();
        self.held = false;
        trace!(key = %self.key, "named lock released");
    }

    /// Whether this handle currently holds the per-key lock.
    pub fn is_held(&self) -> bool {
        self.held
    }

    /// Thread currently holding the per-key lock, if any. Advisory.
    pub fn owner(&self) -> Option<ThreadId> {
        self.entry.state.lock().owner
    }

    /// Whether the current hold covers a memory-map operation. Advisory.
    pub fn mmap_mode(&self) -> bool {
        self.entry.state.lock().mmap_mode
    }
}

impl Drop for NamedLock {
    fn drop(&mut self) {
        self.unlock();
        self.registry.release(&self.key, &self.entry);
    }
}
