//! File-identity exclusion set guarding shrink/truncate against live mmaps.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::sync::Arc;

use pakrat_sync::Monitor;
use tracing::trace;

/// Identity of a file's data on a filesystem: `(device, inode)`, independent
/// of any path it is reachable through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileId {
    pub dev: u64,
    pub ino: u64,
}

impl FileId {
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    pub fn of(meta: &fs::Metadata) -> Self {
        Self {
            dev: meta.dev(),
            ino: meta.ino(),
        }
    }

    /// Identity of an already-open file, via `fstat` on its descriptor.
    pub fn of_file(file: &File) -> io::Result<Self> {
        let st = nix::sys::stat::fstat(file.as_raw_fd()).map_err(io::Error::from)?;
        Ok(Self {
            dev: st.st_dev as u64,
            ino: st.st_ino as u64,
        })
    }

    pub fn for_path(path: &Path) -> io::Result<Self> {
        Ok(Self::of(&fs::metadata(path)?))
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.dev, self.ino)
    }
}

/// Process-wide set of file identities with a shrink-sensitive mapping
/// active.
///
/// Presence is a strict boolean, not a count: a second `acquire` for the
/// same identity blocks until the first guard is dropped. Truncating a file
/// while another thread holds it memory-mapped can corrupt the map or crash
/// the process, so shrink paths take a guard here before touching the file.
///
/// No fairness guarantee among waiters beyond eventual progress: every
/// release wakes all of them and one wins the retry.
pub struct ShrinkGate {
    active: Monitor<HashSet<FileId>>,
}

impl ShrinkGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            active: Monitor::new(HashSet::new()),
        })
    }

    /// Reserve `id`, blocking while any other guard holds it.
    pub fn acquire(self: &Arc<Self>, id: FileId) -> ShrinkGuard {
        let mut active = self.active.lock();
        while !active.insert(id) {
            trace!(%id, "file identity busy, waiting");
            self.active.wait(&mut active);
        }
        trace!(%id, "file identity reserved");
        ShrinkGuard {
            gate: Arc::clone(self),
            id,
        }
    }

    /// Reserve `id` only if no other guard holds it.
    pub fn try_acquire(self: &Arc<Self>, id: FileId) -> Option<ShrinkGuard> {
        let mut active = self.active.lock();
        if active.insert(id) {
            Some(ShrinkGuard {
                gate: Arc::clone(self),
                id,
            })
        } else {
            None
        }
    }

    /// Whether `id` is currently reserved.
    pub fn is_active(&self, id: FileId) -> bool {
        self.active.lock().contains(&id)
    }
}

/// Reservation of one file identity; dropping it releases the identity and
/// wakes every waiter.
pub struct ShrinkGuard {
    gate: Arc<ShrinkGate>,
    id: FileId,
}

impl ShrinkGuard {
    pub fn id(&self) -> FileId {
        self.id
    }
}

impl Drop for ShrinkGuard {
    fn drop(&mut self) {
        {
            let mut active = self.gate.active.lock();
            active.remove(&self.id);
        }
        self.gate.active.notify_all();
        trace!(id = %self.id, "file identity released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn acquire_and_release() {
        let gate = ShrinkGate::new();
        let id = FileId::new(8, 1001);

        let guard = gate.acquire(id);
        assert!(gate.is_active(id));
        drop(guard);
        assert!(!gate.is_active(id));
    }

    #[test]
    fn try_acquire_refuses_held_identity() {
        let gate = ShrinkGate::new();
        let id = FileId::new(8, 1001);

        let guard = gate.acquire(id);
        assert!(gate.try_acquire(id).is_none());
        drop(guard);
        assert!(gate.try_acquire(id).is_some());
    }

    #[test]
    fn distinct_identities_do_not_contend() {
        let gate = ShrinkGate::new();
        let _a = gate.acquire(FileId::new(8, 1001));
        let _b = gate.acquire(FileId::new(8, 1002));
        let _c = gate.acquire(FileId::new(9, 1001));
        assert!(gate.is_active(FileId::new(8, 1001)));
        assert!(gate.is_active(FileId::new(9, 1001)));
    }

    #[test]
    fn second_acquire_blocks_until_guard_drops() {
        let gate = ShrinkGate::new();
        let id = FileId::new(8, 1001);
        let barrier = Arc::new(Barrier::new(2));
        let order = Arc::new(Monitor::new(Vec::new()));

        let guard = gate.acquire(id);

        let gate2 = Arc::clone(&gate);
        let barrier2 = Arc::clone(&barrier);
        let order2 = Arc::clone(&order);
        let waiter = thread::spawn(move || {
            barrier2.wait();
            let _guard = gate2.acquire(id);
            order2.lock().push("waiter");
        });

        barrier.wait();
        thread::sleep(Duration::from_millis(30));
        order.lock().push("holder");
        drop(guard);

        waiter.join().unwrap();
        assert_eq!(*order.lock(), vec!["holder", "waiter"]);
    }

    #[test]
    fn contended_identity_grants_one_at_a_time() {
        const THREADS: usize = 8;
        let gate = ShrinkGate::new();
        let id = FileId::new(3, 42);
        let barrier = Arc::new(Barrier::new(THREADS));
        let inside = Arc::new(Monitor::new(0usize));

        let handles: Vec<_> = (0..THREADS)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let barrier = Arc::clone(&barrier);
                let inside = Arc::clone(&inside);
                thread::spawn(move || {
                    barrier.wait();
                    let _guard = gate.acquire(id);
                    {
                        let mut n = inside.lock();
                        *n += 1;
                        assert_eq!(*n, 1, "two guards granted for one identity");
                    }
                    thread::sleep(Duration::from_millis(2));
                    {
                        let mut n = inside.lock();
                        *n -= 1;
                    }
                })
            })
            .collect();

        for h in handles {
            h.join().unwrap();
        }
        assert!(!gate.is_active(id));
    }

    #[test]
    fn file_id_from_metadata_and_fd_agree() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob.bin");
        fs::write(&path, b"contents").unwrap();

        let by_path = FileId::for_path(&path).unwrap();
        let file = File::open(&path).unwrap();
        let by_fd = FileId::of_file(&file).unwrap();
        assert_eq!(by_path, by_fd);

        // A different file on the same device gets a different inode.
        let other = dir.path().join("other.bin");
        fs::write(&other, b"x").unwrap();
        let other_id = FileId::for_path(&other).unwrap();
        assert_eq!(by_path.dev, other_id.dev);
        assert_ne!(by_path.ino, other_id.ino);
    }
}
