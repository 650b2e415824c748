use std::fs::OpenOptions;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use pakrat_locks::{lock_key_for, FileId, NamedLockRegistry, ShrinkGate};

#[test]
fn registry_serializes_critical_sections_per_key() {
    const THREADS: usize = 8;
    const ITERATIONS: usize = 200;
    const KEYS: [&str; 4] = [
        "dists/stable/Packages.gz",
        "dists/stable/Sources.gz",
        "pool/main/a/acl/acl_2.3.deb",
        "pool/main/z/zlib/zlib_1.3.deb",
    ];

    let registry = NamedLockRegistry::new();
    let busy: Arc<Vec<AtomicBool>> =
        Arc::new(KEYS.iter().map(|_| AtomicBool::new(false)).collect());
    let barrier = Arc::new(Barrier::new(THREADS));

    let mut handles = Vec::new();
    for t in 0..THREADS {
        let registry = Arc::clone(&registry);
        let busy = Arc::clone(&busy);
        let barrier = Arc::clone(&barrier);
        handles.push(thread::spawn(move || {
            barrier.wait();
            for i in 0..ITERATIONS {
                let key_idx = (t + i) % KEYS.len();
                let mut handle = registry.acquire(KEYS[key_idx]);
                handle.lock(false);

                // The named lock must be the only thing letting us in here.
                assert!(
                    busy[key_idx]
                        .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                        .is_ok(),
                    "two holders inside the critical section for {}",
                    KEYS[key_idx]
                );
                busy[key_idx].store(false, Ordering::SeqCst);

                handle.unlock();
            }
        }));
    }
    for h in handles {
        h.join().unwrap();
    }

    // Every handle is gone, so every entry must be too.
    assert_eq!(registry.entry_count(), 0);
    for key in KEYS {
        assert_eq!(registry.handle_count(key), None);
    }
}

#[test]
fn registry_keys_from_paths_contend_correctly() {
    let registry = NamedLockRegistry::new();

    let key_a = lock_key_for(std::path::Path::new("./pool//main/pkg.deb"));
    let key_b = lock_key_for(std::path::Path::new("pool/main/pkg.deb"));
    assert_eq!(key_a, key_b);

    let _first = registry.acquire(&key_a);
    let _second = registry.acquire(&key_b);
    assert_eq!(registry.entry_count(), 1);
    assert_eq!(registry.handle_count(&key_a), Some(2));
}

#[test]
fn shrink_gate_defers_truncate_until_mapping_dropped() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Packages.cache");
    std::fs::write(&path, vec![0xabu8; 4096]).unwrap();

    let gate = ShrinkGate::new();
    let id = FileId::for_path(&path).unwrap();

    let mapper_gate = Arc::clone(&gate);
    let mapper_path = path.clone();
    let mapped = Arc::new(Barrier::new(2));
    let mapped2 = Arc::clone(&mapped);

    let mapper = thread::spawn(move || {
        let file = std::fs::File::open(&mapper_path).unwrap();
        let id = FileId::of_file(&file).unwrap();
        let guard = mapper_gate.acquire(id);

        let map = unsafe { memmap2::Mmap::map(&file).unwrap() };
        assert_eq!(map.len(), 4096);
        assert_eq!(map[0], 0xab);
        mapped2.wait();

        // Keep the mapping alive for a while; the truncator must block.
        thread::sleep(Duration::from_millis(60));
        drop(map);
        drop(guard);
    });

    mapped.wait();

    // The mapping is live; this acquire blocks until the mapper releases.
    let guard = gate.acquire(id);
    let file = OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(16).unwrap();
    drop(guard);

    mapper.join().unwrap();
    assert_eq!(std::fs::metadata(&path).unwrap().len(), 16);
}

#[test]
fn shrink_gate_same_file_two_paths_is_one_identity() {
    let dir = tempfile::tempdir().unwrap();
    let original = dir.path().join("original.deb");
    let linked = dir.path().join("linked.deb");
    {
        let mut f = std::fs::File::create(&original).unwrap();
        f.write_all(b"payload").unwrap();
    }
    std::fs::hard_link(&original, &linked).unwrap();

    let gate = ShrinkGate::new();
    let id_a = FileId::for_path(&original).unwrap();
    let id_b = FileId::for_path(&linked).unwrap();
    assert_eq!(id_a, id_b, "hard links share one file identity");

    let _guard = gate.acquire(id_a);
    assert!(gate.try_acquire(id_b).is_none());
}
