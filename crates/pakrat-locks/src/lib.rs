//! # pakrat-locks
//!
//! Advisory locking for shared cache resources:
//!
//! - [`NamedLockRegistry`]: a keyed, reference-counted registry of
//!   per-resource locks. Request handlers check out a lock by key (typically
//!   a cache-relative path) before touching the resource it names.
//! - [`ShrinkGate`]: a file-identity exclusion set that keeps a
//!   truncate/shrink from racing a live memory map of the same file.
//!
//! Both are advisory: they only constrain callers that go through them.
//! Both are process-wide singletons by convention, constructed before the
//! worker threads start and handed to the components that need them.

mod registry;
mod shrink;

pub use registry::{NamedLock, NamedLockRegistry};
pub use shrink::{FileId, ShrinkGate, ShrinkGuard};

use std::path::{Component, Path};

/// Derive a registry key from a cache-relative path.
///
/// The registry itself treats keys as opaque strings; this is the
/// conventional mapping callers use so that `./a//b` and `a/b` contend on
/// the same entry.
pub fn lock_key_for(path: &Path) -> String {
    let mut segments: Vec<String> = Vec::new();
    for comp in path.components() {
        match comp {
            Component::Normal(c) => segments.push(c.to_string_lossy().into_owned()),
            Component::ParentDir => {
                segments.pop();
            }
            Component::RootDir | Component::CurDir | Component::Prefix(_) => {}
        }
    }
    segments.join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn lock_key_normalizes_separators() {
        assert_eq!(lock_key_for(Path::new("a/b/c.deb")), "a/b/c.deb");
        assert_eq!(lock_key_for(Path::new("./a//b/c.deb")), "a/b/c.deb");
        assert_eq!(lock_key_for(Path::new("/a/b/c.deb")), "a/b/c.deb");
        assert_eq!(lock_key_for(Path::new("a/x/../b")), "a/b");
    }

    #[test]
    fn lock_key_equal_paths_share_key() {
        let a = lock_key_for(&PathBuf::from("dists/stable/Packages.gz"));
        let b = lock_key_for(&PathBuf::from("./dists/./stable/Packages.gz"));
        assert_eq!(a, b);
    }
}
