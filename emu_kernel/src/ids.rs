//! Kernel-wide identifier generation

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Source of never-reused identifiers
///
/// Task keys, thread group and session IDs, FD table and filesystem
/// context IDs and namespace IDs all come from the same sequence.
#[derive(Debug, Default)]
pub struct UniqueIds {
    last: AtomicU64,
    inotify_cookie: AtomicU32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UniqueIdsSnapshot {
    pub last: u64,
    pub inotify_cookie: u32,
}

impl UniqueIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next identifier; never zero
    ///
    /// # Panics
    ///
    /// Panics if the sequence wraps around.
    pub fn next(&self) -> u64 {
        let id = self.last.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if id == 0 {
            panic!("unique identifier generator wrapped around");
        }
        id
    }

    /// Returns the next inotify cookie; wraps around but skips zero
    pub fn next_inotify_cookie(&self) -> u32 {
        let mut id = self.inotify_cookie.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        if id == 0 {
            id = self.inotify_cookie.fetch_add(1, Ordering::SeqCst).wrapping_add(1);
        }
        id
    }

    pub fn snapshot(&self) -> UniqueIdsSnapshot {
        UniqueIdsSnapshot {
            last: self.last.load(Ordering::SeqCst),
            inotify_cookie: self.inotify_cookie.load(Ordering::SeqCst),
        }
    }

    pub fn from_snapshot(snapshot: &UniqueIdsSnapshot) -> Self {
        Self {
            last: AtomicU64::new(snapshot.last),
            inotify_cookie: AtomicU32::new(snapshot.inotify_cookie),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_ids_strictly_increase() {
        let ids = UniqueIds::new();
        let a = ids.next();
        let b = ids.next();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[test]
    fn test_concurrent_ids_are_distinct() {
        let ids = Arc::new(UniqueIds::new());
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let ids = Arc::clone(&ids);
                thread::spawn(move || (0..1000).map(|_| ids.next()).collect::<Vec<_>>())
            })
            .collect();
        let mut seen = BTreeSet::new();
        for h in handles {
            for id in h.join().unwrap() {
                assert_ne!(id, 0);
                assert!(seen.insert(id));
            }
        }
        assert_eq!(seen.len(), 4000);
    }

    #[test]
    #[should_panic(expected = "wrapped around")]
    fn test_wraparound_panics() {
        let ids = UniqueIds::from_snapshot(&UniqueIdsSnapshot {
            last: u64::MAX - 1,
            inotify_cookie: 0,
        });
        assert_eq!(ids.next(), u64::MAX);
        ids.next();
    }

    #[test]
    fn test_inotify_cookie_skips_zero() {
        let ids = UniqueIds::from_snapshot(&UniqueIdsSnapshot {
            last: 0,
            inotify_cookie: u32::MAX - 1,
        });
        assert_eq!(ids.next_inotify_cookie(), u32::MAX);
        assert_eq!(ids.next_inotify_cookie(), 1);
        assert_eq!(ids.next_inotify_cookie(), 2);
    }
}
