//! The seam to the downstream scanner, plus the FD caches.
//!
//! Everything past "here is a candidate range" lives behind
//! [`ScanContext`]: content hashing, the dedupe ioctl, blacklisting.
//! The crawler only needs the three hooks below.

use fbs_btrfs::Fd;
use fbs_error::Result;
use fbs_types::{FileId, FileRange};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::hash::Hash;

/// Downstream collaborator interface.
pub trait ScanContext: Send + Sync {
    /// Dedupe one candidate range. `Ok(true)` asks the crawler to
    /// re-emit the same range later; `Ok(false)` advances past it.
    fn scan_forward(&self, range: &FileRange) -> Result<bool>;

    /// Whether this file must not be scanned.
    fn is_blacklisted(&self, fid: FileId) -> bool;

    /// Drop any FDs or resolution state cached downstream. Called on
    /// every transid change so open handles never pin dead snapshots.
    fn clear_caches(&self) {}
}

/// Small LRU map of open FDs.
///
/// Eviction is by least-recent use, tracked with a monotonic stamp per
/// entry; the caches here are small enough that an O(n) eviction scan
/// is fine.
pub struct FdCache<K> {
    capacity: usize,
    inner: Mutex<FdCacheInner<K>>,
}

struct FdCacheInner<K> {
    map: HashMap<K, (Fd, u64)>,
    stamp: u64,
}

impl<K: Eq + Hash + Clone> FdCache<K> {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            inner: Mutex::new(FdCacheInner {
                map: HashMap::new(),
                stamp: 0,
            }),
        }
    }

    #[must_use]
    pub fn get(&self, key: &K) -> Option<Fd> {
        let mut inner = self.inner.lock();
        inner.stamp += 1;
        let stamp = inner.stamp;
        inner.map.get_mut(key).map(|entry| {
            entry.1 = stamp;
            entry.0.clone()
        })
    }

    pub fn insert(&self, key: K, fd: Fd) {
        let mut inner = self.inner.lock();
        inner.stamp += 1;
        let stamp = inner.stamp;
        inner.map.insert(key, (fd, stamp));
        while inner.map.len() > self.capacity {
            let Some(oldest) = inner
                .map
                .iter()
                .min_by_key(|(_, (_, stamp))| *stamp)
                .map(|(key, _)| key.clone())
            else {
                break;
            };
            inner.map.remove(&oldest);
        }
    }

    /// Cached FD for `key`, or the result of `fill` (cached when it
    /// produces one). `fill` runs without the cache lock held, so a
    /// filler may re-enter the cache for a different key.
    pub fn get_or_try_insert(
        &self,
        key: K,
        fill: impl FnOnce() -> Result<Option<Fd>>,
    ) -> Result<Option<Fd>> {
        if let Some(fd) = self.get(&key) {
            return Ok(Some(fd));
        }
        let fd = fill()?;
        if let Some(fd) = &fd {
            self.insert(key, fd.clone());
        }
        Ok(fd)
    }

    pub fn clear(&self) {
        self.inner.lock().map.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().map.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn null_fd() -> Fd {
        Fd::from(std::fs::File::open("/dev/null").unwrap())
    }

    #[test]
    fn evicts_least_recently_used() {
        let cache = FdCache::new(2);
        cache.insert(1_u64, null_fd());
        cache.insert(2, null_fd());
        // Touch 1 so 2 becomes the eviction victim.
        assert!(cache.get(&1).is_some());
        cache.insert(3, null_fd());
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&1).is_some());
        assert!(cache.get(&2).is_none());
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn fill_runs_once_and_caches() {
        let cache = FdCache::new(4);
        let mut calls = 0;
        let fd = cache
            .get_or_try_insert(7_u64, || {
                calls += 1;
                Ok(Some(null_fd()))
            })
            .unwrap();
        assert!(fd.is_some());
        assert_eq!(calls, 1);
        let fd = cache
            .get_or_try_insert(7_u64, || unreachable!("cached"))
            .unwrap();
        assert!(fd.is_some());
    }

    #[test]
    fn negative_results_are_not_cached() {
        let cache = FdCache::new(4);
        let fd = cache.get_or_try_insert(7_u64, || Ok(None)).unwrap();
        assert!(fd.is_none());
        let fd = cache
            .get_or_try_insert(7_u64, || Ok(Some(null_fd())))
            .unwrap();
        assert!(fd.is_some());
    }
}
