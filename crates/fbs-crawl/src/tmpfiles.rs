//! Registry of staged rewrite files.
//!
//! Rewrite temporaries have no stable path, so path resolution cannot
//! find them; the registry hands out their FDs directly. Both misuse
//! cases (double insert, erase of an absent entry) are bugs in the
//! caller, not recoverable conditions.

use fbs_btrfs::Fd;
use fbs_types::FileId;
use parking_lot::Mutex;
use std::collections::HashMap;

/// `FileId` → open FD map for staged rewrite files.
#[derive(Default)]
pub struct TmpfileRegistry {
    map: Mutex<HashMap<FileId, Fd>>,
}

impl TmpfileRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `fd` under `fid`.
    ///
    /// # Panics
    /// Panics if `fid` is already registered.
    pub fn insert(&self, fid: FileId, fd: Fd) {
        let previous = self.map.lock().insert(fid, fd);
        assert!(previous.is_none(), "tmpfile {fid} registered twice");
    }

    /// Remove the registration for `fid`.
    ///
    /// # Panics
    /// Panics if `fid` is not registered.
    pub fn erase(&self, fid: FileId) {
        let removed = self.map.lock().remove(&fid);
        assert!(removed.is_some(), "tmpfile {fid} erased but never registered");
    }

    #[must_use]
    pub fn get(&self, fid: FileId) -> Option<Fd> {
        self.map.lock().get(&fid).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.lock().is_empty()
    }
}
