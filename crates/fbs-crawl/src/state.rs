//! Per-subvolume crawl position.

use fbs_types::{RootId, Transid};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds since the Unix epoch.
#[must_use]
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One subvolume's crawl position: an inode/offset cursor inside a
/// half-open transid window.
///
/// Invariant: `min_transid <= max_transid < u64::MAX`. Values of
/// `u64::MAX` only ever appear in corrupted state files and are
/// repaired on load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrawlState {
    pub root: RootId,
    pub objectid: u64,
    pub offset: u64,
    pub min_transid: Transid,
    pub max_transid: Transid,
    pub started: u64,
}

impl CrawlState {
    /// Fresh state for `root` with an empty window starting now.
    #[must_use]
    pub fn new(root: RootId) -> Self {
        Self {
            root,
            objectid: 0,
            offset: 0,
            min_transid: 0,
            max_transid: 0,
            started: unix_now(),
        }
    }

    fn sort_key(&self) -> (Transid, Transid, u64, u64, RootId, u64) {
        (
            self.min_transid,
            self.max_transid,
            self.objectid,
            self.offset,
            self.root,
            // started is not part of the crawl position; it only breaks
            // ties so the ordering stays consistent with equality.
            self.started,
        )
    }
}

impl Ord for CrawlState {
    fn cmp(&self, other: &Self) -> Ordering {
        self.sort_key().cmp(&other.sort_key())
    }
}

impl PartialOrd for CrawlState {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for CrawlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let age = unix_now().saturating_sub(self.started);
        write!(
            f,
            "root {}:{} offset {:#x} transid {}..{} started {} ({age}s ago)",
            self.root, self.objectid, self.offset, self.min_transid, self.max_transid, self.started
        )
    }
}
