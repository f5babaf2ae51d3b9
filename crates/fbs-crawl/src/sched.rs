//! Extent ordering policies.
//!
//! A scan mode owns a private view derived from the cursor map and
//! rebuilt on every transid change. `scan()` picks one cursor, asks the
//! controller to dispatch one batch from it, and reorders the view per
//! policy. The view snapshot is swapped atomically; the inner mutex
//! serializes scan ticks against the snapshot they started on.

use crate::cursor::CrawlCursor;
use arc_swap::ArcSwap;
use fbs_types::{RootId, Transid};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

/// The discovery pass's view of all cursors, keyed by root.
pub type CrawlMap = BTreeMap<RootId, Arc<CrawlCursor>>;

/// Dispatches one batch of work from a cursor.
pub trait BatchRunner: Send + Sync {
    /// Returns `false` when the cursor has nothing to dispatch.
    fn crawl_batch(&self, cursor: &Arc<CrawlCursor>) -> bool;
}

/// One extent ordering policy.
pub trait ScanMode: Send + Sync {
    /// Dispatch one batch. Returns `false` when the view is empty.
    fn scan(&self, runner: &dyn BatchRunner) -> bool;

    /// Rebuild the view from a fresh cursor map snapshot.
    fn next_transid(&self, map: &CrawlMap);

    fn name(&self) -> &'static str;
}

/// Selector for the four scan modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanModeKind {
    Lockstep,
    Independent,
    Sequential,
    Recent,
}

impl fmt::Display for ScanModeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lockstep => "lockstep",
            Self::Independent => "independent",
            Self::Sequential => "sequential",
            Self::Recent => "recent",
        };
        write!(f, "{name}")
    }
}

impl FromStr for ScanModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "lockstep" => Ok(Self::Lockstep),
            "independent" => Ok(Self::Independent),
            "sequential" => Ok(Self::Sequential),
            "recent" => Ok(Self::Recent),
            other => Err(format!(
                "unknown scan mode {other:?} (expected lockstep, independent, sequential, or recent)"
            )),
        }
    }
}

/// Instantiate the scheduler for `kind`.
#[must_use]
pub fn make_scan_mode(kind: ScanModeKind) -> Arc<dyn ScanMode> {
    match kind {
        ScanModeKind::Lockstep => Arc::new(ScanModeLockstep::new()),
        ScanModeKind::Independent => Arc::new(ScanModeIndependent::new()),
        ScanModeKind::Sequential => Arc::new(ScanModeSequential::new()),
        ScanModeKind::Recent => Arc::new(ScanModeRecent::new()),
    }
}

// ── Lockstep ────────────────────────────────────────────────────────────────

/// Key: next extent's `(inode, offset, root)`.
type LockstepKey = (u64, u64, RootId);

/// Scan the same inode/offset position in each subvolume together.
/// Maximizes cache sharing across snapshots; degrades when snapshots
/// rotate quickly.
pub struct ScanModeLockstep {
    view: ArcSwap<Mutex<BTreeMap<LockstepKey, Arc<CrawlCursor>>>>,
}

impl Default for ScanModeLockstep {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanModeLockstep {
    #[must_use]
    pub fn new() -> Self {
        Self {
            view: ArcSwap::from_pointee(Mutex::new(BTreeMap::new())),
        }
    }
}

impl ScanMode for ScanModeLockstep {
    fn scan(&self, runner: &dyn BatchRunner) -> bool {
        let view = self.view.load_full();
        let mut sorted = view.lock();
        while let Some((_, cursor)) = sorted.pop_first() {
            if runner.crawl_batch(&cursor) {
                if let Some(range) = cursor.peek_front() {
                    let key = (range.fid.ino, range.begin, range.fid.root);
                    let previous = sorted.insert(key, cursor);
                    assert!(previous.is_none(), "duplicate lockstep view key {key:?}");
                }
                return true;
            }
        }
        false
    }

    fn next_transid(&self, map: &CrawlMap) {
        let mut sorted = BTreeMap::new();
        for cursor in map.values() {
            if let Some(range) = cursor.peek_front() {
                let key = (range.fid.ino, range.begin, range.fid.root);
                let previous = sorted.insert(key, Arc::clone(cursor));
                assert!(previous.is_none(), "duplicate lockstep view key {key:?}");
            }
        }
        debug!(cursors = sorted.len(), "lockstep view rebuilt");
        self.view.store(Arc::new(Mutex::new(sorted)));
    }

    fn name(&self) -> &'static str {
        "lockstep"
    }
}

// ── Independent ─────────────────────────────────────────────────────────────

/// Round-robin over subvolumes with no synchronization between them.
/// Smooth forward progress, no head-of-line blocking.
pub struct ScanModeIndependent {
    view: ArcSwap<Mutex<VecDeque<Arc<CrawlCursor>>>>,
}

impl Default for ScanModeIndependent {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanModeIndependent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            view: ArcSwap::from_pointee(Mutex::new(VecDeque::new())),
        }
    }
}

impl ScanMode for ScanModeIndependent {
    fn scan(&self, runner: &dyn BatchRunner) -> bool {
        let view = self.view.load_full();
        let mut subvols = view.lock();
        while let Some(cursor) = subvols.pop_front() {
            if runner.crawl_batch(&cursor) {
                subvols.push_back(cursor);
                return true;
            }
        }
        false
    }

    fn next_transid(&self, map: &CrawlMap) {
        let mut subvols = VecDeque::new();
        for cursor in map.values() {
            if cursor.peek_front().is_some() {
                subvols.push_back(Arc::clone(cursor));
            }
        }
        debug!(cursors = subvols.len(), "independent view rebuilt");
        self.view.store(Arc::new(Mutex::new(subvols)));
    }

    fn name(&self) -> &'static str {
        "independent"
    }
}

// ── Sequential ──────────────────────────────────────────────────────────────

/// Drain each subvolume completely, in numerical order, before moving
/// on. Highest temporary-space cost and the lowest hit rate; retained
/// for experimentation.
pub struct ScanModeSequential {
    view: ArcSwap<Mutex<BTreeMap<RootId, Arc<CrawlCursor>>>>,
}

impl Default for ScanModeSequential {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanModeSequential {
    #[must_use]
    pub fn new() -> Self {
        Self {
            view: ArcSwap::from_pointee(Mutex::new(BTreeMap::new())),
        }
    }
}

impl ScanMode for ScanModeSequential {
    fn scan(&self, runner: &dyn BatchRunner) -> bool {
        let view = self.view.load_full();
        let mut sorted = view.lock();
        loop {
            let Some((&root, cursor)) = sorted.iter().next() else {
                return false;
            };
            let cursor = Arc::clone(cursor);
            if runner.crawl_batch(&cursor) {
                return true;
            }
            sorted.remove(&root);
        }
    }

    fn next_transid(&self, map: &CrawlMap) {
        let mut sorted = BTreeMap::new();
        for cursor in map.values() {
            if cursor.peek_front().is_some() {
                sorted.insert(cursor.root(), Arc::clone(cursor));
            }
        }
        debug!(cursors = sorted.len(), "sequential view rebuilt");
        self.view.store(Arc::new(Mutex::new(sorted)));
    }

    fn name(&self) -> &'static str {
        "sequential"
    }
}

// ── Recent ──────────────────────────────────────────────────────────────────

/// Sort key for the recent mode: descending on the transid pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RecentKey {
    min_transid: Transid,
    max_transid: Transid,
}

impl Ord for RecentKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: larger transids sort first.
        (other.min_transid, other.max_transid).cmp(&(self.min_transid, self.max_transid))
    }
}

impl PartialOrd for RecentKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Prefer subvolumes whose current window is newest. Keeps freshly
/// written small subvolumes from starving behind a large subvolume's
/// first full scan.
pub struct ScanModeRecent {
    view: ArcSwap<Mutex<BTreeMap<RecentKey, VecDeque<Arc<CrawlCursor>>>>>,
}

impl Default for ScanModeRecent {
    fn default() -> Self {
        Self::new()
    }
}

impl ScanModeRecent {
    #[must_use]
    pub fn new() -> Self {
        Self {
            view: ArcSwap::from_pointee(Mutex::new(BTreeMap::new())),
        }
    }
}

impl ScanMode for ScanModeRecent {
    fn scan(&self, runner: &dyn BatchRunner) -> bool {
        let view = self.view.load_full();
        let mut sorted = view.lock();
        loop {
            let Some((key, popped)) = sorted
                .iter_mut()
                .next()
                .map(|(&key, bucket)| (key, bucket.pop_front()))
            else {
                return false;
            };
            let Some(cursor) = popped else {
                sorted.remove(&key);
                continue;
            };
            if runner.crawl_batch(&cursor) {
                if let Some(bucket) = sorted.get_mut(&key) {
                    bucket.push_back(cursor);
                }
                return true;
            }
        }
    }

    fn next_transid(&self, map: &CrawlMap) {
        let mut sorted: BTreeMap<RecentKey, VecDeque<Arc<CrawlCursor>>> = BTreeMap::new();
        for cursor in map.values() {
            if cursor.peek_front().is_some() {
                let state = cursor.state_end();
                let key = RecentKey {
                    min_transid: state.min_transid,
                    // Sorting on the real max_transid would order the
                    // view toward sequential scanning, which is the
                    // worst of the four modes. It stays zero.
                    max_transid: 0,
                };
                sorted.entry(key).or_default().push_back(Arc::clone(cursor));
            }
        }
        debug!(buckets = sorted.len(), "recent view rebuilt");
        self.view.store(Arc::new(Mutex::new(sorted)));
    }

    fn name(&self) -> &'static str {
        "recent"
    }
}
