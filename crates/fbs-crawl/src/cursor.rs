//! The per-subvolume crawl cursor.
//!
//! A cursor walks one subvolume's EXTENT_DATA items inside a transid
//! window, in `(inode, offset)` order, one lookahead item at a time.
//! When the window is exhausted it advances to a new window ending at
//! the current filesystem transid, or parks itself `finished` and
//! `deferred` until the next transid change.

use crate::counters::Counters;
use crate::progress::{ProgressHolder, ProgressTracker};
use crate::state::{unix_now, CrawlState};
use crate::store::DirtyGen;
use crate::transid::TransidTracker;
use fbs_btrfs::{ExtentItem, MetaSearch};
use fbs_types::{FileId, FileRange, RootId};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared environment handed to every cursor and work unit.
pub struct CrawlEnv {
    pub meta: Arc<dyn MetaSearch>,
    pub counters: Arc<Counters>,
    pub dirt: Arc<DirtyGen>,
    pub transid: Arc<TransidTracker>,
    workaround_btrfs_send: AtomicBool,
}

impl CrawlEnv {
    #[must_use]
    pub fn new(
        meta: Arc<dyn MetaSearch>,
        counters: Arc<Counters>,
        dirt: Arc<DirtyGen>,
        transid: Arc<TransidTracker>,
        workaround_btrfs_send: bool,
    ) -> Self {
        Self {
            meta,
            counters,
            dirt,
            transid,
            workaround_btrfs_send: AtomicBool::new(workaround_btrfs_send),
        }
    }

    pub fn set_workaround_btrfs_send(&self, enable: bool) {
        self.workaround_btrfs_send.store(enable, Ordering::Release);
        if enable {
            info!("btrfs send workaround enabled: read-only subvolumes are invisible");
        } else {
            info!("btrfs send workaround disabled");
        }
    }

    #[must_use]
    pub fn workaround_btrfs_send(&self) -> bool {
        self.workaround_btrfs_send.load(Ordering::Acquire)
    }

    /// Whether `root` is read-only for crawl purposes.
    ///
    /// Without the send workaround every root counts as writable. An
    /// unreadable root item counts as read-only.
    #[must_use]
    pub fn is_root_ro(&self, root: RootId) -> bool {
        if !self.workaround_btrfs_send() {
            return false;
        }
        match self.meta.root_info(root) {
            Ok(Some(info)) => info.is_readonly(),
            Ok(None) | Err(_) => true,
        }
    }
}

#[derive(Debug)]
struct CursorInner {
    lookahead: Option<ExtentItem>,
    deferred: bool,
    finished: bool,
}

/// Crawl state machine for one subvolume.
pub struct CrawlCursor {
    env: Arc<CrawlEnv>,
    root: RootId,
    tracker: ProgressTracker,
    inner: Mutex<CursorInner>,
}

impl CrawlCursor {
    #[must_use]
    pub fn new(env: Arc<CrawlEnv>, initial: CrawlState) -> Arc<Self> {
        Arc::new(Self {
            env,
            root: initial.root,
            tracker: ProgressTracker::new(initial),
            inner: Mutex::new(CursorInner {
                lookahead: None,
                deferred: false,
                finished: false,
            }),
        })
    }

    #[must_use]
    pub fn root(&self) -> RootId {
        self.root
    }

    /// Position safe to persist (never past in-flight work).
    #[must_use]
    pub fn state_begin(&self) -> CrawlState {
        self.tracker.begin()
    }

    /// The cursor's own committed position.
    #[must_use]
    pub fn state_end(&self) -> CrawlState {
        self.tracker.end()
    }

    /// Pin `state` as in flight.
    #[must_use]
    pub fn hold_state(&self, state: CrawlState) -> ProgressHolder {
        self.env.dirt.mark_dirty();
        self.tracker.hold(state)
    }

    /// Commit `state` (merged by ordering; never regresses).
    pub fn set_state(&self, state: CrawlState) {
        self.tracker.advance(state);
        self.env.dirt.mark_dirty();
    }

    pub fn set_deferred(&self, deferred: bool) {
        self.inner.lock().deferred = deferred;
    }

    #[must_use]
    pub fn is_deferred(&self) -> bool {
        self.inner.lock().deferred
    }

    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.lock().finished
    }

    /// Next range this cursor will emit, leaving the lookahead in place.
    #[must_use]
    pub fn peek_front(&self) -> Option<FileRange> {
        let mut inner = self.inner.lock();
        self.fetch_harder(&mut inner);
        inner.lookahead.as_ref().map(|item| self.to_range(item))
    }

    /// Consume and return the next range.
    #[must_use]
    pub fn pop_front(&self) -> Option<FileRange> {
        let mut inner = self.inner.lock();
        self.fetch_harder(&mut inner);
        inner.lookahead.take().map(|item| self.to_range(&item))
    }

    fn to_range(&self, item: &ExtentItem) -> FileRange {
        FileRange::new(
            FileId::new(self.root, item.ino),
            item.offset,
            item.offset.saturating_add(item.logical_bytes),
        )
    }

    fn fetch_harder(&self, inner: &mut CursorInner) {
        while inner.lookahead.is_none() {
            if !self.fetch_extents(inner) {
                return;
            }
        }
    }

    /// Try to produce a lookahead item. Returns whether progress was
    /// made (a new item or a new transid window).
    fn fetch_extents(&self, inner: &mut CursorInner) -> bool {
        // Discovery un-defers us; until then, nothing.
        if inner.deferred {
            return false;
        }

        let old_state = self.state_end();

        // An empty transid interval cannot be scanned.
        if inner.finished || old_state.max_transid <= old_state.min_transid {
            return self.next_transid(inner);
        }

        if self.env.is_root_ro(old_state.root) {
            debug!(root = %old_state.root, "send workaround: skipping read-only root");
            self.env.counters.bump("root_workaround_btrfs_send");
            if old_state.objectid == 0 {
                // The scan has not started; keep max_transid current so
                // a later switch to read-write does not force a search
                // across ancient transids. Never move it backwards.
                let current = self.env.transid.current();
                let mut state = old_state;
                state.max_transid = state.max_transid.max(current);
                state.started = unix_now();
                self.set_state(state);
            }
            inner.deferred = true;
            return false;
        }

        match self
            .env
            .meta
            .next_extent_from(self.root, old_state.objectid, old_state.min_transid)
        {
            Err(err) => {
                // Stop scanning this subvolume until the next transid
                // cycle; the next discovery pass un-defers us.
                warn!(root = %self.root, error = %err, "extent search failed, deferring crawl");
                self.env.counters.bump("crawl_search_fail");
                inner.deferred = true;
                false
            }
            Ok(None) => {
                // Out of data in this window; restart immediately if a
                // newer transid is available.
                self.next_transid(inner)
            }
            Ok(Some(item)) => {
                let mut state = old_state;
                state.objectid = item.ino.saturating_add(1);
                state.offset = 0;
                self.set_state(state);
                inner.lookahead = Some(item);
                true
            }
        }
    }

    /// Advance to the next transid window, or park finished+deferred.
    fn next_transid(&self, inner: &mut CursorInner) -> bool {
        let next_transid = self.env.transid.current();
        let mut state = self.state_end();

        inner.finished = state.max_transid >= next_transid;
        if inner.finished {
            inner.deferred = true;
            debug!(%state, "crawl finished");
            return false;
        }

        state.min_transid = state.max_transid;
        state.max_transid = next_transid;
        state.objectid = 0;
        state.offset = 0;
        state.started = unix_now();
        self.env.counters.bump("crawl_restart");
        self.set_state(state);
        inner.deferred = false;
        info!(%state, "crawl started");
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fbs_btrfs::mem::{MemExtent, MemFs};
    use fbs_btrfs::BTRFS_ROOT_SUBVOL_RDONLY;
    use std::time::Duration;

    fn env_with(fs: Arc<MemFs>, workaround: bool) -> Arc<CrawlEnv> {
        let transid = Arc::new(TransidTracker::new(
            Arc::clone(&fs) as Arc<dyn MetaSearch>,
            Duration::from_secs(1),
        ));
        let _ = transid.sample();
        Arc::new(CrawlEnv::new(
            fs,
            Arc::new(Counters::new()),
            Arc::new(DirtyGen::new()),
            transid,
            workaround,
        ))
    }

    fn fresh_state(root: u64, min: u64, max: u64) -> CrawlState {
        CrawlState {
            root: RootId(root),
            objectid: 0,
            offset: 0,
            min_transid: min,
            max_transid: max,
            started: 0,
        }
    }

    #[test]
    fn pops_extents_in_inode_order() {
        let fs = Arc::new(MemFs::new());
        fs.set_transid(100);
        fs.add_fs_tree(RootId(5));
        fs.add_extent(RootId(5), 257, 0, MemExtent::regular(100, 0x1000, 4096));
        fs.add_extent(RootId(5), 300, 0, MemExtent::regular(100, 0x2000, 4096));
        let env = env_with(Arc::clone(&fs), false);
        let cursor = CrawlCursor::new(env, fresh_state(5, 0, 100));

        let first = cursor.pop_front().unwrap();
        assert_eq!(first.fid, FileId::new(RootId(5), 257));
        // The committed position moved past inode 257.
        assert_eq!(cursor.state_end().objectid, 258);
        let second = cursor.pop_front().unwrap();
        assert_eq!(second.fid, FileId::new(RootId(5), 300));
        assert!(cursor.pop_front().is_none());
        assert!(cursor.is_finished());
        assert!(cursor.is_deferred());
    }

    #[test]
    fn transid_advance_restarts_window() {
        let fs = Arc::new(MemFs::new());
        fs.set_transid(100);
        fs.add_fs_tree(RootId(5));
        let env = env_with(Arc::clone(&fs), false);
        let counters = Arc::clone(&env.counters);
        let cursor = CrawlCursor::new(Arc::clone(&env), fresh_state(5, 100, 100));

        // min == max: the window is empty, and no newer transid exists.
        assert!(cursor.pop_front().is_none());
        assert!(cursor.is_finished());

        // The filesystem moves on; discovery un-defers the cursor.
        fs.set_transid(120);
        let _ = env.transid.sample();
        cursor.set_deferred(false);
        assert!(cursor.pop_front().is_none()); // no extents, but window advanced
        let state = cursor.state_end();
        assert_eq!(state.min_transid, 100);
        assert_eq!(state.max_transid, 120);
        assert_eq!(state.objectid, 0);
        assert_eq!(state.offset, 0);
        assert!(state.started > 0);
        assert_eq!(counters.get("crawl_restart"), 1);
    }

    #[test]
    fn readonly_root_defers_and_ratchets_max_transid() {
        let fs = Arc::new(MemFs::new());
        fs.set_transid(50);
        fs.add_fs_tree(RootId(5));
        fs.add_subvol(RootId(256), RootId(5), 257, "snap", BTRFS_ROOT_SUBVOL_RDONLY);
        fs.add_extent(RootId(256), 300, 0, MemExtent::regular(10, 0x1000, 4096));
        let env = env_with(Arc::clone(&fs), true);
        let counters = Arc::clone(&env.counters);
        let cursor = CrawlCursor::new(env, fresh_state(256, 0, 20));

        assert!(cursor.peek_front().is_none());
        assert!(cursor.is_deferred());
        let state = cursor.state_end();
        assert_eq!(state.max_transid, 50);
        assert_eq!(counters.get("root_workaround_btrfs_send"), 1);
    }

    #[test]
    fn search_failure_defers_cursor() {
        // MemFs reports an unknown root as "no extents", so the error
        // path needs a meta implementation that actually fails.
        struct FailingMeta;
        impl MetaSearch for FailingMeta {
            fn current_transid(&self) -> fbs_error::Result<u64> {
                Ok(100)
            }
            fn root_info(&self, _: RootId) -> fbs_error::Result<Option<fbs_btrfs::RootInfo>> {
                Ok(None)
            }
            fn root_backref(&self, _: RootId) -> fbs_error::Result<Option<fbs_btrfs::RootBackref>> {
                Ok(None)
            }
            fn next_root_backref(
                &self,
                _: RootId,
            ) -> fbs_error::Result<Option<fbs_btrfs::RootBackref>> {
                Ok(None)
            }
            fn next_extent_from(
                &self,
                _: RootId,
                _: u64,
                _: u64,
            ) -> fbs_error::Result<Option<ExtentItem>> {
                Err(fbs_error::FbsError::search("injected failure"))
            }
            fn next_file_extent(
                &self,
                _: RootId,
                _: u64,
                _: u64,
                _: u64,
            ) -> fbs_error::Result<Option<ExtentItem>> {
                Err(fbs_error::FbsError::search("injected failure"))
            }
            fn block_size(&self) -> u64 {
                4096
            }
        }
        let meta: Arc<dyn MetaSearch> = Arc::new(FailingMeta);
        let transid = Arc::new(TransidTracker::new(
            Arc::clone(&meta),
            Duration::from_secs(1),
        ));
        let _ = transid.sample();
        let env = Arc::new(CrawlEnv::new(
            meta,
            Arc::new(Counters::new()),
            Arc::new(DirtyGen::new()),
            transid,
            false,
        ));
        let counters = Arc::clone(&env.counters);
        let cursor = CrawlCursor::new(env, fresh_state(5, 0, 100));
        assert!(cursor.pop_front().is_none());
        assert!(cursor.is_deferred());
        assert!(!cursor.is_finished());
        assert_eq!(counters.get("crawl_search_fail"), 1);
    }
}
