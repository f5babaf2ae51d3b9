//! The one-extent-at-a-time work unit.
//!
//! One `FileCrawl` exists per (cursor, inode) batch. Each execution
//! processes at most one extent item and reports whether it wants to
//! run again; the task pool keeps appending it to itself until the
//! inode is exhausted or the per-inode lock defers it.

use crate::context::ScanContext;
use crate::cursor::{CrawlCursor, CrawlEnv};
use crate::progress::ProgressHolder;
use crate::state::CrawlState;
use fbs_task::{LockSet, Task};
use fbs_types::{FileId, FileRange};
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, warn};

struct FileCrawlInner {
    /// Next file offset to look at.
    offset: u64,
    /// Progress pin for the last committed position.
    hold: ProgressHolder,
}

/// Crawl state for one inode of one cursor.
pub struct FileCrawl {
    env: Arc<CrawlEnv>,
    ctx: Arc<dyn ScanContext>,
    locks: Arc<LockSet>,
    cursor: Arc<CrawlCursor>,
    /// Cursor state snapshot at batch creation.
    state: CrawlState,
    fid: FileId,
    inner: Mutex<FileCrawlInner>,
}

impl FileCrawl {
    #[must_use]
    pub fn new(
        env: Arc<CrawlEnv>,
        ctx: Arc<dyn ScanContext>,
        locks: Arc<LockSet>,
        cursor: Arc<CrawlCursor>,
        state: CrawlState,
        range: &FileRange,
    ) -> Arc<Self> {
        let hold = cursor.hold_state(state);
        Arc::new(Self {
            env,
            ctx,
            locks,
            cursor,
            state,
            fid: range.fid,
            inner: Mutex::new(FileCrawlInner {
                offset: range.begin,
                hold,
            }),
        })
    }

    #[must_use]
    pub fn fid(&self) -> FileId {
        self.fid
    }

    /// Process one extent. Returns whether the task should run again.
    pub fn crawl_one_extent(&self) -> bool {
        let Some(task) = Task::current() else {
            warn!(fid = %self.fid, "file crawl executed outside the task pool");
            return false;
        };

        // Only one thread can usefully dedupe a file; btrfs locks the
        // others out. Snapshots share inode numbers, so locking by
        // inode alone covers the same inode in every subvolume at once.
        let inode_lock = self.locks.get(self.fid.ino);
        let Some(_guard) = inode_lock.try_lock(&task) else {
            self.env.counters.bump("scanf_deferred_inode");
            // The lock's waiter queue re-runs this task on release; no
            // self-reschedule here.
            return false;
        };

        let mut inner = self.inner.lock();
        let item = match self.env.meta.next_file_extent(
            self.fid.root,
            self.fid.ino,
            inner.offset,
            self.state.min_transid,
        ) {
            Err(err) => {
                // A failing lookup means the inode is gone or its
                // metadata is corrupt; either way this task is over.
                // The next transid cycle retries the subvolume.
                warn!(fid = %self.fid, error = %err, "extent lookup failed, aborting file crawl");
                self.env.counters.bump("crawl_abort");
                return false;
            }
            Ok(None) => return false,
            Ok(Some(item)) if item.ino != self.fid.ino => return false,
            Ok(Some(item)) => item,
        };

        // Always advance, even over a garbage item. The max() guards
        // against wrapping at the top of the address space.
        let block_size = self.env.meta.block_size();
        inner.offset = item.offset.saturating_add(block_size).max(item.offset);

        // The search window filters on metadata page transids, which
        // cover everything else that happened to land on the same page.
        // The extent item's own generation decides membership in the
        // window.
        if item.generation < self.state.min_transid {
            self.env.counters.bump("crawl_gen_low");
            return true;
        }
        if item.generation > self.state.max_transid {
            // A new extent referenced from an old page; the next crawl
            // cycle owns it.
            self.env.counters.bump("crawl_gen_high");
            return true;
        }

        match item.kind {
            fbs_btrfs::ExtentKind::Unknown(raw) => {
                debug!(fid = %self.fid, raw, "unhandled file extent type");
                self.env.counters.bump("crawl_unknown");
            }
            fbs_btrfs::ExtentKind::Inline => {
                // TODO: rewrite inline extents as out-of-line dup
                // extents so they become dedupe candidates.
                self.env.counters.bump("crawl_inline");
            }
            kind @ (fbs_btrfs::ExtentKind::Prealloc | fbs_btrfs::ExtentKind::Regular) => {
                if kind == fbs_btrfs::ExtentKind::Prealloc {
                    self.env.counters.bump("crawl_prealloc");
                }
                if item.bytenr == 0 {
                    self.env.counters.bump("crawl_hole");
                } else if item.logical_bytes == 0 {
                    warn!(fid = %self.fid, offset = item.offset, "zero-length extent item");
                    self.env.counters.bump("crawl_abort");
                    return false;
                } else if self.ctx.is_blacklisted(self.fid) {
                    self.env.counters.bump("crawl_blacklisted");
                } else {
                    let range = FileRange::new(
                        self.fid,
                        item.offset,
                        item.offset.saturating_add(item.logical_bytes),
                    );
                    self.env.counters.bump("crawl_push");
                    let mut held = self.state;
                    held.objectid = self.fid.ino;
                    held.offset = range.begin;
                    let new_hold = self.cursor.hold_state(held);
                    let scan_again = match self.ctx.scan_forward(&range) {
                        Ok(again) => again,
                        Err(err) => {
                            // Could be corrupt data or a truncated
                            // file; skip this extent and keep going.
                            warn!(range = %range, error = %err, "scan failed");
                            self.env.counters.bump("scanf_fail");
                            false
                        }
                    };
                    if scan_again {
                        // Keep the old pin: the persisted position must
                        // not advance past a range we will re-emit.
                        self.env.counters.bump("crawl_again");
                    } else {
                        inner.hold = new_hold;
                    }
                }
            }
        }
        true
    }
}
