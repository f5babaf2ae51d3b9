//! The roots controller.
//!
//! Owns the cursor map, the active scan mode, the resolver and FD
//! caches, the tmpfile registry, and the two background threads: the
//! transid watcher (discovery and crawl restart on every transid
//! change) and the state writeback. Lock order is controller state →
//! cursor internals → tmpfile registry; nothing here is held across
//! kernel I/O.

use crate::context::ScanContext;
use crate::counters::Counters;
use crate::cursor::{CrawlCursor, CrawlEnv};
use crate::filecrawl::FileCrawl;
use crate::resolve::RootResolver;
use crate::sched::{make_scan_mode, BatchRunner, CrawlMap, ScanMode, ScanModeKind};
use crate::state::{unix_now, CrawlState};
use crate::store::{CrawlStateStore, DirtyGen};
use crate::tmpfiles::TmpfileRegistry;
use crate::transid::TransidTracker;
use crate::Config;
use fbs_btrfs::{Fd, FileOps, MetaSearch};
use fbs_error::{FbsError, Result};
use fbs_task::{LockSet, Task, TaskMutex, TaskPool};
use fbs_types::{FileId, RootId};
use parking_lot::{Condvar, Mutex};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

struct RootsState {
    crawl_map: CrawlMap,
    scanner: Arc<dyn ScanMode>,
}

/// Crawl lifecycle controller.
pub struct Roots {
    env: Arc<CrawlEnv>,
    ctx: Arc<dyn ScanContext>,
    files: Arc<dyn FileOps>,
    pool: Arc<TaskPool>,
    resolver: RootResolver,
    store: CrawlStateStore,
    tmpfiles: TmpfileRegistry,
    inode_locks: Arc<LockSet>,
    writeback_interval: Duration,
    state: Mutex<RootsState>,
    stop: Mutex<bool>,
    stop_condvar: Condvar,
    watcher_thread: Mutex<Option<JoinHandle<()>>>,
    writeback_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Roots {
    /// Wire up a controller. Nothing runs until [`Roots::start`].
    #[must_use]
    pub fn new(
        config: &Config,
        meta: Arc<dyn MetaSearch>,
        files: Arc<dyn FileOps>,
        ctx: Arc<dyn ScanContext>,
        counters: Arc<Counters>,
        pool: Arc<TaskPool>,
        root_fd: Fd,
        home: PathBuf,
    ) -> Arc<Self> {
        let dirt = Arc::new(DirtyGen::new());
        let transid = Arc::new(TransidTracker::new(
            Arc::clone(&meta),
            config.transid_poll_interval,
        ));
        let env = Arc::new(CrawlEnv::new(
            Arc::clone(&meta),
            Arc::clone(&counters),
            Arc::clone(&dirt),
            transid,
            config.workaround_btrfs_send,
        ));
        let resolver = RootResolver::new(meta, Arc::clone(&files), Arc::clone(&counters), root_fd);
        let store = CrawlStateStore::new(home, dirt, counters);
        let scanner = make_scan_mode(config.scan_mode);
        info!(mode = scanner.name(), "scan mode selected");
        Arc::new(Self {
            env,
            ctx,
            files,
            pool,
            resolver,
            store,
            tmpfiles: TmpfileRegistry::new(),
            inode_locks: Arc::new(LockSet::new()),
            writeback_interval: config.writeback_interval,
            state: Mutex::new(RootsState {
                crawl_map: CrawlMap::new(),
                scanner,
            }),
            stop: Mutex::new(false),
            stop_condvar: Condvar::new(),
            watcher_thread: Mutex::new(None),
            writeback_thread: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn counters(&self) -> &Arc<Counters> {
        &self.env.counters
    }

    #[must_use]
    pub fn env(&self) -> &Arc<CrawlEnv> {
        &self.env
    }

    /// Shared per-inode lock, keyed by inode number alone so snapshots
    /// contend with each other.
    #[must_use]
    pub fn inode_lock(&self, ino: u64) -> Arc<TaskMutex> {
        self.inode_locks.get(ino)
    }

    /// Snapshot of the cursor map.
    #[must_use]
    pub fn crawl_map(&self) -> CrawlMap {
        self.state.lock().crawl_map.clone()
    }

    /// Replace the scheduler. The new view fills at the next discovery
    /// pass.
    pub fn set_scan_mode(&self, kind: ScanModeKind) {
        let scanner = make_scan_mode(kind);
        info!(mode = scanner.name(), "scan mode set");
        self.state.lock().scanner = scanner;
    }

    pub fn set_workaround_btrfs_send(&self, enable: bool) {
        self.env.set_workaround_btrfs_send(enable);
    }

    #[must_use]
    pub fn is_root_ro(&self, root: RootId) -> bool {
        self.env.is_root_ro(root)
    }

    // ── FD resolution ───────────────────────────────────────────────

    pub fn open_root(&self, root: RootId) -> Result<Option<Fd>> {
        self.resolver.open_root(root)
    }

    pub fn open_root_ino(&self, fid: FileId) -> Result<Option<Fd>> {
        self.resolver.open_root_ino(fid, &self.tmpfiles)
    }

    /// Register a staged rewrite file so lookups bypass paths.
    pub fn insert_tmpfile(&self, fd: &Fd) -> Result<()> {
        let fid = self.fd_fid(fd)?;
        self.tmpfiles.insert(fid, fd.clone());
        Ok(())
    }

    pub fn erase_tmpfile(&self, fd: &Fd) -> Result<()> {
        let fid = self.fd_fid(fd)?;
        self.tmpfiles.erase(fid);
        Ok(())
    }

    fn fd_fid(&self, fd: &Fd) -> Result<FileId> {
        let root = self.files.fd_root_id(fd)?;
        let identity = self.files.fd_identity(fd)?;
        Ok(FileId::new(root, identity.ino))
    }

    // ── Cursor map maintenance ──────────────────────────────────────

    /// Minimum `min_transid` over all writable cursors; 0 for an empty
    /// map.
    pub fn transid_min(&self) -> Result<u64> {
        let map = self.crawl_map();
        if map.is_empty() {
            return Ok(0);
        }
        let mut min = u64::MAX;
        for (root, cursor) in &map {
            // Roots isolated by the send workaround do not advance
            // until the workaround lifts or they turn read-write;
            // counting them would pin the minimum forever.
            if !self.env.is_root_ro(*root) {
                min = min.min(cursor.state_end().min_transid);
            }
        }
        if min == u64::MAX {
            // Reachable when every root is read-only under the send
            // workaround. Seeding new cursors from the sentinel would
            // overflow, so discovery gives up instead.
            return Err(FbsError::invalid_state(
                "transid_min reduction never assigned",
            ));
        }
        Ok(min)
    }

    fn insert_root(&self, new_state: CrawlState) {
        let mut st = self.state.lock();
        let cursor = st.crawl_map.entry(new_state.root).or_insert_with(|| {
            self.env.dirt.mark_dirty();
            CrawlCursor::new(Arc::clone(&self.env), new_state)
        });
        cursor.set_deferred(false);
    }

    fn crawl_state_erase(&self, root: RootId) {
        let mut st = self.state.lock();
        // Keep at least one cursor: it carries our transid high-water
        // mark.
        if st.crawl_map.len() < 2 {
            self.env.counters.bump("crawl_no_empty");
            return;
        }
        let anchor = st
            .crawl_map
            .iter()
            .max_by_key(|(r, cursor)| (cursor.state_end().max_transid, std::cmp::Reverse(**r)))
            .map(|(r, _)| *r);
        if anchor == Some(root) {
            debug!(%root, "not erasing the max-transid anchor cursor");
            self.env.counters.bump("crawl_anchor_kept");
            return;
        }
        if st.crawl_map.remove(&root).is_some() {
            self.env.dirt.mark_dirty();
        }
    }

    /// Discovery: add crawlers for new subvolumes, drop crawlers for
    /// vanished ones, hand the scheduler a fresh view.
    pub fn insert_new_crawl(&self) -> Result<()> {
        let min_transid = self.transid_min()?;
        let max_transid = self.env.transid.current();

        let mut excess: BTreeSet<RootId> =
            self.state.lock().crawl_map.keys().copied().collect();

        let mut root = RootId(0);
        while let Some(next) = self.resolver.next_root(root)? {
            root = next;
            excess.remove(&root);
            self.insert_root(CrawlState {
                root,
                objectid: 0,
                offset: 0,
                min_transid,
                max_transid,
                started: unix_now(),
            });
            self.env.counters.bump("crawl_create");
        }

        for root in excess {
            self.crawl_state_erase(root);
        }

        let (snapshot, scanner) = {
            let st = self.state.lock();
            (st.crawl_map.clone(), Arc::clone(&st.scanner))
        };
        if snapshot.is_empty() {
            info!("crawl map is empty");
        }
        // The scheduler gets the map even when empty; an empty view
        // stops the crawl task cleanly.
        scanner.next_transid(&snapshot);
        Ok(())
    }

    // ── Scan driving ────────────────────────────────────────────────

    fn crawl_roots(&self) -> bool {
        let scanner = Arc::clone(&self.state.lock().scanner);
        if scanner.scan(self) {
            return true;
        }
        self.env.counters.bump("crawl_done");
        info!(mode = scanner.name(), "crawl ran out of data");
        false
    }

    // ── Persistence ─────────────────────────────────────────────────

    /// Load persisted cursors into the map.
    pub fn load_state(&self) -> Result<()> {
        for state in self.store.load()? {
            self.insert_root(state);
        }
        Ok(())
    }

    /// Persist the safe position of every cursor.
    pub fn save_state(&self) -> Result<()> {
        let map = self.crawl_map();
        let states: Vec<CrawlState> = map.values().map(|cursor| cursor.state_begin()).collect();
        self.store.save(&states)
    }

    #[must_use]
    pub fn state_path(&self) -> PathBuf {
        self.store.path()
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    /// Start the transid watcher and writeback threads.
    pub fn start(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("fbs-crawl-transid".to_owned())
            .spawn(move || {
                // Measure the transid before creating any crawlers.
                if let Err(err) = this.env.transid.sample() {
                    warn!(error = %err, "initial transid sample failed");
                }
                if let Err(err) = this.load_state() {
                    warn!(error = %err, "crawl state load failed");
                }
                let writeback = Arc::clone(&this);
                let wb_handle = std::thread::Builder::new()
                    .name("fbs-crawl-writeback".to_owned())
                    .spawn(move || writeback.writeback_loop())
                    .expect("spawn writeback thread");
                *this.writeback_thread.lock() = Some(wb_handle);
                this.transid_loop();
            })
            .expect("spawn transid watcher thread");
        *self.watcher_thread.lock() = Some(handle);
    }

    /// Ask both background threads to exit.
    pub fn stop_request(&self) {
        debug!("roots stop requested");
        let mut stop = self.stop.lock();
        *stop = true;
        self.stop_condvar.notify_all();
    }

    /// Join both threads: writeback first, so in-flight progress is on
    /// disk before the crawl machinery is torn down.
    pub fn stop_wait(&self) {
        if let Some(handle) = self.writeback_thread.lock().take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.watcher_thread.lock().take() {
            let _ = handle.join();
        }
        // The watcher registers the writeback thread during startup; a
        // very early stop can land between the two joins above.
        if let Some(handle) = self.writeback_thread.lock().take() {
            let _ = handle.join();
        }
        debug!("roots stopped");
    }

    fn transid_loop(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        let crawl_more = Task::new(&self.pool, "crawl_more", move || {
            if let Some(roots) = weak.upgrade() {
                if roots.crawl_roots() {
                    if let Some(current) = Task::current() {
                        current.run();
                    }
                }
            }
        });
        let weak = Arc::downgrade(self);
        let restart_crawl = crawl_more.clone();
        let crawl_new = Task::new(&self.pool, "crawl_new", move || {
            if let Some(roots) = weak.upgrade() {
                if let Err(err) = roots.insert_new_crawl() {
                    error!(error = %err, "subvolume discovery failed");
                }
                restart_crawl.run();
            }
        });

        let mut last_transid = 0;
        loop {
            if let Err(err) = self.env.transid.sample() {
                warn!(error = %err, "transid sample failed");
            }
            let new_transid = self.env.transid.current();
            if new_transid != last_transid {
                // Open root FDs prevent snapshot deletion: the cleaner
                // keeps skipping over any directory we hold open. Drop
                // everything on every commit.
                self.resolver.clear_caches();
                self.ctx.clear_caches();
                crawl_new.run();
            }
            last_transid = new_transid;

            let poll = self.env.transid.poll_interval();
            debug!(poll_secs = poll.as_secs_f64(), transid = new_transid, "waiting for next transid");
            let mut stop = self.stop.lock();
            if *stop {
                debug!("stop requested in transid watcher");
                break;
            }
            self.stop_condvar.wait_for(&mut stop, poll);
            if *stop {
                debug!("stop requested in transid watcher");
                break;
            }
        }
    }

    fn writeback_loop(&self) {
        loop {
            if let Err(err) = self.save_state() {
                warn!(error = %err, "crawl state save failed");
            }
            let mut stop = self.stop.lock();
            if *stop {
                drop(stop);
                debug!("stop requested in writeback thread, flushing state");
                if let Err(err) = self.save_state() {
                    warn!(error = %err, "final crawl state save failed");
                }
                return;
            }
            self.stop_condvar
                .wait_for(&mut stop, self.writeback_interval);
        }
    }
}

impl BatchRunner for Roots {
    /// Dispatch one inode's crawl from `cursor`.
    fn crawl_batch(&self, cursor: &Arc<CrawlCursor>) -> bool {
        let this_state = cursor.state_end();
        let Some(range) = cursor.pop_front() else {
            return false;
        };
        let fid = range.fid;
        debug!(%range, "starting file crawl");
        let crawl = FileCrawl::new(
            Arc::clone(&self.env),
            Arc::clone(&self.ctx),
            Arc::clone(&self.inode_locks),
            Arc::clone(cursor),
            this_state,
            &range,
        );
        let task = Task::new(
            &self.pool,
            format!("crawl_{}_{}", fid.root, fid.ino),
            move || {
                if crawl.crawl_one_extent() {
                    if let Some(current) = Task::current() {
                        current.append(&current);
                    }
                }
            },
        );
        task.run();

        // No end-of-inode bump is needed here: the lookahead fetch
        // behind pop_front() has already committed the cursor past
        // this inode (objectid = ino + 1, offset 0), which is what
        // gets persisted. The work unit above walks the inode's
        // remaining offsets on its own.
        self.env.counters.bump("crawl_scan");
        true
    }
}
