//! End-to-end crawl scenarios over the in-memory filesystem model.

use fbs_btrfs::mem::{MemExtent, MemFs};
use fbs_btrfs::{FileOps, MetaSearch, BTRFS_ROOT_SUBVOL_RDONLY};
use fbs_crawl::context::ScanContext;
use fbs_crawl::counters::Counters;
use fbs_crawl::sched::BatchRunner;
use fbs_crawl::{Config, Roots, ScanModeKind};
use fbs_task::{Task, TaskPool};
use fbs_types::{FileId, FileRange, RootId};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::mpsc;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ── Harness ─────────────────────────────────────────────────────────────────

struct RecordingContext {
    calls: Mutex<Vec<FileRange>>,
    blacklist: Mutex<HashSet<FileId>>,
}

impl RecordingContext {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            blacklist: Mutex::new(HashSet::new()),
        })
    }

    fn calls(&self) -> Vec<FileRange> {
        self.calls.lock().clone()
    }
}

impl ScanContext for RecordingContext {
    fn scan_forward(&self, range: &FileRange) -> fbs_error::Result<bool> {
        self.calls.lock().push(*range);
        Ok(false)
    }

    fn is_blacklisted(&self, fid: FileId) -> bool {
        self.blacklist.lock().contains(&fid)
    }
}

struct Harness {
    ctx: Arc<RecordingContext>,
    counters: Arc<Counters>,
    pool: Arc<TaskPool>,
    roots: Arc<Roots>,
    home: tempfile::TempDir,
}

fn fast_config() -> Config {
    Config {
        scan_mode: ScanModeKind::Independent,
        workaround_btrfs_send: false,
        transid_poll_interval: Duration::from_millis(10),
        writeback_interval: Duration::from_secs(3600),
        task_threads: 2,
    }
}

fn harness(fs: Arc<MemFs>, config: Config) -> Harness {
    let home = tempfile::tempdir().unwrap();
    let ctx = RecordingContext::new();
    let counters = Arc::new(Counters::new());
    let pool = Arc::new(TaskPool::new(config.task_threads));
    let root_fd = fs.open_root_dir(RootId(5)).unwrap();
    let roots = Roots::new(
        &config,
        Arc::clone(&fs) as Arc<dyn MetaSearch>,
        Arc::clone(&fs) as Arc<dyn FileOps>,
        Arc::clone(&ctx) as Arc<dyn ScanContext>,
        Arc::clone(&counters),
        Arc::clone(&pool),
        root_fd,
        home.path().to_path_buf(),
    );
    Harness {
        ctx,
        counters,
        pool,
        roots,
        home,
    }
}

fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}

fn shutdown(harness: &Harness) {
    harness.roots.stop_request();
    harness.roots.stop_wait();
    harness.pool.shutdown();
}

fn range(root: u64, ino: u64, begin: u64, end: u64) -> FileRange {
    FileRange::new(FileId::new(RootId(root), ino), begin, end)
}

// ── Scenarios ───────────────────────────────────────────────────────────────

/// Cold start over one subvolume with two extents in one inode: both
/// are scanned in order and the persisted cursor sits past the inode.
#[test]
fn cold_start_scans_in_order_and_persists() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));
    fs.add_extent(RootId(5), 257, 0, MemExtent::regular(100, 0x1000, 4096));
    fs.add_extent(RootId(5), 257, 4096, MemExtent::regular(100, 0x2000, 4096));

    let h = harness(fs, fast_config());
    h.roots.start();

    wait_until("two scans and a finished crawl", || {
        h.ctx.calls().len() == 2 && h.counters.get("crawl_done") >= 1
    });
    assert_eq!(
        h.ctx.calls(),
        vec![range(5, 257, 0, 4096), range(5, 257, 4096, 8192)]
    );

    // The work unit commits and drops its progress pins.
    wait_until("cursor settles past inode 257", || {
        let map = h.roots.crawl_map();
        let begin = map[&RootId(5)].state_begin();
        begin.objectid == 258 && begin.offset == 0
    });
    // Nothing else gets scanned.
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.ctx.calls().len(), 2);

    shutdown(&h);
    let text = std::fs::read_to_string(h.home.path().join("beescrawl.dat")).unwrap();
    assert!(
        text.contains("root 5 objectid 258 offset 0 min_transid 0 max_transid 100"),
        "unexpected state file: {text}"
    );
}

/// Read-only subvolumes under the send workaround are invisible: no
/// scans, deferred cursor, max_transid ratcheted, excluded from
/// transid_min.
#[test]
fn send_workaround_hides_readonly_subvolume() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(50);
    fs.add_fs_tree(RootId(5));
    fs.add_subvol(RootId(256), RootId(5), 256, "snap", BTRFS_ROOT_SUBVOL_RDONLY);
    fs.add_extent(RootId(5), 257, 0, MemExtent::regular(49, 0x1000, 4096));
    fs.add_extent(RootId(256), 300, 0, MemExtent::regular(10, 0x2000, 4096));

    let mut config = fast_config();
    config.workaround_btrfs_send = true;
    let h = harness(fs, config);

    // Pre-seed state so the two subvolumes carry distinct windows.
    std::fs::write(
        h.home.path().join("beescrawl.dat"),
        "root 5 objectid 0 offset 0 min_transid 48 max_transid 50 started 0\n\
         root 256 objectid 0 offset 0 min_transid 40 max_transid 45 started 0\n",
    )
    .unwrap();

    h.roots.start();
    wait_until("crawl to finish", || {
        h.counters.get("crawl_done") >= 1 && !h.ctx.calls().is_empty()
    });
    std::thread::sleep(Duration::from_millis(50));

    // The writable subvolume was scanned; the read-only one never was.
    assert!(h.ctx.calls().iter().all(|r| r.fid.root == RootId(5)));
    assert!(h.counters.get("root_workaround_btrfs_send") >= 1);

    let map = h.roots.crawl_map();
    let ro_cursor = &map[&RootId(256)];
    assert!(ro_cursor.is_deferred());
    // max_transid ratcheted up to the current transid; the scan has
    // not started so objectid stayed 0.
    let state = ro_cursor.state_end();
    assert_eq!(state.max_transid, 50);
    assert_eq!(state.objectid, 0);

    // The read-only window (min 40) is excluded from the reduction.
    assert_eq!(h.roots.transid_min().unwrap(), 48);

    shutdown(&h);
}

/// Two snapshots share an inode; the second crawl task defers on the
/// inode lock and is requeued when the first releases it.
#[test]
fn contended_inode_defers_and_requeues() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));
    fs.add_subvol(RootId(256), RootId(5), 256, "snap", 0);
    fs.add_extent(RootId(5), 300, 0, MemExtent::regular(100, 0x1000, 4096));
    fs.add_extent(RootId(256), 300, 0, MemExtent::regular(100, 0x1000, 4096));

    let h = harness(fs, fast_config());
    // Drive discovery by hand; the watcher thread stays off.
    h.roots.env().transid.sample().unwrap();
    h.roots.insert_new_crawl().unwrap();
    let map = h.roots.crawl_map();
    let cursor256 = Arc::clone(&map[&RootId(256)]);

    // Park a task holding the shared inode lock, standing in for the
    // root-5 crawl.
    let lock = h.roots.inode_lock(300);
    let (locked_tx, locked_rx) = mpsc::channel::<()>();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder_lock = Arc::clone(&lock);
    let holder = Task::new(&h.pool, "inode-holder", move || {
        let me = Task::current().unwrap();
        let guard = holder_lock.try_lock(&me).expect("uncontended lock");
        locked_tx.send(()).unwrap();
        release_rx.recv().ok();
        drop(guard);
    });
    holder.run();
    locked_rx.recv().unwrap();

    // Dispatch the snapshot's crawl; its task must defer exactly once
    // and not reschedule itself.
    assert!(h.roots.crawl_batch(&cursor256));
    wait_until("deferred inode counter", || {
        h.counters.get("scanf_deferred_inode") == 1
    });
    std::thread::sleep(Duration::from_millis(50));
    assert!(h.ctx.calls().is_empty());
    assert_eq!(h.counters.get("scanf_deferred_inode"), 1);

    // Releasing the lock requeues the parked task.
    release_tx.send(()).unwrap();
    wait_until("deferred crawl to run", || {
        h.ctx.calls().contains(&range(256, 300, 0, 4096))
    });

    h.pool.shutdown();
}

/// Extents outside the cursor's transid window are filtered by the
/// extent generation, with one counter per direction.
#[test]
fn extent_generation_window_filter() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(200);
    fs.add_fs_tree(RootId(5));
    // All three items sit on pages new enough to be searched; only the
    // middle one's own generation is inside the window.
    fs.add_extent(
        RootId(5),
        400,
        0,
        MemExtent::regular(50, 0x1000, 4096).with_page_transid(150),
    );
    fs.add_extent(RootId(5), 400, 4096, MemExtent::regular(150, 0x2000, 4096));
    fs.add_extent(RootId(5), 400, 8192, MemExtent::regular(300, 0x3000, 4096));

    let h = harness(fs, fast_config());
    std::fs::write(
        h.home.path().join("beescrawl.dat"),
        "root 5 objectid 0 offset 0 min_transid 100 max_transid 200 started 0\n",
    )
    .unwrap();

    h.roots.start();
    wait_until("window-filtered scan", || {
        h.counters.get("crawl_gen_low") == 1
            && h.counters.get("crawl_gen_high") == 1
            && h.ctx.calls().len() == 1
    });
    assert_eq!(h.ctx.calls(), vec![range(5, 400, 4096, 8192)]);
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(h.ctx.calls().len(), 1);

    shutdown(&h);
}

/// A finished cursor picks up a new transid window when the filesystem
/// moves forward, and scans what the new window holds.
#[test]
fn transid_advance_restarts_crawl() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));
    fs.add_extent(RootId(5), 257, 0, MemExtent::regular(100, 0x1000, 4096));

    let h = harness(Arc::clone(&fs), fast_config());
    h.roots.start();

    wait_until("first window to finish", || {
        h.ctx.calls().len() == 1 && h.counters.get("crawl_done") >= 1
    });

    // The filesystem commits more work.
    fs.add_extent(RootId(5), 500, 0, MemExtent::regular(110, 0x9000, 4096).with_page_transid(110));
    fs.set_transid(120);

    wait_until("new window to be scanned", || {
        h.ctx.calls().contains(&range(5, 500, 0, 4096))
    });
    assert!(h.counters.get("crawl_restart") >= 1);
    let state = h.roots.crawl_map()[&RootId(5)].state_end();
    assert_eq!(state.min_transid, 100);
    assert_eq!(state.max_transid, 120);
    assert!(state.started > 0);

    shutdown(&h);
}

/// Corrupted transid sentinels in the state file are repaired on load.
#[test]
fn corrupted_state_file_is_repaired() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));

    let h = harness(fs, fast_config());
    std::fs::write(
        h.home.path().join("beescrawl.dat"),
        "root 5 objectid 0 offset 0 min_transid 42 max_transid ffffffffffffffff started 0\n",
    )
    .unwrap();

    h.roots.load_state().unwrap();
    assert_eq!(h.counters.get("bug_bad_max_transid"), 1);
    let state = h.roots.crawl_map()[&RootId(5)].state_end();
    assert_eq!(state.min_transid, 42);
    assert_eq!(state.max_transid, 42);

    h.pool.shutdown();
}

// ── Laws ────────────────────────────────────────────────────────────────────

/// Discovery twice with no filesystem change yields the same map.
#[test]
fn discovery_is_idempotent() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));
    fs.add_subvol(RootId(256), RootId(5), 256, "a", 0);
    fs.add_subvol(RootId(257), RootId(5), 256, "b", 0);
    fs.add_extent(RootId(256), 300, 0, MemExtent::regular(100, 0x1000, 4096));

    let h = harness(fs, fast_config());
    h.roots.env().transid.sample().unwrap();
    h.roots.insert_new_crawl().unwrap();
    let first = h.roots.crawl_map();
    h.roots.insert_new_crawl().unwrap();
    let second = h.roots.crawl_map();

    assert_eq!(
        first.keys().collect::<Vec<_>>(),
        second.keys().collect::<Vec<_>>()
    );
    for (root, cursor) in &first {
        assert!(Arc::ptr_eq(cursor, &second[root]), "cursor for {root} replaced");
        assert_eq!(cursor.state_end(), second[root].state_end());
    }

    h.pool.shutdown();
}

/// Cursors for vanished subvolumes are erased, except the max-transid
/// anchor.
#[test]
fn discovery_erases_vanished_roots_but_keeps_anchor() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));
    fs.add_subvol(RootId(256), RootId(5), 256, "a", 0);

    let h = harness(fs, fast_config());
    // Root 888 does not exist in the filesystem, but its cursor holds
    // the transid high-water mark.
    std::fs::write(
        h.home.path().join("beescrawl.dat"),
        "root 5 objectid 0 offset 0 min_transid 0 max_transid 100 started 0\n\
         root 256 objectid 0 offset 0 min_transid 0 max_transid 100 started 0\n\
         root 888 objectid 0 offset 0 min_transid 0 max_transid 500 started 0\n\
         root 999 objectid 0 offset 0 min_transid 0 max_transid 90 started 0\n",
    )
    .unwrap();
    h.roots.env().transid.sample().unwrap();
    h.roots.load_state().unwrap();
    h.roots.insert_new_crawl().unwrap();

    let map = h.roots.crawl_map();
    assert!(map.contains_key(&RootId(5)));
    assert!(map.contains_key(&RootId(256)));
    assert!(map.contains_key(&RootId(888)), "anchor cursor was evicted");
    assert!(!map.contains_key(&RootId(999)), "vanished root kept");
    assert_eq!(h.counters.get("crawl_anchor_kept"), 1);

    h.pool.shutdown();
}

/// Blacklisted files are counted and skipped.
#[test]
fn blacklisted_files_are_skipped() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));
    fs.add_extent(RootId(5), 257, 0, MemExtent::regular(100, 0x1000, 4096));
    fs.add_extent(RootId(5), 258, 0, MemExtent::regular(100, 0x2000, 4096));

    let h = harness(fs, fast_config());
    h.ctx
        .blacklist
        .lock()
        .insert(FileId::new(RootId(5), 257));
    h.roots.start();

    wait_until("crawl to finish", || {
        h.counters.get("crawl_done") >= 1 && h.counters.get("crawl_blacklisted") >= 1
    });
    wait_until("unblacklisted scan", || {
        h.ctx.calls().contains(&range(5, 258, 0, 4096))
    });
    assert!(h.ctx.calls().iter().all(|r| r.fid.ino != 257));

    shutdown(&h);
}

/// Holes and inline extents never reach the scanner.
#[test]
fn holes_and_inline_extents_are_skipped() {
    let fs = Arc::new(MemFs::new());
    fs.set_transid(100);
    fs.add_fs_tree(RootId(5));
    fs.add_extent(RootId(5), 257, 0, MemExtent::regular(100, 0, 4096)); // hole
    fs.add_extent(
        RootId(5),
        257,
        4096,
        MemExtent {
            page_transid: 100,
            generation: 100,
            kind: fbs_btrfs::ExtentKind::Inline,
            bytenr: 0,
            logical_bytes: 1000,
        },
    );
    fs.add_extent(RootId(5), 257, 8192, MemExtent::regular(100, 0x3000, 4096));

    let h = harness(fs, fast_config());
    h.roots.start();

    wait_until("real extent scanned", || {
        h.ctx.calls().contains(&range(5, 257, 8192, 12288))
    });
    assert_eq!(h.counters.get("crawl_hole"), 1);
    assert_eq!(h.counters.get("crawl_inline"), 1);
    assert_eq!(h.ctx.calls().len(), 1);

    shutdown(&h);
}
