#![forbid(unsafe_code)]
//! Subvolume crawl and scheduling core of the FrankenBees dedupe daemon.
//!
//! The crawler discovers subvolumes, keeps one persistent cursor per
//! subvolume over transid windows, and feeds candidate extents one at a
//! time to a downstream scanner. Module map:
//!
//! - **transid**: transid sampling and rate-estimated polling.
//! - **state** / **progress**: the per-subvolume cursor position and
//!   the in-flight progress multiset that guards persistence.
//! - **store**: durable text-format cursor state (`beescrawl.dat`).
//! - **cursor**: the per-subvolume crawl state machine.
//! - **sched**: the four extent ordering policies.
//! - **resolve**: root enumeration and subvolume/inode FD resolution.
//! - **filecrawl**: the one-extent-at-a-time work unit.
//! - **roots**: the controller owning discovery, the scheduler, and
//!   the two background threads.

pub mod context;
pub mod counters;
pub mod cursor;
pub mod filecrawl;
pub mod progress;
pub mod resolve;
pub mod roots;
pub mod sched;
pub mod state;
pub mod store;
pub mod tmpfiles;
pub mod transid;

pub use context::ScanContext;
pub use counters::Counters;
pub use roots::Roots;
pub use sched::ScanModeKind;
pub use state::CrawlState;

use std::time::Duration;

/// Runtime tunables for the crawler.
#[derive(Debug, Clone)]
pub struct Config {
    /// Extent ordering policy.
    pub scan_mode: ScanModeKind,
    /// Hide read-only subvolumes from the scanner (`btrfs send` runs
    /// fail when dedupe touches the subvolume being sent).
    pub workaround_btrfs_send: bool,
    /// Floor on the transid polling period.
    pub transid_poll_interval: Duration,
    /// Crawl state flush period.
    pub writeback_interval: Duration,
    /// Worker threads in the task pool.
    pub task_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scan_mode: ScanModeKind::Independent,
            workaround_btrfs_send: false,
            transid_poll_interval: Duration::from_secs(30),
            writeback_interval: Duration::from_secs(900),
            task_threads: std::thread::available_parallelism()
                .map(std::num::NonZeroUsize::get)
                .unwrap_or(4),
        }
    }
}
