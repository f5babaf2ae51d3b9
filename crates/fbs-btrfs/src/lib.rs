#![deny(unsafe_code)]
//! btrfs metadata access: constants, item views, and the search seams
//! the crawler runs on.
//!
//! Two trait seams keep the crawl logic independent of the kernel:
//!
//! - [`MetaSearch`]: read-only metadata queries (current transid, root
//!   items, subvolume backrefs, extent-data enumeration).
//! - [`FileOps`]: FD-level operations (openat, ino-path resolution,
//!   identity and flag checks).
//!
//! [`kernel::KernelFs`] implements both against a mounted filesystem;
//! [`mem::MemFs`] implements both in memory for tests and tooling. All
//! unsafe FFI is confined to the private `sys` module.

use fbs_error::Result;
use fbs_types::{RootId, Transid};
use std::fmt;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod kernel;
pub mod mem;
#[allow(unsafe_code)]
mod sys;

// ── Well-known objectids and keys ───────────────────────────────────────────

/// Root tree: holds one item per tree plus subvolume backrefs.
pub const BTRFS_ROOT_TREE_OBJECTID: u64 = 1;
/// Extent tree: its root item's generation is the filesystem transid.
pub const BTRFS_EXTENT_TREE_OBJECTID: u64 = 2;
/// The top-level filesystem tree.
pub const BTRFS_FS_TREE_OBJECTID: u64 = 5;
/// First regular objectid in a filesystem tree; also the inode number
/// of every subvolume root directory.
pub const BTRFS_FIRST_FREE_OBJECTID: u64 = 256;

/// Item type for file extent data.
pub const BTRFS_EXTENT_DATA_KEY: u8 = 108;
/// Item type for root items in the root tree.
pub const BTRFS_ROOT_ITEM_KEY: u8 = 132;
/// Item type for subvolume-to-parent backrefs in the root tree.
pub const BTRFS_ROOT_BACKREF_KEY: u8 = 144;

/// Root item flag: subvolume is read-only.
pub const BTRFS_ROOT_SUBVOL_RDONLY: u64 = 1;

/// Inode attribute flag: file is nodatacow (implies nodatasum).
pub const FS_NOCOW_FL: u32 = 0x0080_0000;

/// File extent type values in EXTENT_DATA payloads.
pub const BTRFS_FILE_EXTENT_INLINE: u8 = 0;
pub const BTRFS_FILE_EXTENT_REG: u8 = 1;
pub const BTRFS_FILE_EXTENT_PREALLOC: u8 = 2;

// ── Item views ──────────────────────────────────────────────────────────────

/// Classification of one EXTENT_DATA item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentKind {
    Inline,
    Regular,
    Prealloc,
    Unknown(u8),
}

impl ExtentKind {
    #[must_use]
    pub fn from_raw(raw: u8) -> Self {
        match raw {
            BTRFS_FILE_EXTENT_INLINE => Self::Inline,
            BTRFS_FILE_EXTENT_REG => Self::Regular,
            BTRFS_FILE_EXTENT_PREALLOC => Self::Prealloc,
            other => Self::Unknown(other),
        }
    }
}

impl fmt::Display for ExtentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => write!(f, "inline"),
            Self::Regular => write!(f, "regular"),
            Self::Prealloc => write!(f, "prealloc"),
            Self::Unknown(raw) => write!(f, "unknown({raw})"),
        }
    }
}

/// One EXTENT_DATA item as seen by the crawler.
///
/// `generation` is the extent item's own transid. The containing
/// metadata page has its own transid, which is what search filtering
/// acts on; the two differ whenever an old extent shares a page with
/// newer neighbors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentItem {
    pub ino: u64,
    pub offset: u64,
    pub generation: Transid,
    pub kind: ExtentKind,
    /// Physical byte address; 0 means a hole.
    pub bytenr: u64,
    pub logical_bytes: u64,
}

/// Subset of a root item needed by the crawler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RootInfo {
    pub flags: u64,
    pub generation: Transid,
}

impl RootInfo {
    #[must_use]
    pub fn is_readonly(&self) -> bool {
        self.flags & BTRFS_ROOT_SUBVOL_RDONLY != 0
    }
}

/// A subvolume's backref: where it hangs in its parent root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBackref {
    pub root: RootId,
    pub parent: RootId,
    /// Inode of the containing directory within the parent root.
    pub dirid: u64,
    pub name: String,
}

// ── Shared FD handle ────────────────────────────────────────────────────────

/// Cheaply cloneable shared file descriptor.
#[derive(Clone)]
pub struct Fd(Arc<OwnedFd>);

impl Fd {
    #[must_use]
    pub fn new(fd: OwnedFd) -> Self {
        Self(Arc::new(fd))
    }

    #[must_use]
    pub fn as_raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    #[must_use]
    pub fn borrow(&self) -> BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl From<std::fs::File> for Fd {
    fn from(file: std::fs::File) -> Self {
        Self::new(OwnedFd::from(file))
    }
}

impl fmt::Debug for Fd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fd({})", self.as_raw())
    }
}

/// Identity of an open file: inode and device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdIdentity {
    pub ino: u64,
    pub dev: u64,
}

// ── Trait seams ─────────────────────────────────────────────────────────────

/// Read-only metadata queries over one mounted filesystem.
pub trait MetaSearch: Send + Sync {
    /// The filesystem transid: the extent tree root item's generation.
    ///
    /// Errors if the value is zero or the max sentinel.
    fn current_transid(&self) -> Result<Transid>;

    /// Root item for `root`, or `None` if it does not exist.
    fn root_info(&self, root: RootId) -> Result<Option<RootInfo>>;

    /// The backref of `root` (its link into the parent root).
    fn root_backref(&self, root: RootId) -> Result<Option<RootBackref>>;

    /// Backref of the smallest root id strictly greater than `after`.
    fn next_root_backref(&self, after: RootId) -> Result<Option<RootBackref>>;

    /// First EXTENT_DATA item in `root` with `ino ≥ min_ino` whose
    /// containing metadata page has transid ≥ `min_transid`.
    fn next_extent_from(
        &self,
        root: RootId,
        min_ino: u64,
        min_transid: Transid,
    ) -> Result<Option<ExtentItem>>;

    /// First EXTENT_DATA item of inode `ino` in `root` with `offset ≥
    /// min_offset` whose containing metadata page has transid ≥
    /// `min_transid`. Never returns items of other inodes.
    fn next_file_extent(
        &self,
        root: RootId,
        ino: u64,
        min_offset: u64,
        min_transid: Transid,
    ) -> Result<Option<ExtentItem>>;

    /// Filesystem data block size in bytes.
    fn block_size(&self) -> u64;
}

/// FD-level operations used by the root resolver.
pub trait FileOps: Send + Sync {
    /// Open a directory relative to `dir`.
    fn open_dir_at(&self, dir: &Fd, path: &Path) -> std::io::Result<Fd>;

    /// Open a file read-only relative to `dir`.
    fn open_file_at(&self, dir: &Fd, path: &Path) -> std::io::Result<Fd>;

    /// Paths of `ino` relative to the subvolume open at `fd`.
    fn ino_paths(&self, fd: &Fd, ino: u64) -> std::io::Result<Vec<PathBuf>>;

    /// The btrfs root id containing the object open at `fd`.
    fn fd_root_id(&self, fd: &Fd) -> std::io::Result<RootId>;

    /// Inode and device of the object open at `fd`.
    fn fd_identity(&self, fd: &Fd) -> std::io::Result<FdIdentity>;

    /// Inode attribute flags (`FS_IOC_GETFLAGS`).
    fn fd_iflags(&self, fd: &Fd) -> std::io::Result<u32>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extent_kind_round_trip() {
        assert_eq!(ExtentKind::from_raw(0), ExtentKind::Inline);
        assert_eq!(ExtentKind::from_raw(1), ExtentKind::Regular);
        assert_eq!(ExtentKind::from_raw(2), ExtentKind::Prealloc);
        assert_eq!(ExtentKind::from_raw(9), ExtentKind::Unknown(9));
        assert_eq!(ExtentKind::Unknown(9).to_string(), "unknown(9)");
    }

    #[test]
    fn root_info_readonly_flag() {
        let rw = RootInfo {
            flags: 0,
            generation: 10,
        };
        let ro = RootInfo {
            flags: BTRFS_ROOT_SUBVOL_RDONLY,
            generation: 10,
        };
        assert!(!rw.is_readonly());
        assert!(ro.is_readonly());
    }
}
