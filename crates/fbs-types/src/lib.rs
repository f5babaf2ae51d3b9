#![forbid(unsafe_code)]
//! Shared identifier types for the FrankenBees dedupe crawler.
//!
//! Newtypes keep subvolume ids, inode numbers, and byte ranges from
//! being mixed up across the crawl pipeline.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Filesystem-global monotonically increasing commit counter.
pub type Transid = u64;

/// Subvolume (root) identifier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct RootId(pub u64);

impl RootId {
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for RootId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A file identity: subvolume plus inode number.
///
/// Two files with the same inode number across snapshots are distinct
/// `FileId`s but share extent data, which is why inode-level exclusion
/// keys on the inode number alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FileId {
    pub root: RootId,
    pub ino: u64,
}

impl FileId {
    #[must_use]
    pub fn new(root: RootId, ino: u64) -> Self {
        Self { root, ino }
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.root, self.ino)
    }
}

/// A half-open byte range `[begin, end)` within one file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileRange {
    pub fid: FileId,
    pub begin: u64,
    pub end: u64,
}

impl FileRange {
    #[must_use]
    pub fn new(fid: FileId, begin: u64, end: u64) -> Self {
        Self { fid, begin, end }
    }

    #[must_use]
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.begin)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.end <= self.begin
    }
}

impl fmt::Display for FileRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:#x}..{:#x}", self.fid, self.begin, self.end)
    }
}
