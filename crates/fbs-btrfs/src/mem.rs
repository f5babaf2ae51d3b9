//! In-memory filesystem model implementing the crawl seams.
//!
//! `MemFs` stands in for a mounted filesystem in tests and tooling. It
//! models subvolumes, extent items (with distinct page and extent
//! transids, so search filtering behaves like the kernel), and a small
//! directory/path world for exercising the resolver. Opened [`Fd`]s are
//! backed by `/dev/null` handles; their identity lives in the model.

use crate::{
    ExtentItem, ExtentKind, Fd, FdIdentity, FileOps, MetaSearch, RootBackref, RootInfo,
    BTRFS_FIRST_FREE_OBJECTID,
};
use fbs_error::{FbsError, Result};
use fbs_types::{RootId, Transid};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::fd::RawFd;
use std::path::{Path, PathBuf};

/// One extent item in the model.
#[derive(Debug, Clone, Copy)]
pub struct MemExtent {
    /// Transid of the metadata page holding the item; this is what
    /// search filtering sees.
    pub page_transid: Transid,
    /// The extent item's own generation.
    pub generation: Transid,
    pub kind: ExtentKind,
    pub bytenr: u64,
    pub logical_bytes: u64,
}

impl MemExtent {
    /// A regular extent whose page and extent generations coincide.
    #[must_use]
    pub fn regular(generation: Transid, bytenr: u64, logical_bytes: u64) -> Self {
        Self {
            page_transid: generation,
            generation,
            kind: ExtentKind::Regular,
            bytenr,
            logical_bytes,
        }
    }

    #[must_use]
    pub fn with_page_transid(mut self, page_transid: Transid) -> Self {
        self.page_transid = page_transid;
        self
    }
}

#[derive(Debug, Clone)]
struct MemSubvol {
    /// `None` for the top-level fs tree, which has no backref.
    parent: Option<RootId>,
    dirid: u64,
    name: String,
    flags: u64,
    extents: BTreeMap<(u64, u64), MemExtent>,
}

/// Identity handed out for objects opened through [`FileOps`].
#[derive(Debug, Clone, Copy)]
pub struct MemObject {
    pub root: RootId,
    pub ino: u64,
    pub dev: u64,
    pub iflags: u32,
}

#[derive(Default)]
struct MemInner {
    transid: Transid,
    subvols: BTreeMap<RootId, MemSubvol>,
    /// Directory entries: (directory identity, name) → object.
    entries: HashMap<(RootId, u64, String), MemObject>,
    /// Configured ino-path answers: (subvol, ino) → paths.
    paths: HashMap<(RootId, u64), Vec<PathBuf>>,
    /// Identities of handles opened through this model.
    open_objects: HashMap<RawFd, MemObject>,
}

/// In-memory [`MetaSearch`] + [`FileOps`] implementation.
pub struct MemFs {
    inner: Mutex<MemInner>,
    block_size: u64,
}

impl Default for MemFs {
    fn default() -> Self {
        Self::new()
    }
}

impl MemFs {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(MemInner::default()),
            block_size: 4096,
        }
    }

    pub fn set_transid(&self, transid: Transid) {
        self.inner.lock().transid = transid;
    }

    /// Register the top-level fs tree (no backref).
    pub fn add_fs_tree(&self, root: RootId) {
        self.inner.lock().subvols.insert(
            root,
            MemSubvol {
                parent: None,
                dirid: 0,
                name: String::new(),
                flags: 0,
                extents: BTreeMap::new(),
            },
        );
    }

    /// Register a subvolume hanging off `parent` at directory `dirid`.
    pub fn add_subvol(&self, root: RootId, parent: RootId, dirid: u64, name: &str, flags: u64) {
        self.inner.lock().subvols.insert(
            root,
            MemSubvol {
                parent: Some(parent),
                dirid,
                name: name.to_owned(),
                flags,
                extents: BTreeMap::new(),
            },
        );
    }

    pub fn set_subvol_flags(&self, root: RootId, flags: u64) {
        if let Some(subvol) = self.inner.lock().subvols.get_mut(&root) {
            subvol.flags = flags;
        }
    }

    pub fn remove_subvol(&self, root: RootId) {
        self.inner.lock().subvols.remove(&root);
    }

    pub fn add_extent(&self, root: RootId, ino: u64, offset: u64, extent: MemExtent) {
        if let Some(subvol) = self.inner.lock().subvols.get_mut(&root) {
            subvol.extents.insert((ino, offset), extent);
        }
    }

    pub fn remove_extent(&self, root: RootId, ino: u64, offset: u64) {
        if let Some(subvol) = self.inner.lock().subvols.get_mut(&root) {
            subvol.extents.remove(&(ino, offset));
        }
    }

    /// Add a directory entry visible to `open_dir_at`/`open_file_at`.
    pub fn add_entry(&self, dir: (RootId, u64), name: &str, object: MemObject) {
        self.inner
            .lock()
            .entries
            .insert((dir.0, dir.1, name.to_owned()), object);
    }

    /// Configure the ino-path answer for `(root, ino)`.
    pub fn set_ino_paths(&self, root: RootId, ino: u64, paths: &[&str]) {
        self.inner
            .lock()
            .paths
            .insert((root, ino), paths.iter().map(PathBuf::from).collect());
    }

    /// Open a handle representing `object` (backed by `/dev/null`).
    pub fn open_object(&self, object: MemObject) -> io::Result<Fd> {
        let fd = Fd::from(std::fs::File::open("/dev/null")?);
        self.inner.lock().open_objects.insert(fd.as_raw(), object);
        Ok(fd)
    }

    /// A handle on the root directory of `root`.
    pub fn open_root_dir(&self, root: RootId) -> io::Result<Fd> {
        self.open_object(MemObject {
            root,
            ino: BTRFS_FIRST_FREE_OBJECTID,
            dev: 1,
            iflags: 0,
        })
    }

    fn object_of(&self, fd: &Fd) -> io::Result<MemObject> {
        self.inner
            .lock()
            .open_objects
            .get(&fd.as_raw())
            .copied()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown fd"))
    }
}

impl MetaSearch for MemFs {
    fn current_transid(&self) -> Result<Transid> {
        let transid = self.inner.lock().transid;
        if transid == 0 || transid == u64::MAX {
            return Err(FbsError::invalid_state(format!(
                "implausible filesystem transid {transid:#x}"
            )));
        }
        Ok(transid)
    }

    fn root_info(&self, root: RootId) -> Result<Option<RootInfo>> {
        let inner = self.inner.lock();
        Ok(inner.subvols.get(&root).map(|subvol| RootInfo {
            flags: subvol.flags,
            generation: inner.transid,
        }))
    }

    fn root_backref(&self, root: RootId) -> Result<Option<RootBackref>> {
        let inner = self.inner.lock();
        Ok(inner.subvols.get(&root).and_then(|subvol| {
            subvol.parent.map(|parent| RootBackref {
                root,
                parent,
                dirid: subvol.dirid,
                name: subvol.name.clone(),
            })
        }))
    }

    fn next_root_backref(&self, after: RootId) -> Result<Option<RootBackref>> {
        let inner = self.inner.lock();
        let Some(start) = after.get().checked_add(1) else {
            return Ok(None);
        };
        for (&root, subvol) in inner.subvols.range(RootId(start)..) {
            if let Some(parent) = subvol.parent {
                return Ok(Some(RootBackref {
                    root,
                    parent,
                    dirid: subvol.dirid,
                    name: subvol.name.clone(),
                }));
            }
        }
        Ok(None)
    }

    fn next_extent_from(
        &self,
        root: RootId,
        min_ino: u64,
        min_transid: Transid,
    ) -> Result<Option<ExtentItem>> {
        let inner = self.inner.lock();
        let Some(subvol) = inner.subvols.get(&root) else {
            return Ok(None);
        };
        for (&(ino, offset), extent) in subvol.extents.range((min_ino, 0)..) {
            if extent.page_transid >= min_transid {
                return Ok(Some(ExtentItem {
                    ino,
                    offset,
                    generation: extent.generation,
                    kind: extent.kind,
                    bytenr: extent.bytenr,
                    logical_bytes: extent.logical_bytes,
                }));
            }
        }
        Ok(None)
    }

    fn next_file_extent(
        &self,
        root: RootId,
        ino: u64,
        min_offset: u64,
        min_transid: Transid,
    ) -> Result<Option<ExtentItem>> {
        let inner = self.inner.lock();
        let Some(subvol) = inner.subvols.get(&root) else {
            return Ok(None);
        };
        for (&(_, offset), extent) in subvol
            .extents
            .range((ino, min_offset)..=(ino, u64::MAX))
        {
            if extent.page_transid >= min_transid {
                return Ok(Some(ExtentItem {
                    ino,
                    offset,
                    generation: extent.generation,
                    kind: extent.kind,
                    bytenr: extent.bytenr,
                    logical_bytes: extent.logical_bytes,
                }));
            }
        }
        Ok(None)
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }
}

impl FileOps for MemFs {
    fn open_dir_at(&self, dir: &Fd, path: &Path) -> io::Result<Fd> {
        let dir_obj = self.object_of(dir)?;
        let name = path.to_string_lossy().into_owned();
        let object = {
            let inner = self.inner.lock();
            inner
                .entries
                .get(&(dir_obj.root, dir_obj.ino, name))
                .copied()
        };
        match object {
            Some(object) => self.open_object(object),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn open_file_at(&self, dir: &Fd, path: &Path) -> io::Result<Fd> {
        self.open_dir_at(dir, path)
    }

    fn ino_paths(&self, fd: &Fd, ino: u64) -> io::Result<Vec<PathBuf>> {
        let obj = self.object_of(fd)?;
        let inner = self.inner.lock();
        match inner.paths.get(&(obj.root, ino)) {
            Some(paths) => Ok(paths.clone()),
            None => Err(io::Error::from_raw_os_error(libc::ENOENT)),
        }
    }

    fn fd_root_id(&self, fd: &Fd) -> io::Result<RootId> {
        self.object_of(fd).map(|obj| obj.root)
    }

    fn fd_identity(&self, fd: &Fd) -> io::Result<FdIdentity> {
        self.object_of(fd).map(|obj| FdIdentity {
            ino: obj.ino,
            dev: obj.dev,
        })
    }

    fn fd_iflags(&self, fd: &Fd) -> io::Result<u32> {
        self.object_of(fd).map(|obj| obj.iflags)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BTRFS_FS_TREE_OBJECTID;

    fn model() -> MemFs {
        let fs = MemFs::new();
        fs.set_transid(100);
        fs.add_fs_tree(RootId(BTRFS_FS_TREE_OBJECTID));
        fs.add_subvol(RootId(256), RootId(BTRFS_FS_TREE_OBJECTID), 257, "snap", 0);
        fs
    }

    #[test]
    fn backref_enumeration_skips_fs_tree() {
        let fs = model();
        let backref = fs.next_root_backref(RootId(0)).unwrap().unwrap();
        assert_eq!(backref.root, RootId(256));
        assert_eq!(backref.parent, RootId(BTRFS_FS_TREE_OBJECTID));
        assert!(fs.next_root_backref(RootId(256)).unwrap().is_none());
        assert!(fs
            .root_backref(RootId(BTRFS_FS_TREE_OBJECTID))
            .unwrap()
            .is_none());
    }

    #[test]
    fn extent_search_filters_on_page_transid() {
        let fs = model();
        let root = RootId(256);
        fs.add_extent(root, 300, 0, MemExtent::regular(50, 0x1000, 4096));
        fs.add_extent(
            root,
            300,
            4096,
            MemExtent::regular(50, 0x2000, 4096).with_page_transid(120),
        );
        // Page filter skips the old page even though a later offset of
        // the same inode qualifies.
        let hit = fs.next_extent_from(root, 0, 100).unwrap().unwrap();
        assert_eq!((hit.ino, hit.offset), (300, 4096));
        // The per-file search honors min_offset.
        let hit = fs.next_file_extent(root, 300, 0, 0).unwrap().unwrap();
        assert_eq!(hit.offset, 0);
        assert!(fs.next_file_extent(root, 300, 8192, 0).unwrap().is_none());
    }

    #[test]
    fn current_transid_rejects_sentinels() {
        let fs = MemFs::new();
        fs.set_transid(0);
        assert!(fs.current_transid().is_err());
        fs.set_transid(u64::MAX);
        assert!(fs.current_transid().is_err());
        fs.set_transid(7);
        assert_eq!(fs.current_transid().unwrap(), 7);
    }

    #[test]
    fn open_paths_resolve_registered_objects() {
        let fs = model();
        let dir = fs.open_root_dir(RootId(BTRFS_FS_TREE_OBJECTID)).unwrap();
        fs.add_entry(
            (RootId(BTRFS_FS_TREE_OBJECTID), BTRFS_FIRST_FREE_OBJECTID),
            "snap",
            MemObject {
                root: RootId(256),
                ino: BTRFS_FIRST_FREE_OBJECTID,
                dev: 1,
                iflags: 0,
            },
        );
        let snap = fs.open_dir_at(&dir, Path::new("snap")).unwrap();
        assert_eq!(fs.fd_root_id(&snap).unwrap(), RootId(256));
        assert!(fs.open_dir_at(&dir, Path::new("missing")).is_err());
    }
}
