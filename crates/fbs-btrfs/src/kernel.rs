//! Kernel backend: [`MetaSearch`] and [`FileOps`] against a mounted
//! filesystem.
//!
//! Metadata queries go through TREE_SEARCH_V2 with single-type search
//! rectangles, so the first returned item is always the answer; the
//! kernel applies the page-transid filter before anything reaches the
//! result buffer. Raw syscalls live in [`crate::sys`]; this module only
//! parses the result bytes.

use crate::sys::{self, SearchArgsV2, SearchKey, SEARCH_HEADER_SIZE};
use crate::{
    ExtentItem, ExtentKind, Fd, FdIdentity, FileOps, MetaSearch, RootBackref, RootInfo,
    BTRFS_EXTENT_DATA_KEY, BTRFS_EXTENT_TREE_OBJECTID, BTRFS_FIRST_FREE_OBJECTID,
    BTRFS_ROOT_BACKREF_KEY, BTRFS_ROOT_ITEM_KEY, BTRFS_ROOT_TREE_OBJECTID,
};
use fbs_error::{FbsError, Result};
use fbs_types::{RootId, Transid};
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

/// One decoded search result: key fields plus payload bytes.
#[derive(Debug, Clone)]
struct RawItem {
    objectid: u64,
    offset: u64,
    item_type: u8,
    data: Vec<u8>,
}

fn read_u64(data: &[u8], off: usize, root: RootId, what: &'static str) -> Result<u64> {
    let end = off + 8;
    let Some(slice) = data.get(off..end) else {
        return Err(FbsError::Corruption {
            root: root.get(),
            detail: format!("{what}: item payload too short ({} bytes)", data.len()),
        });
    };
    Ok(u64::from_le_bytes(slice.try_into().expect("8-byte slice")))
}

fn read_u16(data: &[u8], off: usize, root: RootId, what: &'static str) -> Result<u16> {
    let end = off + 2;
    let Some(slice) = data.get(off..end) else {
        return Err(FbsError::Corruption {
            root: root.get(),
            detail: format!("{what}: item payload too short ({} bytes)", data.len()),
        });
    };
    Ok(u16::from_le_bytes(slice.try_into().expect("2-byte slice")))
}

/// Field offsets within `btrfs_root_item`.
const ROOT_ITEM_GENERATION: usize = 160;
const ROOT_ITEM_FLAGS: usize = 208;

/// Field offsets within `btrfs_file_extent_item`.
const FILE_EXTENT_GENERATION: usize = 0;
const FILE_EXTENT_RAM_BYTES: usize = 8;
const FILE_EXTENT_TYPE: usize = 20;
const FILE_EXTENT_DISK_BYTENR: usize = 21;
const FILE_EXTENT_NUM_BYTES: usize = 45;

/// Field offsets within `btrfs_root_ref`.
const ROOT_REF_DIRID: usize = 0;
const ROOT_REF_NAME_LEN: usize = 16;
const ROOT_REF_NAME: usize = 18;

/// Kernel-backed metadata and file access for one mounted filesystem.
pub struct KernelFs {
    root_fd: Fd,
    block_size: u64,
}

impl KernelFs {
    /// Wrap an open FD on the filesystem root directory.
    pub fn new(root_fd: Fd) -> Result<Self> {
        let block_size = sys::fstatfs_bsize(root_fd.as_raw())?;
        Ok(Self {
            root_fd,
            block_size,
        })
    }

    #[must_use]
    pub fn root_fd(&self) -> &Fd {
        &self.root_fd
    }

    /// Run one search and return the decoded results in key order.
    fn search(&self, key: SearchKey) -> Result<Vec<RawItem>> {
        let mut args = SearchArgsV2::new(key);
        sys::tree_search_v2(self.root_fd.as_raw(), &mut args).map_err(|err| {
            FbsError::search(format!(
                "TREE_SEARCH_V2 tree {} objectid {}..{}: {err}",
                key.tree_id, key.min_objectid, key.max_objectid
            ))
        })?;
        let mut items = Vec::with_capacity(args.key.nr_items as usize);
        let mut pos = 0_usize;
        for _ in 0..args.key.nr_items {
            let Some(header) = args.buf.get(pos..pos + SEARCH_HEADER_SIZE) else {
                break;
            };
            let objectid = u64::from_le_bytes(header[8..16].try_into().expect("8 bytes"));
            let offset = u64::from_le_bytes(header[16..24].try_into().expect("8 bytes"));
            let item_type = u32::from_le_bytes(header[24..28].try_into().expect("4 bytes"));
            let len = u32::from_le_bytes(header[28..32].try_into().expect("4 bytes")) as usize;
            let data_start = pos + SEARCH_HEADER_SIZE;
            let Some(data) = args.buf.get(data_start..data_start + len) else {
                break;
            };
            items.push(RawItem {
                objectid,
                offset,
                item_type: item_type as u8,
                data: data.to_vec(),
            });
            pos = data_start + len;
        }
        Ok(items)
    }

    /// First item of `item_type` in the given rectangle, if any.
    fn search_first(
        &self,
        tree_id: u64,
        min_objectid: u64,
        max_objectid: u64,
        item_type: u8,
        min_offset: u64,
        min_transid: Transid,
    ) -> Result<Option<RawItem>> {
        let mut key = SearchKey::new(tree_id);
        key.min_objectid = min_objectid;
        key.max_objectid = max_objectid;
        key.min_type = item_type.into();
        key.max_type = item_type.into();
        key.min_offset = min_offset;
        key.min_transid = min_transid;
        key.nr_items = 16;
        let items = self.search(key)?;
        Ok(items.into_iter().find(|item| item.item_type == item_type))
    }

    fn parse_root_info(&self, root: RootId, item: &RawItem) -> Result<RootInfo> {
        Ok(RootInfo {
            generation: read_u64(&item.data, ROOT_ITEM_GENERATION, root, "root_item.generation")?,
            flags: read_u64(&item.data, ROOT_ITEM_FLAGS, root, "root_item.flags")?,
        })
    }

    fn parse_backref(&self, item: &RawItem) -> Result<RootBackref> {
        let root = RootId(item.objectid);
        let dirid = read_u64(&item.data, ROOT_REF_DIRID, root, "root_ref.dirid")?;
        let name_len = read_u16(&item.data, ROOT_REF_NAME_LEN, root, "root_ref.name_len")? as usize;
        let name_end = ROOT_REF_NAME + name_len;
        let Some(name_bytes) = item.data.get(ROOT_REF_NAME..name_end) else {
            return Err(FbsError::Corruption {
                root: item.objectid,
                detail: format!(
                    "root_ref name overruns item ({} > {})",
                    name_end,
                    item.data.len()
                ),
            });
        };
        Ok(RootBackref {
            root,
            // For a backref the key offset is the parent tree id.
            parent: RootId(item.offset),
            dirid,
            name: String::from_utf8_lossy(name_bytes).into_owned(),
        })
    }

    fn parse_extent(&self, root: RootId, item: &RawItem) -> Result<ExtentItem> {
        let generation = read_u64(&item.data, FILE_EXTENT_GENERATION, root, "extent.generation")?;
        let Some(&kind_raw) = item.data.get(FILE_EXTENT_TYPE) else {
            return Err(FbsError::Corruption {
                root: root.get(),
                detail: format!("extent item too short ({} bytes)", item.data.len()),
            });
        };
        let kind = ExtentKind::from_raw(kind_raw);
        let (bytenr, logical_bytes) = match kind {
            ExtentKind::Regular | ExtentKind::Prealloc => (
                read_u64(&item.data, FILE_EXTENT_DISK_BYTENR, root, "extent.bytenr")?,
                read_u64(&item.data, FILE_EXTENT_NUM_BYTES, root, "extent.num_bytes")?,
            ),
            ExtentKind::Inline | ExtentKind::Unknown(_) => (
                0,
                read_u64(&item.data, FILE_EXTENT_RAM_BYTES, root, "extent.ram_bytes")?,
            ),
        };
        Ok(ExtentItem {
            ino: item.objectid,
            offset: item.offset,
            generation,
            kind,
            bytenr,
            logical_bytes,
        })
    }
}

impl MetaSearch for KernelFs {
    fn current_transid(&self) -> Result<Transid> {
        let info = self
            .root_info(RootId(BTRFS_EXTENT_TREE_OBJECTID))?
            .ok_or_else(|| FbsError::search("extent tree root item missing"))?;
        let transid = info.generation;
        if transid == 0 || transid == u64::MAX {
            return Err(FbsError::invalid_state(format!(
                "implausible filesystem transid {transid:#x}"
            )));
        }
        Ok(transid)
    }

    fn root_info(&self, root: RootId) -> Result<Option<RootInfo>> {
        let item = self.search_first(
            BTRFS_ROOT_TREE_OBJECTID,
            root.get(),
            root.get(),
            BTRFS_ROOT_ITEM_KEY,
            0,
            0,
        )?;
        item.map(|item| self.parse_root_info(root, &item)).transpose()
    }

    fn root_backref(&self, root: RootId) -> Result<Option<RootBackref>> {
        let item = self.search_first(
            BTRFS_ROOT_TREE_OBJECTID,
            root.get(),
            root.get(),
            BTRFS_ROOT_BACKREF_KEY,
            0,
            0,
        )?;
        item.map(|item| self.parse_backref(&item)).transpose()
    }

    fn next_root_backref(&self, after: RootId) -> Result<Option<RootBackref>> {
        let Some(min_objectid) = after.get().checked_add(1) else {
            return Ok(None);
        };
        let item = self.search_first(
            BTRFS_ROOT_TREE_OBJECTID,
            min_objectid,
            u64::MAX,
            BTRFS_ROOT_BACKREF_KEY,
            0,
            0,
        )?;
        item.map(|item| self.parse_backref(&item)).transpose()
    }

    fn next_extent_from(
        &self,
        root: RootId,
        min_ino: u64,
        min_transid: Transid,
    ) -> Result<Option<ExtentItem>> {
        let item = self.search_first(
            root.get(),
            min_ino,
            u64::MAX,
            BTRFS_EXTENT_DATA_KEY,
            0,
            min_transid,
        )?;
        item.map(|item| self.parse_extent(root, &item)).transpose()
    }

    fn next_file_extent(
        &self,
        root: RootId,
        ino: u64,
        min_offset: u64,
        min_transid: Transid,
    ) -> Result<Option<ExtentItem>> {
        let item = self.search_first(
            root.get(),
            ino,
            ino,
            BTRFS_EXTENT_DATA_KEY,
            min_offset,
            min_transid,
        )?;
        item.map(|item| self.parse_extent(root, &item)).transpose()
    }

    fn block_size(&self) -> u64 {
        self.block_size
    }
}

const FLAGS_OPEN_DIR: libc::c_int = libc::O_RDONLY | libc::O_DIRECTORY;
const FLAGS_OPEN_FILE: libc::c_int = libc::O_RDONLY | libc::O_NOFOLLOW | libc::O_NOATIME;

impl FileOps for KernelFs {
    fn open_dir_at(&self, dir: &Fd, path: &Path) -> io::Result<Fd> {
        sys::openat(dir.as_raw(), path, FLAGS_OPEN_DIR).map(Fd::new)
    }

    fn open_file_at(&self, dir: &Fd, path: &Path) -> io::Result<Fd> {
        match sys::openat(dir.as_raw(), path, FLAGS_OPEN_FILE) {
            Ok(fd) => Ok(Fd::new(fd)),
            // O_NOATIME needs ownership of the file; retry without.
            Err(err) if err.raw_os_error() == Some(libc::EPERM) => {
                warn!(path = %path.display(), "O_NOATIME open refused, retrying without");
                sys::openat(dir.as_raw(), path, FLAGS_OPEN_FILE & !libc::O_NOATIME).map(Fd::new)
            }
            Err(err) => Err(err),
        }
    }

    fn ino_paths(&self, fd: &Fd, ino: u64) -> io::Result<Vec<PathBuf>> {
        sys::ino_paths(fd.as_raw(), ino)
    }

    fn fd_root_id(&self, fd: &Fd) -> io::Result<RootId> {
        sys::ino_lookup_treeid(fd.as_raw(), BTRFS_FIRST_FREE_OBJECTID).map(RootId)
    }

    fn fd_identity(&self, fd: &Fd) -> io::Result<FdIdentity> {
        let (ino, dev) = sys::fstat_ino_dev(fd.as_raw())?;
        Ok(FdIdentity { ino, dev })
    }

    fn fd_iflags(&self, fd: &Fd) -> io::Result<u32> {
        sys::iflags_get(fd.as_raw())
    }
}
