//! Raw btrfs ioctl shims.
//!
//! The only module in the workspace allowed to contain `unsafe`. Every
//! function here wraps exactly one syscall and returns `std::io` errors;
//! result parsing happens in safe code in [`crate::kernel`].

use std::ffi::CString;
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};

pub const BTRFS_IOC_TREE_SEARCH_V2: libc::c_ulong = 0xc070_9411;
pub const BTRFS_IOC_INO_LOOKUP: libc::c_ulong = 0xd000_9412;
pub const BTRFS_IOC_INO_PATHS: libc::c_ulong = 0xc038_9423;
pub const FS_IOC_GETFLAGS: libc::c_ulong = 0x8008_6601;

/// Result buffer size for one TREE_SEARCH_V2 call.
pub const SEARCH_BUF_SIZE: usize = 64 * 1024;

/// `struct btrfs_ioctl_search_key`.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct SearchKey {
    pub tree_id: u64,
    pub min_objectid: u64,
    pub max_objectid: u64,
    pub min_offset: u64,
    pub max_offset: u64,
    pub min_transid: u64,
    pub max_transid: u64,
    pub min_type: u32,
    pub max_type: u32,
    pub nr_items: u32,
    unused: u32,
    unused1: u64,
    unused2: u64,
    unused3: u64,
    unused4: u64,
}

impl SearchKey {
    #[must_use]
    pub fn new(tree_id: u64) -> Self {
        Self {
            tree_id,
            min_objectid: 0,
            max_objectid: u64::MAX,
            min_offset: 0,
            max_offset: u64::MAX,
            min_transid: 0,
            max_transid: u64::MAX,
            min_type: 0,
            max_type: u8::MAX.into(),
            nr_items: 0,
            unused: 0,
            unused1: 0,
            unused2: 0,
            unused3: 0,
            unused4: 0,
        }
    }
}

/// `struct btrfs_ioctl_search_args_v2` with an inline result buffer.
#[repr(C)]
pub struct SearchArgsV2 {
    pub key: SearchKey,
    pub buf_size: u64,
    pub buf: [u8; SEARCH_BUF_SIZE],
}

impl SearchArgsV2 {
    #[must_use]
    pub fn new(key: SearchKey) -> Box<Self> {
        Box::new(Self {
            key,
            buf_size: SEARCH_BUF_SIZE as u64,
            buf: [0_u8; SEARCH_BUF_SIZE],
        })
    }
}

/// Size of `struct btrfs_ioctl_search_header` in the result buffer.
pub const SEARCH_HEADER_SIZE: usize = 32;

/// Run one TREE_SEARCH_V2. On return `args.key.nr_items` holds the
/// number of results serialized into `args.buf`.
pub fn tree_search_v2(fd: RawFd, args: &mut SearchArgsV2) -> io::Result<()> {
    // SAFETY: `args` is a live, properly sized repr(C) buffer matching
    // the ioctl's expected layout; the kernel writes only within
    // `buf_size` bytes of `buf`.
    let rc = unsafe { libc::ioctl(fd, BTRFS_IOC_TREE_SEARCH_V2, std::ptr::from_mut(args)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// `struct btrfs_ioctl_ino_lookup_args`.
#[repr(C)]
struct InoLookupArgs {
    treeid: u64,
    objectid: u64,
    name: [u8; 4080],
}

/// Resolve the tree id containing the object open at `fd`.
pub fn ino_lookup_treeid(fd: RawFd, objectid: u64) -> io::Result<u64> {
    let mut args = Box::new(InoLookupArgs {
        treeid: 0,
        objectid,
        name: [0_u8; 4080],
    });
    // SAFETY: fixed-size repr(C) argument block owned by this frame.
    let rc = unsafe { libc::ioctl(fd, BTRFS_IOC_INO_LOOKUP, std::ptr::from_mut(&mut *args)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(args.treeid)
}

const INO_PATHS_BUF_SIZE: usize = 64 * 1024;

/// `struct btrfs_ioctl_ino_path_args` followed by its data container.
#[repr(C)]
struct InoPathArgs {
    inum: u64,
    size: u64,
    reserved: [u64; 4],
    fspath: u64,
}

#[repr(C)]
struct DataContainer {
    bytes_left: u32,
    bytes_missing: u32,
    elem_cnt: u32,
    elem_missed: u32,
    val: [u8; INO_PATHS_BUF_SIZE],
}

/// Paths of inode `inum` relative to the subvolume open at `fd`.
pub fn ino_paths(fd: RawFd, inum: u64) -> io::Result<Vec<PathBuf>> {
    let mut container = Box::new(DataContainer {
        bytes_left: 0,
        bytes_missing: 0,
        elem_cnt: 0,
        elem_missed: 0,
        val: [0_u8; INO_PATHS_BUF_SIZE],
    });
    let container_addr = std::ptr::from_mut(&mut *container) as u64;
    let mut args = InoPathArgs {
        inum,
        size: (std::mem::size_of::<DataContainer>()) as u64,
        reserved: [0; 4],
        fspath: container_addr,
    };
    // SAFETY: `args` points at a live container buffer of the declared
    // size; the kernel writes path bytes and offset slots only within
    // that buffer.
    let rc = unsafe { libc::ioctl(fd, BTRFS_IOC_INO_PATHS, std::ptr::from_mut(&mut args)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    // The leading `elem_cnt` u64 slots of `val` hold byte offsets
    // (relative to the start of `val`) of NUL-terminated path strings
    // later in the buffer.
    let elem_cnt = container.elem_cnt as usize;
    let mut paths = Vec::with_capacity(elem_cnt);
    for i in 0..elem_cnt {
        let slot = i * 8;
        let Some(raw) = container.val.get(slot..slot + 8) else {
            break;
        };
        let offset = u64::from_ne_bytes(raw.try_into().expect("8-byte slot")) as usize;
        let Some(tail) = container.val.get(offset..) else {
            continue;
        };
        let end = tail.iter().position(|&b| b == 0).unwrap_or(tail.len());
        let bytes = &tail[..end];
        paths.push(PathBuf::from(String::from_utf8_lossy(bytes).into_owned()));
    }
    Ok(paths)
}

/// Inode attribute flags (`FS_IOC_GETFLAGS`).
pub fn iflags_get(fd: RawFd) -> io::Result<u32> {
    let mut flags: libc::c_long = 0;
    // SAFETY: ioctl writes one c_long through the provided pointer.
    let rc = unsafe { libc::ioctl(fd, FS_IOC_GETFLAGS, std::ptr::from_mut(&mut flags)) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(flags as u32)
}

fn cstring_path(path: &Path) -> io::Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL"))
}

/// `openat` relative to `dirfd`.
pub fn openat(dirfd: RawFd, path: &Path, flags: libc::c_int) -> io::Result<OwnedFd> {
    let cpath = cstring_path(path)?;
    // SAFETY: `cpath` is a valid NUL-terminated string for the call.
    let fd = unsafe { libc::openat(dirfd, cpath.as_ptr(), flags | libc::O_CLOEXEC) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` is a freshly opened descriptor owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Inode and device numbers of the object open at `fd`.
pub fn fstat_ino_dev(fd: RawFd) -> io::Result<(u64, u64)> {
    // SAFETY: zeroed stat buffer is a valid fstat target.
    let mut st: libc::stat = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstat(fd, &mut st) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok((st.st_ino, st.st_dev))
}

/// Filesystem block size reported by `fstatfs`.
pub fn fstatfs_bsize(fd: RawFd) -> io::Result<u64> {
    // SAFETY: zeroed statfs buffer is a valid fstatfs target.
    let mut st: libc::statfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::fstatfs(fd, &mut st) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(st.f_bsize as u64)
}
