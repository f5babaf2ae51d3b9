//! Root enumeration and subvolume/inode FD resolution.
//!
//! Turning a `(root, inode)` pair back into an open FD takes a backref
//! walk to the parent root, an ino-path lookup, and a stack of identity
//! checks on whatever the paths actually open. Every recoverable
//! failure class has its own counter; only verification mismatches on
//! freshly opened subvolume roots are hard errors.

use crate::context::FdCache;
use crate::counters::Counters;
use crate::tmpfiles::TmpfileRegistry;
use fbs_btrfs::{
    Fd, FileOps, MetaSearch, BTRFS_FIRST_FREE_OBJECTID, BTRFS_FS_TREE_OBJECTID,
    BTRFS_ROOT_TREE_OBJECTID, FS_NOCOW_FL,
};
use fbs_error::{FbsError, Result};
use fbs_types::{FileId, RootId};
use std::io::ErrorKind;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

const ROOT_FD_CACHE_SIZE: usize = 1024;
const INO_FD_CACHE_SIZE: usize = 16384;

/// Resolves subvolume and inode FDs through filesystem metadata.
pub struct RootResolver {
    meta: Arc<dyn MetaSearch>,
    files: Arc<dyn FileOps>,
    counters: Arc<Counters>,
    root_fd: Fd,
    root_cache: FdCache<RootId>,
    ino_cache: FdCache<FileId>,
}

impl RootResolver {
    #[must_use]
    pub fn new(
        meta: Arc<dyn MetaSearch>,
        files: Arc<dyn FileOps>,
        counters: Arc<Counters>,
        root_fd: Fd,
    ) -> Self {
        Self {
            meta,
            files,
            counters,
            root_fd,
            root_cache: FdCache::new(ROOT_FD_CACHE_SIZE),
            ino_cache: FdCache::new(INO_FD_CACHE_SIZE),
        }
    }

    #[must_use]
    pub fn root_fd(&self) -> &Fd {
        &self.root_fd
    }

    /// Drop all cached FDs. Run on every transid change so held
    /// directory handles never block snapshot deletion.
    pub fn clear_caches(&self) {
        self.root_cache.clear();
        self.ino_cache.clear();
    }

    /// Smallest existing root id strictly greater than `after`.
    ///
    /// The top-level fs tree has no backref, so anything below it maps
    /// straight to the fs tree id.
    pub fn next_root(&self, after: RootId) -> Result<Option<RootId>> {
        if after.get() < BTRFS_FS_TREE_OBJECTID {
            return Ok(Some(RootId(BTRFS_FS_TREE_OBJECTID)));
        }
        Ok(self
            .meta
            .next_root_backref(after)?
            .map(|backref| backref.root))
    }

    /// Cached subvolume directory FD.
    pub fn open_root(&self, root: RootId) -> Result<Option<Fd>> {
        // LOGICAL_INO output can name the root tree itself; there is
        // nothing to open for it.
        if root.get() == BTRFS_ROOT_TREE_OBJECTID {
            return Ok(None);
        }
        self.root_cache
            .get_or_try_insert(root, || self.open_root_nocache(root))
    }

    /// Resolve a subvolume directory FD through its parent backref.
    pub fn open_root_nocache(&self, root: RootId) -> Result<Option<Fd>> {
        // Recursion bottoms out at the filesystem root.
        if root.get() == BTRFS_FS_TREE_OBJECTID {
            return Ok(Some(self.root_fd.clone()));
        }

        let Some(backref) = self.meta.root_backref(root)? else {
            debug!(%root, "no backref for root");
            self.counters.bump("root_notfound");
            return Ok(None);
        };

        self.counters.bump("root_parent_open_try");
        let Some(mut parent_fd) = self.open_root(backref.parent)? else {
            self.counters.bump("root_parent_open_fail");
            return Ok(None);
        };
        self.counters.bump("root_parent_open_ok");

        if backref.dirid != BTRFS_FIRST_FREE_OBJECTID {
            let paths = match self.files.ino_paths(&parent_fd, backref.dirid) {
                Ok(paths) => paths,
                Err(err) => {
                    info!(
                        dirid = backref.dirid,
                        parent = %backref.parent,
                        error = %err,
                        "inode path lookup failed in parent root"
                    );
                    self.counters.bump("root_parent_path_fail");
                    return Ok(None);
                }
            };
            let Some(dir_path) = paths.first() else {
                info!(
                    dirid = backref.dirid,
                    parent = %backref.parent,
                    "containing directory has no paths"
                );
                self.counters.bump("root_parent_path_empty");
                return Ok(None);
            };
            parent_fd = match self.files.open_dir_at(&parent_fd, dir_path) {
                Ok(fd) => fd,
                Err(err) => {
                    debug!(path = %dir_path.display(), error = %err, "containing directory open failed");
                    self.counters.bump("root_parent_path_open_fail");
                    return Ok(None);
                }
            };
        }

        let fd = match self.files.open_dir_at(&parent_fd, Path::new(&backref.name)) {
            Ok(fd) => fd,
            Err(err) => {
                debug!(name = %backref.name, error = %err, "subvolume open failed");
                self.counters.bump("root_open_fail");
                return Ok(None);
            }
        };
        self.counters.bump("root_found");

        // Verify what we opened. Mismatches here are rare and there is
        // no alternative path to try, so they are hard errors.
        let opened_root = self.files.fd_root_id(&fd)?;
        if opened_root != root {
            return Err(FbsError::invalid_state(format!(
                "opened root {opened_root} while resolving root {root}"
            )));
        }
        let identity = self.files.fd_identity(&fd)?;
        if identity.ino != BTRFS_FIRST_FREE_OBJECTID {
            return Err(FbsError::invalid_state(format!(
                "root {root} opened with inode {} instead of subvolume root",
                identity.ino
            )));
        }

        self.counters.bump("root_ok");
        Ok(Some(fd))
    }

    /// Cached file FD for `(root, ino)`.
    pub fn open_root_ino(&self, fid: FileId, tmpfiles: &TmpfileRegistry) -> Result<Option<Fd>> {
        self.ino_cache
            .get_or_try_insert(fid, || self.open_root_ino_nocache(fid, tmpfiles))
    }

    /// Resolve a file FD by path lookup, validating everything.
    pub fn open_root_ino_nocache(
        &self,
        fid: FileId,
        tmpfiles: &TmpfileRegistry,
    ) -> Result<Option<Fd>> {
        // Staged rewrite files have no path; the registry owns them.
        if let Some(fd) = tmpfiles.get(fid) {
            self.counters.bump("open_tmpfile");
            return Ok(Some(fd));
        }

        let Some(root_fd) = self.open_root(fid.root)? else {
            self.counters.bump("open_no_root");
            return Ok(None);
        };

        let paths = match self.files.ino_paths(&root_fd, fid.ino) {
            Ok(paths) => paths,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                self.counters.bump("open_lookup_enoent");
                return Ok(None);
            }
            Err(err) => {
                info!(fid = %fid, error = %err, "inode path lookup failed");
                self.counters.bump("open_lookup_error");
                return Ok(None);
            }
        };
        if paths.is_empty() {
            warn!(fid = %fid, "inode has no paths");
            self.counters.bump("open_lookup_empty");
        }
        self.counters.bump("open_lookup_ok");

        for path in &paths {
            self.counters.bump("open_file");
            // Read-only is enough: the dedupe ioctl works on read FDs
            // when running privileged, and a write-mode FD would block
            // exec of the file.
            let fd = match self.files.open_file_at(&root_fd, path) {
                Ok(fd) => fd,
                Err(err) if err.kind() == ErrorKind::NotFound => {
                    self.counters.bump("open_fail_enoent");
                    continue;
                }
                Err(err) => {
                    warn!(fid = %fid, path = %path.display(), error = %err, "candidate open failed");
                    self.counters.bump("open_fail_error");
                    continue;
                }
            };

            let identity = match self.files.fd_identity(&fd) {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(fid = %fid, error = %err, "stat of candidate failed");
                    self.counters.bump("open_fail_error");
                    break;
                }
            };
            if identity.ino != fid.ino {
                warn!(
                    fid = %fid,
                    path = %path.display(),
                    found_ino = identity.ino,
                    "candidate path has wrong inode"
                );
                self.counters.bump("open_wrong_ino");
                break;
            }

            let file_root = match self.files.fd_root_id(&fd) {
                Ok(root) => root,
                Err(err) => {
                    warn!(fid = %fid, error = %err, "root id lookup of candidate failed");
                    self.counters.bump("open_fail_error");
                    break;
                }
            };
            if file_root != fid.root {
                warn!(
                    fid = %fid,
                    path = %path.display(),
                    found_root = %file_root,
                    "candidate path has wrong root"
                );
                self.counters.bump("open_wrong_root");
                break;
            }

            let root_identity = match self.files.fd_identity(&root_fd) {
                Ok(identity) => identity,
                Err(err) => {
                    warn!(fid = %fid, error = %err, "stat of subvolume root failed");
                    self.counters.bump("open_fail_error");
                    break;
                }
            };
            if root_identity.dev != identity.dev {
                warn!(
                    fid = %fid,
                    path = %path.display(),
                    file_dev = identity.dev,
                    root_dev = root_identity.dev,
                    "candidate path is on the wrong device"
                );
                self.counters.bump("open_wrong_dev");
                break;
            }

            // The kernel rejects dedupe between files with different
            // datasum flags; nocow implies nodatasum, so nocow files
            // are treated as unopenable.
            let attributes = match self.files.fd_iflags(&fd) {
                Ok(attributes) => attributes,
                Err(err) => {
                    warn!(fid = %fid, error = %err, "attribute read of candidate failed");
                    self.counters.bump("open_fail_error");
                    break;
                }
            };
            if attributes & FS_NOCOW_FL != 0 {
                warn!(
                    fid = %fid,
                    path = %path.display(),
                    attributes,
                    "candidate has nocow set"
                );
                self.counters.bump("open_wrong_flags");
                break;
            }

            self.counters.bump("open_hit");
            return Ok(Some(fd));
        }

        self.counters.bump("open_no_path");
        Ok(None)
    }
}
