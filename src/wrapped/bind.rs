//! Passthrough implementation of [`WrappedFs`] over a host directory.

use std::ffi::CString;
use std::fs::{self, File};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{DriftError, Result};
use crate::overlay::types::{DirEntry, FsStats, NodeAttr, OpResult};
use crate::wrapped::{WrappedFile, WrappedFs};

/// Serves attributes, listings and bytes straight from an origin directory
/// on the host filesystem. Never writes.
pub struct BindFs {
    root: PathBuf,
}

impl BindFs {
    /// The root is made absolute up front so a later working-directory
    /// change cannot repoint the origin.
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let abs = root
            .canonicalize()
            .map_err(|e| DriftError::Origin(format!("{}: {}", root.display(), e)))?;
        if !abs.is_dir() {
            return Err(DriftError::Origin(format!(
                "{}: not a directory",
                abs.display()
            )));
        }
        Ok(BindFs { root: abs })
    }

    fn full_path(&self, rel: &str) -> PathBuf {
        if rel.is_empty() {
            self.root.clone()
        } else {
            self.root.join(rel)
        }
    }
}

impl WrappedFs for BindFs {
    fn getattr(&self, path: &str) -> OpResult<NodeAttr> {
        let full = self.full_path(path);
        // The origin root is looked at through symlinks so a symlinked
        // origin still mounts as a directory.
        let meta = if path.is_empty() {
            fs::metadata(&full)
        } else {
            fs::symlink_metadata(&full)
        }
        .map_err(io_errno)?;
        Ok(metadata_to_node_attr(&meta))
    }

    fn open_dir(&self, path: &str) -> OpResult<Vec<DirEntry>> {
        let full = self.full_path(path);
        let read_dir = fs::read_dir(&full).map_err(io_errno)?;
        let mut out = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(io_errno)?;
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                tracing::warn!("skipping non-UTF-8 entry under {}", full.display());
                continue;
            };
            let meta = entry.metadata().map_err(io_errno)?;
            out.push(DirEntry::new(name, meta.mode()));
        }
        Ok(out)
    }

    fn open(&self, path: &str, _flags: i32) -> OpResult<Box<dyn WrappedFile>> {
        // The overlay never writes through this layer, so every open is
        // read-only regardless of the requested flags.
        let file = File::open(self.full_path(path)).map_err(io_errno)?;
        Ok(Box::new(BindFile { file }))
    }

    fn readlink(&self, path: &str) -> OpResult<String> {
        let target = fs::read_link(self.full_path(path)).map_err(io_errno)?;
        match target.to_str() {
            Some(s) => Ok(s.to_string()),
            None => Err(libc::EINVAL),
        }
    }

    fn statfs(&self, path: &str) -> OpResult<FsStats> {
        let full = self.full_path(path);
        let c_path = CString::new(full.as_os_str().as_bytes()).map_err(|_| libc::EINVAL)?;
        let mut st: libc::statfs = unsafe { std::mem::zeroed() };
        // SAFETY: c_path is a valid NUL-terminated string and st is a
        // zeroed out-parameter of the correct type.
        let rc = unsafe { libc::statfs(c_path.as_ptr(), &mut st) };
        if rc != 0 {
            return Err(io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO));
        }
        Ok(FsStats {
            blocks: st.f_blocks as u64,
            bfree: st.f_bfree as u64,
            bavail: st.f_bavail as u64,
            files: st.f_files as u64,
            ffree: st.f_ffree as u64,
            bsize: st.f_bsize as u32,
            #[cfg(target_os = "linux")]
            namelen: st.f_namelen as u32,
            #[cfg(not(target_os = "linux"))]
            namelen: 255,
            #[cfg(target_os = "linux")]
            frsize: st.f_frsize as u32,
            #[cfg(not(target_os = "linux"))]
            frsize: st.f_bsize as u32,
        })
    }
}

struct BindFile {
    file: File,
}

impl WrappedFile for BindFile {
    fn read_at(&self, buf: &mut [u8], off: u64) -> OpResult<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.file.read_at(&mut buf[filled..], off + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(io_errno(e)),
            }
        }
        Ok(filled)
    }
}

pub(crate) fn io_errno(e: io::Error) -> i32 {
    if let Some(code) = e.raw_os_error() {
        return code;
    }
    match e.kind() {
        io::ErrorKind::NotFound => libc::ENOENT,
        io::ErrorKind::PermissionDenied => libc::EACCES,
        io::ErrorKind::AlreadyExists => libc::EEXIST,
        io::ErrorKind::InvalidInput => libc::EINVAL,
        io::ErrorKind::InvalidData => libc::EINVAL,
        io::ErrorKind::Interrupted => libc::EINTR,
        io::ErrorKind::Unsupported => libc::ENOSYS,
        _ => libc::EIO,
    }
}

fn systime(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::new((-secs) as u64, 0)
    }
}

pub(crate) fn metadata_to_node_attr(meta: &fs::Metadata) -> NodeAttr {
    NodeAttr {
        ino: meta.ino(),
        size: meta.len(),
        blocks: meta.blocks(),
        blksize: meta.blksize() as u32,
        mode: meta.mode(),
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        atime: systime(meta.atime(), meta.atime_nsec()),
        mtime: systime(meta.mtime(), meta.mtime_nsec()),
        ctime: systime(meta.ctime(), meta.ctime_nsec()),
    }
}
