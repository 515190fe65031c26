use std::time::SystemTime;

/// Raw errno value as understood by the FUSE transport.
pub type Errno = i32;

/// Result type spoken by every filesystem-facing operation.
pub type OpResult<T> = std::result::Result<T, Errno>;

/// Identity of the process issuing a filesystem request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallCtx {
    pub uid: u32,
    pub gid: u32,
}

impl CallCtx {
    pub fn new(uid: u32, gid: u32) -> Self {
        CallCtx { uid, gid }
    }
}

/// One entry of a directory listing: name plus full mode bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub mode: u32,
}

impl DirEntry {
    pub fn new(name: impl Into<String>, mode: u32) -> Self {
        DirEntry {
            name: name.into(),
            mode,
        }
    }
}

/// Filesystem-level statistics passed through from the wrapped filesystem.
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStats {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

/// Stat-like attribute block shared by all overlay node kinds.
///
/// `mode` carries both the file-type bits and the permission bits, the way
/// the kernel reports them. The inode number is opaque to the overlay; the
/// FUSE adapter assigns its own numbering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    pub size: u64,
    pub blocks: u64,
    pub blksize: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: SystemTime,
    pub mtime: SystemTime,
    pub ctime: SystemTime,
}

impl NodeAttr {
    /// Attributes for a path that exists only in the overlay: current
    /// times, link count 1, the caller's ownership, the requested mode.
    /// Fresh directories get the conventional nominal size.
    pub fn from_scratch(mode: u32, ctx: &CallCtx) -> Self {
        let now = SystemTime::now();
        let mut attr = NodeAttr {
            ino: 0,
            size: 0,
            blocks: 0,
            blksize: 4096,
            mode,
            nlink: 1,
            uid: ctx.uid,
            gid: ctx.gid,
            atime: now,
            mtime: now,
            ctime: now,
        };
        if attr.is_dir() {
            attr.size = 4096;
            attr.blocks = 8;
        }
        attr
    }

    pub fn file_type(&self) -> u32 {
        self.mode & libc::S_IFMT as u32
    }

    pub fn perm(&self) -> u32 {
        self.mode & 0o7777
    }

    pub fn is_dir(&self) -> bool {
        self.file_type() == libc::S_IFDIR as u32
    }

    pub fn is_symlink(&self) -> bool {
        self.file_type() == libc::S_IFLNK as u32
    }

    pub fn is_file(&self) -> bool {
        self.file_type() == libc::S_IFREG as u32
    }

    /// Replace the permission bits, leaving the file-type bits alone.
    pub fn set_perm(&mut self, mode: u32) {
        self.mode = (self.mode & !0o7777) | (mode & 0o7777);
    }

    /// Apply the provided times; `ctime` always advances to now.
    pub fn set_times(&mut self, atime: Option<SystemTime>, mtime: Option<SystemTime>) {
        if let Some(a) = atime {
            self.atime = a;
        }
        if let Some(m) = mtime {
            self.mtime = m;
        }
        self.ctime = SystemTime::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_dir_gets_nominal_size() {
        let ctx = CallCtx::new(1000, 1000);
        let attr = NodeAttr::from_scratch(libc::S_IFDIR as u32 | 0o755, &ctx);
        assert!(attr.is_dir());
        assert_eq!(attr.size, 4096);
        assert_eq!(attr.blocks, 8);
        assert_eq!(attr.nlink, 1);
        assert_eq!(attr.uid, 1000);
    }

    #[test]
    fn test_fresh_file_is_empty() {
        let ctx = CallCtx::new(1000, 1000);
        let attr = NodeAttr::from_scratch(libc::S_IFREG as u32 | 0o644, &ctx);
        assert!(attr.is_file());
        assert_eq!(attr.size, 0);
        assert_eq!(attr.perm(), 0o644);
    }

    #[test]
    fn test_set_perm_preserves_file_type() {
        let ctx = CallCtx::new(0, 0);
        let mut attr = NodeAttr::from_scratch(libc::S_IFREG as u32 | 0o644, &ctx);
        attr.set_perm(0o600);
        assert!(attr.is_file());
        assert_eq!(attr.perm(), 0o600);
    }
}
