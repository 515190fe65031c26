//! FUSE adapter: translates the kernel's inode-addressed protocol into the
//! overlay core's path-addressed operations.
//!
//! This layer owns no overlay semantics. It keeps an inode-to-path table,
//! an open-handle table, and converts attribute blocks; everything else is
//! forwarded to [`OverlayFs`].

mod convert;
mod inode_map;

use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use fuser::{
    Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData, ReplyDirectory, ReplyEmpty,
    ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, Request, TimeOrNow,
};
use parking_lot::{Mutex, RwLock};

use crate::overlay::{join_path, CallCtx, OverlayFs, OverlayHandle};
use convert::{mode_to_filetype, node_attr_to_fuse};
use inode_map::InodeMap;

pub struct DriftFs {
    overlay: Arc<OverlayFs>,
    inodes: RwLock<InodeMap>,
    handles: RwLock<HashMap<u64, OverlayHandle>>,
    next_fh: Mutex<u64>,
    /// Attribute and entry cache timeout handed to the kernel.
    ttl: Duration,
}

impl DriftFs {
    pub fn new(overlay: Arc<OverlayFs>, ttl: Duration) -> Self {
        DriftFs {
            overlay,
            inodes: RwLock::new(InodeMap::new()),
            handles: RwLock::new(HashMap::new()),
            next_fh: Mutex::new(1),
            ttl,
        }
    }

    fn alloc_fh(&self) -> u64 {
        let mut next = self.next_fh.lock();
        let fh = *next;
        *next = next.wrapping_add(1);
        fh
    }

    fn path_for(&self, ino: u64) -> Result<String, i32> {
        self.inodes
            .read()
            .path_of(ino)
            .map(str::to_string)
            .ok_or(libc::ENOENT)
    }

    fn child_path(&self, parent: u64, name: &OsStr) -> Result<String, i32> {
        // Overlay paths are strings; names the kernel hands us that are not
        // UTF-8 cannot be addressed.
        let Some(name) = name.to_str() else {
            return Err(libc::EINVAL);
        };
        let inodes = self.inodes.read();
        let Some(dir) = inodes.path_of(parent) else {
            return Err(libc::ENOENT);
        };
        Ok(join_path(dir, name))
    }

    fn handle_for(&self, fh: u64) -> Result<OverlayHandle, i32> {
        self.handles.read().get(&fh).cloned().ok_or(libc::EBADF)
    }
}

fn req_ctx(req: &Request) -> CallCtx {
    CallCtx::new(req.uid(), req.gid())
}

impl Filesystem for DriftFs {
    fn init(
        &mut self,
        _req: &Request,
        _config: &mut KernelConfig,
    ) -> std::result::Result<(), libc::c_int> {
        tracing::info!("overlay filesystem initialized");
        Ok(())
    }

    fn destroy(&mut self) {
        tracing::info!("overlay filesystem destroyed, buffered changes discarded");
    }

    fn lookup(&mut self, _req: &Request, parent: u64, name: &OsStr, reply: ReplyEntry) {
        tracing::debug!("lookup(parent={}, name={:?})", parent, name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.getattr(&path) {
            Ok(attr) => {
                let ino = self.inodes.write().bind(&path);
                reply.entry(&self.ttl, &node_attr_to_fuse(&attr, ino), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn getattr(&mut self, _req: &Request, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        tracing::trace!("getattr(ino={})", ino);
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.getattr(&path) {
            Ok(attr) => reply.attr(&self.ttl, &node_attr_to_fuse(&attr, ino)),
            Err(e) => reply.error(e),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        req: &Request,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        _fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        tracing::debug!(
            "setattr(ino={}, mode={:?}, uid={:?}, gid={:?}, size={:?})",
            ino,
            mode,
            uid,
            gid,
            size
        );
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let ctx = req_ctx(req);

        let current = match self.overlay.getattr(&path) {
            Ok(a) => a,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        if let Some(mode) = mode {
            if let Err(e) = self.overlay.chmod(&path, mode, &ctx) {
                reply.error(e);
                return;
            }
        }
        if uid.is_some() || gid.is_some() {
            let (uid, gid) = (uid.unwrap_or(current.uid), gid.unwrap_or(current.gid));
            if let Err(e) = self.overlay.chown(&path, uid, gid, &ctx) {
                reply.error(e);
                return;
            }
        }
        if let Some(size) = size {
            if let Err(e) = self.overlay.truncate(&path, size, &ctx) {
                reply.error(e);
                return;
            }
        }
        if atime.is_some() || mtime.is_some() {
            let resolve = |t: TimeOrNow| match t {
                TimeOrNow::SpecificTime(t) => t,
                TimeOrNow::Now => SystemTime::now(),
            };
            if let Err(e) =
                self.overlay
                    .utimens(&path, atime.map(resolve), mtime.map(resolve), &ctx)
            {
                reply.error(e);
                return;
            }
        }

        match self.overlay.getattr(&path) {
            Ok(attr) => reply.attr(&self.ttl, &node_attr_to_fuse(&attr, ino)),
            Err(e) => reply.error(e),
        }
    }

    fn open(&mut self, req: &Request, ino: u64, flags: i32, reply: ReplyOpen) {
        tracing::debug!("open(ino={}, flags={:#x})", ino, flags);
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.open(&path, flags, &req_ctx(req)) {
            Ok(handle) => {
                let fh = self.alloc_fh();
                self.handles.write().insert(fh, handle);
                reply.opened(fh, 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn create(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        tracing::debug!("create(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.create(&path, flags, mode, &req_ctx(req)) {
            Ok(handle) => {
                let attr = handle.node().getattr();
                let ino = self.inodes.write().bind(&path);
                let fh = self.alloc_fh();
                self.handles.write().insert(fh, handle);
                reply.created(&self.ttl, &node_attr_to_fuse(&attr, ino), 0, fh, 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn read(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        tracing::debug!("read(ino={}, fh={}, offset={}, size={})", ino, fh, offset, size);
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        // Clone the handle out of the table so slow wrapped-file reads do
        // not block open/close of other files.
        let handle = match self.handle_for(fh) {
            Ok(h) => h,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match handle.read(size, offset as u64) {
            Ok(data) => reply.data(&data),
            Err(e) => reply.error(e),
        }
    }

    fn write(
        &mut self,
        _req: &Request,
        ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        tracing::debug!(
            "write(ino={}, fh={}, offset={}, len={})",
            ino,
            fh,
            offset,
            data.len()
        );
        if offset < 0 {
            reply.error(libc::EINVAL);
            return;
        }
        let handle = match self.handle_for(fh) {
            Ok(h) => h,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match handle.write(data, offset as u64) {
            Ok(written) => reply.written(written),
            Err(e) => reply.error(e),
        }
    }

    fn flush(&mut self, _req: &Request, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.handle_for(fh).and_then(|h| h.flush()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn release(
        &mut self,
        _req: &Request,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.handles.write().remove(&fh);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request, _ino: u64, fh: u64, _datasync: bool, reply: ReplyEmpty) {
        match self.handle_for(fh).and_then(|h| h.fsync()) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        tracing::debug!("readdir(ino={}, offset={})", ino, offset);
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let entries = match self.overlay.open_dir(&path) {
            Ok(entries) => entries,
            Err(e) => {
                reply.error(e);
                return;
            }
        };

        let mut inodes = self.inodes.write();
        for (idx, entry) in entries.iter().enumerate() {
            if (idx as i64) < offset {
                continue;
            }
            let child_ino = inodes.bind(&join_path(&path, &entry.name));
            let kind = mode_to_filetype(entry.mode);
            if reply.add(child_ino, (idx + 1) as i64, kind, entry.name.as_str()) {
                break;
            }
        }
        reply.ok();
    }

    fn mkdir(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mkdir(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let ctx = req_ctx(req);
        match self
            .overlay
            .mkdir(&path, mode, &ctx)
            .and_then(|()| self.overlay.getattr(&path))
        {
            Ok(attr) => {
                let ino = self.inodes.write().bind(&path);
                reply.entry(&self.ttl, &node_attr_to_fuse(&attr, ino), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        tracing::debug!("mknod(parent={}, name={:?}, mode={:#o})", parent, name, mode);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        // The dispatcher owns the unsupported answer; mknod never succeeds
        reply.error(self.overlay.mknod(&path, mode, rdev).err().unwrap_or(libc::ENOSYS));
    }

    fn unlink(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("unlink(parent={}, name={:?})", parent, name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.unlink(&path, &req_ctx(req)) {
            Ok(()) => {
                self.inodes.write().unbind(&path);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn rmdir(&mut self, req: &Request, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        tracing::debug!("rmdir(parent={}, name={:?})", parent, name);
        let path = match self.child_path(parent, name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.rmdir(&path, &req_ctx(req)) {
            Ok(()) => {
                self.inodes.write().unbind(&path);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn rename(
        &mut self,
        req: &Request,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        _flags: u32,
        reply: ReplyEmpty,
    ) {
        tracing::debug!(
            "rename(parent={}, name={:?} -> newparent={}, newname={:?})",
            parent,
            name,
            newparent,
            newname
        );
        let (old, new) = match (
            self.child_path(parent, name),
            self.child_path(newparent, newname),
        ) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.rename(&old, &new, &req_ctx(req)) {
            Ok(()) => {
                self.inodes.write().rename_subtree(&old, &new);
                reply.ok();
            }
            Err(e) => reply.error(e),
        }
    }

    fn link(
        &mut self,
        _req: &Request,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        tracing::debug!("link(ino={}, newname={:?})", ino, newname);
        let (old, new) = match (self.path_for(ino), self.child_path(newparent, newname)) {
            (Ok(old), Ok(new)) => (old, new),
            (Err(e), _) | (_, Err(e)) => {
                reply.error(e);
                return;
            }
        };
        // The dispatcher owns the unsupported answer; link never succeeds
        reply.error(self.overlay.link(&old, &new).err().unwrap_or(libc::ENOSYS));
    }

    fn symlink(
        &mut self,
        req: &Request,
        parent: u64,
        link_name: &OsStr,
        target: &std::path::Path,
        reply: ReplyEntry,
    ) {
        tracing::debug!("symlink(parent={}, name={:?} -> {:?})", parent, link_name, target);
        let path = match self.child_path(parent, link_name) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        let Some(target) = target.to_str() else {
            reply.error(libc::EINVAL);
            return;
        };
        let ctx = req_ctx(req);
        match self
            .overlay
            .symlink(target, &path, &ctx)
            .and_then(|()| self.overlay.getattr(&path))
        {
            Ok(attr) => {
                let ino = self.inodes.write().bind(&path);
                reply.entry(&self.ttl, &node_attr_to_fuse(&attr, ino), 0);
            }
            Err(e) => reply.error(e),
        }
    }

    fn readlink(&mut self, _req: &Request, ino: u64, reply: ReplyData) {
        tracing::debug!("readlink(ino={})", ino);
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.readlink(&path) {
            Ok(target) => reply.data(target.as_bytes()),
            Err(e) => reply.error(e),
        }
    }

    fn access(&mut self, req: &Request, ino: u64, mask: i32, reply: ReplyEmpty) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.access(&path, mask as u32, &req_ctx(req)) {
            Ok(()) => reply.ok(),
            Err(e) => reply.error(e),
        }
    }

    fn statfs(&mut self, _req: &Request, ino: u64, reply: ReplyStatfs) {
        let path = match self.path_for(ino) {
            Ok(p) => p,
            Err(e) => {
                reply.error(e);
                return;
            }
        };
        match self.overlay.statfs(&path) {
            Ok(st) => reply.statfs(
                st.blocks, st.bfree, st.bavail, st.files, st.ffree, st.bsize, st.namelen,
                st.frsize,
            ),
            Err(e) => reply.error(e),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request,
        ino: u64,
        _fh: u64,
        _offset: i64,
        _length: i64,
        _mode: i32,
        reply: ReplyEmpty,
    ) {
        // Nothing buffered here survives unmount; no space to reserve
        tracing::debug!("fallocate(ino={}): unsupported", ino);
        reply.error(libc::ENOSYS);
    }
}
