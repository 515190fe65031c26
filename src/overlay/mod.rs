//! The overlay core: per-path buffered state over a wrapped filesystem.
//!
//! `OverlayFs` routes every operation between the in-memory overlay and the
//! wrapped tree underneath. A path is served from the overlay iff it has
//! been materialized; everything else falls through untouched. Unmounting
//! drops the whole table, which is the entire point.

mod handle;
mod node;
mod path;
mod slice;
pub mod types;

pub use handle::OverlayHandle;
pub use node::{NodeType, OverlayNode};
pub use path::{join_path, split_path};
pub use slice::{insert_slice, FileSlice};
pub use types::{CallCtx, DirEntry, Errno, FsStats, NodeAttr, OpResult};

use std::collections::HashMap;
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::RwLock;

use crate::wrapped::WrappedFs;

/// Path-addressed overlay dispatcher.
///
/// Lock order: the table lock is never held across a wrapped-filesystem
/// call, and node locks are only taken on `Arc`s cloned out of the table.
pub struct OverlayFs {
    wrapped: Arc<dyn WrappedFs>,
    nodes: RwLock<HashMap<String, Arc<OverlayNode>>>,
}

impl OverlayFs {
    pub fn new(wrapped: Arc<dyn WrappedFs>) -> Self {
        OverlayFs {
            wrapped,
            nodes: RwLock::new(HashMap::new()),
        }
    }

    fn lookup(&self, path: &str) -> Option<Arc<OverlayNode>> {
        self.nodes.read().get(path).cloned()
    }

    /// Insert `built` unless another thread materialized the path first, in
    /// which case the winner is returned. Keeps the table lock short; the
    /// node is fully constructed before the lock is taken.
    fn insert_if_absent(&self, path: &str, built: OverlayNode) -> Arc<OverlayNode> {
        self.nodes
            .write()
            .entry(path.to_string())
            .or_insert_with(|| Arc::new(built))
            .clone()
    }

    /// Overlay node for `path` as a regular file, materializing one bound
    /// to the wrapped file when it exists and an empty unbacked one when it
    /// does not.
    fn ensure_file(&self, path: &str, ctx: &CallCtx) -> OpResult<Arc<OverlayNode>> {
        if let Some(node) = self.lookup(path) {
            return match node.node_type() {
                NodeType::Dir => Err(libc::EISDIR),
                _ => Ok(node),
            };
        }
        let built = match self.wrapped.getattr(path) {
            Ok(attr) if attr.is_dir() => return Err(libc::EISDIR),
            Ok(attr) => OverlayNode::file(attr, Some(path.to_string())),
            Err(_) => OverlayNode::file(
                NodeAttr::from_scratch(libc::S_IFREG as u32 | 0o644, ctx),
                None,
            ),
        };
        tracing::debug!("materializing file overlay for {:?}", path);
        Ok(self.insert_if_absent(path, built))
    }

    /// Overlay node for `path` as a directory. Materialization seeds the
    /// entry list from the wrapped listing so later additions and removals
    /// layer on top of what was already there.
    fn ensure_dir(&self, path: &str, ctx: &CallCtx) -> OpResult<Arc<OverlayNode>> {
        if let Some(node) = self.lookup(path) {
            return match node.node_type() {
                NodeType::Dir => Ok(node),
                _ => Err(libc::ENOTDIR),
            };
        }
        let attr = match self.wrapped.getattr(path) {
            Ok(a) if a.is_dir() => a,
            Ok(_) => return Err(libc::ENOTDIR),
            Err(_) => NodeAttr::from_scratch(libc::S_IFDIR as u32 | 0o755, ctx),
        };
        let entries = self.wrapped.open_dir(path).unwrap_or_default();
        tracing::debug!("materializing dir overlay for {:?}", path);
        Ok(self.insert_if_absent(path, OverlayNode::dir(attr, entries)))
    }

    /// Overlay node for `path` of the kind `attr` reports, reusing an
    /// existing node when one is present.
    fn materialize_kind(
        &self,
        path: &str,
        attr: &NodeAttr,
        ctx: &CallCtx,
    ) -> OpResult<Arc<OverlayNode>> {
        if let Some(node) = self.lookup(path) {
            return Ok(node);
        }
        if attr.is_dir() {
            return self.ensure_dir(path, ctx);
        }
        let built = if attr.is_symlink() {
            let target = self.wrapped.readlink(path)?;
            OverlayNode::symlink(*attr, target)
        } else {
            OverlayNode::file(*attr, Some(path.to_string()))
        };
        tracing::debug!("materializing overlay for {:?}", path);
        Ok(self.insert_if_absent(path, built))
    }

    /// A path exists iff its parent's listing contains it. The listing is
    /// whichever of overlay or wrapped serves `open_dir` for the parent,
    /// which is how a deletion buffered in the parent makes the child
    /// vanish without any tombstone node.
    pub fn getattr(&self, path: &str) -> OpResult<NodeAttr> {
        if !path.is_empty() {
            let (dir, base) = split_path(path);
            let entries = self.open_dir(dir)?;
            if !entries.iter().any(|e| e.name == base) {
                return Err(libc::ENOENT);
            }
        }
        if let Some(node) = self.lookup(path) {
            return Ok(node.getattr());
        }
        self.wrapped.getattr(path)
    }

    pub fn open_dir(&self, path: &str) -> OpResult<Vec<DirEntry>> {
        if let Some(node) = self.lookup(path) {
            return node.entries();
        }
        self.wrapped.open_dir(path)
    }

    pub fn open(&self, path: &str, _flags: i32, ctx: &CallCtx) -> OpResult<OverlayHandle> {
        tracing::debug!("open({:?})", path);
        let node = self.ensure_file(path, ctx)?;
        Ok(OverlayHandle::new(node, self.wrapped.clone(), *ctx))
    }

    /// Create a fresh, unbacked file overlay at `path` and list it in the
    /// parent. A name already present in the parent's listing is a
    /// conflict; nothing is touched until the entry is claimed.
    pub fn create(
        &self,
        path: &str,
        _flags: i32,
        mode: u32,
        ctx: &CallCtx,
    ) -> OpResult<OverlayHandle> {
        tracing::debug!("create({:?}, mode={:#o})", path, mode);
        let (dir, base) = split_path(path);
        let parent = self.ensure_dir(dir, ctx)?;

        let attr = NodeAttr::from_scratch(libc::S_IFREG as u32 | (mode & 0o7777), ctx);
        parent.add_entry(attr.mode, base)?;

        let node = Arc::new(OverlayNode::file(attr, None));
        self.nodes.write().insert(path.to_string(), node.clone());
        Ok(OverlayHandle::new(node, self.wrapped.clone(), *ctx))
    }

    pub fn mkdir(&self, path: &str, mode: u32, ctx: &CallCtx) -> OpResult<()> {
        tracing::debug!("mkdir({:?}, mode={:#o})", path, mode);
        let (dir, base) = split_path(path);
        let parent = self.ensure_dir(dir, ctx)?;
        let mode = libc::S_IFDIR as u32 | (mode & 0o7777);
        parent.add_entry(mode, base)?;

        let attr = match self.wrapped.getattr(path) {
            Ok(a) => a,
            Err(_) => NodeAttr::from_scratch(mode, ctx),
        };
        // A fresh directory starts with no entries even when the wrapped
        // tree has content at this path: from the caller's point of view
        // the path did not exist a moment ago.
        let node = Arc::new(OverlayNode::dir(attr, Vec::new()));
        self.nodes.write().insert(path.to_string(), node);
        Ok(())
    }

    pub fn symlink(&self, target: &str, path: &str, ctx: &CallCtx) -> OpResult<()> {
        tracing::debug!("symlink({:?} -> {:?})", path, target);
        let (dir, base) = split_path(path);
        let parent = self.ensure_dir(dir, ctx)?;
        let mode = libc::S_IFLNK as u32 | 0o777;
        parent.add_entry(mode, base)?;

        let attr = match self.wrapped.getattr(path) {
            Ok(a) => a,
            Err(_) => NodeAttr::from_scratch(mode, ctx),
        };
        let node = Arc::new(OverlayNode::symlink(attr, target.to_string()));
        self.nodes.write().insert(path.to_string(), node);
        Ok(())
    }

    /// Delist `path` from its parent and drop any overlay node. Both halves
    /// are idempotent, so unlinking twice reports success twice.
    pub fn unlink(&self, path: &str, ctx: &CallCtx) -> OpResult<()> {
        tracing::debug!("unlink({:?})", path);
        let (dir, base) = split_path(path);
        let parent = self.ensure_dir(dir, ctx)?;
        parent.remove_entry(base)?;
        self.nodes.write().remove(path);
        Ok(())
    }

    pub fn rmdir(&self, path: &str, ctx: &CallCtx) -> OpResult<()> {
        tracing::debug!("rmdir({:?})", path);
        self.unlink(path, ctx)
    }

    pub fn chmod(&self, path: &str, mode: u32, ctx: &CallCtx) -> OpResult<()> {
        let attr = self.getattr(path)?;
        if attr.perm() == mode & 0o7777 {
            return Ok(());
        }
        // Symlink permissions are ignored on every mainstream platform;
        // report success without materializing anything.
        if attr.is_symlink() {
            return Ok(());
        }
        let node = self.materialize_kind(path, &attr, ctx)?;
        node.chmod(mode);
        Ok(())
    }

    pub fn chown(&self, path: &str, uid: u32, gid: u32, ctx: &CallCtx) -> OpResult<()> {
        let attr = self.getattr(path)?;
        if attr.uid == uid && attr.gid == gid {
            return Ok(());
        }
        let node = self.materialize_kind(path, &attr, ctx)?;
        node.chown(uid, gid);
        Ok(())
    }

    pub fn truncate(&self, path: &str, size: u64, ctx: &CallCtx) -> OpResult<()> {
        tracing::debug!("truncate({:?}, {})", path, size);
        let node = self.ensure_file(path, ctx)?;
        node.truncate(size)
    }

    pub fn utimens(
        &self,
        path: &str,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
        ctx: &CallCtx,
    ) -> OpResult<()> {
        let attr = self.getattr(path)?;
        let node = self.materialize_kind(path, &attr, ctx)?;
        node.utimens(atime, mtime);
        Ok(())
    }

    pub fn readlink(&self, path: &str) -> OpResult<String> {
        if let Some(node) = self.lookup(path) {
            return node.target();
        }
        self.wrapped.readlink(path)
    }

    /// Move `old` to `new` inside the overlay. The node is re-keyed, the
    /// destination parent gains the entry (replacing any same-name entry:
    /// rename overwrites), the source parent loses it, and a directory's
    /// descendants are re-keyed eagerly so their buffered state follows.
    ///
    /// The steps are not atomic; a concurrent reader can observe an
    /// intermediate state.
    pub fn rename(&self, old: &str, new: &str, ctx: &CallCtx) -> OpResult<()> {
        tracing::debug!("rename({:?} -> {:?})", old, new);
        let attr = self.getattr(old)?;
        let node = self.materialize_kind(old, &attr, ctx)?;

        let (old_dir, old_base) = split_path(old);
        let (new_dir, new_base) = split_path(new);
        let old_parent = self.ensure_dir(old_dir, ctx)?;
        let new_parent = if new_dir == old_dir {
            old_parent.clone()
        } else {
            self.ensure_dir(new_dir, ctx)?
        };

        self.nodes.write().insert(new.to_string(), node);
        if attr.is_dir() {
            self.rename_children(old, new, ctx)?;
        }

        new_parent.remove_entry(new_base)?;
        new_parent.add_entry(attr.mode, new_base)?;
        if old != new {
            old_parent.remove_entry(old_base)?;
            self.nodes.write().remove(old);
        }
        Ok(())
    }

    /// Re-key every descendant of a renamed directory. The directory node
    /// carries its entry list with it, so only the table bindings move;
    /// children served purely from the wrapped tree are materialized first
    /// so their wrapped source keeps pointing at the old location.
    fn rename_children(&self, old: &str, new: &str, ctx: &CallCtx) -> OpResult<()> {
        let entries = match self.lookup(new) {
            Some(dir) => dir.entries()?,
            None => return Ok(()),
        };
        for entry in entries {
            let old_child = join_path(old, &entry.name);
            let new_child = join_path(new, &entry.name);
            let child_attr = self.getattr(&old_child)?;
            let child = self.materialize_kind(&old_child, &child_attr, ctx)?;
            self.nodes.write().insert(new_child.clone(), child);
            if child_attr.is_dir() {
                self.rename_children(&old_child, &new_child, ctx)?;
            }
            self.nodes.write().remove(&old_child);
        }
        Ok(())
    }

    /// Classic permission-triad check against the caller's identity.
    pub fn access(&self, path: &str, mask: u32, ctx: &CallCtx) -> OpResult<()> {
        let attr = self.getattr(path)?;
        if mask == 0 {
            return Ok(());
        }
        let bits = if ctx.uid == attr.uid {
            (attr.mode >> 6) & 0o7
        } else if ctx.gid == attr.gid {
            (attr.mode >> 3) & 0o7
        } else {
            attr.mode & 0o7
        };
        if mask & !bits != 0 {
            return Err(libc::EACCES);
        }
        Ok(())
    }

    pub fn statfs(&self, path: &str) -> OpResult<FsStats> {
        self.wrapped.statfs(path)
    }

    /// Special files are out of scope.
    pub fn mknod(&self, _path: &str, _mode: u32, _rdev: u32) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    /// Hard links are out of scope.
    pub fn link(&self, _old: &str, _new: &str) -> OpResult<()> {
        Err(libc::ENOSYS)
    }

    #[cfg(test)]
    pub(crate) fn overlay_len(&self) -> usize {
        self.nodes.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wrapped::BindFs;
    use std::fs;

    fn ctx() -> CallCtx {
        CallCtx::new(1000, 1000)
    }

    fn overlay_over(dir: &std::path::Path) -> OverlayFs {
        OverlayFs::new(Arc::new(BindFs::new(dir).unwrap()))
    }

    #[test]
    fn test_untouched_paths_fall_through() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        let fs_ = overlay_over(dir.path());

        let attr = fs_.getattr("a").unwrap();
        assert_eq!(attr.size, 5);
        assert_eq!(fs_.overlay_len(), 0, "getattr must not materialize");
    }

    #[test]
    fn test_getattr_missing_is_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let fs_ = overlay_over(dir.path());
        assert_eq!(fs_.getattr("ghost").unwrap_err(), libc::ENOENT);
    }

    #[test]
    fn test_open_materializes_with_source() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        let fs_ = overlay_over(dir.path());

        let handle = fs_.open("a", libc::O_RDONLY, &ctx()).unwrap();
        assert_eq!(fs_.overlay_len(), 1);
        assert_eq!(handle.read(5, 0).unwrap(), b"hello");
    }

    #[test]
    fn test_open_directory_is_eisdir() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("d")).unwrap();
        let fs_ = overlay_over(dir.path());
        assert_eq!(
            fs_.open("d", libc::O_RDONLY, &ctx()).unwrap_err(),
            libc::EISDIR
        );
    }

    #[test]
    fn test_unlink_hides_wrapped_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"hello").unwrap();
        let fs_ = overlay_over(dir.path());

        fs_.unlink("a", &ctx()).unwrap();
        assert_eq!(fs_.getattr("a").unwrap_err(), libc::ENOENT);
        assert!(dir.path().join("a").exists(), "origin must be untouched");

        // Second unlink is a no-op that still succeeds
        fs_.unlink("a", &ctx()).unwrap();
    }

    #[test]
    fn test_chmod_noop_does_not_materialize() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"x").unwrap();
        fs::set_permissions(
            dir.path().join("a"),
            std::os::unix::fs::PermissionsExt::from_mode(0o644),
        )
        .unwrap();
        let fs_ = overlay_over(dir.path());

        fs_.chmod("a", 0o644, &ctx()).unwrap();
        assert_eq!(fs_.overlay_len(), 0);

        fs_.chmod("a", 0o600, &ctx()).unwrap();
        assert_eq!(fs_.overlay_len(), 1);
        assert_eq!(fs_.getattr("a").unwrap().perm(), 0o600);
    }

    #[test]
    fn test_access_triads() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a"), b"x").unwrap();
        fs::set_permissions(
            dir.path().join("a"),
            std::os::unix::fs::PermissionsExt::from_mode(0o640),
        )
        .unwrap();
        let fs_ = overlay_over(dir.path());
        let attr = fs_.getattr("a").unwrap();

        let owner = CallCtx::new(attr.uid, attr.gid);
        assert!(fs_.access("a", libc::R_OK as u32, &owner).is_ok());
        assert!(fs_.access("a", libc::X_OK as u32, &owner).is_err());

        let stranger = CallCtx::new(attr.uid + 1, attr.gid + 1);
        assert_eq!(
            fs_.access("a", libc::R_OK as u32, &stranger).unwrap_err(),
            libc::EACCES
        );
    }

    #[test]
    fn test_mknod_and_link_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let fs_ = overlay_over(dir.path());
        assert_eq!(
            fs_.mknod("dev", libc::S_IFCHR as u32 | 0o600, 0).unwrap_err(),
            libc::ENOSYS
        );
        assert_eq!(fs_.link("a", "b").unwrap_err(), libc::ENOSYS);
    }
}
