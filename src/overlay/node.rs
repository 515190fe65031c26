//! Overlay nodes: the in-memory state of one modified path.
//!
//! A node is one of three kinds. Files carry a sorted list of byte slices
//! shadowing the wrapped file's bytes; directories carry an entry list that
//! may diverge from the wrapped listing; symlinks carry their target.
//! Operations of the wrong kind answer with the matching type errno.

use parking_lot::Mutex;

use crate::overlay::slice::{insert_slice, FileSlice};
use crate::overlay::types::{DirEntry, NodeAttr, OpResult};
use crate::wrapped::WrappedFs;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Dir,
    Symlink,
}

#[derive(Debug)]
enum NodeKind {
    File {
        /// Wrapped path supplying baseline bytes, or `None` for a file
        /// created fresh in the overlay.
        source: Option<String>,
        slices: Vec<FileSlice>,
    },
    Dir {
        entries: Vec<DirEntry>,
    },
    Symlink {
        target: String,
    },
}

#[derive(Debug)]
struct NodeInner {
    attr: NodeAttr,
    kind: NodeKind,
}

/// One materialized overlay path. The mutex covers the attribute block and
/// the kind-specific state; read, write and truncate serialize on it.
#[derive(Debug)]
pub struct OverlayNode {
    inner: Mutex<NodeInner>,
}

impl OverlayNode {
    pub fn file(attr: NodeAttr, source: Option<String>) -> Self {
        OverlayNode {
            inner: Mutex::new(NodeInner {
                attr,
                kind: NodeKind::File {
                    source,
                    slices: Vec::new(),
                },
            }),
        }
    }

    pub fn dir(attr: NodeAttr, entries: Vec<DirEntry>) -> Self {
        OverlayNode {
            inner: Mutex::new(NodeInner {
                attr,
                kind: NodeKind::Dir { entries },
            }),
        }
    }

    pub fn symlink(attr: NodeAttr, target: String) -> Self {
        OverlayNode {
            inner: Mutex::new(NodeInner {
                attr,
                kind: NodeKind::Symlink { target },
            }),
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.inner.lock().kind {
            NodeKind::File { .. } => NodeType::File,
            NodeKind::Dir { .. } => NodeType::Dir,
            NodeKind::Symlink { .. } => NodeType::Symlink,
        }
    }

    pub fn getattr(&self) -> NodeAttr {
        self.inner.lock().attr
    }

    pub fn size(&self) -> u64 {
        self.inner.lock().attr.size
    }

    pub fn chmod(&self, mode: u32) {
        self.inner.lock().attr.set_perm(mode);
    }

    pub fn chown(&self, uid: u32, gid: u32) {
        let mut inner = self.inner.lock();
        inner.attr.uid = uid;
        inner.attr.gid = gid;
    }

    pub fn utimens(
        &self,
        atime: Option<std::time::SystemTime>,
        mtime: Option<std::time::SystemTime>,
    ) {
        self.inner.lock().attr.set_times(atime, mtime);
    }

    /// Read up to `size` bytes at `off`, stitching buffered slices over the
    /// wrapped file's bytes.
    ///
    /// A read at or past end of file returns no bytes (`read(2)`). With no
    /// bound source the window starts out zero-filled, so holes between
    /// slices read back as zeros.
    pub fn read(&self, wrapped: &dyn WrappedFs, size: u32, off: u64) -> OpResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let (source, want) = match &inner.kind {
            NodeKind::File { source, .. } => (source.clone(), size as usize),
            NodeKind::Dir { .. } => return Err(libc::EISDIR),
            NodeKind::Symlink { .. } => return Err(libc::EINVAL),
        };

        if off >= inner.attr.size {
            return Ok(Vec::new());
        }

        let mut window = FileSlice::zeroed(off, want);
        if let Some(src) = source {
            let file = wrapped.open(&src, libc::O_RDONLY)?;
            // A short read leaves the tail zero-filled; the size clip below
            // keeps stale zeros from leaking past end of file.
            file.read_at(window.data_mut(), off)?;
        }

        if let NodeKind::File { slices, .. } = &inner.kind {
            for s in slices {
                if s.overlaps(&window) {
                    window.write_onto(s);
                }
            }
        }

        let stop = inner.attr.size.min(off + want as u64);
        let clipped = window.truncated(stop);
        inner.attr.atime = std::time::SystemTime::now();
        Ok(clipped.into_data())
    }

    /// Buffer `data` at `off`. The incoming bytes are copied before storage
    /// because the transport reuses its buffers across requests.
    pub fn write(&self, data: &[u8], off: u64) -> OpResult<u32> {
        let mut inner = self.inner.lock();
        match &mut inner.kind {
            NodeKind::File { slices, .. } => {
                if data.is_empty() {
                    return Ok(0);
                }
                insert_slice(slices, FileSlice::new(off, data.to_vec()));
            }
            NodeKind::Dir { .. } => return Err(libc::EISDIR),
            NodeKind::Symlink { .. } => return Err(libc::EINVAL),
        }
        let end = off + data.len() as u64;
        if end > inner.attr.size {
            inner.attr.size = end;
        }
        let now = std::time::SystemTime::now();
        inner.attr.mtime = now;
        inner.attr.ctime = now;
        Ok(data.len() as u32)
    }

    /// Cut or extend the file to `new_size`.
    ///
    /// Slices past the cut are dropped, a straddling slice is clipped, and
    /// an extension appends a zero-filled slice so the new range reads back
    /// as zeros (`truncate(2)`).
    pub fn truncate(&self, new_size: u64) -> OpResult<()> {
        let mut inner = self.inner.lock();
        let old_size = inner.attr.size;
        match &mut inner.kind {
            NodeKind::File { slices, .. } => {
                let mut kept = Vec::with_capacity(slices.len());
                for s in slices.drain(..) {
                    if s.end() <= new_size {
                        kept.push(s);
                    } else if s.beg() < new_size {
                        kept.push(s.truncated(new_size));
                    }
                }
                *slices = kept;
                if new_size > old_size {
                    insert_slice(
                        slices,
                        FileSlice::zeroed(old_size, (new_size - old_size) as usize),
                    );
                }
            }
            NodeKind::Dir { .. } => return Err(libc::EISDIR),
            NodeKind::Symlink { .. } => return Err(libc::EINVAL),
        }
        inner.attr.size = new_size;
        let now = std::time::SystemTime::now();
        inner.attr.mtime = now;
        inner.attr.ctime = now;
        Ok(())
    }

    pub fn entries(&self) -> OpResult<Vec<DirEntry>> {
        match &self.inner.lock().kind {
            NodeKind::Dir { entries } => Ok(entries.clone()),
            _ => Err(libc::ENOTDIR),
        }
    }

    pub fn add_entry(&self, mode: u32, name: &str) -> OpResult<()> {
        match &mut self.inner.lock().kind {
            NodeKind::Dir { entries } => {
                if entries.iter().any(|e| e.name == name) {
                    return Err(libc::EEXIST);
                }
                entries.push(DirEntry::new(name, mode));
                Ok(())
            }
            _ => Err(libc::ENOTDIR),
        }
    }

    /// Drop any entry with the given name. Succeeds even when absent, which
    /// keeps unlink and rmdir idempotent.
    pub fn remove_entry(&self, name: &str) -> OpResult<()> {
        match &mut self.inner.lock().kind {
            NodeKind::Dir { entries } => {
                entries.retain(|e| e.name != name);
                Ok(())
            }
            _ => Err(libc::ENOTDIR),
        }
    }

    pub fn target(&self) -> OpResult<String> {
        match &self.inner.lock().kind {
            NodeKind::Symlink { target } => Ok(target.clone()),
            _ => Err(libc::ENOLINK),
        }
    }

    #[cfg(test)]
    pub(crate) fn slice_spans(&self) -> Vec<(u64, u64)> {
        match &self.inner.lock().kind {
            NodeKind::File { slices, .. } => slices.iter().map(|s| (s.beg(), s.end())).collect(),
            _ => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::overlay::types::CallCtx;
    use crate::wrapped::BindFs;

    fn fresh_file() -> OverlayNode {
        let ctx = CallCtx::new(1000, 1000);
        OverlayNode::file(
            NodeAttr::from_scratch(libc::S_IFREG as u32 | 0o644, &ctx),
            None,
        )
    }

    fn empty_wrapped() -> (tempfile::TempDir, BindFs) {
        let dir = tempfile::tempdir().unwrap();
        let bind = BindFs::new(dir.path()).unwrap();
        (dir, bind)
    }

    #[test]
    fn test_sparse_writes_read_back_with_zero_gap() {
        let (_dir, wrapped) = empty_wrapped();
        let node = fresh_file();
        node.write(b"ab", 0).unwrap();
        node.write(b"XY", 4).unwrap();

        assert_eq!(node.size(), 6);
        let data = node.read(&wrapped, 6, 0).unwrap();
        assert_eq!(data, b"ab\0\0XY");
    }

    #[test]
    fn test_truncate_discards_tail() {
        let (_dir, wrapped) = empty_wrapped();
        let node = fresh_file();
        node.write(b"0123456789", 0).unwrap();
        node.truncate(4).unwrap();

        assert_eq!(node.size(), 4);
        let data = node.read(&wrapped, 10, 0).unwrap();
        assert_eq!(data, b"0123");
    }

    #[test]
    fn test_truncate_extends_with_zeros() {
        let (_dir, wrapped) = empty_wrapped();
        let node = fresh_file();
        node.write(b"hi", 0).unwrap();
        node.truncate(5).unwrap();

        assert_eq!(node.size(), 5);
        let data = node.read(&wrapped, 5, 0).unwrap();
        assert_eq!(data, b"hi\0\0\0");
    }

    #[test]
    fn test_read_past_eof_is_empty() {
        let (_dir, wrapped) = empty_wrapped();
        let node = fresh_file();
        node.write(b"abc", 0).unwrap();
        assert!(node.read(&wrapped, 10, 3).unwrap().is_empty());
        assert!(node.read(&wrapped, 10, 100).unwrap().is_empty());
    }

    #[test]
    fn test_overlapping_writes_last_wins() {
        let (_dir, wrapped) = empty_wrapped();
        let node = fresh_file();
        node.write(b"aaaa", 0).unwrap();
        node.write(b"BB", 1).unwrap();
        let data = node.read(&wrapped, 4, 0).unwrap();
        assert_eq!(data, b"aBBa");
    }

    #[test]
    fn test_slice_list_stays_sorted_and_disjoint() {
        let node = fresh_file();
        for (off, data) in [(8u64, b"xx"), (0, b"yy"), (4, b"zz"), (3, b"ww")] {
            node.write(data.as_slice(), off).unwrap();
        }
        let spans = node.slice_spans();
        for pair in spans.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "slices out of order: {:?}", spans);
        }
    }

    #[test]
    fn test_dir_entry_conflict() {
        let ctx = CallCtx::new(0, 0);
        let node = OverlayNode::dir(
            NodeAttr::from_scratch(libc::S_IFDIR as u32 | 0o755, &ctx),
            Vec::new(),
        );
        node.add_entry(libc::S_IFREG as u32 | 0o644, "x").unwrap();
        assert_eq!(
            node.add_entry(libc::S_IFREG as u32 | 0o644, "x"),
            Err(libc::EEXIST)
        );
        node.remove_entry("x").unwrap();
        node.remove_entry("x").unwrap(); // absent removal still succeeds
        assert!(node.entries().unwrap().is_empty());
    }

    #[test]
    fn test_wrong_kind_errnos() {
        let ctx = CallCtx::new(0, 0);
        let dir = OverlayNode::dir(
            NodeAttr::from_scratch(libc::S_IFDIR as u32 | 0o755, &ctx),
            Vec::new(),
        );
        let link = OverlayNode::symlink(
            NodeAttr::from_scratch(libc::S_IFLNK as u32 | 0o777, &ctx),
            "target".into(),
        );
        let file = fresh_file();

        assert_eq!(dir.write(b"x", 0), Err(libc::EISDIR));
        assert_eq!(dir.target().unwrap_err(), libc::ENOLINK);
        assert_eq!(link.entries().unwrap_err(), libc::ENOTDIR);
        assert_eq!(file.entries().unwrap_err(), libc::ENOTDIR);
        assert_eq!(file.target().unwrap_err(), libc::ENOLINK);
    }

    #[test]
    fn test_symlink_target_round_trip() {
        let ctx = CallCtx::new(0, 0);
        let link = OverlayNode::symlink(
            NodeAttr::from_scratch(libc::S_IFLNK as u32 | 0o777, &ctx),
            "over/there".into(),
        );
        assert_eq!(link.target().unwrap(), "over/there");
    }
}
