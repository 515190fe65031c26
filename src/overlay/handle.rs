use std::sync::Arc;

use crate::overlay::node::OverlayNode;
use crate::overlay::types::{CallCtx, OpResult};
use crate::wrapped::WrappedFs;

/// An open-file handle: a shared reference to the overlay node plus the
/// opening caller's identity and the wrapped filesystem for fall-through
/// reads. Closing a handle frees no overlay state.
#[derive(Clone)]
pub struct OverlayHandle {
    node: Arc<OverlayNode>,
    wrapped: Arc<dyn WrappedFs>,
    ctx: CallCtx,
}

impl std::fmt::Debug for OverlayHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayHandle")
            .field("node", &self.node)
            .field("ctx", &self.ctx)
            .finish_non_exhaustive()
    }
}

impl OverlayHandle {
    pub(crate) fn new(node: Arc<OverlayNode>, wrapped: Arc<dyn WrappedFs>, ctx: CallCtx) -> Self {
        OverlayHandle { node, wrapped, ctx }
    }

    pub fn read(&self, size: u32, off: u64) -> OpResult<Vec<u8>> {
        self.node.read(&*self.wrapped, size, off)
    }

    pub fn write(&self, data: &[u8], off: u64) -> OpResult<u32> {
        self.node.write(data, off)
    }

    /// The overlay is volatile; there is nothing to push anywhere.
    pub fn flush(&self) -> OpResult<()> {
        Ok(())
    }

    pub fn fsync(&self) -> OpResult<()> {
        Ok(())
    }

    pub fn ctx(&self) -> CallCtx {
        self.ctx
    }

    pub fn node(&self) -> &Arc<OverlayNode> {
        &self.node
    }
}
