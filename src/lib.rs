pub mod cli;
pub mod error;
pub mod fuse;
pub mod mount;
pub mod overlay;
pub mod wrapped;

pub use error::{DriftError, Result};

pub use overlay::{CallCtx, DirEntry, FileSlice, NodeAttr, OverlayFs, OverlayHandle};

pub use wrapped::{BindFs, WrappedFile, WrappedFs};

pub use mount::{mount, overlay_stack, MountConfig};

pub use fuse::DriftFs;
