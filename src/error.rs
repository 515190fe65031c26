use thiserror::Error;

pub type Result<T> = std::result::Result<T, DriftError>;

/// Setup-level failures surfaced at the CLI boundary. Filesystem
/// operations themselves speak raw errnos, not this type.
#[derive(Error, Debug)]
pub enum DriftError {
    #[error("Origin error: {0}")]
    Origin(String),

    #[error("Mount error: {0}")]
    Mount(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
