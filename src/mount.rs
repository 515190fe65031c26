//! Mount wiring: builds the bind layer, the overlay and the FUSE adapter,
//! then hands the stack to the kernel session.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use fuser::MountOption;

use crate::error::{DriftError, Result};
use crate::fuse::DriftFs;
use crate::overlay::OverlayFs;
use crate::wrapped::BindFs;

const ATTR_TTL: Duration = Duration::from_secs(1);

/// Mount-time knobs, mostly sourced from the environment.
#[derive(Debug, Clone)]
pub struct MountConfig {
    pub origin: PathBuf,
    pub mountpoint: PathBuf,
    /// Extra options forwarded verbatim to the FUSE runtime.
    pub options: Vec<String>,
    pub enable_links: bool,
    pub single_threaded: bool,
}

impl MountConfig {
    pub fn from_env(origin: PathBuf, mountpoint: PathBuf) -> Self {
        let env_set = |key: &str| std::env::var(key).map(|v| !v.is_empty()).unwrap_or(false);
        let options = std::env::var("MOUNT_OPTIONS")
            .ok()
            .filter(|s| !s.is_empty())
            .map(|s| s.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        MountConfig {
            origin,
            mountpoint,
            options,
            enable_links: env_set("ENABLE_LINKS"),
            single_threaded: env_set("SINGLE_THREADED"),
        }
    }
}

/// Mount and serve until the filesystem is unmounted. Every buffered change
/// dies with this call's return.
pub fn mount(config: MountConfig) -> Result<()> {
    let bind = BindFs::new(&config.origin)?;
    let overlay = Arc::new(OverlayFs::new(Arc::new(bind)));
    let fs = DriftFs::new(overlay, ATTR_TTL);

    let options = mount_options(&config);

    if config.enable_links {
        // The kernel session dispatches by its own inode numbers already;
        // nothing extra to request from fuser. The overlay still answers
        // ENOSYS to link().
        tracing::info!("ENABLE_LINKS set: transport-level inode tracking requested");
    }
    if config.single_threaded {
        tracing::info!("SINGLE_THREADED set: serving requests on a single thread");
    }

    tracing::info!(
        "mounting {} at {}",
        config.origin.display(),
        config.mountpoint.display()
    );
    fuser::mount2(fs, &config.mountpoint, &options)
        .map_err(|e| DriftError::Mount(format!("{}: {}", config.mountpoint.display(), e)))?;

    tracing::info!("unmounted, all buffered changes discarded");
    Ok(())
}

fn mount_options(config: &MountConfig) -> Vec<MountOption> {
    let fsname = config
        .origin
        .canonicalize()
        .unwrap_or_else(|_| config.origin.clone());
    let mut options = vec![
        MountOption::FSName(fsname.display().to_string()),
        MountOption::Subtype("driftfs".to_string()),
        MountOption::AutoUnmount,
        MountOption::DefaultPermissions,
    ];
    for token in &config.options {
        options.push(parse_option(token));
    }
    options
}

fn parse_option(token: &str) -> MountOption {
    match token {
        "allow_other" => MountOption::AllowOther,
        "allow_root" => MountOption::AllowRoot,
        "auto_unmount" => MountOption::AutoUnmount,
        "default_permissions" => MountOption::DefaultPermissions,
        "dev" => MountOption::Dev,
        "nodev" => MountOption::NoDev,
        "suid" => MountOption::Suid,
        "nosuid" => MountOption::NoSuid,
        "ro" => MountOption::RO,
        "rw" => MountOption::RW,
        "exec" => MountOption::Exec,
        "noexec" => MountOption::NoExec,
        "atime" => MountOption::Atime,
        "noatime" => MountOption::NoAtime,
        "dirsync" => MountOption::DirSync,
        "sync" => MountOption::Sync,
        "async" => MountOption::Async,
        other => MountOption::CUSTOM(other.to_string()),
    }
}

/// Build the full stack over `origin` without a kernel mount. Used by the
/// integration tests to drive the overlay directly.
pub fn overlay_stack(origin: &Path) -> Result<Arc<OverlayFs>> {
    let bind = BindFs::new(origin)?;
    Ok(Arc::new(OverlayFs::new(Arc::new(bind))))
}
