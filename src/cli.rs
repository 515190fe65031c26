use clap::Parser;
use std::path::PathBuf;

use crate::error::{DriftError, Result};

#[derive(Parser, Debug)]
#[command(name = "driftfs")]
#[command(
    about = "Mount a writable in-memory view of a directory; every change is discarded at unmount"
)]
pub struct Args {
    #[arg(help = "Directory to present through the mount")]
    pub origin: PathBuf,

    #[arg(help = "Where to mount the writable view")]
    pub mountpoint: PathBuf,
}

pub fn validate_args(args: &Args) -> Result<()> {
    if !args.origin.is_dir() {
        return Err(DriftError::Origin(format!(
            "{}: not a directory",
            args.origin.display()
        )));
    }
    if !args.mountpoint.is_dir() {
        return Err(DriftError::Mount(format!(
            "{}: mount point is not a directory",
            args.mountpoint.display()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_missing_origin() {
        let dir = tempfile::tempdir().unwrap();
        let args = Args {
            origin: dir.path().join("nope"),
            mountpoint: dir.path().to_path_buf(),
        };
        assert!(validate_args(&args).is_err());
    }

    #[test]
    fn test_rejects_file_origin() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        std::fs::write(&file, b"x").unwrap();
        let args = Args {
            origin: file,
            mountpoint: dir.path().to_path_buf(),
        };
        assert!(validate_args(&args).is_err());
    }

    #[test]
    fn test_accepts_two_directories() {
        let origin = tempfile::tempdir().unwrap();
        let mnt = tempfile::tempdir().unwrap();
        let args = Args {
            origin: origin.path().to_path_buf(),
            mountpoint: mnt.path().to_path_buf(),
        };
        assert!(validate_args(&args).is_ok());
    }
}
