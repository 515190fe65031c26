use clap::Parser;

use driftfs::cli::{self, Args};
use driftfs::mount::{self, MountConfig};

fn main() {
    match run() {
        Ok(()) => {}
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    }
}

fn run() -> driftfs::Result<()> {
    let default_filter = if std::env::var("DEBUG").map(|v| !v.is_empty()).unwrap_or(false) {
        "debug".to_string()
    } else {
        std::env::var("DRIFTFS_LOG").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(default_filter)
        .init();

    let args = Args::parse();
    cli::validate_args(&args)?;

    mount::mount(MountConfig::from_env(args.origin, args.mountpoint))
}
