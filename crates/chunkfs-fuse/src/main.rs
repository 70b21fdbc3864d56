#![warn(missing_docs)]
//! ChunkFS FUSE mount daemon

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chunkfs_fuse::config::ClientConfig;
use chunkfs_fuse::filesystem::ChunkFs;
use chunkfs_fuse::memory::MemoryMeta;
use chunkfs_fuse::mount::{mount, parse_mount_options};

#[derive(Parser, Debug)]
#[command(name = "chunkfs-fuse", about = "ChunkFS FUSE client")]
struct Args {
    /// Mount point; overrides the config file.
    mountpoint: Option<PathBuf>,

    /// Config file (.toml or .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Comma-separated mount options; overrides the config file.
    #[arg(short = 'o', long)]
    options: Option<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "CHUNKFS_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ClientConfig::from_file(path)?,
        None => ClientConfig::default(),
    };
    if let Some(mountpoint) = args.mountpoint {
        config.mountpoint = mountpoint;
    }
    if let Some(options) = args.options {
        config.mount_options = options;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    tracing::info!("ChunkFS FUSE daemon starting...");
    tracing::info!("Mount point: {}", config.mountpoint.display());

    let mount_opts = parse_mount_options(&config.mount_options)?;
    // SAFETY: getuid/getgid have no preconditions and cannot fail.
    let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

    tracing::info!("serving the in-memory metadata backend");
    let fs = ChunkFs::new(config.fs_config(uid, gid), Arc::new(MemoryMeta::new()));

    let mountpoint = config.mountpoint.clone();
    tokio::task::spawn_blocking(move || mount(fs, &mountpoint, &mount_opts)).await??;

    tracing::info!("ChunkFS FUSE daemon stopped");
    Ok(())
}
