#![warn(missing_docs)]
//! ChunkFS DataNode daemon

use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use chunkfs_datanode::config::DataNodeConfig;
use chunkfs_datanode::health::disk_usage;
use chunkfs_datanode::register::{register_with_volmgr, NodeRegistration};
use chunkfs_datanode::{DataNodeServer, TcpConnector};

#[derive(Parser, Debug)]
#[command(name = "chunkfs-datanode", about = "ChunkFS DataNode")]
struct Args {
    /// Config file (.toml or .json).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address; overrides the config file.
    #[arg(long)]
    host: Option<String>,

    /// Data directory; overrides the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Storage tier announced to the volume manager.
    #[arg(long)]
    tier: Option<String>,

    /// Volume manager address; may be repeated.
    #[arg(long = "volmgr")]
    volmgr_hosts: Vec<String>,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "CHUNKFS_LOG")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => DataNodeConfig::from_file(path)?,
        None => DataNodeConfig::default(),
    };
    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(tier) = args.tier {
        config.tier = tier;
    }
    if !args.volmgr_hosts.is_empty() {
        config.volmgr_hosts = args.volmgr_hosts;
    }
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)))
        .init();

    tracing::info!("ChunkFS DataNode starting...");
    tracing::info!("Data directory: {}", config.data_dir.display());

    tokio::fs::create_dir_all(&config.data_dir).await?;

    if config.volmgr_hosts.is_empty() {
        tracing::warn!("no volmgr hosts configured, skipping registration");
    } else {
        let usage = disk_usage(&config.data_dir)?;
        let registration = NodeRegistration::new(&config.host, &config.data_dir, &config.tier, usage);
        let connector = TcpConnector::new(config.link_config());
        register_with_volmgr(&connector, &config.volmgr_hosts, &registration, config.io_timeout()).await?;
    }

    let listener = TcpListener::bind(&config.host).await?;
    let server = Arc::new(DataNodeServer::new(&config));

    tokio::select! {
        result = server.serve(listener) => result?,
        _ = shutdown_signal() => tracing::info!("shutdown requested"),
    }

    tracing::info!("ChunkFS DataNode stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("failed to listen for ctrl-c: {}", e);
        std::future::pending::<()>().await;
    }
}
