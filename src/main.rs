//! Compute node daemon - main entry point.
//!
//! Loads configuration, binds the listening socket and serves clients until
//! interrupted. Exits with 1 on configuration or startup failure and 2 when
//! serving fails.

use clap::Parser;
use dcl_core::{ComputeNode, Config};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Debug, Parser)]
#[command(name = "dcl-daemon", version, about = "Distributed compute node daemon")]
struct Args {
    /// JSON configuration file.
    #[arg(short, long, env = "DCL_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on (overrides the configuration).
    #[arg(short, long)]
    listen: Option<String>,

    /// 16-bit node identifier (overrides the configuration).
    #[arg(short, long)]
    node_id: Option<u16>,

    /// Device name to expose; repeat for several devices.
    #[arg(short, long = "device")]
    devices: Vec<String>,
}

fn load(args: &Args) -> dcl_core::Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    if let Some(listen) = &args.listen {
        config.node.listen_addr = listen.clone();
    }
    if let Some(node_id) = args.node_id {
        config.node.node_id = node_id;
    }
    if !args.devices.is_empty() {
        config.node.devices = args.devices.clone();
    }
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load(&args) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("dcl-daemon: {}", e);
            return ExitCode::from(1);
        }
    };

    dcl_core::observability::init_tracing(&config.observability);

    let node = match ComputeNode::bind(&config).await {
        Ok(node) => node,
        Err(e) => {
            tracing::error!("startup failed: {}", e);
            return ExitCode::from(1);
        }
    };
    match node.local_addr() {
        Ok(addr) => tracing::info!(node_id = config.node.node_id, %addr, "compute node listening"),
        Err(e) => tracing::warn!("local address unavailable: {}", e),
    }

    let node = Arc::new(node);
    let signal_node = node.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, shutting down");
            signal_node.shutdown();
        }
    });

    let result = node.serve().await;
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("serve failed: {}", e);
            ExitCode::from(2)
        }
    }
}
