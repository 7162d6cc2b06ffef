//! Replica Server - Main entry point

use anyhow::Context;
use clap::Parser;
use replica_persistence::FileLogStore;
use replica_raft::{KvStateMachine, Replica, RpcServer, TcpTransport};
use replica_server::{telemetry, JsonLineService, ServerConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Replicated key-value node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "replica.yaml")]
    config: PathBuf,

    /// Node id (overrides config)
    #[arg(long)]
    id: Option<String>,

    /// Raft RPC address, also advertised to peers (overrides config)
    #[arg(short, long)]
    listen: Option<String>,

    /// Client service address (overrides config)
    #[arg(long)]
    client_listen: Option<String>,

    /// Data directory (overrides config)
    #[arg(short, long)]
    data_dir: Option<PathBuf>,

    /// Log level (overrides config)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = if Path::new(&args.config).exists() {
        ServerConfig::from_file(&args.config)?
    } else {
        eprintln!(
            "Config file {} not found, using defaults and environment variables",
            args.config.display()
        );
        ServerConfig::from_env()?
    };

    if let Some(id) = args.id {
        config.node.id = id;
    }
    if let Some(listen) = args.listen {
        config.node.listen = listen;
    }
    if let Some(listen) = args.client_listen {
        config.service.listen = listen;
    }
    if let Some(data_dir) = args.data_dir {
        config.storage.data_dir = data_dir;
    }
    if let Some(level) = args.log_level {
        config.logging.level = level;
    }

    telemetry::init(&config.logging)?;

    let raft_config = config.raft_config()?;
    info!(
        node = %config.node.id,
        rpc = %config.node.listen,
        client = %config.service.listen,
        data_dir = %config.storage.data_dir.display(),
        members = raft_config.members.len(),
        "Starting replica"
    );

    let store = FileLogStore::open(&config.storage.data_dir).with_context(|| {
        format!(
            "Failed to open log store in {}",
            config.storage.data_dir.display()
        )
    })?;
    let transport = Arc::new(TcpTransport::new(raft_config.rpc_timeout));
    let service = JsonLineService::new(
        config.service.listen.clone(),
        config.service.max_line_length,
    );
    let mut replica = Replica::open(
        raft_config,
        store,
        KvStateMachine::new(),
        transport,
        service,
    )?;

    let shutdown = CancellationToken::new();

    let rpc = RpcServer::bind(&config.node.listen, Arc::new(replica.raft().clone()))
        .await
        .with_context(|| format!("Failed to bind RPC listener on {}", config.node.listen))?;
    let rpc_server = tokio::spawn(rpc.serve(shutdown.child_token()));

    let mut events = replica.events();
    let event_log = {
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    event = events.recv() => match event {
                        Ok(event) => info!(?event, "Replica event"),
                        Err(RecvError::Lagged(missed)) => warn!("Event log missed {} events", missed),
                        Err(RecvError::Closed) => return,
                    }
                }
            }
        })
    };

    replica.start().await?;
    info!("Replica started, press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    replica.stop().await?;
    shutdown.cancel();
    match rpc_server.await {
        Ok(Err(e)) => warn!("RPC server error: {}", e),
        Err(e) => warn!("RPC server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    let _ = event_log.await;

    info!("Shutdown complete");
    Ok(())
}
