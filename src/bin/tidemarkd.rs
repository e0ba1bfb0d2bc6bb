//! Tidemark node daemon
//!
//! Runs a meta node and a data node in one process: consensus and cluster
//! RPC share the cluster TCP port, the meta API listens on HTTP.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tidemark::config::{parse_peers, Config};
use tidemark::coordinator::{ClusterService, ShardStore};
use tidemark::meta::{Command, MetaClient, MetaStore, NodeInfo, TopologyReader};
use tidemark::net::{Mux, MUX_HEADER_CLUSTER, MUX_HEADER_RAFT};
use tidemark::storage::MemoryStore;
use tidemark::telemetry::{init_logging, LogFormat};
use tidemark::Error;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const REGISTER_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Tidemark node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Cluster TCP address (consensus and cluster RPC)
    #[arg(long, env = "TIDEMARK_BIND_ADDRESS")]
    bind_address: Option<String>,

    /// Meta HTTP API address
    #[arg(long, env = "TIDEMARK_HTTP_BIND_ADDRESS")]
    http_bind_address: Option<String>,

    /// Data directory; omit to keep state in memory
    #[arg(long, env = "TIDEMARK_META_DIR")]
    dir: Option<String>,

    /// Comma separated HTTP addresses of meta nodes to join
    #[arg(long, env = "TIDEMARK_JOIN")]
    join: Option<String>,

    /// Forwarded shard write timeout (e.g., "500ms", "5s")
    #[arg(long)]
    shard_writer_timeout: Option<humantime::Duration>,

    /// Shard reconciliation policy: ignore, warn or fail
    #[arg(long)]
    reconcile_policy: Option<String>,

    /// Log level
    #[arg(long, env = "TIDEMARK_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Log format: json or text
    #[arg(long, env = "TIDEMARK_LOG_FORMAT", default_value = "json")]
    log_format: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let format: LogFormat = args.log_format.parse()?;
    init_logging("tidemarkd", &args.log_level, format)?;

    let config = load_config(&args)?;
    info!("Starting Tidemark node");

    let cancel = CancellationToken::new();

    // Cluster port, split by header byte.
    let cluster_listener = TcpListener::bind(&config.meta.bind_address).await?;
    let mut mux = Mux::new(cluster_listener)?;
    let raft_listener = mux.listen(MUX_HEADER_RAFT)?;
    let rpc_listener = mux.listen(MUX_HEADER_CLUSTER)?;
    let tcp_addr = mux.local_addr().to_string();
    tokio::spawn(mux.serve(cancel.child_token()));

    let http_listener = TcpListener::bind(&config.meta.http_bind_address).await?;
    let http_addr = http_listener.local_addr()?.to_string();

    let meta = Arc::new(MetaStore::new(config.meta.clone(), http_addr.clone(), tcp_addr.clone())?);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        let _ = shutdown_tx.send(true);
    });

    let router = tidemark::meta::router(meta.clone());
    let http_shutdown = shutdown_rx.clone();
    let http_server = tokio::spawn(async move {
        axum::serve(http_listener, router)
            .with_graceful_shutdown(wait_for_shutdown(http_shutdown))
            .await
            .map_err(|e| Error::Internal(format!("HTTP server error: {e}")))
    });

    meta.open(raft_listener).await?;

    let node = register_data_node(&meta, &http_addr, &tcp_addr, &cancel).await?;
    info!(node_id = node.id, tcp = %tcp_addr, "Registered data node");

    let store: Arc<dyn ShardStore> = Arc::new(MemoryStore::new());
    let topology: Arc<dyn TopologyReader> = meta.clone();
    let service = Arc::new(ClusterService::new(store, topology));
    tokio::spawn(service.serve(rpc_listener, cancel.child_token()));

    info!(
        http = %http_addr,
        tcp = %tcp_addr,
        leader = %meta.leader_http(),
        "Tidemark node ready"
    );

    wait_for_shutdown(shutdown_rx).await;
    info!("Tidemark node shutting down");

    cancel.cancel();
    meta.close().await?;
    http_server.await??;
    Ok(())
}

fn load_config(args: &Args) -> tidemark::Result<Config> {
    let mut config = Config::from_env()?;
    if let Some(addr) = &args.bind_address {
        config.meta.bind_address = addr.clone();
    }
    if let Some(addr) = &args.http_bind_address {
        config.meta.http_bind_address = addr.clone();
    }
    if let Some(dir) = &args.dir {
        config.meta.dir = Some(dir.into());
    }
    if let Some(join) = &args.join {
        config.meta.join_peers = parse_peers(join);
    }
    if let Some(timeout) = args.shard_writer_timeout {
        config.coordinator.shard_writer_timeout = timeout.into();
    }
    if let Some(policy) = &args.reconcile_policy {
        config.coordinator.reconcile_policy = policy.parse().map_err(Error::Config)?;
    }
    config.validate()?;
    Ok(config)
}

/// Register this process as a data node, through the leader if this meta
/// node is a follower.
async fn register_data_node(
    meta: &MetaStore,
    http_addr: &str,
    tcp_addr: &str,
    cancel: &CancellationToken,
) -> tidemark::Result<NodeInfo> {
    loop {
        let result = match meta.create_data_node(http_addr, tcp_addr).await {
            Err(Error::NotLeader { leader: Some(leader) }) => {
                forward_create_data_node(meta, &leader, http_addr, tcp_addr).await
            }
            other => other,
        };
        match result {
            Ok(node) => return Ok(node),
            Err(e) => warn!(error = %e, "Data node registration failed, retrying"),
        }
        tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Closing),
            _ = tokio::time::sleep(REGISTER_RETRY_INTERVAL) => {}
        }
    }
}

async fn forward_create_data_node(
    meta: &MetaStore,
    leader: &str,
    http_addr: &str,
    tcp_addr: &str,
) -> tidemark::Result<NodeInfo> {
    let client = MetaClient::new(vec![leader.to_string()], Duration::from_secs(10))?;
    let index = client
        .execute(&Command::CreateDataNode {
            host: http_addr.to_string(),
            tcp_host: tcp_addr.to_string(),
        })
        .await?;
    // Wait until the local replica has applied the registration.
    if index > 0 {
        meta.after_index(index - 1).wait().await?;
    }
    meta.snapshot()
        .data_node_by_tcp_host(tcp_addr)
        .cloned()
        .ok_or(Error::NodeNotFound)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    if *shutdown.borrow() {
        return;
    }
    let _ = shutdown.changed().await;
}
