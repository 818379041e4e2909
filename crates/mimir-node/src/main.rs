mod config;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tokio::sync::watch;

use mimir_cache::ConfigCache;
use mimir_consensus::ConfigNode;
use mimir_server::{
    serve_client, serve_cluster, AdmissionControl, ConfigServiceImpl, GrpcNetwork,
};
use mimir_storage::fjall::{FjallLogStorage, FjallStateMachine, FjallStore};
use mimir_storage::{PinRegistry, RetentionTask};
use mimir_types::NodeId;

#[derive(clap::Parser, Debug)]
#[command(name = "mimir-node", about = "Mimir replicated config store node")]
struct Cli {
    #[arg(long)]
    node_id: NodeId,
    #[arg(long, default_value = "0.0.0.0:7000")]
    client_addr: String,
    #[arg(long, default_value = "0.0.0.0:7001")]
    cluster_addr: String,
    /// Other cluster members as "id=addr" of their cluster port, repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    /// Overrides storage.data_dir
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_tracing(observability: &config::ObservabilityConfig) {
    match observability.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .json()
                .with_env_filter(&observability.log_level)
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .pretty()
                .with_env_filter(&observability.log_level)
                .init();
        }
    }
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow_and_update() {
        if rx.changed().await.is_err() {
            return;
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    use clap::Parser;
    let cli = Cli::parse();

    let config = config::load(cli.config.as_deref())?;
    init_tracing(&config.observability);

    let mut peers = config::parse_peers(&cli.peers)?;
    peers.remove(&cli.node_id);
    let mut members: Vec<NodeId> = peers.keys().copied().collect();
    members.push(cli.node_id);
    members.sort_unstable();

    let data_dir = cli.data_dir.unwrap_or(config.storage.data_dir);
    tracing::info!(
        node_id = cli.node_id,
        client_addr = %cli.client_addr,
        cluster_addr = %cli.cluster_addr,
        data_dir = %data_dir.display(),
        ?members,
        "node starting"
    );

    std::fs::create_dir_all(&data_dir)
        .with_context(|| format!("cannot create data dir {}", data_dir.display()))?;
    let db = FjallStore::open(&data_dir)
        .with_context(|| format!("cannot open store at {}", data_dir.display()))?;
    let log = Arc::new(FjallLogStorage(db.clone()));
    let store = Arc::new(FjallStateMachine::new(db));

    let network = GrpcNetwork::new(
        &peers,
        config.server.peer_connect_timeout(),
        config.server.max_message_bytes,
    )?;
    let node = ConfigNode::start(
        cli.node_id,
        members,
        config.raft.clone(),
        log,
        store.clone(),
        Arc::new(network),
    )
    .await
    .context("failed to start raft node")?;

    let pins = PinRegistry::new();
    let retention = RetentionTask::new(
        store,
        config.retention.policy(),
        pins.clone(),
        config.retention.interval(),
    );
    let retention = tokio::spawn(retention.run());

    let cache = Arc::new(ConfigCache::new(Arc::new(node.clone()), config.cache.clone()));
    let invalidation = cache.spawn_invalidation();
    let service = ConfigServiceImpl::new(
        cache,
        pins,
        Arc::new(AdmissionControl::new(config.admission.clone())),
        config.server.max_batch_keys,
    );

    let client_listener = TcpListener::bind(&cli.client_addr)
        .await
        .with_context(|| format!("cannot bind client_addr {}", cli.client_addr))?;
    let cluster_listener = TcpListener::bind(&cli.cluster_addr)
        .await
        .with_context(|| format!("cannot bind cluster_addr {}", cli.cluster_addr))?;

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("shutdown requested");
                let _ = stop_tx.send(true);
            }
            Err(e) => {
                tracing::warn!(error = %e, "cannot listen for ctrl-c; running until killed");
                std::future::pending::<()>().await;
            }
        }
    });

    let served = tokio::try_join!(
        serve_client(client_listener, service, &config.server, stopped(stop_rx.clone())),
        serve_cluster(cluster_listener, node.clone(), &config.server, stopped(stop_rx)),
    );

    invalidation.abort();
    retention.abort();
    node.shutdown();
    served?;
    tracing::info!(node_id = cli.node_id, "node stopped");
    Ok(())
}
