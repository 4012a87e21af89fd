//! The linebus broker daemon.
//!
//! Reads its configuration from the environment (`BROKER_NODE_ID`,
//! `BROKER_PORT`, `HTTP_PORT`, `MAX_CLUSTER_SIZE`), opens the node's
//! database, starts the broker, and runs until SIGINT/SIGTERM. Exit
//! codes: 0 on a clean shutdown, 1 on an unrecoverable storage failure,
//! 2 when a port cannot be bound.

use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use linebus::config::Config;
use linebus::discovery::PortScanDiscovery;
use linebus::error::BrokerError;
use linebus::server::BrokerNode;
use linestore::DiskStore;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("linebus=info".parse().expect("valid directive")))
        .with_target(true)
        .init();
}

/// Directory holding the node's database, PID file and friends.
fn data_dir() -> PathBuf {
    std::env::var("BROKER_DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

fn write_pid_file(dir: &std::path::Path, node_id: u64) -> std::io::Result<PathBuf> {
    let path = dir.join(format!("linebusd_{}.pid", node_id));
    std::fs::write(&path, format!("{}\n", std::process::id()))?;
    Ok(path)
}

async fn run() -> Result<(), BrokerError> {
    let config = Config::from_env()?;
    let dir = data_dir();
    std::fs::create_dir_all(&dir).map_err(|err| BrokerError::Config(format!("cannot create data dir: {}", err)))?;

    let db_path = dir.join(format!("messages_node_{}.db", config.node_id));
    let store = DiskStore::open(&db_path).map_err(|err| BrokerError::Storage(err.into_storage_error()))?;
    tracing::info!(node_id = config.node_id, db = %db_path.display(), "store opened");

    let pid_path = write_pid_file(&dir, config.node_id)
        .map_err(|err| BrokerError::Config(format!("cannot write pid file: {}", err)))?;

    let discovery = Arc::new(PortScanDiscovery::from_config(&config));
    let node = BrokerNode::start(config, Arc::new(store), discovery).await?;

    wait_for_signal().await;

    let res = node.shutdown().await.map_err(BrokerError::Other);
    let _ = std::fs::remove_file(pid_path);
    res
}

async fn wait_for_signal() {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(err) => {
            tracing::error!(error = %err, "cannot install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => tracing::info!("SIGINT received"),
        _ = term.recv() => tracing::info!("SIGTERM received"),
    }
}

#[tokio::main]
async fn main() {
    init_tracing();
    if let Err(err) = run().await {
        tracing::error!(error = %err, "broker failed");
        exit(err.exit_code());
    }
}
