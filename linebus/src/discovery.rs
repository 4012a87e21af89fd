//! Cluster membership without static configuration.
//!
//! Nodes find each other by probing a port range on the configured hosts
//! with a lightweight identity RPC. The scanner task rescans
//! periodically, keeps a grace window for peers that stop answering, and
//! feeds the resulting peer set to the consensus core, which derives its
//! quorum arithmetic from it.

use std::collections::HashMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::timeout;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::config::PEER_RPC_PORT_OFFSET;
use crate::network::probe_addr;
use crate::network::Peer;
use crate::network::PeerTable;
use crate::raft::Raft;
use crate::storage::LogStore;
use crate::unix_ms;
use crate::NodeId;
use crate::RaftNetwork;

/// A source of peer candidates.
///
/// The default implementation scans ports; tests inject a static set.
#[async_trait]
pub trait PeerDiscovery: Send + Sync + 'static {
    /// Enumerate the peers currently reachable, this node excluded.
    async fn list_peers(&self) -> Vec<Peer>;
}

/// Discovery by probing a contiguous port range on a set of hosts.
pub struct PortScanDiscovery {
    /// This node's ID, so its own listener is not reported as a peer.
    self_id: NodeId,
    /// Only nodes of the same cluster are peers.
    cluster_name: String,
    hosts: Vec<IpAddr>,
    /// First client port of the scanned range; node `i` conventionally
    /// listens on `base_client_port + i`.
    base_client_port: u16,
    /// Number of ports probed per host.
    span: u16,
    probe_timeout: Duration,
}

impl PortScanDiscovery {
    pub fn from_config(config: &Config) -> Self {
        // Node i listens on base + i, so the base of the range is this
        // node's own client port minus its ID.
        let base_client_port = config.client_port.saturating_sub(config.node_id as u16);
        Self {
            self_id: config.node_id,
            cluster_name: config.cluster_name.clone(),
            hosts: vec![config.host],
            base_client_port,
            span: config.max_cluster_size,
            probe_timeout: Duration::from_millis(500),
        }
    }
}

#[async_trait]
impl PeerDiscovery for PortScanDiscovery {
    #[tracing::instrument(level = "debug", skip(self))]
    async fn list_peers(&self) -> Vec<Peer> {
        let mut probes = Vec::new();
        for host in &self.hosts {
            for offset in 0..self.span {
                let client_port = match self.base_client_port.checked_add(offset) {
                    Some(p) => p,
                    None => break,
                };
                let rpc_port = match client_port.checked_add(PEER_RPC_PORT_OFFSET) {
                    Some(p) => p,
                    None => break,
                };
                let addr = SocketAddr::new(*host, rpc_port);
                let deadline = self.probe_timeout;
                probes.push(async move { (addr, probe_addr(addr, deadline).await) });
            }
        }

        let results = futures::future::join_all(probes).await;
        let mut peers = Vec::new();
        for (addr, res) in results {
            match res {
                Ok(identity) => {
                    if identity.node_id == self.self_id || identity.cluster_name != self.cluster_name {
                        continue;
                    }
                    peers.push(Peer {
                        node_id: identity.node_id,
                        host: addr.ip(),
                        client_port: identity.client_port,
                        peer_rpc_port: identity.peer_rpc_port,
                        admin_http_port: identity.admin_http_port,
                        last_seen_ms: unix_ms(),
                    });
                }
                Err(err) => {
                    tracing::trace!(%addr, error=%err, "probe found no broker");
                }
            }
        }
        peers
    }
}

/// A fixed peer set, for tests and manually wired deployments.
pub struct StaticDiscovery {
    peers: RwLock<Vec<Peer>>,
}

impl StaticDiscovery {
    pub fn new(peers: Vec<Peer>) -> Self {
        Self {
            peers: RwLock::new(peers),
        }
    }

    /// Replace the advertised peer set; picked up on the next scan.
    pub fn set_peers(&self, peers: Vec<Peer>) {
        *self.peers.write().expect("static discovery lock poisoned") = peers;
    }
}

#[async_trait]
impl PeerDiscovery for StaticDiscovery {
    async fn list_peers(&self) -> Vec<Peer> {
        self.peers.read().expect("static discovery lock poisoned").clone()
    }
}

/// Probe a peer's admin HTTP endpoint.
///
/// A peer is only declared lost once both its RPC port and its admin
/// endpoint have stopped answering for the grace window.
async fn admin_probe(peer: &Peer, deadline: Duration) -> bool {
    let url = match format!("{}/status", peer.admin_url()).parse::<hyper::Uri>() {
        Ok(url) => url,
        Err(_) => return false,
    };
    let client = hyper::Client::new();
    matches!(timeout(deadline, client.get(url)).await, Ok(Ok(resp)) if resp.status().is_success())
}

/// Spawn the periodic membership scan task.
///
/// Every cycle the scanner enumerates reachable peers, refreshes the
/// shared address book, drops peers that have failed both probes for
/// longer than the grace window, and posts the resulting ID set to the
/// consensus core. The first cycle runs immediately so a booting node
/// learns about an existing cluster before its election timer arms.
pub fn spawn_membership_scanner<D, N, S>(
    discovery: Arc<D>,
    table: Arc<PeerTable>,
    raft: Raft<N, S>,
    config: Arc<Config>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()>
where
    D: PeerDiscovery,
    N: RaftNetwork,
    S: LogStore,
{
    tokio::spawn(
        async move {
            let grace = Duration::from_millis(config.peer_lost_grace());
            let mut scan_tick = interval(Duration::from_millis(config.discovery_interval));
            // Peers currently counted, with the instant they last answered
            // a probe.
            let mut known: HashMap<NodeId, (Peer, Instant)> = HashMap::new();

            loop {
                tokio::select! {
                    _ = scan_tick.tick() => {}
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("membership scanner shutting down");
                        return;
                    }
                }

                let now = Instant::now();
                let found = discovery.list_peers().await;
                for peer in found {
                    known.insert(peer.node_id, (peer, now));
                }

                // Peers that missed the RPC probe get a second chance over
                // their admin endpoint, then a grace window before they
                // are dropped from quorum arithmetic.
                let mut lost = Vec::new();
                for (id, (peer, last_ok)) in known.iter_mut() {
                    if *last_ok == now {
                        continue;
                    }
                    if admin_probe(peer, Duration::from_millis(500)).await {
                        *last_ok = now;
                        continue;
                    }
                    if now.duration_since(*last_ok) > grace {
                        tracing::warn!(peer = *id, "peer lost, removing from membership");
                        lost.push(*id);
                    }
                }
                for id in &lost {
                    known.remove(id);
                }

                table.replace(known.values().map(|(peer, _)| peer.clone()).collect());
                let ids = known.keys().copied().collect();
                if raft.update_peers(ids).is_err() {
                    // The core is gone; nothing left to feed.
                    return;
                }
            }
        }
        .instrument(tracing::debug_span!("membership")),
    )
}
