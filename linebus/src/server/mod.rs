//! Broker node assembly and lifecycle.
//!
//! [`BrokerNode::start`] binds the three listeners (client TCP, peer RPC,
//! admin HTTP), wires the write serializer, consensus core, fan-out
//! engine and membership scanner together, and returns a handle whose
//! [`BrokerNode::shutdown`] drains client connections within a bounded
//! deadline before stopping consensus and flushing the write queue.

mod admin_http;
mod client_tcp;
mod peer_rpc;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::discovery::spawn_membership_scanner;
use crate::discovery::PeerDiscovery;
use crate::error::BrokerError;
use crate::network::ForwardOutcome;
use crate::network::Peer;
use crate::network::PeerIdentity;
use crate::network::PeerTable;
use crate::network::TcpRaftNetwork;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::Raft;
use crate::raft::Unsubscription;
use crate::storage::LogStore;
use crate::subscribers::spawn_fanout;
use crate::subscribers::BrokerStats;
use crate::subscribers::SubscriberRegistry;
use crate::writer;
use crate::ClientWriteError;
use crate::NodeId;
use crate::RaftNetwork;

/// Shared state handed to every endpoint handler.
pub struct ServerContext<S: LogStore> {
    pub config: Arc<Config>,
    pub raft: Raft<TcpRaftNetwork, S>,
    pub network: Arc<TcpRaftNetwork>,
    pub storage: Arc<S>,
    pub registry: Arc<SubscriberRegistry>,
    pub stats: Arc<BrokerStats>,
    pub peer_table: Arc<PeerTable>,
    pub started_at: Instant,
}

/// Why a locally received write was not committed here.
#[derive(Debug)]
pub enum ProposeError {
    /// This node is not the leader; the hint carries the leader's
    /// endpoints when known.
    NotLeader(Option<Peer>),
    /// Consensus is unavailable (no leader, shutting down, storage
    /// fault).
    Unavailable(String),
}

impl<S: LogStore> ServerContext<S> {
    /// The identity this node reports to discovery probes.
    pub fn identity(&self) -> PeerIdentity {
        PeerIdentity {
            node_id: self.config.node_id,
            cluster_name: self.config.cluster_name.clone(),
            client_port: self.config.client_port,
            peer_rpc_port: self.config.peer_rpc_port(),
            admin_http_port: self.config.admin_http_port,
        }
    }

    fn leader_hint(&self, leader: Option<NodeId>) -> Option<Peer> {
        leader.and_then(|id| self.peer_table.get(id))
    }

    /// Propose a write on this node only. Non-leaders answer with the
    /// leader hint so the caller can redirect its client.
    pub async fn propose_local(&self, rpc: ClientWriteRequest) -> Result<ClientWriteResponse, ProposeError> {
        match self.raft.client_write(rpc).await {
            Ok(resp) => Ok(resp),
            Err(ClientWriteError::ForwardToLeader(leader)) => Err(ProposeError::NotLeader(self.leader_hint(leader))),
            Err(ClientWriteError::RaftError(err)) => Err(ProposeError::Unavailable(err.to_string())),
        }
    }

    /// Propose a write, relaying it to the leader over peer RPC when this
    /// node is a follower.
    ///
    /// Used for subscription changes: the registration names this node as
    /// the delivery point, so the connection stays here while the entry
    /// is committed wherever the leader is.
    pub async fn propose_forwarded(&self, rpc: ClientWriteRequest) -> Result<ClientWriteResponse, ProposeError> {
        let mut hint: Option<NodeId> = None;
        for _hop in 0..3 {
            match hint.take() {
                None => match self.raft.client_write(rpc.clone()).await {
                    Ok(resp) => return Ok(resp),
                    Err(ClientWriteError::ForwardToLeader(Some(leader))) => hint = Some(leader),
                    Err(ClientWriteError::ForwardToLeader(None)) => {
                        return Err(ProposeError::Unavailable("no leader elected".into()))
                    }
                    Err(ClientWriteError::RaftError(err)) => return Err(ProposeError::Unavailable(err.to_string())),
                },
                Some(leader) => match self.network.send_forward(leader, rpc.clone()).await {
                    Ok(ForwardOutcome::Committed(resp)) => return Ok(resp),
                    Ok(ForwardOutcome::NotLeader { leader: next }) => match next {
                        Some(next) if next != leader => hint = Some(next),
                        _ => return Err(ProposeError::NotLeader(self.leader_hint(next))),
                    },
                    Err(err) => return Err(ProposeError::Unavailable(err.to_string())),
                },
            }
        }
        Err(ProposeError::Unavailable("leadership did not settle while forwarding".into()))
    }

    /// Propose removal of every registration of a departed subscriber.
    pub async fn propose_unsubscribe_all(&self, subscriber_id: &str, topics: Vec<String>) {
        for topic in topics {
            let rpc = ClientWriteRequest::unsubscribe(Unsubscription {
                subscriber_id: subscriber_id.to_string(),
                topic,
            });
            if let Err(err) = self.propose_forwarded(rpc).await {
                tracing::warn!(subscriber = subscriber_id, ?err, "could not propagate unsubscribe");
            }
        }
    }
}

/// A running broker node.
pub struct BrokerNode<S: LogStore> {
    ctx: Arc<ServerContext<S>>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
    writer_handle: JoinHandle<()>,
}

impl<S: LogStore> BrokerNode<S> {
    /// Bind all endpoints and spawn the node's tasks.
    ///
    /// Fails fast on bind errors so the supervisor can exit with the
    /// mandated code before any state is touched.
    pub async fn start<D: PeerDiscovery>(
        config: Config,
        storage: Arc<S>,
        discovery: Arc<D>,
    ) -> Result<BrokerNode<S>, BrokerError> {
        let config = Arc::new(config);

        let client_addr = (config.host, config.client_port);
        let client_listener = TcpListener::bind(client_addr).await.map_err(|source| BrokerError::Bind {
            endpoint: "client",
            addr: format!("{}:{}", config.host, config.client_port),
            source,
        })?;
        let rpc_addr = (config.host, config.peer_rpc_port());
        let rpc_listener = TcpListener::bind(rpc_addr).await.map_err(|source| BrokerError::Bind {
            endpoint: "peer-rpc",
            addr: format!("{}:{}", config.host, config.peer_rpc_port()),
            source,
        })?;
        let admin_listener = std::net::TcpListener::bind((config.host, config.admin_http_port)).map_err(|source| {
            BrokerError::Bind {
                endpoint: "admin-http",
                addr: format!("{}:{}", config.host, config.admin_http_port),
                source,
            }
        })?;
        admin_listener.set_nonblocking(true).map_err(|source| BrokerError::Bind {
            endpoint: "admin-http",
            addr: format!("{}:{}", config.host, config.admin_http_port),
            source,
        })?;
        tracing::info!(
            id = config.node_id,
            client = %format!("{}:{}", config.host, config.client_port),
            peer_rpc = %format!("{}:{}", config.host, config.peer_rpc_port()),
            admin = %format!("{}:{}", config.host, config.admin_http_port),
            "broker endpoints bound"
        );

        let stats = Arc::new(BrokerStats::default());
        let peer_table = Arc::new(PeerTable::new());
        let network = Arc::new(TcpRaftNetwork::new(peer_table.clone()));

        let (write_handle, writer_handle) =
            writer::spawn(storage.clone(), config.write_queue_depth, config.write_batch_max);
        let (applied_tx, applied_rx) = mpsc::unbounded_channel();
        let (registry, detached_rx) = SubscriberRegistry::new(
            config.node_id,
            config.subscriber_queue_depth,
            config.subscriber_overflow_limit,
            stats.clone(),
        );

        let raft = Raft::new(
            config.node_id,
            config.clone(),
            network.clone(),
            storage.clone(),
            write_handle,
            applied_tx,
        );

        let ctx = Arc::new(ServerContext {
            config: config.clone(),
            raft: raft.clone(),
            network,
            storage,
            registry: registry.clone(),
            stats,
            peer_table: peer_table.clone(),
            started_at: Instant::now(),
        });

        let (shutdown_tx, _) = broadcast::channel(1);
        let mut tasks = Vec::new();

        tasks.push(spawn_fanout(registry, applied_rx));
        tasks.push(spawn_membership_scanner(
            discovery,
            peer_table,
            raft,
            config.clone(),
            shutdown_tx.subscribe(),
        ));
        tasks.push(peer_rpc::spawn_listener(rpc_listener, ctx.clone(), shutdown_tx.subscribe()));
        tasks.push(client_tcp::spawn_listener(
            client_listener,
            ctx.clone(),
            shutdown_tx.clone(),
        ));
        tasks.push(admin_http::spawn_server(admin_listener, ctx.clone(), shutdown_tx.subscribe())?);
        tasks.push(Self::spawn_detached_reaper(ctx.clone(), detached_rx, shutdown_tx.subscribe()));

        Ok(BrokerNode {
            ctx,
            shutdown_tx,
            tasks,
            writer_handle,
        })
    }

    /// Propagate removal of subscribers force-detached by the fan-out
    /// engine.
    fn spawn_detached_reaper(
        ctx: Arc<ServerContext<S>>,
        mut detached_rx: mpsc::UnboundedReceiver<String>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> JoinHandle<()> {
        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        maybe_id = detached_rx.recv() => match maybe_id {
                            Some(subscriber_id) => {
                                let topics = ctx.registry.drop_connection(&subscriber_id);
                                ctx.propose_unsubscribe_all(&subscriber_id, topics).await;
                            }
                            None => return,
                        },
                        _ = shutdown_rx.recv() => return,
                    }
                }
            }
            .instrument(tracing::debug_span!("detached-reaper")),
        )
    }

    /// The shared server context (used by the daemon for status logging).
    pub fn context(&self) -> &Arc<ServerContext<S>> {
        &self.ctx
    }

    /// Gracefully stop the node.
    ///
    /// Closes the listeners, drains in-flight client connections up to
    /// the configured deadline, stops the consensus core, then waits for
    /// the write serializer to flush its queue.
    pub async fn shutdown(mut self) -> anyhow::Result<()> {
        tracing::info!(id = self.ctx.config.node_id, "broker shutting down");
        let _ = self.shutdown_tx.send(());

        // Bounded connection drain.
        let deadline = Instant::now() + Duration::from_millis(self.ctx.config.shutdown_drain_timeout);
        loop {
            let publishers = self.ctx.stats.publisher_connections.load(Ordering::Relaxed);
            let subscribers = self.ctx.registry.active_connection_count();
            if publishers == 0 && subscribers == 0 {
                break;
            }
            if Instant::now() >= deadline {
                tracing::warn!(publishers, subscribers, "drain deadline reached with connections still open");
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        self.ctx.raft.shutdown().await?;

        for task in self.tasks.drain(..) {
            task.abort();
            let _ = task.await;
        }

        // The consensus core held the last write handle; once it is gone
        // the serializer drains the queue and exits.
        let _ = (&mut self.writer_handle).await;
        tracing::info!("broker shutdown complete");
        Ok(())
    }
}
