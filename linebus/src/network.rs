//! The Raft network interface and its TCP implementation.
//!
//! Peer RPCs are framed as one JSON object per LF-terminated line: the
//! caller writes a [`PeerRequest`] line and reads back a single
//! [`PeerResponse`] line. Each peer gets one persistent socket which is
//! re-established on failure; request/response pairs on a socket never
//! interleave.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::net::IpAddr;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::RwLock;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncBufReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::BufStream;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::timeout;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponse;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::NodeId;

/// A peer broker node as known to this node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    pub node_id: NodeId,
    pub host: IpAddr,
    pub client_port: u16,
    pub peer_rpc_port: u16,
    pub admin_http_port: u16,
    /// Milliseconds since the epoch at which the peer last answered a
    /// probe.
    pub last_seen_ms: u64,
}

impl Peer {
    /// The peer's RPC endpoint.
    pub fn rpc_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.peer_rpc_port)
    }

    /// The peer's client TCP endpoint, as advertised to redirected
    /// publishers.
    pub fn client_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.client_port)
    }

    /// The peer's admin base URL, as used in HTTP redirects.
    pub fn admin_url(&self) -> String {
        format!("http://{}:{}", self.host, self.admin_http_port)
    }
}

/// The identity a node reports when answering a discovery probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerIdentity {
    pub node_id: NodeId,
    pub cluster_name: String,
    pub client_port: u16,
    pub peer_rpc_port: u16,
    pub admin_http_port: u16,
}

/// The shared address book mapping node IDs to peer endpoints.
///
/// Written by the membership scanner, read by the RPC client and by the
/// protocol layers when rendering leader hints.
#[derive(Default)]
pub struct PeerTable {
    peers: RwLock<BTreeMap<NodeId, Peer>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: NodeId) -> Option<Peer> {
        self.peers.read().expect("peer table lock poisoned").get(&id).cloned()
    }

    pub fn all(&self) -> Vec<Peer> {
        self.peers.read().expect("peer table lock poisoned").values().cloned().collect()
    }

    pub fn insert(&self, peer: Peer) {
        self.peers.write().expect("peer table lock poisoned").insert(peer.node_id, peer);
    }

    pub fn remove(&self, id: NodeId) -> Option<Peer> {
        self.peers.write().expect("peer table lock poisoned").remove(&id)
    }

    /// Replace the table wholesale with the given peer set.
    pub fn replace(&self, peers: Vec<Peer>) {
        let mut table = self.peers.write().expect("peer table lock poisoned");
        table.clear();
        for peer in peers {
            table.insert(peer.node_id, peer);
        }
    }
}

/// The outcome of a write forwarded to the (believed) leader.
#[derive(Debug, Serialize, Deserialize)]
pub enum ForwardOutcome {
    /// The target accepted and committed the write.
    Committed(ClientWriteResponse),
    /// The target was not the leader either; the caller should rebind to
    /// the carried hint.
    NotLeader { leader: Option<NodeId> },
}

/// A single peer RPC request, one JSON line on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub enum PeerRequest {
    AppendEntries(AppendEntriesRequest),
    Vote(VoteRequest),
    /// A client write relayed from a non-leader node.
    Forward(ClientWriteRequest),
    /// Liveness and identity check used by discovery.
    Probe,
}

/// A single peer RPC response, one JSON line on the wire.
#[derive(Debug, Serialize, Deserialize)]
pub enum PeerResponse {
    AppendEntries(AppendEntriesResponse),
    Vote(VoteResponse),
    Forward(ForwardOutcome),
    Probe(PeerIdentity),
    Error(String),
}

/// A trait defining the interface for the Raft network layer.
///
/// Typically this will be implemented by [`TcpRaftNetwork`]; tests run a
/// whole cluster in one process by implementing this trait over an
/// in-memory routing table.
#[async_trait]
pub trait RaftNetwork: Send + Sync + 'static {
    /// Send an AppendEntries RPC to the target Raft node.
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse>;

    /// Send a RequestVote RPC to the target Raft node.
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse>;

    /// Relay a client write to the target node (the believed leader) and
    /// return its outcome.
    async fn send_forward(&self, target: NodeId, rpc: ClientWriteRequest) -> Result<ForwardOutcome>;
}

/// The production network: JSON-line RPCs over one persistent TCP socket
/// per peer.
pub struct TcpRaftNetwork {
    table: Arc<PeerTable>,
    connect_timeout: Duration,
    conns: RwLock<HashMap<NodeId, Arc<Mutex<Option<BufStream<TcpStream>>>>>>,
}

impl TcpRaftNetwork {
    pub fn new(table: Arc<PeerTable>) -> Self {
        Self {
            table,
            connect_timeout: Duration::from_millis(1000),
            conns: RwLock::new(HashMap::new()),
        }
    }

    fn conn_slot(&self, target: NodeId) -> Arc<Mutex<Option<BufStream<TcpStream>>>> {
        if let Some(slot) = self.conns.read().expect("conn map lock poisoned").get(&target) {
            return slot.clone();
        }
        let mut conns = self.conns.write().expect("conn map lock poisoned");
        conns.entry(target).or_default().clone()
    }

    /// Perform one request/response round trip on the peer's socket,
    /// reconnecting if the cached socket is gone or fails.
    async fn call(&self, target: NodeId, req: &PeerRequest) -> Result<PeerResponse> {
        let peer = self
            .table
            .get(target)
            .ok_or_else(|| anyhow!("no known address for node {}", target))?;
        let slot = self.conn_slot(target);
        let mut guard = slot.lock().await;

        if guard.is_none() {
            let stream = timeout(self.connect_timeout, TcpStream::connect(peer.rpc_addr()))
                .await
                .with_context(|| format!("connect timeout to node {} at {}", target, peer.rpc_addr()))??;
            *guard = Some(BufStream::new(stream));
        }

        let stream = guard.as_mut().expect("connection populated above");
        match roundtrip(stream, req).await {
            Ok(resp) => Ok(resp),
            Err(err) => {
                // Drop the broken socket; the next call reconnects.
                *guard = None;
                Err(err)
            }
        }
    }
}

async fn roundtrip(stream: &mut BufStream<TcpStream>, req: &PeerRequest) -> Result<PeerResponse> {
    let mut line = serde_json::to_string(req)?;
    line.push('\n');
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;

    let mut resp_line = String::new();
    let n = stream.read_line(&mut resp_line).await?;
    if n == 0 {
        return Err(anyhow!("peer closed the connection"));
    }
    let resp: PeerResponse = serde_json::from_str(resp_line.trim_end())?;
    if let PeerResponse::Error(msg) = resp {
        return Err(anyhow!("peer error: {}", msg));
    }
    Ok(resp)
}

#[async_trait]
impl RaftNetwork for TcpRaftNetwork {
    #[tracing::instrument(level = "trace", skip(self, rpc))]
    async fn send_append_entries(&self, target: NodeId, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        match self.call(target, &PeerRequest::AppendEntries(rpc)).await? {
            PeerResponse::AppendEntries(resp) => Ok(resp),
            other => Err(anyhow!("unexpected response to AppendEntries: {:?}", other)),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, rpc))]
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> Result<VoteResponse> {
        match self.call(target, &PeerRequest::Vote(rpc)).await? {
            PeerResponse::Vote(resp) => Ok(resp),
            other => Err(anyhow!("unexpected response to Vote: {:?}", other)),
        }
    }

    #[tracing::instrument(level = "trace", skip(self, rpc))]
    async fn send_forward(&self, target: NodeId, rpc: ClientWriteRequest) -> Result<ForwardOutcome> {
        match self.call(target, &PeerRequest::Forward(rpc)).await? {
            PeerResponse::Forward(outcome) => Ok(outcome),
            other => Err(anyhow!("unexpected response to Forward: {:?}", other)),
        }
    }
}

/// Probe an arbitrary address for a broker node, returning its identity.
///
/// Used by the port scanner before the responder's node ID is known, so
/// it cannot go through the per-peer connection cache.
pub async fn probe_addr(addr: SocketAddr, deadline: Duration) -> Result<PeerIdentity> {
    let fut = async {
        let stream = TcpStream::connect(addr).await?;
        let mut stream = BufStream::new(stream);
        match roundtrip(&mut stream, &PeerRequest::Probe).await? {
            PeerResponse::Probe(identity) => Ok(identity),
            other => Err(anyhow!("unexpected response to Probe: {:?}", other)),
        }
    };
    timeout(deadline, fut).await.with_context(|| format!("probe timeout for {}", addr))?
}
