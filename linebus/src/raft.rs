//! Public Raft interface and data types.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::Span;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::message::Message;
use crate::metrics::RaftMetrics;
use crate::metrics::Wait;
use crate::storage::AppliedEvent;
use crate::storage::LogStore;
use crate::writer::WriteHandle;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;

struct RaftInner {
    tx_api: mpsc::UnboundedSender<(RaftMsg, Span)>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    raft_handle: Mutex<Option<JoinHandle<RaftResult<()>>>>,
    tx_shutdown: Mutex<Option<oneshot::Sender<()>>>,
}

/// The consensus API of a broker node.
///
/// This type is the interface to a running Raft task. It is cheap to
/// clone, and every endpoint layer (client TCP, admin HTTP, peer RPC)
/// holds a clone and posts typed messages to the core's inbox.
///
/// If any of the interfaces returns `RaftError::ShuttingDown`, the node
/// is going down (potentially for data safety reasons due to a storage
/// fault) and `shutdown` should be called to await the core task.
pub struct Raft<N: RaftNetwork, S: LogStore> {
    inner: Arc<RaftInner>,
    marker_n: std::marker::PhantomData<N>,
    marker_s: std::marker::PhantomData<S>,
}

impl<N: RaftNetwork, S: LogStore> Raft<N, S> {
    /// Create and spawn a new Raft task.
    ///
    /// ### `id`
    /// The ID which the spawned Raft task will use to identify itself
    /// within the cluster. It must be stable across restarts.
    ///
    /// ### `network`
    /// An implementation of the `RaftNetwork` trait used for sending RPCs
    /// to peer nodes.
    ///
    /// ### `storage`
    /// The node's durable store. The core only reads from it directly;
    /// every mutation goes through `writer`.
    ///
    /// ### `writer`
    /// The write serializer handle; the sole mutation path to `storage`.
    ///
    /// ### `applied_tx`
    /// Receives every [`AppliedEvent`] in apply order; the fan-out engine
    /// consumes this stream.
    #[tracing::instrument(level="trace", skip(config, network, storage, writer, applied_tx), fields(cluster=%config.cluster_name))]
    pub fn new(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        writer: WriteHandle,
        applied_tx: mpsc::UnboundedSender<AppliedEvent>,
    ) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let raft_handle = RaftCore::spawn(
            id,
            config,
            network,
            storage,
            writer,
            applied_tx,
            rx_api,
            tx_metrics,
            rx_shutdown,
        );
        let inner = RaftInner {
            tx_api,
            rx_metrics,
            raft_handle: Mutex::new(Some(raft_handle)),
            tx_shutdown: Mutex::new(Some(tx_shutdown)),
        };
        Self {
            inner: Arc::new(inner),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        }
    }

    /// Submit an AppendEntries RPC to this Raft node.
    ///
    /// These RPCs are sent by the cluster leader to replicate log entries,
    /// and are also used as heartbeats.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn append_entries(&self, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::AppendEntries { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a VoteRequest (RequestVote in the Raft paper) RPC to this node.
    ///
    /// These RPCs are sent by cluster peers which are in candidate state
    /// attempting to gather votes.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, rpc: VoteRequest) -> Result<VoteResponse, RaftError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::RequestVote { rpc, tx }, span))
            .map_err(|_| RaftError::ShuttingDown)?;

        rx.await.map_err(|_| RaftError::ShuttingDown).and_then(|res| res)
    }

    /// Submit a mutating client request to update the state of the system.
    ///
    /// The entry will be appended to the log, committed to the cluster,
    /// and applied to the state machine; the apply result is returned.
    /// On a non-leader this fails with `ClientWriteError::ForwardToLeader`
    /// carrying the current leader hint, and the caller rebinds.
    #[tracing::instrument(level = "debug", skip(self, rpc), fields(rpc=%rpc.summary()))]
    pub async fn client_write(&self, rpc: ClientWriteRequest) -> Result<ClientWriteResponse, ClientWriteError> {
        let span = tracing::debug_span!("CH");

        let (tx, rx) = oneshot::channel();
        self.inner
            .tx_api
            .send((RaftMsg::ClientWriteRequest { rpc, tx }, span))
            .map_err(|_| ClientWriteError::RaftError(RaftError::ShuttingDown))?;

        match rx.await {
            Ok(res) => res,
            Err(err) => {
                tracing::error!("error when Raft::client_write: recv from rx: {}", err);
                Err(ClientWriteError::RaftError(RaftError::ShuttingDown))
            }
        }
    }

    /// Replace the core's view of the live peer set.
    ///
    /// Posted by the membership scanner. The core reconciles replication
    /// streams (when leader) and quorum arithmetic against the new set;
    /// an election already in flight keeps the set it snapshotted when
    /// the candidacy began.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn update_peers(&self, peers: BTreeSet<NodeId>) -> RaftResult<()> {
        let span = tracing::debug_span!("CH");
        self.inner
            .tx_api
            .send((RaftMsg::UpdatePeers { peers }, span))
            .map_err(|_| RaftError::ShuttingDown)
    }

    /// Get the ID of the current leader from this Raft node.
    ///
    /// This method is based on the metrics system which does a good job
    /// at staying up-to-date; it is perfect for making decisions on where
    /// to route client requests.
    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    /// Get a handle to the metrics channel.
    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    /// Get a handle to wait for the metrics to satisfy some condition.
    ///
    /// ```ignore
    /// let timeout = Duration::from_millis(200);
    ///
    /// // wait for log-3 to be received and applied:
    /// r.wait(Some(timeout)).log(3, "log 3").await?;
    ///
    /// // wait for the node's state to become leader:
    /// r.wait(None).state(State::Leader, "leader").await?;
    /// ```
    pub fn wait(&self, timeout: Option<Duration>) -> Wait {
        let timeout = match timeout {
            Some(t) => t,
            None => Duration::from_millis(500),
        };
        Wait {
            timeout,
            rx: self.inner.rx_metrics.clone(),
        }
    }

    /// Shutdown this Raft node.
    pub async fn shutdown(&self) -> anyhow::Result<()> {
        if let Some(tx) = self.inner.tx_shutdown.lock().await.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.inner.raft_handle.lock().await.take() {
            let _ = handle.await?;
        }
        Ok(())
    }
}

impl<N: RaftNetwork, S: LogStore> Clone for Raft<N, S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            marker_n: std::marker::PhantomData,
            marker_s: std::marker::PhantomData,
        }
    }
}

pub(crate) type ClientWriteResponseTx = oneshot::Sender<Result<ClientWriteResponse, ClientWriteError>>;

/// A message coming from the Raft API.
pub(crate) enum RaftMsg {
    AppendEntries {
        rpc: AppendEntriesRequest,
        tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>>,
    },
    RequestVote {
        rpc: VoteRequest,
        tx: oneshot::Sender<Result<VoteResponse, RaftError>>,
    },
    ClientWriteRequest {
        rpc: ClientWriteRequest,
        tx: ClientWriteResponseTx,
    },
    UpdatePeers {
        peers: BTreeSet<NodeId>,
    },
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by a cluster leader to replicate log entries, and as a heartbeat.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// The leader's current term.
    pub term: u64,
    /// The leader's ID. Useful in redirecting clients.
    pub leader_id: u64,

    /// The log entry immediately preceding the new entries.
    pub prev_log_id: LogId,

    /// The new log entries to store.
    ///
    /// This may be empty when the leader is sending heartbeats. Entries
    /// are batched for efficiency.
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: u64,
}

impl MessageSummary for AppendEntriesRequest {
    fn summary(&self) -> String {
        format!(
            "term={}, leader_id={}, prev_log_id={}, leader_commit={}, n={}",
            self.term,
            self.leader_id,
            self.prev_log_id,
            self.leader_commit,
            self.entries.len()
        )
    }
}

/// The response to an `AppendEntriesRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// The responding node's current term, for leader to update itself.
    pub term: u64,
    /// Will be true if follower contained entry matching `prev_log_id`.
    pub success: bool,
    /// A hint letting the leader resynchronize a diverged follower in
    /// fewer round-trips than decrementing one index at a time.
    ///
    /// This value will only be present, and should only be considered,
    /// when `success` is `false`.
    pub conflict_opt: Option<ConflictOpt>,
}

/// The most recent entry on the responding follower which does not
/// conflict with the received request.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ConflictOpt {
    pub log_id: LogId,
}

/// A log entry of the replicated broker log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,

    /// This entry's payload.
    pub payload: EntryPayload,
}

impl MessageSummary for Entry {
    fn summary(&self) -> String {
        format!("{}:{}", self.log_id, self.payload.summary())
    }
}

impl MessageSummary for &[Entry] {
    fn summary(&self) -> String {
        let mut res = Vec::with_capacity(self.len());
        for x in self.iter() {
            let e = format!("{}:{}", x.log_id, x.payload.summary());
            res.push(e);
        }

        res.join(",")
    }
}

/// Log entry payload variants.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryPayload {
    /// An empty payload committed by a new cluster leader.
    Noop,
    /// A message publish.
    Publish(Message),
    /// A subscriber registering interest in a topic.
    Subscribe(Subscription),
    /// A subscriber dropping a topic, or being detached.
    Unsubscribe(Unsubscription),
}

impl MessageSummary for EntryPayload {
    fn summary(&self) -> String {
        match self {
            EntryPayload::Noop => "noop".to_string(),
            EntryPayload::Publish(msg) => format!("publish: {}", msg.summary()),
            EntryPayload::Subscribe(sub) => {
                format!("subscribe: {} -> {}", sub.subscriber_id, sub.topic)
            }
            EntryPayload::Unsubscribe(unsub) => {
                format!("unsubscribe: {} -> {}", unsub.subscriber_id, unsub.topic)
            }
        }
    }
}

/// A subscriber registering interest in a topic, replicated so every node
/// can route around the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscriber_id: String,
    /// The node holding the subscriber's connection.
    pub node_id: NodeId,
    pub topic: String,
}

/// Removal of a subscriber registration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unsubscription {
    pub subscriber_id: String,
    pub topic: String,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// An RPC sent by candidates to gather votes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The candidate's current term.
    pub term: u64,
    /// The candidate's ID.
    pub candidate_id: u64,
    /// The index of the candidate’s last log entry.
    pub last_log_index: u64,
    /// The term of the candidate’s last log entry.
    pub last_log_term: u64,
}

impl MessageSummary for VoteRequest {
    fn summary(&self) -> String {
        format!("{:?}", self)
    }
}

impl VoteRequest {
    /// Create a new instance.
    pub fn new(term: u64, candidate_id: u64, last_log_index: u64, last_log_term: u64) -> Self {
        Self {
            term,
            candidate_id,
            last_log_index,
            last_log_term,
        }
    }
}

/// The response to a `VoteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The current term of the responding node, for the candidate to update itself.
    pub term: u64,
    /// Will be true if the candidate received a vote from the responder.
    pub vote_granted: bool,
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A client request to update the state of the system.
///
/// The entry of this payload will be appended to the replicated log and
/// then applied to the state machine on every node.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientWriteRequest {
    pub(crate) entry: EntryPayload,
}

impl MessageSummary for ClientWriteRequest {
    fn summary(&self) -> String {
        self.entry.summary()
    }
}

impl ClientWriteRequest {
    /// Create a request carrying a message publish.
    pub fn publish(msg: Message) -> Self {
        Self {
            entry: EntryPayload::Publish(msg),
        }
    }

    /// Create a request registering a subscription.
    pub fn subscribe(sub: Subscription) -> Self {
        Self {
            entry: EntryPayload::Subscribe(sub),
        }
    }

    /// Create a request removing a subscription.
    pub fn unsubscribe(unsub: Unsubscription) -> Self {
        Self {
            entry: EntryPayload::Unsubscribe(unsub),
        }
    }

    /// Generate a new noop payload.
    ///
    /// This is used by new leaders when first coming to power.
    pub(crate) fn noop() -> Self {
        Self {
            entry: EntryPayload::Noop,
        }
    }
}

/// The response to a `ClientWriteRequest`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientWriteResponse {
    /// The log index of the successfully processed client request.
    pub index: u64,
    /// The apply result of the request.
    pub event: AppliedEvent,
}
