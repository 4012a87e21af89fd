//! The core logic of a Raft node.

mod append_entries;
mod client;
mod vote;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;

use futures::stream::FuturesOrdered;
use futures::stream::StreamExt;
use serde::Deserialize;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio::time::sleep_until;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing::Span;
use tracing_futures::Instrument;

use crate::config::Config;
use crate::core::client::ClientRequestEntry;
use crate::error::ClientWriteError;
use crate::error::RaftError;
use crate::error::RaftResult;
use crate::metrics::LeaderMetrics;
use crate::metrics::RaftMetrics;
use crate::quorum;
use crate::raft::ClientWriteRequest;
use crate::raft::ClientWriteResponseTx;
use crate::raft::RaftMsg;
use crate::replication::RaftEvent;
use crate::replication::ReplicaEvent;
use crate::replication::ReplicationStream;
use crate::storage::AppliedEvent;
use crate::storage::HardState;
use crate::storage::LogStore;
use crate::writer::StoreHealth;
use crate::writer::WriteCommand;
use crate::writer::WriteHandle;
use crate::writer::WriteOutcome;
use crate::LogId;
use crate::MessageSummary;
use crate::NodeId;
use crate::RaftNetwork;
use crate::Update;

/// The result of one state-machine apply task: the log id of the last
/// entry applied, along with the apply events in entry order.
pub(crate) type ApplyOutcome = Option<(LogId, Vec<AppliedEvent>)>;

/// The core type implementing the Raft protocol.
pub struct RaftCore<N: RaftNetwork, S: LogStore> {
    /// This node's ID.
    id: NodeId,
    /// This node's runtime config.
    config: Arc<Config>,
    /// The `RaftNetwork` implementation.
    network: Arc<N>,
    /// The `LogStore` implementation. The core reads from it directly;
    /// all mutations go through `writer`.
    storage: Arc<S>,
    /// The write serializer handle, the sole mutation path to `storage`.
    writer: WriteHandle,
    /// Sink for apply events, consumed by the fan-out engine.
    applied_tx: mpsc::UnboundedSender<AppliedEvent>,

    /// The live peer set as reported by the membership scanner, this node
    /// excluded. Quorum arithmetic is over `peers ∪ {self}`.
    peers: BTreeSet<NodeId>,
    /// Set once the scanner has completed its first pass. Elections are
    /// deferred until then so a booting node does not promote itself
    /// before it has looked for an existing cluster.
    peers_seeded: bool,

    /// The target state of the system.
    target_state: State,

    /// The index of the highest log entry known to be committed
    /// cluster-wide.
    ///
    /// Is initialized to 0 on boot and increases monotonically; it is
    /// never persisted. The commit index must be re-derived by a leader
    /// after successfully committing a new log to the cluster.
    commit_index: u64,
    /// The log id of the highest log entry which has been applied to the
    /// local state machine. Advances only after the write serializer has
    /// made the apply durable.
    last_applied: LogId,

    /// The current term.
    current_term: u64,
    /// The ID of the current leader of the Raft cluster.
    current_leader: Option<NodeId>,
    /// The ID of the candidate which received this node's vote for the
    /// current term. Persisted before any vote response is sent.
    voted_for: Option<NodeId>,

    /// The last entry to be appended to the log.
    last_log_id: LogId,

    /// The stream of join handles from state machine apply tasks. There
    /// will only ever be a maximum of 1 element at a time.
    ///
    /// This abstraction is needed to ensure that applying entries does
    /// not block the AppendEntries RPC flow.
    replicate_to_sm_handle: FuturesOrdered<JoinHandle<anyhow::Result<ApplyOutcome>>>,

    /// The last time a heartbeat was received.
    last_heartbeat: Option<Instant>,
    /// The duration until the next election timeout.
    next_election_timeout: Option<Instant>,

    /// Store health as observed by the write serializer. A degraded store
    /// forbids leadership and elections; a failed store shuts the node
    /// down.
    store_health: watch::Receiver<StoreHealth>,

    rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N: RaftNetwork, S: LogStore> RaftCore<N, S> {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        writer: WriteHandle,
        applied_tx: mpsc::UnboundedSender<AppliedEvent>,
        rx_api: mpsc::UnboundedReceiver<(RaftMsg, Span)>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<RaftResult<()>> {
        let store_health = writer.health();
        let this = Self {
            id,
            config,
            network,
            storage,
            writer,
            applied_tx,
            peers: BTreeSet::new(),
            peers_seeded: false,
            target_state: State::Follower,
            commit_index: 0,
            last_applied: LogId { term: 0, index: 0 },
            current_term: 0,
            current_leader: None,
            voted_for: None,
            last_log_id: LogId { term: 0, index: 0 },
            replicate_to_sm_handle: FuturesOrdered::new(),
            last_heartbeat: None,
            next_election_timeout: None,
            store_health,
            rx_api,
            tx_metrics,
            rx_shutdown,
        };
        tokio::spawn(this.main().instrument(tracing::debug_span!("spawn")))
    }

    /// The main loop of the Raft protocol.
    #[tracing::instrument(level="debug", skip(self), fields(id=self.id, cluster=%self.config.cluster_name))]
    async fn main(mut self) -> RaftResult<()> {
        tracing::debug!("raft node is initializing");

        let state = self.storage.get_initial_state().await.map_err(|err| self.map_fatal_storage_error(err))?;
        self.last_log_id = state.last_log_id;
        self.current_term = state.hard_state.current_term;
        self.voted_for = state.hard_state.voted_for;
        self.last_applied = state.last_applied_log;
        // NOTE: it is unsafe to initialize the node's commit index to any
        // other value. The commit index must be determined by a leader
        // after committing a new log to the cluster.
        self.commit_index = 0;

        // Nodes always boot as followers; leadership is only ever reached
        // through an election, even in a single-node cluster. The first
        // election timeout is armed once the membership scanner has
        // reported its initial peer set.
        self.target_state = State::Follower;
        self.report_metrics(Update::Update(None));

        tracing::debug!("id={} target_state: {:?}", self.id, self.target_state);

        // This is the central loop of the system. The Raft core assumes a
        // few different roles based on cluster state. It delegates control
        // to the different state controllers and simply awaits the
        // delegated loop to return, which only takes place on error or a
        // state change.
        loop {
            match &self.target_state {
                State::Leader => LeaderState::new(&mut self).run().await?,
                State::Candidate => CandidateState::new(&mut self).run().await?,
                State::Follower => FollowerState::new(&mut self).run().await?,
                State::Shutdown => {
                    tracing::info!("node has shutdown");
                    return Ok(());
                }
            }
        }
    }

    /// Report a metrics payload on the current state of the Raft node.
    #[tracing::instrument(level = "trace", skip(self))]
    fn report_metrics(&mut self, leader_metrics: Update<Option<&LeaderMetrics>>) {
        let leader_metrics = match leader_metrics {
            Update::Update(v) => v.cloned(),
            Update::Ignore => self.tx_metrics.borrow().leader_metrics.clone(),
        };

        let res = self.tx_metrics.send(RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            commit_index: self.commit_index,
            last_applied: self.last_applied.index,
            current_leader: self.current_leader,
            peers: self.peers.clone(),
            leader_metrics,
        });

        if let Err(err) = res {
            tracing::error!(error=%err, id=self.id, "error reporting metrics");
        }
    }

    /// Save the Raft node's current hard state, via the write serializer.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn save_hard_state(&mut self) -> RaftResult<()> {
        let hs = HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        };
        self.writer
            .submit(WriteCommand::SaveHardState(hs))
            .await
            .map(|_| ())
            .map_err(|err| self.map_fatal_storage_error(err))
    }

    /// Update core's target state, ensuring all invariants are upheld.
    #[tracing::instrument(level = "trace", skip(self))]
    fn set_target_state(&mut self, target_state: State) {
        self.target_state = target_state;
    }

    /// Get the next election timeout, generating a new value if not set.
    ///
    /// Until the membership scanner has seeded the peer set, the timeout
    /// is pushed arbitrarily far out: a node that has not yet looked for
    /// an existing cluster must not promote itself.
    #[tracing::instrument(level = "trace", skip(self))]
    fn get_next_election_timeout(&mut self) -> Instant {
        if !self.peers_seeded {
            return Instant::now() + Duration::from_secs(3600);
        }
        match self.next_election_timeout {
            Some(inst) => inst,
            None => {
                let t = Duration::from_millis(self.config.new_rand_election_timeout());
                tracing::debug!("create election timeout after: {:?}", t);
                let inst = Instant::now() + t;
                self.next_election_timeout = Some(inst);
                inst
            }
        }
    }

    /// Set a value for the next election timeout.
    ///
    /// If `heartbeat=true`, then also update the value of `last_heartbeat`.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_next_election_timeout(&mut self, heartbeat: bool) {
        let now = Instant::now();

        let t = Duration::from_millis(self.config.new_rand_election_timeout());
        tracing::debug!("update election timeout after: {:?}", t);

        self.next_election_timeout = Some(now + t);
        if heartbeat {
            self.last_heartbeat = Some(now);
        }
    }

    /// Update the value of the `current_leader` property.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_leader(&mut self, update: UpdateCurrentLeader) {
        match update {
            UpdateCurrentLeader::ThisNode => {
                self.current_leader = Some(self.id);
            }
            UpdateCurrentLeader::OtherNode(target) => {
                self.current_leader = Some(target);
            }
            UpdateCurrentLeader::Unknown => {
                self.current_leader = None;
            }
        }
    }

    /// Encapsulate the process of updating the current term, as updating the `voted_for` state must also be updated.
    #[tracing::instrument(level = "trace", skip(self))]
    fn update_current_term(&mut self, new_term: u64, voted_for: Option<NodeId>) {
        if new_term > self.current_term {
            self.current_term = new_term;
            self.voted_for = voted_for;
        }
    }

    /// Replace the live peer set reported by the membership scanner.
    ///
    /// The first report arms the election timer; later reports adjust
    /// quorum arithmetic. An election already underway keeps the set it
    /// snapshotted when the candidacy began.
    #[tracing::instrument(level = "debug", skip(self, peers))]
    fn update_peers(&mut self, mut peers: BTreeSet<NodeId>) {
        peers.remove(&self.id);
        let first = !self.peers_seeded;
        self.peers_seeded = true;
        if first || peers != self.peers {
            tracing::info!(id=self.id, ?peers, "peer set updated");
            self.peers = peers;
            if first {
                self.update_next_election_timeout(false);
            }
            self.report_metrics(Update::Ignore);
        }
    }

    /// Trigger the shutdown sequence due to a non-recoverable error from the storage layer.
    ///
    /// This method assumes that a storage error observed here is non-recoverable. As such, the
    /// Raft node will be instructed to stop. If such behavior is not needed, then don't use this
    /// interface.
    #[tracing::instrument(level = "trace", skip(self))]
    fn map_fatal_storage_error(&mut self, err: anyhow::Error) -> RaftError {
        tracing::error!({error=?err, id=self.id}, "fatal storage error, shutting down");
        self.set_target_state(State::Shutdown);
        RaftError::RaftStorage(err)
    }

    /// Whether the write serializer currently reports a usable store.
    fn store_is_healthy(&self) -> bool {
        *self.store_health.borrow() == StoreHealth::Healthy
    }

    /// React to a store health transition observed on the watch channel.
    #[tracing::instrument(level = "debug", skip(self))]
    fn handle_store_health_change(&mut self) {
        let health = *self.store_health.borrow();
        match health {
            StoreHealth::Healthy => {}
            StoreHealth::Degraded => {
                if self.target_state == State::Leader || self.target_state == State::Candidate {
                    tracing::warn!(id = self.id, "store degraded, stepping down");
                    self.set_target_state(State::Follower);
                }
            }
            StoreHealth::Failed => {
                tracing::error!(id = self.id, "store failed, shutting down");
                self.set_target_state(State::Shutdown);
            }
        }
    }

    /// Spawn a task applying committed-but-unapplied entries, if needed.
    ///
    /// At most one apply task runs at a time; entries flow through the
    /// write serializer so `last_applied` only advances after the apply
    /// is durable.
    #[tracing::instrument(level = "trace", skip(self))]
    fn trigger_apply_to_state_machine(&mut self) {
        if self.commit_index <= self.last_applied.index || !self.replicate_to_sm_handle.is_empty() {
            return;
        }
        let from = self.last_applied.index + 1;
        let to = self.commit_index;
        let storage = self.storage.clone();
        let writer = self.writer.clone();
        let handle = tokio::spawn(
            async move {
                let entries = storage.get_log_entries(from..=to).await?;
                let last = match entries.last() {
                    Some(entry) => entry.log_id,
                    None => return Ok(None),
                };
                match writer.submit(WriteCommand::Apply(entries)).await? {
                    WriteOutcome::Applied(events) => Ok(Some((last, events))),
                    other => Err(anyhow::anyhow!("unexpected write outcome {:?} for apply", other)),
                }
            }
            .instrument(tracing::debug_span!("apply_to_sm")),
        );
        self.replicate_to_sm_handle.push(handle);
    }

    /// Handle the output of an async task applying entries to the state machine.
    #[tracing::instrument(level = "trace", skip(self, res))]
    fn handle_replicate_to_sm_result(&mut self, res: anyhow::Result<ApplyOutcome>) -> RaftResult<Vec<AppliedEvent>> {
        let outcome = res.map_err(|err| self.map_fatal_storage_error(err))?;

        let mut applied = Vec::new();
        if let Some((last_applied, events)) = outcome {
            tracing::debug!("last_applied:{}", last_applied);
            self.last_applied = last_applied;
            for event in &events {
                let _ = self.applied_tx.send(event.clone());
            }
            applied = events;
        }

        self.report_metrics(Update::Ignore);
        // The commit index may have moved on while the apply ran.
        self.trigger_apply_to_state_machine();
        Ok(applied)
    }

    /// Reject a client write request with a hint at the current leader.
    #[tracing::instrument(level = "trace", skip(self, tx))]
    fn forward_client_write_request(&self, _req: ClientWriteRequest, tx: ClientWriteResponseTx) {
        let _ = tx.send(Err(ClientWriteError::ForwardToLeader(self.current_leader)));
    }
}

/// An enum describing the way the current leader property is to be updated.
#[derive(Debug)]
pub(self) enum UpdateCurrentLeader {
    Unknown,
    OtherNode(NodeId),
    ThisNode,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// All possible states of a Raft node.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum State {
    /// The node is replicating logs from the leader.
    Follower,
    /// The node is campaigning to become the cluster leader.
    Candidate,
    /// The node is the Raft cluster leader.
    Leader,
    /// The Raft node is shutting down.
    Shutdown,
}

impl State {
    /// Check if currently in follower state.
    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower)
    }

    /// Check if currently in candidate state.
    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate)
    }

    /// Check if currently in leader state.
    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader)
    }
}

impl std::fmt::Display for State {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            State::Follower => "FOLLOWER",
            State::Candidate => "CANDIDATE",
            State::Leader => "LEADER",
            State::Shutdown => "SHUTDOWN",
        };
        f.write_str(name)
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to the Raft leader.
struct LeaderState<'a, N: RaftNetwork, S: LogStore> {
    pub(super) core: &'a mut RaftCore<N, S>,
    /// A mapping of node IDs to the replication state of the target node.
    pub(super) nodes: BTreeMap<NodeId, ReplicationState>,

    /// The metrics about a leader.
    pub leader_metrics: LeaderMetrics,

    /// The stream of events coming from replication streams.
    pub(super) replication_rx: mpsc::UnboundedReceiver<(ReplicaEvent, Span)>,
    /// The cloneable sender channel for replication stream events.
    pub(super) replication_tx: mpsc::UnboundedSender<(ReplicaEvent, Span)>,

    /// A buffer of client requests which have been appended locally and are awaiting to be committed to the cluster.
    pub(super) awaiting_committed: Vec<ClientRequestEntry>,
}

impl<'a, N: RaftNetwork, S: LogStore> LeaderState<'a, N, S> {
    /// Create a new instance.
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        let (replication_tx, replication_rx) = mpsc::unbounded_channel();
        Self {
            core,
            nodes: BTreeMap::new(),
            leader_metrics: LeaderMetrics::default(),
            replication_tx,
            replication_rx,
            awaiting_committed: Vec::new(),
        }
    }

    /// Transition to the Raft leader state.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="leader"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Spawn replication streams for the current peer set.
        let targets: Vec<_> = self.core.peers.iter().copied().collect();
        for target in targets {
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }

        // Setup state as leader.
        self.core.last_heartbeat = None;
        self.core.next_election_timeout = None;
        self.core.update_current_leader(UpdateCurrentLeader::ThisNode);
        self.leader_report_metrics();

        // Commit an initial entry in the new term, so that entries carried
        // over from earlier terms become committable.
        self.commit_initial_leader_entry().await?;

        // A leader which cannot reach a majority within an election window
        // steps down; this timer drives that check.
        let mut quorum_check = interval(Duration::from_millis(self.core.config.election_timeout_max));
        quorum_check.tick().await; // First tick fires immediately.

        loop {
            if !self.core.target_state.is_leader() {
                tracing::info!("id={} state becomes: {:?}", self.core.id, self.core.target_state);

                for node in self.nodes.values() {
                    let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                }
                return Ok(());
            }

            let span = tracing::debug_span!("CHrx:LeaderState");
            let _ent = span.enter();

            tokio::select! {
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            tracing::info!("leader recv from rx_api: AppendEntries, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            tracing::info!("leader recv from rx_api: RequestVote, {}", rpc.summary());
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.handle_client_write_request(rpc, tx).await;
                        }
                        RaftMsg::UpdatePeers{peers} => {
                            self.handle_update_peers(peers).await;
                        }
                    }
                },
                Some((event, span)) = self.replication_rx.recv() => {
                    tracing::debug!("leader recv from replication_rx: {:?}", event.summary());
                    let _ent = span.enter();
                    self.handle_replica_event(event).await;
                }
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let events = self.core.handle_replicate_to_sm_result(repl_sm_result).unwrap_or_default();
                    self.respond_to_applied_requests(events);
                }
                _ = quorum_check.tick() => {
                    self.check_quorum();
                }
                Ok(()) = self.core.store_health.changed() => {
                    self.core.handle_store_health_change();
                }
                Ok(_) = &mut self.core.rx_shutdown => {
                    tracing::info!("leader recv from rx_shutdown");
                    self.core.set_target_state(State::Shutdown);
                }
            }
        }
    }

    /// Spawn a replication stream to the target peer.
    pub(super) fn spawn_replication_stream(&self, target: NodeId) -> ReplicationState {
        let replstream = ReplicationStream::new(
            self.core.id,
            target,
            self.core.current_term,
            self.core.config.clone(),
            self.core.last_log_id,
            self.core.commit_index,
            self.core.network.clone(),
            self.core.storage.clone(),
            self.replication_tx.clone(),
        );
        ReplicationState {
            matched: LogId { term: 0, index: 0 },
            replstream,
            last_contact: None,
        }
    }

    /// Reconcile the replication streams against a new peer set.
    #[tracing::instrument(level = "debug", skip(self, peers))]
    async fn handle_update_peers(&mut self, peers: BTreeSet<NodeId>) {
        self.core.update_peers(peers);

        let current: BTreeSet<NodeId> = self.nodes.keys().copied().collect();
        let added: Vec<NodeId> = self.core.peers.difference(&current).copied().collect();
        for target in added {
            tracing::info!(target, "starting replication to discovered peer");
            let state = self.spawn_replication_stream(target);
            self.nodes.insert(target, state);
        }
        let removed: Vec<NodeId> = current.difference(&self.core.peers).copied().collect();
        for target in removed {
            tracing::info!(target, "stopping replication to lost peer");
            if let Some(node) = self.nodes.remove(&target) {
                let _ = node.replstream.repl_tx.send((RaftEvent::Terminate, tracing::debug_span!("CH")));
                self.leader_metrics.replication.remove(&target);
            }
        }

        // A smaller cluster may make previously uncommitted entries
        // committable.
        self.update_commit_index().await;
        self.leader_report_metrics();
    }

    /// Handle an event coming from a replication stream.
    #[tracing::instrument(level = "trace", skip(self, event))]
    async fn handle_replica_event(&mut self, event: ReplicaEvent) {
        match event {
            ReplicaEvent::UpdateMatchIndex { target, matched } => {
                if let Some(state) = self.nodes.get_mut(&target) {
                    state.matched = matched;
                    state.last_contact = Some(Instant::now());
                } else {
                    return;
                }
                self.leader_metrics.replication.insert(
                    target,
                    crate::replication::ReplicationMetrics { matched },
                );
                self.update_commit_index().await;
                self.leader_report_metrics();
            }
            ReplicaEvent::RevertToFollower { target, term } => {
                if term > self.core.current_term {
                    tracing::info!(target, term, "newer term observed from replication, stepping down");
                    self.core.update_current_term(term, None);
                    if let Err(err) = self.core.save_hard_state().await {
                        tracing::error!(error=%err, "error saving hard state on step-down");
                    }
                    self.core.update_current_leader(UpdateCurrentLeader::Unknown);
                    self.core.set_target_state(State::Follower);
                }
            }
            ReplicaEvent::Shutdown => {
                self.core.set_target_state(State::Shutdown);
            }
        }
    }

    /// Advance the commit index to the highest index replicated on a
    /// strict majority of the cluster, provided the entry at that index
    /// is from the current term. Earlier-term entries commit transitively.
    #[tracing::instrument(level = "trace", skip(self))]
    async fn update_commit_index(&mut self) {
        let cluster_size = self.nodes.len() + 1;
        let needed = quorum::majority_of(cluster_size);

        let mut indexes: Vec<u64> = self.nodes.values().map(|n| n.matched.index).collect();
        indexes.push(self.core.last_log_id.index);
        indexes.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = indexes[needed - 1];
        if candidate <= self.core.commit_index {
            return;
        }

        // Only entries of the current term are committed by counting
        // replicas.
        let term_at = match self.core.storage.try_get_log_entry(candidate).await {
            Ok(Some(entry)) => entry.log_id.term,
            Ok(None) => return,
            Err(err) => {
                self.core.map_fatal_storage_error(err);
                return;
            }
        };
        if term_at != self.core.current_term {
            return;
        }

        self.core.commit_index = candidate;
        for node in self.nodes.values() {
            let _ = node.replstream.repl_tx.send((
                RaftEvent::UpdateCommitIndex {
                    commit_index: self.core.commit_index,
                },
                tracing::debug_span!("CH"),
            ));
        }
        self.core.trigger_apply_to_state_machine();
        self.core.report_metrics(Update::Ignore);
    }

    /// Step down if a majority of the cluster has been unreachable for a
    /// full election window.
    #[tracing::instrument(level = "trace", skip(self))]
    fn check_quorum(&mut self) {
        if self.nodes.is_empty() {
            return;
        }
        let window = Duration::from_millis(self.core.config.election_timeout_max);
        let now = Instant::now();
        let reachable = self
            .nodes
            .values()
            .filter(|n| n.last_contact.map(|at| now.duration_since(at) < window).unwrap_or(false))
            .count();
        let cluster_size = self.nodes.len() + 1;
        if reachable + 1 < quorum::majority_of(cluster_size) {
            tracing::warn!(
                id = self.core.id,
                reachable,
                cluster_size,
                "quorum lost, stepping down"
            );
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
        }
    }

    /// Report metrics with leader specific states.
    #[tracing::instrument(level = "trace", skip(self))]
    pub fn leader_report_metrics(&mut self) {
        self.core.report_metrics(Update::Update(Some(&self.leader_metrics)));
    }
}

/// A struct tracking the state of a replication stream from the perspective of the Raft actor.
struct ReplicationState {
    pub matched: LogId,
    pub replstream: ReplicationStream,
    /// When the target last answered an AppendEntries RPC; drives the
    /// quorum-loss check.
    pub last_contact: Option<Instant>,
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in candidate state.
struct CandidateState<'a, N: RaftNetwork, S: LogStore> {
    core: &'a mut RaftCore<N, S>,
    /// The peer set this candidacy is campaigning over.
    ///
    /// Snapshotted when the candidacy begins so that quorum arithmetic
    /// cannot oscillate mid-election; membership updates land in the core
    /// and take effect from the next role transition.
    election_peers: BTreeSet<NodeId>,
    /// The number of votes which have been granted by peer nodes.
    votes_granted: u64,
    /// The number of votes needed in order to become the Raft leader.
    votes_needed: u64,
}

impl<'a, N: RaftNetwork, S: LogStore> CandidateState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        let election_peers = core.peers.clone();
        Self {
            core,
            election_peers,
            votes_granted: 0,
            votes_needed: 0,
        }
    }

    /// Run the candidate loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="candidate"))]
    pub(self) async fn run(mut self) -> RaftResult<()> {
        // Each iteration of the outer loop represents a new term.
        loop {
            if !self.core.target_state.is_candidate() {
                return Ok(());
            }
            if !self.core.store_is_healthy() {
                // A read-only node must not campaign.
                self.core.set_target_state(State::Follower);
                return Ok(());
            }

            // Setup initial state per term. We vote for ourselves.
            self.votes_granted = 1;
            self.votes_needed = quorum::majority_of(self.election_peers.len() + 1) as u64;

            // Setup new term.
            self.core.update_next_election_timeout(false); // Generates a new rand value within range.
            self.core.current_term += 1;
            self.core.voted_for = Some(self.core.id);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.save_hard_state().await?;
            self.core.report_metrics(Update::Update(None));

            // A single-node cluster has its majority already.
            if self.votes_granted >= self.votes_needed {
                self.core.set_target_state(State::Leader);
                return Ok(());
            }

            // Send RPCs to all members in parallel.
            let mut pending_votes = self.spawn_parallel_vote_requests();

            // Inner processing loop for this Raft state.
            loop {
                if !self.core.target_state.is_candidate() {
                    return Ok(());
                }
                let timeout_fut = sleep_until(self.core.get_next_election_timeout());

                let span = tracing::debug_span!("CHrx:CandidateState");
                let _ent = span.enter();

                tokio::select! {
                    _ = timeout_fut => break, // This election has timed-out. Break to outer loop, which starts a new term.
                    Some((res, peer)) = pending_votes.recv() => self.handle_vote_response(res, peer).await?,
                    Some((msg, span)) = self.core.rx_api.recv() => {
                        let _ent = span.enter();
                        match msg {
                            RaftMsg::AppendEntries{rpc, tx} => {
                                let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                            }
                            RaftMsg::RequestVote{rpc, tx} => {
                                let _ = tx.send(self.core.handle_vote_request(rpc).await);
                            }
                            RaftMsg::ClientWriteRequest{rpc, tx} => {
                                self.core.forward_client_write_request(rpc, tx);
                            }
                            RaftMsg::UpdatePeers{peers} => {
                                // Quorum for this election stays on the
                                // snapshot taken at candidacy start.
                                self.core.update_peers(peers);
                            }
                        }
                    },
                    Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                        // Errors herein will trigger shutdown, so no need to process error.
                        let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                    }
                    Ok(()) = self.core.store_health.changed() => {
                        self.core.handle_store_health_change();
                    }
                    Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
                }
            }
        }
    }
}

///////////////////////////////////////////////////////////////////////////////////////////////////

/// Volatile state specific to a Raft node in follower state.
pub struct FollowerState<'a, N: RaftNetwork, S: LogStore> {
    core: &'a mut RaftCore<N, S>,
}

impl<'a, N: RaftNetwork, S: LogStore> FollowerState<'a, N, S> {
    pub(self) fn new(core: &'a mut RaftCore<N, S>) -> Self {
        Self { core }
    }

    /// Run the follower loop.
    #[tracing::instrument(level="trace", skip(self), fields(id=self.core.id, raft_state="follower"))]
    pub(self) async fn run(self) -> RaftResult<()> {
        self.core.report_metrics(Update::Update(None));
        loop {
            if !self.core.target_state.is_follower() {
                return Ok(());
            }
            let election_timeout = sleep_until(self.core.get_next_election_timeout()); // Value is updated as heartbeats are received.

            let span = tracing::debug_span!("CHrx:FollowerState");
            let _ent = span.enter();

            tokio::select! {
                // If an election timeout is hit, then we need to transition to candidate.
                _ = election_timeout => {
                    if self.core.store_is_healthy() {
                        self.core.set_target_state(State::Candidate)
                    } else {
                        // Read-only nodes sit out elections.
                        self.core.update_next_election_timeout(false);
                    }
                }
                Some((msg, span)) = self.core.rx_api.recv() => {
                    let _ent = span.enter();
                    match msg {
                        RaftMsg::AppendEntries{rpc, tx} => {
                            let _ = tx.send(self.core.handle_append_entries_request(rpc).await);
                        }
                        RaftMsg::RequestVote{rpc, tx} => {
                            let _ = tx.send(self.core.handle_vote_request(rpc).await);
                        }
                        RaftMsg::ClientWriteRequest{rpc, tx} => {
                            self.core.forward_client_write_request(rpc, tx);
                        }
                        RaftMsg::UpdatePeers{peers} => {
                            self.core.update_peers(peers);
                        }
                    }
                },
                Some(Ok(repl_sm_result)) = self.core.replicate_to_sm_handle.next() => {
                    // Errors herein will trigger shutdown, so no need to process error.
                    let _ = self.core.handle_replicate_to_sm_result(repl_sm_result);
                }
                Ok(()) = self.core.store_health.changed() => {
                    self.core.handle_store_health_change();
                }
                Ok(_) = &mut self.core.rx_shutdown => self.core.set_target_state(State::Shutdown),
            }
        }
    }
}
