//! Observable state of a running broker node.
//!
//! The consensus core publishes a [`RaftMetrics`] snapshot on a `watch`
//! channel every time externally visible state changes. The admin HTTP
//! layer reads the latest value; tests use [`Wait`] to block until the
//! metrics satisfy a condition.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;

use crate::core::State;
use crate::replication::ReplicationMetrics;
use crate::NodeId;

/// A set of metrics describing the current state of a Raft node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// The ID of the Raft node.
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    /// The current term of the Raft node.
    pub current_term: u64,
    /// The last log index to have been appended to this Raft node's log.
    pub last_log_index: u64,
    /// The highest log index known to be committed cluster-wide.
    pub commit_index: u64,
    /// The last log index to have been applied to the local state machine.
    pub last_applied: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    /// The set of peers this node currently counts toward quorum,
    /// excluding itself.
    pub peers: BTreeSet<NodeId>,
    /// The metrics about the leader. It is Some() only when this node is
    /// leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    /// Generate the initial metrics payload for a pristine node.
    pub(crate) fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            commit_index: 0,
            last_applied: 0,
            current_leader: None,
            peers: BTreeSet::new(),
            leader_metrics: None,
        }
    }

    /// The cluster size used for quorum arithmetic: known peers plus self.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }
}

/// The metrics about the leader.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics of peers.
    pub replication: HashMap<NodeId, ReplicationMetrics>,
}

/// Error variants related to metrics waiting.
#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timeout after {0:?} when {1}")]
    Timeout(Duration, String),
    #[error("raft is shutting down")]
    ShuttingDown,
}

/// Wait for metrics to satisfy some condition.
pub struct Wait {
    pub timeout: Duration,
    pub rx: watch::Receiver<RaftMetrics>,
}

impl Wait {
    /// Wait for metrics to satisfy some condition or timeout.
    #[tracing::instrument(level = "debug", skip(self, func), fields(msg=%msg.to_string()))]
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where T: Fn(&RaftMetrics) -> bool + Send {
        let timeout_at = Instant::now() + self.timeout;
        let mut rx = self.rx.clone();
        loop {
            let latest = rx.borrow().clone();
            tracing::debug!("id={} wait {:} latest: {:?}", latest.id, msg.to_string(), latest);

            if func(&latest) {
                return Ok(latest);
            }

            let delay = tokio::time::sleep_until(timeout_at);
            tokio::select! {
                _ = delay => {
                    return Err(WaitError::Timeout(self.timeout, format!("{} latest: {:?}", msg.to_string(), latest)));
                }
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(WaitError::ShuttingDown);
                    }
                }
            }
        }
    }

    /// Wait for `last_applied` to reach `want_log` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn log(&self, want_log: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.last_log_index >= want_log && m.last_applied >= want_log,
            &format!("{} .last_log_index+last_applied -> {}", msg.to_string(), want_log),
        )
        .await
    }

    /// Wait for `state` to become `want_state` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn state(&self, want_state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.state == want_state,
            &format!("{} .state -> {:?}", msg.to_string(), want_state),
        )
        .await
    }

    /// Wait for `current_leader` to become `Some(leader_id)` or timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(msg=%msg.to_string()))]
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(
            |m| m.current_leader == Some(leader_id),
            &format!("{} .current_leader -> {}", msg.to_string(), leader_id),
        )
        .await
    }
}
