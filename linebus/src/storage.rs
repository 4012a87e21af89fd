//! The durable log store interface and data types.

use std::collections::BTreeSet;
use std::fmt::Debug;
use std::ops::RangeBounds;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde::Serialize;

use crate::message::Message;
use crate::raft::Entry;
use crate::raft::Subscription;
use crate::raft::Unsubscription;
use crate::LogId;
use crate::NodeId;

/// A record holding the hard state of a Raft node.
///
/// This model derives serde's traits for easily (de)serializing this
/// model for storage & retrieval.
#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq, Default)]
pub struct HardState {
    /// The last recorded term observed by this system.
    pub current_term: u64,
    /// The ID of the node voted for in the `current_term`.
    pub voted_for: Option<NodeId>,
}

/// A struct used to represent the initial state which a Raft node needs when first starting.
#[derive(Clone, Debug)]
pub struct InitialState {
    /// The last entry in the log.
    pub last_log_id: LogId,
    /// The LogId of the last log applied to the state machine.
    pub last_applied_log: LogId,
    /// The saved hard state of the node.
    pub hard_state: HardState,
}

impl InitialState {
    /// Create a new instance for a pristine Raft node.
    pub fn new_initial() -> Self {
        Self {
            last_log_id: LogId { term: 0, index: 0 },
            last_applied_log: LogId { term: 0, index: 0 },
            hard_state: HardState {
                current_term: 0,
                voted_for: None,
            },
        }
    }
}

/// A committed message as recorded in the durable store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// The store-assigned, strictly monotone sequence number.
    pub seq_no: u64,
    /// The log index of the entry which carried this message.
    pub log_index: u64,
    pub message: Message,
}

/// A replicated subscriber registration.
///
/// Distinct from the in-memory connection handle: this record exists on
/// every node and names the node which owns the live connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberInfo {
    pub subscriber_id: String,
    /// The node holding the subscriber's TCP connection.
    pub node_id: NodeId,
    pub topics: BTreeSet<String>,
    /// Milliseconds since the epoch of the last observed heartbeat.
    pub last_heartbeat_ms: u64,
}

/// The effect of applying one committed entry to the state machine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppliedEvent {
    /// The entry advanced `last_applied` with no other effect.
    Noop { log_id: LogId },
    /// A message was persisted; the fan-out engine delivers it locally.
    Published(StoredMessage),
    Subscribed {
        log_index: u64,
        subscription: Subscription,
    },
    Unsubscribed {
        log_index: u64,
        unsubscription: Unsubscription,
    },
}

impl AppliedEvent {
    /// The log index of the entry which produced this event.
    pub fn log_index(&self) -> u64 {
        match self {
            AppliedEvent::Noop { log_id } => log_id.index,
            AppliedEvent::Published(stored) => stored.log_index,
            AppliedEvent::Subscribed { log_index, .. } => *log_index,
            AppliedEvent::Unsubscribed { log_index, .. } => *log_index,
        }
    }
}

/// A cheap aggregate of store contents for status endpoints.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub message_count: u64,
    pub subscriber_count: u64,
    pub topics: Vec<String>,
    pub last_applied: u64,
}

/// A trait defining the interface for the broker's durable log store.
///
/// All mutating methods are invoked from exactly one task, the write
/// serializer; read methods may be called concurrently from any task.
/// Errors returned from mutating methods are inspected by the serializer:
/// transient failures are retried with backoff, decode failures are
/// treated as fatal corruption.
#[async_trait]
pub trait LogStore: Send + Sync + 'static {
    /// Get Raft's state information from storage.
    ///
    /// When the Raft node is first started, it will call this interface on
    /// the storage system to fetch the last known state from stable
    /// storage. If no such state exists, `InitialState::new_initial` is
    /// returned.
    async fn get_initial_state(&self) -> Result<InitialState>;

    /// Save Raft's hard-state.
    async fn save_hard_state(&self, hs: &HardState) -> Result<()>;

    /// Get a series of log entries from storage.
    ///
    /// The start value is inclusive in the search and the stop value is non-inclusive: `[start, stop)`.
    async fn get_log_entries<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(
        &self,
        range: RNG,
    ) -> Result<Vec<Entry>>;

    /// Try to get a log entry. Returns `None` when the index is absent.
    async fn try_get_log_entry(&self, log_index: u64) -> Result<Option<Entry>>;

    /// Returns the last known log id, or `(0,0)` when the log is empty.
    async fn get_last_log_id(&self) -> Result<LogId>;

    /// Delete all logs in a `range`. Used to discard an uncommitted
    /// suffix which conflicts with the leader's log.
    async fn delete_logs_from<RNG: RangeBounds<u64> + Clone + Debug + Send + Sync>(&self, range: RNG) -> Result<()>;

    /// Append a payload of entries to the log.
    ///
    /// Though the entries will always be presented in order, each entry's index should be used to
    /// determine its location to be written in the log.
    async fn append_to_log(&self, entries: &[&Entry]) -> Result<()>;

    /// Apply the given payload of committed entries to the state machine.
    ///
    /// Publish entries persist the message and return the stored record;
    /// subscribe/unsubscribe entries update the replicated registration
    /// table. Applying the same prefix on any node yields identical store
    /// contents. Input is validated before it is ever proposed, so apply
    /// does not fail on well-formed entries.
    async fn apply_to_state_machine(&self, entries: &[&Entry]) -> Result<Vec<AppliedEvent>>;

    /// Read back up to `limit` of the most recent committed messages,
    /// ordered by sequence number.
    async fn read_messages(&self, limit: usize) -> Result<Vec<StoredMessage>>;

    /// Read the replicated subscriber registrations.
    async fn read_subscribers(&self) -> Result<Vec<SubscriberInfo>>;

    /// Cheap aggregate of the applied state for status endpoints.
    async fn snapshot_state(&self) -> Result<StoreSnapshot>;
}

/// APIs for debugging a store.
#[async_trait]
pub trait LogStoreDebug {
    /// Get the current hard state for testing purposes.
    async fn read_hard_state(&self) -> Option<HardState>;
}
