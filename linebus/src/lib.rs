//! linebus — a replicated publish/subscribe message broker.
//!
//! A cluster of broker nodes linearizes every publish and subscription
//! change through a replicated log, persists committed entries to a
//! node-local store behind a single-writer queue, and fans committed
//! messages out to matching subscriber connections.
//!
//! The crate is organized around a small set of long-lived tasks:
//! the consensus core ([`raft::Raft`] is its public handle), one
//! replication stream per peer, a single apply task, the write
//! serializer ([`writer`]), the membership scanner ([`discovery`]),
//! and the listener loops in [`server`].

pub mod config;
mod core;
pub mod discovery;
pub mod error;
pub mod message;
pub mod metrics;
pub mod network;
mod quorum;
pub mod raft;
mod replication;
pub mod server;
pub mod storage;
pub mod subscribers;
pub mod writer;

use serde::Deserialize;
use serde::Serialize;

pub use crate::config::Config;
pub use crate::core::State;
pub use crate::error::BrokerError;
pub use crate::error::ClientWriteError;
pub use crate::error::ProtocolError;
pub use crate::error::RaftError;
pub use crate::error::StorageError;
pub use crate::metrics::RaftMetrics;
pub use crate::network::RaftNetwork;
pub use crate::raft::Raft;
pub use crate::replication::ReplicationMetrics;
pub use crate::storage::LogStore;

/// A Raft node's ID.
pub type NodeId = u64;

/// The identity of a log entry: the term in which it was created and its
/// position in the log.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({},{})", self.term, self.index)
    }
}

/// A replication state change notification, as `enum Update<T>`.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}

/// The suffix of log messages for significant message types.
pub trait MessageSummary {
    /// Return a string of a big message for logging.
    fn summary(&self) -> String;
}

/// Milliseconds since the Unix epoch.
pub(crate) fn unix_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
