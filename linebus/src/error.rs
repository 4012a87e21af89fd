//! Error types exposed by this crate.

use serde::Deserialize;
use serde::Serialize;

use crate::NodeId;

/// A result type where the error variant is always a `RaftError`.
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants related to the internals of Raft.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum RaftError {
    /// An error which has come from the storage layer.
    #[error("{0}")]
    RaftStorage(anyhow::Error),
    /// An error which has come from the network layer.
    #[error("{0}")]
    RaftNetwork(anyhow::Error),
    /// The node is shutting down and can no longer service requests.
    #[error("the broker is shutting down")]
    ShuttingDown,
}

impl From<tokio::io::Error> for RaftError {
    fn from(src: tokio::io::Error) -> Self {
        RaftError::RaftNetwork(src.into())
    }
}

/// An error related to a client write request.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError {
    /// A Raft error.
    #[error("{0}")]
    RaftError(#[from] RaftError),
    /// The write was refused because this node is not the leader. The
    /// current leader, if known, is carried as a hint for rebinding.
    #[error("the node is not the cluster leader")]
    ForwardToLeader(Option<NodeId>),
}

/// Errors from the durable store.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The underlying engine failed an I/O operation. Retryable.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    /// A stored record failed to decode. The database requires operator
    /// intervention; the node refuses to serve.
    #[error("storage corrupt: {0}")]
    Corrupt(String),
}

/// Errors produced while parsing client protocol frames.
#[derive(Debug, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum ProtocolError {
    /// The first seven bytes of the connection were not a known role tag.
    #[error("unknown role tag {0:?}")]
    UnknownRoleTag(String),
    /// A frame did not start with the `FORMAT:` prefix or named an
    /// unknown format.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    /// A payload carried no extractable topic.
    #[error("frame has no topic")]
    MissingTopic,
    /// A subscriber line was not a known command.
    #[error("unknown command {0:?}")]
    UnknownCommand(String),
}

/// Errors surfaced by the write serializer queue.
#[derive(Debug, thiserror::Error)]
pub enum WriteQueueError {
    /// The bounded queue is full. Callers which must not drop (the apply
    /// loop) use the blocking enqueue instead and never see this.
    #[error("write queue full")]
    Backpressure,
    /// The consumer task has exited.
    #[error("write serializer has shut down")]
    Closed,
}

/// Top-level error for node startup and lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("could not bind {endpoint} on {addr}: {source}")]
    Bind {
        endpoint: &'static str,
        addr: String,
        source: std::io::Error,
    },
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Raft(#[from] RaftError),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl BrokerError {
    /// The process exit code mandated for this failure class.
    pub fn exit_code(&self) -> i32 {
        match self {
            BrokerError::Storage(_) => 1,
            BrokerError::Bind { .. } => 2,
            _ => 1,
        }
    }
}
