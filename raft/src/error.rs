//! The error taxonomy shared by every public entry point.
//!
//! Every variant is its own type behind a `thiserror`-derived enum:
//! `RaftError`/`ClientWriteError`/`ChangeMembershipError` and friends.
//! All of them implement `std::error::Error + Send + Sync + 'static` so they
//! compose with `anyhow` at the storage/network boundary.

use crate::raft_types::{LogIndex, NodeId, Term};

/// Errors returned by configuration construction/validation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election_timeout_min ({min}) must be less than election_timeout_max ({max})")]
    InvalidElectionTimeout { min: u64, max: u64 },
    #[error("heartbeat_interval ({heartbeat}) must be less than election_timeout_min ({election_timeout_min})")]
    HeartbeatTooSlow { heartbeat: u64, election_timeout_min: u64 },
    #[error("max_entries_per_append must be greater than zero")]
    ZeroMaxEntriesPerAppend,
    #[error("snapshot_chunk_size must be greater than zero")]
    ZeroSnapshotChunkSize,
}

/// The phase a configuration change was in when it failed.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConfigChangePhase {
    None,
    JointPending,
    FinalPending,
}

impl std::fmt::Display for ConfigChangePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConfigChangePhase::None => "none",
            ConfigChangePhase::JointPending => "joint_consensus",
            ConfigChangePhase::FinalPending => "final_configuration",
        };
        write!(f, "{}", s)
    }
}

/// Top level error returned by every client-visible `Raft` method.
///
/// Transient network/timeout errors inside replication never reach this type;
/// only client-visible calls (`submit_command`, `read_state`, `add_server`,
/// `remove_server`) terminate with one of these variants.
#[derive(Debug, thiserror::Error)]
pub enum RaftError {
    #[error("node {0} is not the current leader")]
    NotLeader(NodeId),

    #[error("leadership lost: term changed from {old_term} to {new_term}")]
    LeadershipLost { old_term: Term, new_term: Term },

    #[error("commit timed out for log index {index} after {duration_ms}ms")]
    CommitTimeout { index: LogIndex, duration_ms: u64 },

    #[error("configuration change failed in phase '{phase}': {reason}")]
    ConfigurationChange { phase: ConfigChangePhase, reason: String },

    #[error("future collection failed for operation '{operation}': {failed_count} of the futures failed")]
    FutureCollection { operation: String, failed_count: usize },

    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error("storage error: {0}")]
    Persistence(#[source] anyhow::Error),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("this node is shutting down")]
    ShuttingDown,

    #[error("a reconfiguration is already in progress")]
    ConfigChangeInProgress,

    #[error("node {0} is already a cluster member")]
    NodeAlreadyMember(NodeId),

    #[error("node {0} is not a cluster member")]
    NodeNotMember(NodeId),

    #[error("initialize() may only be called on a pristine node")]
    NotPristine,

    #[error("internal channel closed unexpectedly, this is a bug")]
    Fatal,
}

/// The network-error subkinds used both by `RaftError::Network` and by the
/// retry subsystem's classifier.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, thiserror::Error)]
pub enum ErrorType {
    #[error("network timeout")]
    NetworkTimeout,
    #[error("network unreachable")]
    NetworkUnreachable,
    #[error("connection refused")]
    ConnectionRefused,
    #[error("serialization error")]
    SerializationError,
    #[error("protocol error")]
    ProtocolError,
    #[error("temporary failure")]
    TemporaryFailure,
    #[error("permanent failure")]
    PermanentFailure,
    #[error("unknown error")]
    UnknownError,
}

#[derive(Debug, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct NetworkError {
    pub kind: ErrorType,
    pub message: String,
}

impl NetworkError {
    pub fn new(kind: ErrorType, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NetworkTimeout, message)
    }

    pub fn unreachable(message: impl Into<String>) -> Self {
        Self::new(ErrorType::NetworkUnreachable, message)
    }

    pub fn connection_refused(message: impl Into<String>) -> Self {
        Self::new(ErrorType::ConnectionRefused, message)
    }

    /// Classify a transport failure surfaced as `anyhow::Error` by a
    /// `RaftNetwork` implementation. `RaftNetwork` is transport-agnostic, so
    /// this can't downcast to a specific transport's error type; it goes by
    /// the rendered message instead, matching the wording the default
    /// simulator transport (and any real socket transport) uses for these
    /// conditions.
    pub fn classify_transport_error(err: &anyhow::Error) -> Self {
        let message = err.to_string();
        let lower = message.to_lowercase();
        let kind = if lower.contains("timed out") || lower.contains("timeout") {
            ErrorType::NetworkTimeout
        } else if lower.contains("refused") {
            ErrorType::ConnectionRefused
        } else if lower.contains("no route") || lower.contains("not started") || lower.contains("not registered") {
            ErrorType::NetworkUnreachable
        } else if lower.contains("closed") || lower.contains("dropped") {
            ErrorType::TemporaryFailure
        } else {
            ErrorType::UnknownError
        };
        Self::new(kind, message)
    }
}

/// Error returned by `Raft::initialize`.
#[derive(Debug, thiserror::Error)]
pub enum InitializeError {
    #[error("initialize() may only be called on a pristine node")]
    NotPristine,
    #[error(transparent)]
    Fatal(#[from] RaftError),
}

/// Error returned to the client by `submit_command`/`submit_command_with_session`.
#[derive(Debug, thiserror::Error)]
pub enum ClientWriteError {
    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Error returned by `read_state`.
#[derive(Debug, thiserror::Error)]
pub enum ClientReadError {
    #[error(transparent)]
    Raft(#[from] RaftError),
}

/// Error returned by `add_server`/`remove_server`.
#[derive(Debug, thiserror::Error)]
pub enum ChangeMembershipError {
    #[error(transparent)]
    Raft(#[from] RaftError),
}
