//! A Raft consensus library built around a single-task actor core: one
//! `RaftCore` owns all mutable state and every external entry point (RPCs,
//! client calls, timers, replication updates) is delivered to it as a
//! message. See [`Raft`] for the client-facing handle.
//!
//! `raft.rs` holds the public API and wire types, `core/` the state
//! machine, `replication/` per-peer catch-up, `storage.rs`/`network.rs`
//! the pluggable abstractions.

pub mod commit_waiter;
pub mod config;
pub mod config_sync;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod quorum;
pub mod raft;
pub mod raft_types;
mod replication;
pub mod retry;
pub mod session;
pub mod state_machine;
pub mod storage;

pub use config::{Config, ConfigBuilder};
pub use error::{
    ChangeMembershipError, ClientReadError, ClientWriteError, ConfigError, InitializeError, NetworkError, RaftError,
};
pub use metrics::{RaftMetrics, State, Wait, WaitError};
pub use network::{Codec, JsonCodec, RaftNetwork, RpcEnvelope, RpcResponseEnvelope};
pub use quorum::ClusterConfiguration;
pub use raft::{
    AppendEntriesRequest, AppendEntriesResponse, ClientWriteRequest, ClientWriteResponse, Entry, EntryPayload,
    InstallSnapshotRequest, InstallSnapshotResponse, Raft, RequestVoteRequest, RequestVoteResponse,
};
pub use raft_types::{ClientId, LogId, LogIndex, NodeId, SerialId, Term};
pub use retry::{ErrorClassification, ErrorHandler, RetryPolicy};
pub use state_machine::StateMachine;
pub use storage::{HardState, InitialState, Persistence, PersistenceDebug, Snapshot, SnapshotMeta, SnapshotWriter};
