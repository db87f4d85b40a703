//! The user-supplied deterministic state machine contract.
//!
//! Runs synchronously on the core's apply path: implementations must be
//! fast and non-blocking. The `apply`/`get_state`/`restore_from_snapshot`
//! triad covers command application, linearizable reads, and snapshot
//! restore.
use crate::raft_types::LogIndex;

/// A deterministic `apply(bytes, index) -> bytes` function plus snapshot
/// support. Identical inputs must yield identical outputs on every replica.
pub trait StateMachine: Send + Sync + 'static {
    /// Apply one committed command, returning the client-visible result.
    fn apply(&mut self, index: LogIndex, command: &[u8]) -> anyhow::Result<Vec<u8>>;

    /// Serialize the entire state for snapshotting.
    fn get_state(&self) -> Vec<u8>;

    /// Restore from a previously captured snapshot.
    fn restore_from_snapshot(&mut self, state: &[u8]);
}
