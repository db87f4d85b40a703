//! The persistence abstraction: durable storage for term, vote, log entries,
//! and snapshots, plus the pluggable state machine.
//!
//! `Persistence` is an `async_trait` returning `anyhow::Result` everywhere a
//! fallible storage op is exposed.

use std::ops::RangeBounds;

use async_trait::async_trait;

use crate::raft::Entry;
use crate::quorum::ClusterConfiguration;
use crate::raft_types::{LogId, LogIndex, NodeId, Term};

/// A snapshot of the state machine paired with the log position it subsumes.
#[derive(Clone, Debug)]
pub struct Snapshot {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub membership: ClusterConfiguration,
    pub state_machine_state: Vec<u8>,
}

/// The durable `(current_term, voted_for)` pair.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Everything `RaftCore` needs to recover volatile state on startup.
#[derive(Clone, Debug)]
pub struct InitialState {
    pub last_log_id: LogId,
    pub last_applied: LogIndex,
    pub hard_state: HardState,
    pub membership: ClusterConfiguration,
}

impl InitialState {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            last_log_id: LogId::none(),
            last_applied: 0,
            hard_state: HardState::default(),
            membership: ClusterConfiguration::new_initial(id),
        }
    }
}

/// The durable store for a single Raft node's persistent state and the
/// user-supplied state machine it drives.
///
/// Every mutating method must be durable before it returns; `RaftCore` never
/// responds to an RPC that depends on a write until the write's future
/// resolves.
#[async_trait]
pub trait Persistence: Send + Sync + 'static {
    /// Read whatever of `InitialState` exists on disk, or sensible initial
    /// values for a pristine node.
    async fn get_initial_state(&self) -> anyhow::Result<InitialState>;

    async fn get_membership_config(&self) -> anyhow::Result<ClusterConfiguration>;

    async fn save_hard_state(&self, hard_state: &HardState) -> anyhow::Result<()>;

    async fn get_log_entries<R: RangeBounds<LogIndex> + Send>(&self, range: R) -> anyhow::Result<Vec<Entry>>;

    async fn try_get_log_entry(&self, index: LogIndex) -> anyhow::Result<Option<Entry>>;

    async fn get_last_log_id(&self) -> anyhow::Result<LogId>;

    /// Remove every entry with `index >= from_index`, used on AppendEntries
    /// conflict truncation.
    async fn delete_logs_from(&self, from_index: LogIndex) -> anyhow::Result<()>;

    async fn append_to_log(&self, entries: &[Entry]) -> anyhow::Result<()>;

    /// Apply a contiguous run of already-committed entries to the state
    /// machine, returning each entry's result in order.
    async fn apply_to_state_machine(&self, entries: &[Entry]) -> anyhow::Result<Vec<Vec<u8>>>;

    /// Read the state machine's current serialized bytes without applying
    /// anything, used by the linearizable read path once a quorum of
    /// followers has acknowledged the leader's term.
    async fn read_state_machine(&self) -> anyhow::Result<Vec<u8>>;

    /// Approximate size, in bytes, of the log entries currently retained.
    /// Compared against `snapshot_threshold_bytes` to decide when to compact.
    async fn log_size_bytes(&self) -> anyhow::Result<u64>;

    /// Produce a new snapshot of the state machine's current bytes and
    /// install it, deleting log entries it subsumes.
    async fn do_log_compaction(&self) -> anyhow::Result<Snapshot>;

    /// Begin receiving a new snapshot stream; returns a writable handle the
    /// core appends `InstallSnapshot` chunks into.
    async fn begin_receiving_snapshot(&self) -> anyhow::Result<Box<dyn SnapshotWriter>>;

    async fn finalize_snapshot_installation(
        &self,
        meta: SnapshotMeta,
        snapshot: Box<dyn SnapshotWriter>,
    ) -> anyhow::Result<()>;

    async fn get_current_snapshot(&self) -> anyhow::Result<Option<Snapshot>>;
}

#[derive(Clone, Debug)]
pub struct SnapshotMeta {
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    pub membership: ClusterConfiguration,
}

/// An in-progress snapshot receive buffer, written to chunk by chunk as
/// `InstallSnapshot` RPCs arrive.
pub trait SnapshotWriter: Send + Sync {
    fn write_at(&mut self, offset: u64, data: &[u8]);
    fn into_bytes(self: Box<Self>) -> Vec<u8>;
}

/// A plain in-memory implementation usable by any `Persistence` impl that
/// doesn't need its own chunk bookkeeping.
#[derive(Default)]
pub struct BufferedSnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter for BufferedSnapshotWriter {
    fn write_at(&mut self, offset: u64, data: &[u8]) {
        let offset = offset as usize;
        if self.buf.len() < offset + data.len() {
            self.buf.resize(offset + data.len(), 0);
        }
        self.buf[offset..offset + data.len()].copy_from_slice(data);
    }

    fn into_bytes(self: Box<Self>) -> Vec<u8> {
        self.buf
    }
}

/// A debug-only extension that lets test fixtures peek at state without
/// going through the async trait boundary, used by assertion helpers in
/// `tests/fixtures`.
#[async_trait]
pub trait PersistenceDebug: Persistence {
    async fn read_hard_state(&self) -> HardState;
}
