//! An in-memory `Persistence` implementation for tests and demos.
//!
//! An `Arc`-shared, `RwLock`-guarded store with no actual durability: a
//! `BTreeMap<LogIndex, Entry>` log, a `HardState`, and an `Option<Snapshot>`,
//! plus whatever user `StateMachine` the caller supplies. Nothing here
//! survives a process restart; that's the point.

use std::collections::BTreeMap;
use std::ops::RangeBounds;
use std::sync::RwLock;

use async_trait::async_trait;

use raft::quorum::ClusterConfiguration;
use raft::raft::{Entry, EntryPayload};
use raft::raft_types::{LogId, LogIndex, NodeId};
use raft::state_machine::StateMachine;
use raft::storage::{
    BufferedSnapshotWriter, HardState, InitialState, Persistence, PersistenceDebug, Snapshot, SnapshotMeta,
    SnapshotWriter,
};

/// A rough per-entry byte cost: the command/configuration payload plus a
/// fixed overhead for the `LogId` and payload tag, good enough to compare
/// against `snapshot_threshold_bytes` without a real serializer on hand.
fn entry_byte_size(entry: &Entry) -> u64 {
    const OVERHEAD: u64 = 24;
    let payload_len = match &entry.payload {
        EntryPayload::Normal(data) => data.len(),
        EntryPayload::Configuration(_) => 64,
        EntryPayload::Blank | EntryPayload::PurgedMarker => 0,
    };
    OVERHEAD + payload_len as u64
}

/// The in-memory store itself. `S` is the caller's deterministic state
/// machine; `MemStore` only owns the replicated log and hard state, handing
/// committed commands to `S` one at a time in order.
pub struct MemStore<S: StateMachine> {
    id: NodeId,
    log: RwLock<BTreeMap<LogIndex, Entry>>,
    hard_state: RwLock<HardState>,
    last_applied: RwLock<LogIndex>,
    snapshot: RwLock<Option<Snapshot>>,
    state_machine: RwLock<S>,
}

impl<S: StateMachine> MemStore<S> {
    pub fn new(id: NodeId, state_machine: S) -> Self {
        Self {
            id,
            log: RwLock::new(BTreeMap::new()),
            hard_state: RwLock::new(HardState::default()),
            last_applied: RwLock::new(0),
            snapshot: RwLock::new(None),
            state_machine: RwLock::new(state_machine),
        }
    }

    /// The latest `ClusterConfiguration` visible in the log (or snapshot, if
    /// the configuring entry has since been compacted away).
    fn membership_locked(&self) -> ClusterConfiguration {
        let log = self.log.read().unwrap();
        for entry in log.values().rev() {
            if let EntryPayload::Configuration(config) = &entry.payload {
                return config.clone();
            }
        }
        drop(log);
        match &*self.snapshot.read().unwrap() {
            Some(snap) => snap.membership.clone(),
            None => ClusterConfiguration::new_initial(self.id),
        }
    }
}

#[async_trait]
impl<S: StateMachine> Persistence for MemStore<S> {
    async fn get_initial_state(&self) -> anyhow::Result<InitialState> {
        let hard_state = *self.hard_state.read().unwrap();
        let last_applied = *self.last_applied.read().unwrap();
        let last_log_id = {
            let log = self.log.read().unwrap();
            match log.values().next_back() {
                Some(entry) => entry.log_id,
                None => match &*self.snapshot.read().unwrap() {
                    Some(snap) => LogId::new(snap.last_included_term, snap.last_included_index),
                    None => LogId::none(),
                },
            }
        };
        Ok(InitialState { last_log_id, last_applied, hard_state, membership: self.membership_locked() })
    }

    async fn get_membership_config(&self) -> anyhow::Result<ClusterConfiguration> {
        Ok(self.membership_locked())
    }

    async fn save_hard_state(&self, hard_state: &HardState) -> anyhow::Result<()> {
        *self.hard_state.write().unwrap() = *hard_state;
        Ok(())
    }

    async fn get_log_entries<R: RangeBounds<LogIndex> + Send>(&self, range: R) -> anyhow::Result<Vec<Entry>> {
        Ok(self.log.read().unwrap().range(range).map(|(_, entry)| entry.clone()).collect())
    }

    async fn try_get_log_entry(&self, index: LogIndex) -> anyhow::Result<Option<Entry>> {
        Ok(self.log.read().unwrap().get(&index).cloned())
    }

    async fn get_last_log_id(&self) -> anyhow::Result<LogId> {
        let log = self.log.read().unwrap();
        Ok(match log.values().next_back() {
            Some(entry) => entry.log_id,
            None => match &*self.snapshot.read().unwrap() {
                Some(snap) => LogId::new(snap.last_included_term, snap.last_included_index),
                None => LogId::none(),
            },
        })
    }

    async fn delete_logs_from(&self, from_index: LogIndex) -> anyhow::Result<()> {
        self.log.write().unwrap().split_off(&from_index);
        Ok(())
    }

    async fn append_to_log(&self, entries: &[Entry]) -> anyhow::Result<()> {
        let mut log = self.log.write().unwrap();
        for entry in entries {
            log.insert(entry.log_id.index, entry.clone());
        }
        Ok(())
    }

    async fn apply_to_state_machine(&self, entries: &[Entry]) -> anyhow::Result<Vec<Vec<u8>>> {
        let mut sm = self.state_machine.write().unwrap();
        let mut results = Vec::with_capacity(entries.len());
        for entry in entries {
            let result = match &entry.payload {
                EntryPayload::Normal(data) => sm.apply(entry.log_id.index, data)?,
                EntryPayload::Blank | EntryPayload::Configuration(_) | EntryPayload::PurgedMarker => Vec::new(),
            };
            *self.last_applied.write().unwrap() = entry.log_id.index;
            results.push(result);
        }
        Ok(results)
    }

    async fn read_state_machine(&self) -> anyhow::Result<Vec<u8>> {
        Ok(self.state_machine.read().unwrap().get_state())
    }

    async fn log_size_bytes(&self) -> anyhow::Result<u64> {
        let log = self.log.read().unwrap();
        Ok(log.values().map(|e| entry_byte_size(e)).sum())
    }

    async fn do_log_compaction(&self) -> anyhow::Result<Snapshot> {
        let last_applied = *self.last_applied.read().unwrap();
        let last_included_term = {
            let log = self.log.read().unwrap();
            log.get(&last_applied).map(|e| e.log_id.term).unwrap_or(0)
        };
        let membership = self.membership_locked();
        let state_machine_state = self.state_machine.read().unwrap().get_state();
        let snapshot = Snapshot {
            last_included_index: last_applied,
            last_included_term,
            membership,
            state_machine_state,
        };

        {
            let mut log = self.log.write().unwrap();
            let retained = log.split_off(&(last_applied + 1));
            *log = retained;
        }
        *self.snapshot.write().unwrap() = Some(snapshot.clone());
        Ok(snapshot)
    }

    async fn begin_receiving_snapshot(&self) -> anyhow::Result<Box<dyn SnapshotWriter>> {
        Ok(Box::new(BufferedSnapshotWriter::default()))
    }

    async fn finalize_snapshot_installation(
        &self,
        meta: SnapshotMeta,
        snapshot: Box<dyn SnapshotWriter>,
    ) -> anyhow::Result<()> {
        let state_machine_state = snapshot.into_bytes();
        self.state_machine.write().unwrap().restore_from_snapshot(&state_machine_state);
        *self.last_applied.write().unwrap() = meta.last_included_index;
        self.log.write().unwrap().retain(|index, _| *index > meta.last_included_index);
        *self.snapshot.write().unwrap() = Some(Snapshot {
            last_included_index: meta.last_included_index,
            last_included_term: meta.last_included_term,
            membership: meta.membership,
            state_machine_state,
        });
        Ok(())
    }

    async fn get_current_snapshot(&self) -> anyhow::Result<Option<Snapshot>> {
        Ok(self.snapshot.read().unwrap().clone())
    }
}

#[async_trait]
impl<S: StateMachine> PersistenceDebug for MemStore<S> {
    async fn read_hard_state(&self) -> HardState {
        *self.hard_state.read().unwrap()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use raft::raft_types::LogId;

    struct NullStateMachine;
    impl StateMachine for NullStateMachine {
        fn apply(&mut self, _index: LogIndex, command: &[u8]) -> anyhow::Result<Vec<u8>> {
            Ok(command.to_vec())
        }
        fn get_state(&self) -> Vec<u8> {
            Vec::new()
        }
        fn restore_from_snapshot(&mut self, _state: &[u8]) {}
    }

    #[tokio::test]
    async fn initial_state_of_a_pristine_store_is_empty() {
        let store = MemStore::new(1, NullStateMachine);
        let initial = store.get_initial_state().await.unwrap();
        assert_eq!(initial.last_log_id, LogId::none());
        assert_eq!(initial.last_applied, 0);
        assert_eq!(initial.hard_state, HardState::default());
    }

    #[tokio::test]
    async fn append_and_read_back_log_entries() {
        let store = MemStore::new(1, NullStateMachine);
        let entries = vec![
            Entry::new_blank(LogId::new(1, 1)),
            Entry::new_normal(LogId::new(1, 2), b"hello".to_vec()),
        ];
        store.append_to_log(&entries).await.unwrap();
        assert_eq!(store.get_last_log_id().await.unwrap(), LogId::new(1, 2));
        let fetched = store.get_log_entries(1..=2).await.unwrap();
        assert_eq!(fetched.len(), 2);
    }

    #[tokio::test]
    async fn delete_logs_from_truncates_the_conflicting_suffix() {
        let store = MemStore::new(1, NullStateMachine);
        let entries = vec![
            Entry::new_blank(LogId::new(1, 1)),
            Entry::new_blank(LogId::new(1, 2)),
            Entry::new_blank(LogId::new(1, 3)),
        ];
        store.append_to_log(&entries).await.unwrap();
        store.delete_logs_from(2).await.unwrap();
        assert_eq!(store.get_last_log_id().await.unwrap(), LogId::new(1, 1));
    }

    #[tokio::test]
    async fn apply_to_state_machine_advances_last_applied() {
        let store = MemStore::new(1, NullStateMachine);
        let entries = vec![Entry::new_normal(LogId::new(1, 1), b"cmd".to_vec())];
        store.append_to_log(&entries).await.unwrap();
        let results = store.apply_to_state_machine(&entries).await.unwrap();
        assert_eq!(results, vec![b"cmd".to_vec()]);
        assert_eq!(store.get_initial_state().await.unwrap().last_applied, 1);
    }

    #[tokio::test]
    async fn log_compaction_snapshots_and_trims_applied_entries() {
        let store = MemStore::new(1, NullStateMachine);
        let entries = vec![
            Entry::new_normal(LogId::new(1, 1), b"a".to_vec()),
            Entry::new_normal(LogId::new(1, 2), b"b".to_vec()),
        ];
        store.append_to_log(&entries).await.unwrap();
        store.apply_to_state_machine(&entries).await.unwrap();
        let snapshot = store.do_log_compaction().await.unwrap();
        assert_eq!(snapshot.last_included_index, 2);
        assert!(store.try_get_log_entry(1).await.unwrap().is_none());
        assert!(store.try_get_log_entry(2).await.unwrap().is_none());
    }
}
