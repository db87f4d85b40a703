//! Per-peer replication stream.
//!
//! No separate line-rate/lagging/snapshotting `TargetReplState` machine.
//! Each stream is a
//! single task alternating between a heartbeat tick and draining its `repl_rx`
//! channel, always sending whatever `storage` currently holds between
//! `next_index` and the leader's last log index; it falls back to
//! `InstallSnapshot` automatically once `next_index` is behind the leader's
//! retained log.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, timeout};

use crate::config::Config;
use crate::core::InternalEvent;
use crate::error::NetworkError;
use crate::network::RaftNetwork;
use crate::raft::{AppendEntriesRequest, Entry, InstallSnapshotRequest};
use crate::raft_types::{LogId, LogIndex, NodeId, Term};
use crate::retry::ErrorHandler;
use crate::storage::Persistence;

/// An event sent from the core to a replication stream.
pub(crate) enum RaftEvent {
    /// A new entry was appended to the leader's log and needs replicating.
    Replicate { entry: Arc<Entry>, commit_index: LogIndex },
    /// The stream's target is no longer a cluster member; shut down.
    Terminate,
}

/// The handle a `RaftCore` holds for a running replication stream.
pub(crate) struct ReplicationStream {
    pub repl_tx: mpsc::UnboundedSender<RaftEvent>,
    #[allow(dead_code)]
    pub handle: JoinHandle<()>,
}

impl ReplicationStream {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn spawn<N, S>(
        id: NodeId,
        target: NodeId,
        term: Term,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        last_log_index: LogIndex,
        core_tx: mpsc::UnboundedSender<InternalEvent>,
    ) -> Self
    where
        N: RaftNetwork + 'static,
        S: Persistence + 'static,
    {
        let (repl_tx, repl_rx) = mpsc::unbounded_channel();
        let core = ReplicationCore {
            id,
            target,
            term,
            config,
            network,
            storage,
            core_tx,
            repl_rx,
            next_index: last_log_index + 1,
            matched: LogId::none(),
            commit_index: 0,
            last_log_index,
            error_handler: ErrorHandler::default(),
        };
        let handle = tokio::spawn(core.main());
        Self { repl_tx, handle }
    }
}

struct ReplicationCore<N, S> {
    id: NodeId,
    target: NodeId,
    term: Term,
    config: Arc<Config>,
    network: Arc<N>,
    storage: Arc<S>,
    core_tx: mpsc::UnboundedSender<InternalEvent>,
    repl_rx: mpsc::UnboundedReceiver<RaftEvent>,

    next_index: LogIndex,
    matched: LogId,
    commit_index: LogIndex,
    last_log_index: LogIndex,
    /// Governs retry/backoff for this stream's AppendEntries and
    /// InstallSnapshot sends (§4.7); exhausting retries just leaves
    /// `match_index`/`next_index` unchanged for this round rather than
    /// surfacing anywhere — the commit waiter times out independently.
    error_handler: ErrorHandler,
}

impl<N, S> ReplicationCore<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    #[tracing::instrument(level = "trace", skip(self), fields(id = self.id, target = self.target))]
    async fn main(mut self) {
        self.send_append_entries().await;
        let heartbeat_interval = self.config.heartbeat_interval_duration();
        let mut heartbeat = interval(heartbeat_interval);

        loop {
            tokio::select! {
                _ = heartbeat.tick() => {
                    self.send_append_entries().await;
                }
                event = self.repl_rx.recv() => {
                    match event {
                        Some(RaftEvent::Replicate { entry, commit_index }) => {
                            self.commit_index = commit_index;
                            self.last_log_index = entry.log_id.index;
                            self.send_append_entries().await;
                        }
                        Some(RaftEvent::Terminate) | None => return,
                    }
                }
            }
        }
    }

    /// Send whatever the target needs next: a chunk of the log starting at
    /// `next_index`, or an `InstallSnapshot` chunk if that index has already
    /// been compacted away.
    async fn send_append_entries(&mut self) {
        let prev_log_index = self.next_index.saturating_sub(1);
        let prev_log_term = if prev_log_index == 0 {
            0
        } else {
            match self.storage.try_get_log_entry(prev_log_index).await {
                Ok(Some(entry)) => entry.log_id.term,
                Ok(None) => {
                    // The entry at prev_log_index has been compacted away; the
                    // target must be caught up via snapshot instead.
                    self.send_install_snapshot().await;
                    return;
                }
                Err(e) => {
                    tracing::warn!(error = %e, target = self.target, "failed reading prev_log_entry for replication");
                    return;
                }
            }
        };

        let stop = (self.next_index + self.config.max_entries_per_append).min(self.last_log_index + 1);
        let entries = if self.next_index <= self.last_log_index {
            match self.storage.get_log_entries(self.next_index..stop).await {
                Ok(entries) => entries,
                Err(e) => {
                    tracing::warn!(error = %e, target = self.target, "failed reading log entries for replication");
                    return;
                }
            }
        } else {
            Vec::new()
        };

        self.send_one_append_entries(prev_log_index, prev_log_term, entries).await;
    }

    async fn send_one_append_entries(&mut self, prev_log_index: LogIndex, prev_log_term: Term, entries: Vec<Entry>) {
        let last_sent = entries.last().map(|e| e.log_id);
        let policy = if entries.is_empty() { "heartbeat" } else { "append_entries" };
        let request = AppendEntriesRequest {
            term: self.term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term,
            entries,
            leader_commit: self.commit_index,
        };

        let network = self.network.clone();
        let rpc_timeout = self.config.rpc_timeout_duration();
        let target = self.target;
        let result = self
            .error_handler
            .execute_with_retry(policy, || {
                let network = network.clone();
                let request = request.clone();
                async move {
                    match timeout(rpc_timeout, network.send_append_entries(target, request)).await {
                        Ok(Ok(response)) => Ok(response),
                        Ok(Err(e)) => Err(NetworkError::classify_transport_error(&e)),
                        Err(_) => Err(NetworkError::timeout("append_entries rpc timed out")),
                    }
                }
            })
            .await;
        let response = match result {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, target = self.target, "append_entries rpc failed after retries, will retry on next heartbeat");
                return;
            }
        };

        if response.term > self.term {
            let _ = self.core_tx.send(InternalEvent::HigherTermObserved { term: response.term });
            return;
        }

        if response.success {
            if let Some(log_id) = last_sent {
                self.matched = log_id;
                self.next_index = log_id.index + 1;
                let _ = self.core_tx.send(InternalEvent::ReplicationMatched { target: self.target, matched: log_id });
            }
            return;
        }

        self.next_index = match (response.conflict_index, response.conflict_term) {
            (Some(_), Some(conflict_term)) => self.first_index_of_term(conflict_term, prev_log_index).await,
            (Some(conflict_index), None) => conflict_index,
            _ => prev_log_index.saturating_sub(1).max(1),
        };
        let _ = self.core_tx.send(InternalEvent::ReplicationNextIndex { target: self.target, next_index: self.next_index });
    }

    /// Backtrack to the first index of `conflict_term` in our own log, so the
    /// next AppendEntries skips the whole mismatched term at once.
    async fn first_index_of_term(&self, conflict_term: Term, before_or_at: LogIndex) -> LogIndex {
        let mut probe = before_or_at;
        let mut first = before_or_at.max(1);
        while probe > 0 {
            match self.storage.try_get_log_entry(probe).await {
                Ok(Some(entry)) if entry.log_id.term == conflict_term => {
                    first = probe;
                    probe -= 1;
                }
                _ => break,
            }
        }
        first
    }

    /// Stream the current snapshot to the target in `snapshot_chunk_size`
    /// chunks, then resume log replication from just past it.
    async fn send_install_snapshot(&mut self) {
        let snapshot = match self.storage.get_current_snapshot().await {
            Ok(Some(snapshot)) => snapshot,
            Ok(None) => {
                tracing::warn!(target = self.target, "no snapshot available to catch up a lagging follower");
                return;
            }
            Err(e) => {
                tracing::warn!(error = %e, target = self.target, "failed reading snapshot for replication");
                return;
            }
        };

        let chunk_size = self.config.snapshot_chunk_size as usize;
        let data = &snapshot.state_machine_state;
        let mut offset = 0usize;
        loop {
            let end = (offset + chunk_size).min(data.len());
            let done = end >= data.len();
            let request = InstallSnapshotRequest {
                term: self.term,
                leader_id: self.id,
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                configuration: snapshot.membership.clone(),
                offset: offset as u64,
                data: data[offset..end].to_vec(),
                done,
            };

            let network = self.network.clone();
            let rpc_timeout = self.config.rpc_timeout_duration();
            let target = self.target;
            let result = self
                .error_handler
                .execute_with_retry("install_snapshot", || {
                    let network = network.clone();
                    let request = request.clone();
                    async move {
                        match timeout(rpc_timeout, network.send_install_snapshot(target, request)).await {
                            Ok(Ok(response)) => Ok(response),
                            Ok(Err(e)) => Err(NetworkError::classify_transport_error(&e)),
                            Err(_) => Err(NetworkError::timeout("install_snapshot rpc timed out")),
                        }
                    }
                })
                .await;
            match result {
                Ok(response) if response.term > self.term => {
                    let _ = self.core_tx.send(InternalEvent::HigherTermObserved { term: response.term });
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, target = self.target, "install_snapshot rpc failed after retries");
                    return;
                }
            }

            if done {
                break;
            }
            offset = end;
        }

        let matched = LogId::new(snapshot.last_included_term, snapshot.last_included_index);
        self.matched = matched;
        self.next_index = matched.index + 1;
        let _ = self.core_tx.send(InternalEvent::ReplicationMatched { target: self.target, matched });
    }
}
