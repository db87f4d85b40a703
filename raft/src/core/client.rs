//! Client-visible operations: `submit_command`/`submit_command_with_session`,
//! `read_state`, and the machinery that advances `commit_index`, applies
//! committed entries to the state machine, and fulfills the commit waiter.
//!
//! `append_and_replicate` assigns the next `LogId`, persists, and triggers
//! replication; `handle_client_read` is the quorum-heartbeat linearizable
//! read path; `advance_commit_index` catches up any skipped entries before
//! applying the requested one.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::oneshot;

use crate::error::{ClientReadError, ClientWriteError, RaftError};
use crate::metrics::State;
use crate::network::RaftNetwork;
use crate::quorum::ClusterConfiguration;
use crate::raft::{AppendEntriesRequest, ClientWriteRequest, ClientWriteResponse, Entry, EntryPayload};
use crate::raft_types::LogId;
use crate::replication::RaftEvent;
use crate::storage::Persistence;

use super::RaftCore;

impl<N, S> RaftCore<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    #[tracing::instrument(level = "debug", skip(self, request), fields(id = self.id))]
    pub(crate) async fn handle_client_write(
        &mut self,
        request: ClientWriteRequest,
    ) -> Result<ClientWriteResponse, ClientWriteError> {
        if !self.is_leader() {
            return Err(ClientWriteError::Raft(RaftError::NotLeader(self.id)));
        }

        if let Some((client_id, serial)) = &request.session {
            if let Some(cached) = self.sessions.cached_response(client_id, *serial) {
                return Ok(ClientWriteResponse { index: self.last_applied, data: cached });
            }
        }

        let log_id = LogId::new(self.current_term, self.last_log_id.index + 1);
        let rx = self.append_and_replicate(log_id, request.payload.clone(), request.timeout).await;

        match rx.await {
            Ok(Ok(data)) => {
                if let Some((client_id, serial)) = request.session {
                    self.sessions.record(client_id, serial, data.clone());
                }
                Ok(ClientWriteResponse { index: log_id.index, data })
            }
            Ok(Err(raft_err)) => Err(ClientWriteError::Raft(raft_err)),
            Err(_) => Err(ClientWriteError::Raft(RaftError::Fatal)),
        }
    }

    /// Persist a new entry at `log_id`, register a commit waiter for it, and
    /// kick every replication stream. Returns the waiter's receiver.
    pub(crate) async fn append_and_replicate(
        &mut self,
        log_id: LogId,
        payload: EntryPayload,
        timeout: Option<Duration>,
    ) -> oneshot::Receiver<Result<Vec<u8>, RaftError>> {
        let entry = Entry { log_id, payload };
        let rx = self.commit_waiter.register(log_id.index, timeout);

        if let Err(e) = self.storage.append_to_log(std::slice::from_ref(&entry)).await {
            self.commit_waiter.cancel_for_index(log_id.index, format!("persistence error: {}", e));
            return rx;
        }
        self.last_log_id = log_id;
        self.publish_metrics();

        let total_members = self.membership.all_nodes().len();
        if total_members <= 1 {
            // Single-node cluster: the leader's own persistence is already a quorum.
            self.advance_commit_index(log_id.index).await;
        } else if let Some(leader) = &self.leader_state {
            let entry = Arc::new(entry);
            for stream in leader.streams.values() {
                let _ = stream
                    .repl_tx
                    .send(RaftEvent::Replicate { entry: entry.clone(), commit_index: self.commit_index });
            }
        }
        rx
    }

    /// The linearizable read path. Single-node clusters return immediately;
    /// otherwise a heartbeat round must be acknowledged by a quorum before
    /// the state machine's current value is safe to return.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    pub(crate) async fn handle_client_read(&mut self, timeout: Option<Duration>) -> Result<Vec<u8>, ClientReadError> {
        if !self.is_leader() {
            return Err(ClientReadError::Raft(RaftError::NotLeader(self.id)));
        }
        let total_members = self.membership.all_nodes().len();
        if total_members <= 1 {
            return self.read_local_state().await;
        }

        let peers: Vec<_> = self.membership.all_nodes().into_iter().filter(|id| *id != self.id).collect();
        let request = AppendEntriesRequest {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index: self.last_log_id.index,
            prev_log_term: self.last_log_id.term,
            entries: vec![],
            leader_commit: self.commit_index,
        };
        let network = self.network.clone();
        let rpc_timeout = timeout.unwrap_or_else(|| self.config.rpc_timeout_duration());
        let peer_ids = peers.clone();
        let futures = peers.into_iter().map(|peer| {
            let network = network.clone();
            let request = request.clone();
            async move { tokio::time::timeout(rpc_timeout, network.send_append_entries(peer, request)).await }
        });
        let results = join_all(futures).await;

        let mut acked_ids: std::collections::BTreeSet<_> = std::iter::once(self.id).collect();
        for (peer, result) in peer_ids.into_iter().zip(results) {
            if let Ok(Ok(resp)) = result {
                if resp.term > self.current_term {
                    let new_term = resp.term;
                    self.step_down(new_term).await;
                    return Err(ClientReadError::Raft(RaftError::LeadershipLost {
                        old_term: self.current_term,
                        new_term,
                    }));
                }
                if resp.success {
                    acked_ids.insert(peer);
                }
            }
        }

        if self.membership.has_quorum(|node| acked_ids.contains(&node)) {
            self.read_local_state().await
        } else {
            Err(ClientReadError::Raft(RaftError::CommitTimeout {
                index: self.commit_index,
                duration_ms: rpc_timeout.as_millis() as u64,
            }))
        }
    }

    async fn read_local_state(&mut self) -> Result<Vec<u8>, ClientReadError> {
        self.storage.read_state_machine().await.map_err(|e| ClientReadError::Raft(RaftError::Persistence(e)))
    }

    /// Advance `commit_index` to `new_commit_index` and apply every entry in
    /// `(last_applied, new_commit_index]` to the state machine in order,
    /// fulfilling the commit waiter for each as it resolves.
    pub(crate) async fn advance_commit_index(&mut self, new_commit_index: u64) {
        if new_commit_index <= self.commit_index {
            return;
        }
        self.commit_index = new_commit_index;

        let entries = match self.storage.get_log_entries(self.last_applied + 1..=new_commit_index).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::error!(error = %e, "failed to read entries pending application, this is a bug");
                return;
            }
        };

        for config_entry in entries.iter().filter(|e| matches!(e.payload, EntryPayload::Configuration(_))) {
            if let EntryPayload::Configuration(config) = &config_entry.payload {
                self.handle_committed_configuration(config.clone(), config_entry.log_id.index).await;
            }
        }

        let results = match self.storage.apply_to_state_machine(&entries).await {
            Ok(results) => results,
            Err(e) => {
                tracing::error!(error = %e, "state machine application failed, this is a bug");
                return;
            }
        };
        if let Some(last) = entries.last() {
            self.last_applied = last.log_id.index;
        }

        let mut results_by_index = std::collections::BTreeMap::new();
        for (entry, result) in entries.iter().zip(results.into_iter()) {
            results_by_index.insert(entry.log_id.index, result);
        }
        self.commit_waiter.notify_committed_and_applied(new_commit_index, |index| {
            Ok(results_by_index.remove(&index).unwrap_or_default())
        });

        self.publish_metrics();
    }

    async fn handle_committed_configuration(&mut self, config: ClusterConfiguration, committed_index: u64) {
        if let Some(next) = self.config_sync.notify_committed(&config, committed_index) {
            let log_id = LogId::new(self.current_term, self.last_log_id.index + 1);
            let final_targets = next.all_nodes();
            let _ = self.append_and_replicate(log_id, EntryPayload::Configuration(next), None).await;
            // C_new has landed in the log: a peer dropped by this change no
            // longer needs replicating to once it's committed below.
            self.sync_leader_streams(&final_targets);
        }
        let still_member = config.contains(self.id);
        self.membership = config;
        if !still_member && self.is_leader() {
            self.target_state = State::Follower;
            self.current_leader = None;
            self.leader_state = None;
        }
    }
}
