//! The single-task Raft state machine.
//!
//! `RaftCore` owns every piece of mutable Raft state and runs as one
//! `tokio::task`; every external entry point (RPC, client call, timer tick,
//! replication-stream update) is delivered to it as a message and processed
//! one at a time. This serializes every state transition without an
//! explicit `Mutex` — there's exactly one task with `&mut self` access.

mod admin;
mod append_entries;
mod client;
mod election;
mod install_snapshot;

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{AbortHandle, Abortable};
use rand::Rng;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::commit_waiter::CommitWaiter;
use crate::config::Config;
use crate::config_sync::ConfigurationSynchronizer;
use crate::error::RaftError;
use crate::metrics::{LeaderMetrics, RaftMetrics, State};
use crate::network::RaftNetwork;
use crate::quorum::ClusterConfiguration;
use crate::raft::{RaftMsg, RaftMsgTx};
use crate::raft_types::{LogId, LogIndex, NodeId, Term};
use crate::replication::{RaftEvent, ReplicationStream};
use crate::session::SessionTable;
use crate::storage::{Persistence, Snapshot};

/// Events generated internally (timers, vote responses, replication-stream
/// updates) and fed back into the same processing loop as external `RaftMsg`s.
pub(crate) enum InternalEvent {
    ElectionTimeout,
    HeartbeatTick,
    Tick,
    VoteResponse { term_of_request: Term, voter: NodeId, granted: bool, voter_term: Term },
    ReplicationMatched { target: NodeId, matched: LogId },
    ReplicationNextIndex { target: NodeId, next_index: LogIndex },
    HigherTermObserved { term: Term },
    CompactionFinished(anyhow::Result<Snapshot>),
}

struct LeaderState {
    next_index: BTreeMap<NodeId, LogIndex>,
    match_index: BTreeMap<NodeId, LogIndex>,
    streams: BTreeMap<NodeId, ReplicationStream>,
}

pub(crate) struct RaftCore<N, S>
where
    N: RaftNetwork,
    S: Persistence,
{
    pub(crate) id: NodeId,
    pub(crate) config: Arc<Config>,
    pub(crate) network: Arc<N>,
    pub(crate) storage: Arc<S>,

    pub(crate) current_term: Term,
    pub(crate) voted_for: Option<NodeId>,
    pub(crate) membership: ClusterConfiguration,

    pub(crate) commit_index: LogIndex,
    pub(crate) last_applied: LogIndex,
    pub(crate) last_log_id: LogId,

    pub(crate) target_state: State,
    pub(crate) current_leader: Option<NodeId>,
    pub(crate) votes_received: BTreeSet<NodeId>,

    election_deadline: Instant,

    pub(crate) commit_waiter: CommitWaiter,
    pub(crate) config_sync: ConfigurationSynchronizer,
    pub(crate) sessions: SessionTable,

    leader_state: Option<LeaderState>,
    snapshot_writer: Option<Box<dyn crate::storage::SnapshotWriter>>,
    current_snapshot: Option<LogId>,
    /// Handle to abort an in-flight background compaction, e.g. when a
    /// leader's `InstallSnapshot` stream makes our own compaction moot.
    compacting: Option<AbortHandle>,

    rx_api: mpsc::UnboundedReceiver<RaftMsg<S>>,
    tx_internal: mpsc::UnboundedSender<InternalEvent>,
    rx_internal: mpsc::UnboundedReceiver<InternalEvent>,
    tx_metrics: watch::Sender<RaftMetrics>,
    rx_shutdown: oneshot::Receiver<()>,
}

impl<N, S> RaftCore<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    pub(crate) fn spawn(
        id: NodeId,
        config: Arc<Config>,
        network: Arc<N>,
        storage: Arc<S>,
        rx_api: mpsc::UnboundedReceiver<RaftMsg<S>>,
        tx_metrics: watch::Sender<RaftMetrics>,
        rx_shutdown: oneshot::Receiver<()>,
    ) -> JoinHandle<Result<(), RaftError>> {
        let (tx_internal, rx_internal) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let core = Self {
                id,
                config,
                network,
                storage,
                current_term: 0,
                voted_for: None,
                membership: ClusterConfiguration::new_initial(id),
                commit_index: 0,
                last_applied: 0,
                last_log_id: LogId::none(),
                target_state: State::Follower,
                current_leader: None,
                votes_received: BTreeSet::new(),
                election_deadline: Instant::now(),
                commit_waiter: CommitWaiter::new(),
                config_sync: ConfigurationSynchronizer::new(),
                sessions: SessionTable::new(10_000),
                leader_state: None,
                snapshot_writer: None,
                current_snapshot: None,
                compacting: None,
                rx_api,
                tx_internal,
                rx_internal,
                tx_metrics,
                rx_shutdown,
            };
            core.main().await
        })
    }

    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    async fn main(mut self) -> Result<(), RaftError> {
        self.config.validate().map_err(|e| RaftError::Protocol(e.to_string()))?;
        let initial = self.storage.get_initial_state().await.map_err(RaftError::Persistence)?;
        self.current_term = initial.hard_state.current_term;
        self.voted_for = initial.hard_state.voted_for;
        self.last_log_id = initial.last_log_id;
        self.last_applied = initial.last_applied;
        self.commit_index = initial.last_applied;
        self.membership = initial.membership;
        self.sessions = SessionTable::new(self.config.session_table_capacity);
        self.reset_election_timer();
        self.publish_metrics();

        let tick_interval = self.config.tick_interval_duration();
        let mut ticker = tokio::time::interval(tick_interval);

        loop {
            tokio::select! {
                biased;
                _ = &mut self.rx_shutdown => {
                    self.handle_shutdown();
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.handle_tick().await;
                }
                Some(event) = self.rx_internal.recv() => {
                    self.handle_internal_event(event).await;
                }
                Some(msg) = self.rx_api.recv() => {
                    self.handle_api_msg(msg).await;
                }
                else => return Ok(()),
            }
        }
    }

    fn handle_shutdown(&mut self) {
        self.commit_waiter.cancel_all("node is shutting down");
        self.config_sync.cancel("node is shutting down");
        self.leader_state = None;
    }

    async fn handle_tick(&mut self) {
        let now = Instant::now();
        if matches!(self.target_state, State::Follower | State::Candidate) && now >= self.election_deadline {
            self.start_election().await;
        }
        let cancelled = self.commit_waiter.cancel_timed_out();
        if cancelled > 0 {
            tracing::debug!(cancelled, "cancelled timed-out commit waiters");
        }
        self.config_sync.handle_timeout();
        self.maybe_compact_log().await;
    }

    /// Any node (leader or follower) may compact its log once it grows past
    /// `snapshot_threshold_bytes`; this is independent of who is leader, since
    /// `do_log_compaction` only trims entries already applied locally.
    ///
    /// Runs on a spawned task so a slow compaction never blocks the core
    /// loop from processing RPCs and client requests in the meantime; the
    /// result comes back as an `InternalEvent::CompactionFinished`. Only one
    /// compaction runs at a time per node.
    async fn maybe_compact_log(&mut self) {
        if self.compacting.is_some() || self.last_applied == 0 {
            return;
        }
        let size = match self.storage.log_size_bytes().await {
            Ok(size) => size,
            Err(e) => {
                tracing::warn!(error = %e, "failed reading log size for compaction check");
                return;
            }
        };
        if size < self.config.snapshot_threshold_bytes {
            return;
        }

        let storage = self.storage.clone();
        let tx_internal = self.tx_internal.clone();
        let (abort_handle, abort_reg) = AbortHandle::new_pair();
        self.compacting = Some(abort_handle);
        tokio::spawn(
            async move {
                let res = Abortable::new(storage.do_log_compaction(), abort_reg).await;
                if let Ok(res) = res {
                    let _ = tx_internal.send(InternalEvent::CompactionFinished(res));
                }
            }
            .instrument(tracing::debug_span!("log compaction")),
        );
    }

    fn handle_compaction_finished(&mut self, result: anyhow::Result<Snapshot>) {
        self.compacting = None;
        match result {
            Ok(snapshot) => {
                let log_id = LogId::new(snapshot.last_included_term, snapshot.last_included_index);
                self.current_snapshot = Some(log_id);
                tracing::info!(
                    last_included_index = snapshot.last_included_index,
                    last_included_term = snapshot.last_included_term,
                    "compacted log into snapshot"
                );
                self.publish_metrics();
            }
            Err(e) => tracing::warn!(error = %e, "log compaction failed"),
        }
    }

    async fn handle_internal_event(&mut self, event: InternalEvent) {
        match event {
            InternalEvent::ElectionTimeout => self.start_election().await,
            InternalEvent::HeartbeatTick | InternalEvent::Tick => {}
            InternalEvent::VoteResponse { term_of_request, voter, granted, voter_term } => {
                self.handle_vote_response(term_of_request, voter, granted, voter_term).await;
            }
            InternalEvent::ReplicationMatched { target, matched } => {
                self.handle_replication_matched(target, matched).await;
            }
            InternalEvent::ReplicationNextIndex { target, next_index } => {
                if let Some(leader) = &mut self.leader_state {
                    leader.next_index.insert(target, next_index);
                }
            }
            InternalEvent::HigherTermObserved { term } => {
                if term > self.current_term {
                    self.step_down(term).await;
                }
            }
            InternalEvent::CompactionFinished(result) => self.handle_compaction_finished(result),
        }
    }

    async fn handle_api_msg(&mut self, msg: RaftMsg<S>) {
        match msg {
            RaftMsg::AppendEntries { request, tx } => {
                let res = self.handle_append_entries_request(request).await;
                let _ = tx.send(res);
            }
            RaftMsg::RequestVote { request, tx } => {
                let res = self.handle_vote_request(request).await;
                let _ = tx.send(res);
            }
            RaftMsg::InstallSnapshot { request, tx } => {
                let res = self.handle_install_snapshot_request(request).await;
                let _ = tx.send(res);
            }
            RaftMsg::ClientWrite { request, tx } => {
                let res = self.handle_client_write(request).await;
                let _ = tx.send(res);
            }
            RaftMsg::ClientRead { timeout, tx } => {
                let res = self.handle_client_read(timeout).await;
                let _ = tx.send(res);
            }
            RaftMsg::Initialize { members, tx } => {
                let res = self.handle_initialize(members).await;
                let _ = tx.send(res);
            }
            RaftMsg::AddServer { id, tx } => {
                self.handle_add_server(id, tx).await;
            }
            RaftMsg::RemoveServer { id, tx } => {
                self.handle_remove_server(id, tx).await;
            }
            RaftMsg::_Phantom(_) => unreachable!(),
        }
    }

    fn reset_election_timer(&mut self) {
        let jitter_ms = rand::thread_rng()
            .gen_range(self.config.election_timeout_min, self.config.election_timeout_max);
        self.election_deadline = Instant::now() + Duration::from_millis(jitter_ms);
    }

    /// Transition to `Follower` on discovering a higher term, clearing
    /// `voted_for` and any leader-only state.
    pub(crate) async fn step_down(&mut self, new_term: Term) {
        let old_term = self.current_term;
        tracing::info!(old_term, new_term, id = self.id, "stepping down: higher term observed");
        self.current_term = new_term;
        self.voted_for = None;
        let _ = self
            .storage
            .save_hard_state(&crate::storage::HardState { current_term: new_term, voted_for: None })
            .await;
        let was_leader = matches!(self.target_state, State::Leader);
        self.target_state = State::Follower;
        self.leader_state = None;
        if was_leader {
            self.commit_waiter.cancel_leadership_lost(old_term, new_term);
            self.config_sync.cancel("leadership lost");
        }
        self.reset_election_timer();
        self.publish_metrics();
    }

    pub(crate) fn publish_metrics(&self) {
        let leader_metrics = self.leader_state.as_ref().map(|leader| LeaderMetrics {
            term: self.current_term,
            replication: leader.match_index.iter().map(|(id, idx)| (*id, LogId::new(self.current_term, *idx))).collect(),
        });
        let metrics = RaftMetrics {
            id: self.id,
            state: self.target_state,
            current_term: self.current_term,
            last_log_index: self.last_log_id.index,
            last_applied: self.last_applied,
            current_leader: self.current_leader,
            membership: self.membership.clone(),
            snapshot: self.current_snapshot,
            leader_metrics,
        };
        let _ = self.tx_metrics.send(metrics);
    }

    pub(crate) fn is_leader(&self) -> bool {
        matches!(self.target_state, State::Leader)
    }

    pub(crate) fn leader_state_mut(&mut self) -> Option<&mut LeaderState> {
        self.leader_state.as_mut()
    }

    /// After becoming leader, initialize per-peer replication state and spawn
    /// each peer's replication stream.
    pub(crate) fn become_leader(&mut self) {
        tracing::info!(id = self.id, term = self.current_term, "becoming leader");
        self.target_state = State::Leader;
        self.current_leader = Some(self.id);
        let mut next_index = BTreeMap::new();
        let mut match_index = BTreeMap::new();
        let mut streams = BTreeMap::new();
        for peer in self.membership.all_nodes() {
            if peer == self.id {
                continue;
            }
            next_index.insert(peer, self.last_log_id.index + 1);
            match_index.insert(peer, 0);
            streams.insert(
                peer,
                ReplicationStream::spawn(
                    self.id,
                    peer,
                    self.current_term,
                    self.config.clone(),
                    self.network.clone(),
                    self.storage.clone(),
                    self.last_log_id.index,
                    self.tx_internal.clone(),
                ),
            );
        }
        self.leader_state = Some(LeaderState { next_index, match_index, streams });
    }

    /// Reconcile per-peer replication streams against `target_nodes` — the
    /// full set this leader must currently replicate to, which during joint
    /// consensus is the union of both the old and new membership. Spawns a
    /// stream for any newly required peer and terminates any peer no longer
    /// in `target_nodes`. No-op if this node isn't leader.
    pub(crate) fn sync_leader_streams(&mut self, target_nodes: &BTreeSet<NodeId>) {
        let id = self.id;
        let leader = match &mut self.leader_state {
            Some(leader) => leader,
            None => return,
        };
        let wanted: BTreeSet<NodeId> = target_nodes.iter().copied().filter(|peer| *peer != id).collect();

        let stale: Vec<NodeId> = leader.streams.keys().copied().filter(|peer| !wanted.contains(peer)).collect();
        for peer in stale {
            if let Some(stream) = leader.streams.remove(&peer) {
                let _ = stream.repl_tx.send(RaftEvent::Terminate);
            }
            leader.next_index.remove(&peer);
            leader.match_index.remove(&peer);
        }

        for peer in wanted {
            if leader.streams.contains_key(&peer) {
                continue;
            }
            leader.next_index.insert(peer, self.last_log_id.index + 1);
            leader.match_index.insert(peer, 0);
            leader.streams.insert(
                peer,
                ReplicationStream::spawn(
                    self.id,
                    peer,
                    self.current_term,
                    self.config.clone(),
                    self.network.clone(),
                    self.storage.clone(),
                    self.last_log_id.index,
                    self.tx_internal.clone(),
                ),
            );
        }
    }

    fn members_excluding_self(&self) -> BTreeSet<NodeId> {
        self.membership.all_nodes().into_iter().filter(|id| *id != self.id).collect()
    }

    async fn handle_replication_matched(&mut self, target: NodeId, matched: LogId) {
        let quorum_met = {
            let leader = match &mut self.leader_state {
                Some(leader) => leader,
                None => return,
            };
            leader.match_index.insert(target, matched.index);
            leader.next_index.insert(target, matched.index + 1);
            let membership = self.membership.clone();
            let match_index = leader.match_index.clone();
            let id = self.id;
            let last_log_id = self.last_log_id;
            let current_term = self.current_term;
            // A quorum over `match_index >= N` where N's term equals current_term.
            let mut candidate = matched.index;
            let mut committed_n = self.commit_index;
            while candidate > self.commit_index {
                let has_quorum = membership.has_quorum(|node| {
                    if node == id {
                        candidate <= last_log_id.index
                    } else {
                        *match_index.get(&node).unwrap_or(&0) >= candidate
                    }
                });
                if has_quorum {
                    committed_n = candidate;
                    break;
                }
                candidate -= 1;
            }
            if committed_n > self.commit_index {
                // only commit if the entry at committed_n is from the leader's current term
                if let Ok(Some(entry)) = self.storage.try_get_log_entry(committed_n).await {
                    if entry.log_id.term == current_term {
                        Some(committed_n)
                    } else {
                        None
                    }
                } else {
                    None
                }
            } else {
                None
            }
        };
        if let Some(new_commit_index) = quorum_met {
            self.advance_commit_index(new_commit_index).await;
        }
    }
}
