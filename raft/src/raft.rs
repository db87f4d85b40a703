//! The wire-format RPC structs, the replicated log entry types, and the
//! public `Raft` handle client code talks to.
//!
//! `Raft<N, S>` is a cheap `Clone` wrapper around an `Arc<RaftInner>` whose
//! methods all translate into a `RaftMsg` sent over an `mpsc` channel to the
//! single `RaftCore` task, with a `oneshot` channel carrying the reply back.
//! This is what lets `RaftCore` own all mutable state without an explicit
//! mutex.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::core::RaftCore;
use crate::error::{ChangeMembershipError, ClientReadError, ClientWriteError, InitializeError, RaftError};
use crate::metrics::{RaftMetrics, Wait};
use crate::network::RaftNetwork;
use crate::quorum::ClusterConfiguration;
use crate::raft_types::{ClientId, LogId, LogIndex, NodeId, SerialId, Term};
use crate::storage::Persistence;

/// A single replicated log entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    pub log_id: LogId,
    pub payload: EntryPayload,
}

impl Entry {
    pub fn new_blank(log_id: LogId) -> Self {
        Self { log_id, payload: EntryPayload::Blank }
    }

    pub fn new_normal(log_id: LogId, data: Vec<u8>) -> Self {
        Self { log_id, payload: EntryPayload::Normal(data) }
    }

    pub fn new_config(log_id: LogId, membership: ClusterConfiguration) -> Self {
        Self { log_id, payload: EntryPayload::Configuration(membership) }
    }
}

/// The payload of a log entry. `Blank` is the NoOp a new leader appends in
/// its own term; `PurgedMarker` stands in for an entry subsumed by a
/// snapshot and carries no command of its own.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum EntryPayload {
    Blank,
    Normal(Vec<u8>),
    Configuration(ClusterConfiguration),
    PurgedMarker,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    pub term: Term,
    pub candidate_id: NodeId,
    pub last_log_index: LogIndex,
    pub last_log_term: Term,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    pub term: Term,
    pub vote_granted: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub prev_log_index: LogIndex,
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    pub leader_commit: LogIndex,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    pub term: Term,
    pub success: bool,
    pub conflict_index: Option<LogIndex>,
    pub conflict_term: Option<Term>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    pub term: Term,
    pub leader_id: NodeId,
    pub last_included_index: LogIndex,
    pub last_included_term: Term,
    /// The snapshot's cluster configuration, carried on every chunk so a
    /// receiver that only keeps the final chunk's metadata (as this
    /// implementation does) still learns it without reassembling `data`.
    pub configuration: ClusterConfiguration,
    pub offset: u64,
    pub data: Vec<u8>,
    pub done: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    pub term: Term,
}

/// A client write request: a single entry not yet assigned a `LogId`.
#[derive(Clone, Debug)]
pub struct ClientWriteRequest {
    pub payload: EntryPayload,
    pub session: Option<(ClientId, SerialId)>,
    pub timeout: Option<Duration>,
}

impl ClientWriteRequest {
    pub fn new(data: Vec<u8>, timeout: Option<Duration>) -> Self {
        Self { payload: EntryPayload::Normal(data), session: None, timeout }
    }

    pub fn new_with_session(client_id: ClientId, serial: SerialId, data: Vec<u8>, timeout: Option<Duration>) -> Self {
        Self { payload: EntryPayload::Normal(data), session: Some((client_id, serial)), timeout }
    }

    pub fn new_config(membership: ClusterConfiguration) -> Self {
        Self { payload: EntryPayload::Configuration(membership), session: None, timeout: None }
    }
}

/// The response to a successful client write: the applied entry's index and
/// the state machine's returned bytes.
#[derive(Clone, Debug)]
pub struct ClientWriteResponse {
    pub index: LogIndex,
    pub data: Vec<u8>,
}

pub(crate) type RaftMsgTx<S> = mpsc::UnboundedSender<RaftMsg<S>>;

/// Every external entry point into a running node, translated into a message
/// and delivered to the single `RaftCore` task.
pub(crate) enum RaftMsg<S: Persistence> {
    AppendEntries { request: AppendEntriesRequest, tx: oneshot::Sender<Result<AppendEntriesResponse, RaftError>> },
    RequestVote { request: RequestVoteRequest, tx: oneshot::Sender<Result<RequestVoteResponse, RaftError>> },
    InstallSnapshot {
        request: InstallSnapshotRequest,
        tx: oneshot::Sender<Result<InstallSnapshotResponse, RaftError>>,
    },
    ClientWrite { request: ClientWriteRequest, tx: oneshot::Sender<Result<ClientWriteResponse, ClientWriteError>> },
    ClientRead { timeout: Option<Duration>, tx: oneshot::Sender<Result<Vec<u8>, ClientReadError>> },
    Initialize { members: std::collections::BTreeSet<NodeId>, tx: oneshot::Sender<Result<(), InitializeError>> },
    AddServer { id: NodeId, tx: oneshot::Sender<Result<(), ChangeMembershipError>> },
    RemoveServer { id: NodeId, tx: oneshot::Sender<Result<(), ChangeMembershipError>> },
    _Phantom(std::marker::PhantomData<S>),
}

struct RaftInner<N, S>
where
    N: RaftNetwork,
    S: Persistence,
{
    tx_api: RaftMsgTx<S>,
    rx_metrics: watch::Receiver<RaftMetrics>,
    tx_shutdown: std::sync::Mutex<Option<oneshot::Sender<()>>>,
    core_handle: std::sync::Mutex<Option<JoinHandle<Result<(), RaftError>>>>,
    _network: std::marker::PhantomData<N>,
}

/// A cheap, `Clone`-able handle to a running Raft node.
///
/// Every method sends a message to the single core task owning `RaftCore`
/// and awaits the reply via a `oneshot` channel, serializing every state
/// transition behind that one task without any explicit lock.
pub struct Raft<N, S>
where
    N: RaftNetwork,
    S: Persistence,
{
    inner: Arc<RaftInner<N, S>>,
}

impl<N, S> Clone for Raft<N, S>
where
    N: RaftNetwork,
    S: Persistence,
{
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<N, S> Raft<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    /// Spawn the `RaftCore` task and return a handle to it.
    pub fn new(id: NodeId, config: Arc<Config>, network: Arc<N>, storage: Arc<S>) -> Self {
        let (tx_api, rx_api) = mpsc::unbounded_channel();
        let (tx_metrics, rx_metrics) = watch::channel(RaftMetrics::new_initial(id));
        let (tx_shutdown, rx_shutdown) = oneshot::channel();
        let core_handle = RaftCore::spawn(id, config, network, storage, rx_api, tx_metrics, rx_shutdown);
        Self {
            inner: Arc::new(RaftInner {
                tx_api,
                rx_metrics,
                tx_shutdown: std::sync::Mutex::new(Some(tx_shutdown)),
                core_handle: std::sync::Mutex::new(Some(core_handle)),
                _network: std::marker::PhantomData,
            }),
        }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn append_entries(&self, request: AppendEntriesRequest) -> Result<AppendEntriesResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::AppendEntries { request, tx })?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn vote(&self, request: RequestVoteRequest) -> Result<RequestVoteResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::RequestVote { request, tx })?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn install_snapshot(
        &self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::InstallSnapshot { request, tx })?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    /// The linearizable read path.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn client_read(&self, timeout: Option<Duration>) -> Result<Vec<u8>, ClientReadError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ClientRead { timeout, tx }).map_err(RaftError::from)?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    #[tracing::instrument(level = "debug", skip(self, request))]
    pub async fn client_write(&self, request: ClientWriteRequest) -> Result<ClientWriteResponse, ClientWriteError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::ClientWrite { request, tx }).map_err(RaftError::from)?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    /// Bootstrap a pristine cluster with the given member set.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn initialize(&self, members: std::collections::BTreeSet<NodeId>) -> Result<(), InitializeError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::Initialize { members, tx }).map_err(RaftError::from)?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn add_server(&self, id: NodeId) -> Result<(), ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::AddServer { id, tx }).map_err(RaftError::from)?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn remove_server(&self, id: NodeId) -> Result<(), ChangeMembershipError> {
        let (tx, rx) = oneshot::channel();
        self.send(RaftMsg::RemoveServer { id, tx }).map_err(RaftError::from)?;
        rx.await.map_err(|_| RaftError::Fatal)?
    }

    pub fn metrics(&self) -> watch::Receiver<RaftMetrics> {
        self.inner.rx_metrics.clone()
    }

    pub fn current_leader(&self) -> Option<NodeId> {
        self.inner.rx_metrics.borrow().current_leader
    }

    pub fn wait(&self, timeout: Duration) -> Wait {
        Wait { rx: self.inner.rx_metrics.clone(), timeout }
    }

    /// Signal the core task to stop and wait for it to exit.
    pub async fn shutdown(&self) -> Result<(), RaftError> {
        let tx = self.inner.tx_shutdown.lock().unwrap().take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
        let handle = self.inner.core_handle.lock().unwrap().take();
        if let Some(handle) = handle {
            handle.await.map_err(|_| RaftError::Fatal)??;
        }
        Ok(())
    }

    fn send(&self, msg: RaftMsg<S>) -> Result<(), RaftError> {
        self.inner.tx_api.send(msg).map_err(|_| RaftError::Fatal)
    }
}

impl<N, S> fmt::Debug for Raft<N, S>
where
    N: RaftNetwork,
    S: Persistence,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Raft").finish()
    }
}
