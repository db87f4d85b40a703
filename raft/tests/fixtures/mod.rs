//! Fixtures for testing Raft: an in-process router implementing
//! `RaftNetwork` directly against peer `Raft` handles, with no framing or
//! simulated latency of its own.
//!
//! A `RaftRouter` wiring every member's `Raft` handle together: no
//! non-voter role (every member is a full voter), and joint-consensus
//! `add_server`/`remove_server` as the membership-change API.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use maplit::btreeset;
use memstore::MemStore;
use raft::error::ChangeMembershipError;
use raft::error::ClientReadError;
use raft::error::ClientWriteError;
use raft::metrics::RaftMetrics;
use raft::metrics::State;
use raft::metrics::Wait;
use raft::network::RaftNetwork;
use raft::quorum::ClusterConfiguration;
use raft::raft::AppendEntriesRequest;
use raft::raft::AppendEntriesResponse;
use raft::raft::ClientWriteRequest;
use raft::raft::InstallSnapshotRequest;
use raft::raft::InstallSnapshotResponse;
use raft::raft::Raft;
use raft::raft::RequestVoteRequest;
use raft::raft::RequestVoteResponse;
use raft::raft_types::LogId;
use raft::raft_types::LogIndex;
use raft::raft_types::NodeId;
use raft::state_machine::StateMachine;
use raft::storage::HardState;
use raft::storage::Persistence;
use raft::storage::PersistenceDebug;
use raft::Config;
use tokio::sync::RwLock;
use tracing_subscriber::prelude::*;

macro_rules! func_name {
    () => {{
        fn f() {}
        fn type_name_of<T>(_: T) -> &'static str {
            std::any::type_name::<T>()
        }
        let name = type_name_of(f);
        let n = &name[..name.len() - 3];
        let nn = n.replace("::{{closure}}", "");
        nn
    }};
}

macro_rules! init_ut {
    () => {{
        fixtures::init_tracing();

        let name = func_name!();
        let span = tracing::debug_span!("ut", "{}", name.split("::").last().unwrap());
        ((), span)
    }};
}

/// A minimal state machine that echoes the command bytes it is given,
/// enough to let the test suite assert on total order without caring what
/// the "application" actually does.
#[derive(Default)]
pub struct EchoStateMachine;

impl StateMachine for EchoStateMachine {
    fn apply(&mut self, _index: LogIndex, command: &[u8]) -> anyhow::Result<Vec<u8>> {
        Ok(command.to_vec())
    }

    fn get_state(&self) -> Vec<u8> {
        Vec::new()
    }

    fn restore_from_snapshot(&mut self, _state: &[u8]) {}
}

/// A concrete Raft type used during testing.
pub type MemRaft = Raft<RaftRouter, MemStore<EchoStateMachine>>;

/// Initialize the tracing system.
pub fn init_tracing() {
    let fmt_layer = tracing_subscriber::fmt::Layer::default()
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::FULL)
        .with_ansi(false);
    let subscriber = tracing_subscriber::Registry::default()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(fmt_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);
}

//////////////////////////////////////////////////////////////////////////////////////////////////

/// A type which emulates a network transport and implements the `RaftNetwork` trait.
pub struct RaftRouter {
    /// The Raft runtime config which all nodes are using.
    config: Arc<Config>,
    /// The table of all nodes currently known to this router instance.
    routing_table: RwLock<BTreeMap<NodeId, (MemRaft, Arc<MemStore<EchoStateMachine>>)>>,
    /// Nodes which are isolated can neither send nor receive frames.
    isolated_nodes: RwLock<HashSet<NodeId>>,

    /// To emulate network delay for sending, in milliseconds. 0 means no delay.
    send_delay: u64,
}

pub struct Builder {
    config: Arc<Config>,
    send_delay: u64,
}

impl Builder {
    pub fn send_delay(mut self, ms: u64) -> Self {
        self.send_delay = ms;
        self
    }

    pub fn build(self) -> RaftRouter {
        RaftRouter {
            config: self.config,
            routing_table: Default::default(),
            isolated_nodes: Default::default(),
            send_delay: self.send_delay,
        }
    }
}

impl RaftRouter {
    pub fn builder(config: Arc<Config>) -> Builder {
        Builder { config, send_delay: 0 }
    }

    /// Create a new instance.
    pub fn new(config: Arc<Config>) -> Self {
        Self::builder(config).build()
    }

    pub fn network_send_delay(&mut self, ms: u64) {
        self.send_delay = ms;
    }

    async fn rand_send_delay(&self) {
        if self.send_delay == 0 {
            return;
        }

        let r = rand::random::<u64>() % self.send_delay;
        let timeout = Duration::from_millis(r);
        tokio::time::sleep(timeout).await;
    }

    /// Create a cluster: 0 is the initial leader, the rest join via `add_server`.
    pub async fn new_nodes_from_single(self: &Arc<Self>, node_ids: BTreeSet<NodeId>) -> anyhow::Result<u64> {
        assert!(node_ids.contains(&0));

        self.new_raft_node(0).await;

        let mut want = 0;

        tracing::info!("--- initializing single node cluster: {}", 0);

        self.initialize_from_single_node(0).await?;
        want += 1;

        tracing::info!("--- wait for init node to become leader");

        self.wait_for_log(&btreeset![0], want, Duration::from_secs(5), "init").await?;
        self.assert_stable_cluster(Some(1), Some(want)).await;

        for id in node_ids.iter() {
            if *id == 0 {
                continue;
            }
            tracing::info!("--- add server: {}", id);

            self.new_raft_node(*id).await;
            self.add_server(0, *id).await?;
            want += 1;
        }

        self.wait_for_log(&node_ids, want, Duration::from_secs(5), &format!("cluster of {:?}", node_ids)).await?;

        Ok(want)
    }

    /// Create and register a new Raft node bearing the given ID.
    pub async fn new_raft_node(self: &Arc<Self>, id: NodeId) {
        let memstore = Arc::new(MemStore::new(id, EchoStateMachine));
        self.new_raft_node_with_sto(id, memstore).await
    }

    pub async fn new_raft_node_with_sto(self: &Arc<Self>, id: NodeId, sto: Arc<MemStore<EchoStateMachine>>) {
        let node = Raft::new(id, self.config.clone(), self.clone(), sto.clone());
        let mut rt = self.routing_table.write().await;
        rt.insert(id, (node, sto));
    }

    /// Remove the target node from the routing table & isolation.
    pub async fn remove_node(&self, id: NodeId) -> Option<(MemRaft, Arc<MemStore<EchoStateMachine>>)> {
        let mut rt = self.routing_table.write().await;
        let opt_handles = rt.remove(&id);
        let mut isolated = self.isolated_nodes.write().await;
        isolated.remove(&id);

        opt_handles
    }

    /// Initialize all nodes based on the config in the routing table.
    pub async fn initialize_from_single_node(&self, node: NodeId) -> Result<()> {
        tracing::info!(node, "initializing cluster from single node");
        let rt = self.routing_table.read().await;
        let members: BTreeSet<NodeId> = rt.keys().cloned().collect();
        rt.get(&node).ok_or_else(|| anyhow!("node {} not found in routing table", node))?.0.initialize(members).await?;
        Ok(())
    }

    /// Initialize cluster with specified node ids.
    pub async fn initialize_with(&self, node: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        tracing::info!(node, "initializing cluster with explicit members");
        let rt = self.routing_table.read().await;
        rt.get(&node).ok_or_else(|| anyhow!("node {} not found in routing table", node))?.0.initialize(members).await?;
        Ok(())
    }

    /// Isolate the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn isolate_node(&self, id: NodeId) {
        self.isolated_nodes.write().await.insert(id);
    }

    /// Get a payload of the latest metrics from each node in the cluster.
    pub async fn latest_metrics(&self) -> Vec<RaftMetrics> {
        let rt = self.routing_table.read().await;
        let mut metrics = vec![];
        for node in rt.values() {
            metrics.push(node.0.metrics().borrow().clone());
        }
        metrics
    }

    /// Get a handle to the storage backend for the target node.
    pub async fn get_storage_handle(&self, node_id: &NodeId) -> Result<Arc<MemStore<EchoStateMachine>>> {
        let rt = self.routing_table.read().await;
        let addr = rt.get(node_id).with_context(|| format!("could not find node {} in routing table", node_id))?;
        Ok(addr.1.clone())
    }

    pub async fn wait(&self, node_id: &NodeId, timeout: Duration) -> Result<Wait> {
        let rt = self.routing_table.read().await;
        let node = rt.get(node_id).with_context(|| format!("node {} not found", node_id))?;
        Ok(node.0.wait(timeout))
    }

    /// Wait for specified nodes until they applied up to `want_log`(inclusive) logs.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_log(&self, node_ids: &BTreeSet<u64>, want_log: u64, timeout: Duration, msg: &str) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.log_index(want_log).await.with_context(|| msg.to_string())?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their state becomes `state`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_state(&self, node_ids: &BTreeSet<u64>, want_state: State, timeout: Duration, msg: &str) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.state(want_state).await.with_context(|| msg.to_string())?;
        }
        Ok(())
    }

    /// Wait for specified nodes until their snapshot becomes `want`.
    #[tracing::instrument(level = "info", skip(self))]
    pub async fn wait_for_snapshot(&self, node_ids: &BTreeSet<u64>, want: LogId, timeout: Duration, msg: &str) -> Result<()> {
        for i in node_ids.iter() {
            self.wait(i, timeout).await?.snapshot(want).await.with_context(|| msg.to_string())?;
        }
        Ok(())
    }

    /// Get the ID of the current leader.
    pub async fn leader(&self) -> Option<NodeId> {
        let isolated = self.isolated_nodes.read().await;
        self.latest_metrics().await.into_iter().find_map(|node| {
            if node.current_leader == Some(node.id) {
                if isolated.contains(&node.id) {
                    None
                } else {
                    Some(node.id)
                }
            } else {
                None
            }
        })
    }

    /// Restore the network of the specified node.
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn restore_node(&self, id: NodeId) {
        let mut nodes = self.isolated_nodes.write().await;
        nodes.remove(&id);
    }

    pub async fn add_server(&self, leader: NodeId, target: NodeId) -> Result<(), ChangeMembershipError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).unwrap_or_else(|| panic!("node with ID {} does not exist", leader));
        node.0.add_server(target).await
    }

    pub async fn remove_server(&self, leader: NodeId, target: NodeId) -> Result<(), ChangeMembershipError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&leader).unwrap_or_else(|| panic!("node with ID {} does not exist", leader));
        node.0.remove_server(target).await
    }

    /// Send a client read request to the target node.
    pub async fn client_read(&self, target: NodeId) -> Result<Vec<u8>, ClientReadError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node with ID {} does not exist", target));
        node.0.client_read(None).await
    }

    /// Send a client request to the target node, causing test failure on error.
    pub async fn client_request(&self, target: NodeId, client_id: &str, serial: u64) {
        let data = format!("{}-{}", client_id, serial).into_bytes();
        if let Err(err) = self.send_client_request(target, data).await {
            tracing::error!(error = %err, "error from client request");
            panic!("{:?}", err)
        }
    }

    /// Request the current leader from the target node.
    pub async fn current_leader(&self, target: NodeId) -> Option<NodeId> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node with ID {} does not exist", target));
        node.0.current_leader()
    }

    /// Send multiple client requests to the target node, causing test failure on error.
    pub async fn client_request_many(&self, target: NodeId, client_id: &str, count: usize) {
        for idx in 0..count {
            self.client_request(target, client_id, idx as u64).await
        }
    }

    async fn send_client_request(&self, target: NodeId, data: Vec<u8>) -> std::result::Result<Vec<u8>, ClientWriteError> {
        let rt = self.routing_table.read().await;
        let node = rt.get(&target).unwrap_or_else(|| panic!("node '{}' does not exist in routing table", target));
        node.0.client_write(ClientWriteRequest::new(data, None)).await.map(|res| res.data)
    }

    //////////////////////////////////////////////////////////////////////////////////////////////

    /// Assert that the cluster is in a pristine state, before `initialize` has run.
    pub async fn assert_pristine_cluster(&self) {
        let nodes = self.latest_metrics().await;
        for node in nodes.iter() {
            assert!(node.current_leader.is_none(), "node {} has a current leader, expected none", node.id);
            assert_eq!(node.state, State::Follower, "node is in state {:?}, expected Follower", node.state);
            assert_eq!(node.current_term, 0, "node {} has term {}, expected 0", node.id, node.current_term);
            assert_eq!(node.last_applied, 0, "node {} has last_applied {}, expected 0", node.id, node.last_applied);
            assert_eq!(
                node.last_log_index, 0,
                "node {} has last_log_index {}, expected 0",
                node.id, node.last_log_index
            );
            assert_eq!(
                node.membership.nodes,
                btreeset![node.id],
                "node {} has membership {:?}, expected [{}]",
                node.id,
                node.membership.nodes,
                node.id
            );
            assert!(!node.membership.is_joint(), "node {} is in joint consensus, expected uniform", node.id);
        }
    }

    /// Assert that the cluster has an elected leader, and is in a stable state with all nodes uniform.
    ///
    /// If `expected_term` is `Some`, all nodes are checked against that term, else the leader's
    /// current term is used. Same for `expected_last_log`.
    pub async fn assert_stable_cluster(&self, expected_term: Option<u64>, expected_last_log: Option<u64>) {
        let isolated = self.isolated_nodes.read().await;
        let nodes = self.latest_metrics().await;

        let non_isolated_nodes: Vec<_> = nodes.iter().filter(|node| !isolated.contains(&node.id)).collect();
        let leader = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .find(|node| node.state == State::Leader)
            .expect("expected to find a cluster leader");
        let followers: Vec<_> = nodes
            .iter()
            .filter(|node| !isolated.contains(&node.id))
            .filter(|node| node.state == State::Follower)
            .collect();

        assert_eq!(
            followers.len() + 1,
            non_isolated_nodes.len(),
            "expected all nodes to be followers with one leader, got 1 leader and {} followers, expected {} followers",
            followers.len(),
            non_isolated_nodes.len() - 1,
        );
        let expected_term = expected_term.unwrap_or(leader.current_term);
        let expected_last_log = expected_last_log.unwrap_or(leader.last_log_index);
        let all_nodes = nodes.iter().map(|node| node.id).collect::<BTreeSet<_>>();
        for node in non_isolated_nodes.iter() {
            assert_eq!(
                node.current_leader,
                Some(leader.id),
                "node {} has leader {:?}, expected {}",
                node.id,
                node.current_leader,
                leader.id
            );
            assert_eq!(node.current_term, expected_term, "node {} has term {}, expected {}", node.id, node.current_term, expected_term);
            assert_eq!(
                node.last_applied, expected_last_log,
                "node {} has last_applied {}, expected {}",
                node.id, node.last_applied, expected_last_log
            );
            assert_eq!(
                node.last_log_index, expected_last_log,
                "node {} has last_log_index {}, expected {}",
                node.id, node.last_log_index, expected_last_log
            );
            assert_eq!(node.membership.nodes, all_nodes, "node {} has membership {:?}, expected {:?}", node.id, node.membership.nodes, all_nodes);
            assert!(!node.membership.is_joint(), "node {} was not in uniform consensus state", node.id);
        }
    }

    /// Assert against the state of the storage system per node in the cluster.
    pub async fn assert_storage_state(
        &self,
        expect_term: u64,
        expect_last_log: u64,
        expect_voted_for: Option<u64>,
        expect_last_applied: LogIndex,
        expect_snapshot: Option<(ValueTest<u64>, u64, ClusterConfiguration)>,
    ) {
        let rt = self.routing_table.read().await;
        for (id, (_node, storage)) in rt.iter() {
            let last_log = storage.get_last_log_id().await.unwrap().index;
            assert_eq!(last_log, expect_last_log, "expected node {} to have last_log {}, got {}", id, expect_last_log, last_log);

            let hs: HardState = storage.read_hard_state().await;
            assert_eq!(hs.current_term, expect_term, "expected node {} to have term {}, got {}", id, expect_term, hs.current_term);
            if let Some(voted_for) = expect_voted_for {
                assert_eq!(hs.voted_for, Some(voted_for), "expected node {} to have voted for {}, got {:?}", id, voted_for, hs.voted_for);
            }
            if let Some((index_test, term, cfg)) = &expect_snapshot {
                let snap = storage
                    .get_current_snapshot()
                    .await
                    .unwrap()
                    .unwrap_or_else(|| panic!("no snapshot present for node {}", id));
                match index_test {
                    ValueTest::Exact(index) => assert_eq!(
                        &snap.last_included_index,
                        index,
                        "expected node {} to have snapshot with index {}, got {}",
                        id,
                        index,
                        snap.last_included_index
                    ),
                    ValueTest::Range(range) => assert!(
                        range.contains(&snap.last_included_index),
                        "expected node {} to have snapshot within range {:?}, got {}",
                        id,
                        range,
                        snap.last_included_index
                    ),
                }
                assert_eq!(
                    &snap.last_included_term, term,
                    "expected node {} to have snapshot with term {}, got {}",
                    id, term, snap.last_included_term
                );
                assert_eq!(&snap.membership, cfg, "expected node {} to have membership config {:?}, got {:?}", id, cfg, snap.membership);
            }
            let last_applied = storage.get_initial_state().await.unwrap().last_applied;
            assert_eq!(
                last_applied, expect_last_applied,
                "expected node {} to have last_applied {}, got {}",
                id, expect_last_applied, last_applied
            );
        }
    }
}

#[async_trait]
impl RaftNetwork for RaftRouter {
    /// Send an AppendEntries RPC to the target Raft node.
    async fn send_append_entries(&self, target: u64, rpc: AppendEntriesRequest) -> Result<AppendEntriesResponse> {
        tracing::debug!("append_entries to id={} {:?}", target, rpc);
        self.rand_send_delay().await;

        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        let resp = addr.0.append_entries(rpc).await;

        tracing::debug!("append_entries: recv resp from id={} {:?}", target, resp);
        Ok(resp?)
    }

    /// Send an InstallSnapshot RPC to the target Raft node.
    async fn send_install_snapshot(&self, target: u64, rpc: InstallSnapshotRequest) -> Result<InstallSnapshotResponse> {
        self.rand_send_delay().await;

        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.leader_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.install_snapshot(rpc).await?)
    }

    /// Send a RequestVote RPC to the target Raft node.
    async fn send_vote(&self, target: u64, rpc: RequestVoteRequest) -> Result<RequestVoteResponse> {
        self.rand_send_delay().await;

        let rt = self.routing_table.read().await;
        let isolated = self.isolated_nodes.read().await;
        let addr = rt.get(&target).expect("target node not found in routing table");
        if isolated.contains(&target) || isolated.contains(&rpc.candidate_id) {
            return Err(anyhow!("target node is isolated"));
        }
        Ok(addr.0.vote(rpc).await?)
    }
}

pub enum ValueTest<T> {
    Exact(T),
    Range(std::ops::Range<T>),
}

impl<T> From<T> for ValueTest<T> {
    fn from(src: T) -> Self {
        Self::Exact(src)
    }
}

impl<T> From<std::ops::Range<T>> for ValueTest<T> {
    fn from(src: std::ops::Range<T>) -> Self {
        Self::Range(src)
    }
}

/// Cluster wiring over the network simulator transport, used by the
/// end-to-end scenario tests instead of the in-process `RaftRouter`.
pub mod netsim {
    use std::sync::Arc;
    use std::time::Duration;

    use memstore::MemStore;
    use net_sim::{spawn_server, NetworkEdge, SimNetwork, Simulator, SimulatorConfig};
    use raft::{Config, NodeId, Raft};

    use super::EchoStateMachine;

    pub const RPC_PORT: u16 = 9000;

    pub fn node_address(id: NodeId) -> String {
        format!("node-{id}")
    }

    pub type SimRaft = Raft<SimNetwork, MemStore<EchoStateMachine>>;

    /// Brings up a simulator with `ids`, connects every ordered pair with
    /// `edge`, then spawns one `Raft` node plus its RPC server per id.
    pub async fn cluster(ids: &[NodeId], edge: NetworkEdge, config: Arc<Config>) -> (Simulator, Vec<SimRaft>) {
        let sim = Simulator::new(SimulatorConfig::default());
        for id in ids {
            sim.add_node(node_address(*id)).await;
        }
        for from in ids {
            for to in ids {
                if from != to {
                    sim.add_edge(node_address(*from), node_address(*to), edge).await;
                }
            }
        }
        sim.start();

        let mut handles = Vec::new();
        for id in ids {
            let node = sim.create_node(node_address(*id));
            let network = Arc::new(SimNetwork::new(node.clone(), RPC_PORT, |target| node_address(target)));
            let storage = Arc::new(MemStore::new(*id, EchoStateMachine));
            let raft = Raft::new(*id, config.clone(), network, storage);
            spawn_server(node, RPC_PORT, raft.clone());
            handles.push(raft);
        }
        (sim, handles)
    }

    /// Remove every edge between `a` and `b` in both directions, simulating a
    /// network partition.
    pub async fn sever(sim: &Simulator, a: NodeId, b: NodeId) {
        sim.remove_edge(&node_address(a), &node_address(b)).await;
        sim.remove_edge(&node_address(b), &node_address(a)).await;
    }

    pub async fn heal(sim: &Simulator, a: NodeId, b: NodeId, edge: NetworkEdge) {
        sim.add_edge(node_address(a), node_address(b), edge).await;
        sim.add_edge(node_address(b), node_address(a), edge).await;
    }

    pub fn fast_edge() -> NetworkEdge {
        NetworkEdge::new(Duration::from_millis(10), 1.0)
    }
}
