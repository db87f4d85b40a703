//! The simulator core: topology, scheduler, and routing.
//!
//! A directed weighted graph (`_topology`), BFS shortest-path routing
//! (`find_path`), per-hop Bernoulli reliability (`check_reliability`) and
//! additive latency (`apply_latency`), and a delivery scheduler: a single
//! `BinaryHeap` keyed by delivery deadline, driven by one dedicated task
//! calling `tokio::time::sleep_until`.
//!
//! Operations reachable from a [`Node`]/[`Connection`]/[`Listener`] handle
//! live on [`Inner`] directly, since those handles only hold `Arc<Inner>`;
//! [`Simulator`] wraps the same `Inner` and additionally owns the scheduler
//! task and the topology-configuration API used by test setup code.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::{oneshot, Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

use crate::connection::{Connection, ConnectionState};
use crate::error::NetSimError;
use crate::listener::ListenerState;
use crate::node::Node;
use crate::types::{Address, ConnectionId, Endpoint, Message, NetworkEdge, Port};

/// Determinism knobs. A fixed `seed` makes reliability sampling and
/// ephemeral port allocation reproducible across runs.
#[derive(Clone, Debug)]
pub struct SimulatorConfig {
    pub seed: Option<u64>,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self { seed: None }
    }
}

enum ScheduledEvent {
    Message(Message),
    ConnectionData { conn_id: ConnectionId, data: Vec<u8> },
    ConnectionEstablish {
        listener_endpoint: Endpoint,
        client_conn_id: ConnectionId,
        server_conn_id: ConnectionId,
        client_state: Arc<ConnectionState>,
        server_state: Arc<ConnectionState>,
        reply: oneshot::Sender<Result<(), NetSimError>>,
    },
}

struct TimerEntry {
    deadline: Instant,
    seq: u64,
    event: ScheduledEvent,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for TimerEntry {}
impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for TimerEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.deadline, self.seq).cmp(&(other.deadline, other.seq))
    }
}

pub(crate) struct Inner {
    topology: RwLock<HashMap<Address, HashMap<Address, NetworkEdge>>>,
    message_queues: Mutex<HashMap<Address, VecDeque<Message>>>,
    message_notify: Notify,
    connections: RwLock<HashMap<ConnectionId, Arc<ConnectionState>>>,
    listeners: RwLock<HashMap<Endpoint, Arc<ListenerState>>>,
    used_ports: Mutex<HashMap<Address, HashSet<Port>>>,
    rng: Mutex<StdRng>,
    started: AtomicBool,
    timers: Mutex<BinaryHeap<Reverse<TimerEntry>>>,
    timer_notify: Notify,
    next_seq: AtomicU64,
    /// The delivery deadline handed out to the most recent write on each
    /// `ConnectionId`, so a later write can never be scheduled to arrive
    /// before an earlier one even if the path's latency changes in between.
    conn_write_deadlines: Mutex<HashMap<ConnectionId, Instant>>,
}

impl Inner {
    fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    async fn find_path(&self, from: &str, to: &str) -> Vec<Address> {
        if from == to {
            return vec![from.to_string()];
        }
        let topology = self.topology.read().await;
        let mut queue = VecDeque::new();
        let mut parent: HashMap<Address, Address> = HashMap::new();
        let mut visited: HashSet<Address> = HashSet::new();

        queue.push_back(from.to_string());
        visited.insert(from.to_string());

        while let Some(current) = queue.pop_front() {
            if current == to {
                let mut path = vec![current.clone()];
                let mut node = current;
                while node != from {
                    node = parent.get(&node).cloned().unwrap_or_else(|| node.clone());
                    path.push(node.clone());
                    if node == from {
                        break;
                    }
                }
                path.reverse();
                return path;
            }
            if let Some(edges) = topology.get(&current) {
                for neighbor in edges.keys() {
                    if visited.insert(neighbor.clone()) {
                        parent.insert(neighbor.clone(), current.clone());
                        queue.push_back(neighbor.clone());
                    }
                }
            }
        }
        Vec::new()
    }

    /// Walk `path` hop by hop, rolling an independent Bernoulli trial for
    /// each edge's reliability and summing each edge's latency. Returns
    /// `Err((from, to))` naming the hop that dropped the message.
    async fn apply_path(&self, path: &[Address]) -> Result<Duration, (Address, Address)> {
        let topology = self.topology.read().await;
        let mut total = Duration::from_millis(0);
        for window in path.windows(2) {
            let (from, to) = (&window[0], &window[1]);
            let edge = topology.get(from).and_then(|edges| edges.get(to)).copied().unwrap_or_default();
            if edge.reliability < 1.0 {
                let roll: f64 = self.rng.lock().await.gen();
                if roll >= edge.reliability {
                    return Err((from.clone(), to.clone()));
                }
            }
            total += edge.latency;
        }
        Ok(total)
    }

    fn next_seq(&self) -> u64 {
        self.next_seq.fetch_add(1, Ordering::Relaxed)
    }

    async fn schedule(&self, delay: Duration, event: ScheduledEvent) {
        self.schedule_at(Instant::now() + delay, event).await;
    }

    async fn schedule_at(&self, deadline: Instant, event: ScheduledEvent) {
        let seq = self.next_seq();
        let mut timers = self.timers.lock().await;
        let wake = timers.peek().map_or(true, |Reverse(top)| deadline < top.deadline);
        timers.push(Reverse(TimerEntry { deadline, seq, event }));
        drop(timers);
        if wake {
            self.timer_notify.notify_one();
        }
    }

    pub(crate) async fn send_message(&self, msg: Message) -> Result<(), NetSimError> {
        if !self.is_started() {
            return Err(NetSimError::NotStarted);
        }
        let (src, dst) = (msg.source.address.clone(), msg.destination.address.clone());
        {
            let topology = self.topology.read().await;
            if !topology.contains_key(&src) {
                return Err(NetSimError::NodeNotFound(src));
            }
            if !topology.contains_key(&dst) {
                return Err(NetSimError::NodeNotFound(dst));
            }
        }
        let path = self.find_path(&src, &dst).await;
        if path.is_empty() {
            return Err(NetSimError::NoRoute { from: src, to: dst });
        }
        let delay = self.apply_path(&path).await.map_err(|(from, to)| NetSimError::Dropped { from, to })?;
        self.schedule(delay, ScheduledEvent::Message(msg)).await;
        Ok(())
    }

    pub(crate) async fn receive_message(&self, address: &str) -> Option<Message> {
        let mut queue = self.message_queues.lock().await;
        queue.get_mut(address).and_then(|q| q.pop_front())
    }

    pub(crate) fn message_notify(&self) -> &Notify {
        &self.message_notify
    }

    pub(crate) async fn allocate_ephemeral_port(&self, address: &str) -> Result<Port, NetSimError> {
        const EPHEMERAL_BASE: Port = 49152;
        let mut used = self.used_ports.lock().await;
        let taken = used.entry(address.to_string()).or_insert_with(HashSet::new);
        for port in EPHEMERAL_BASE..Port::MAX {
            if taken.insert(port) {
                return Ok(port);
            }
        }
        Err(NetSimError::NoPortsAvailable(address.to_string()))
    }

    pub(crate) async fn reserve_port(&self, address: &str, port: Port) -> Result<(), NetSimError> {
        let mut used = self.used_ports.lock().await;
        let taken = used.entry(address.to_string()).or_insert_with(HashSet::new);
        if !taken.insert(port) {
            return Err(NetSimError::PortInUse(port));
        }
        Ok(())
    }

    pub(crate) async fn release_port(&self, address: &str, port: Port) {
        if let Some(taken) = self.used_ports.lock().await.get_mut(address) {
            taken.remove(&port);
        }
    }

    pub(crate) async fn bind_listener(&self, endpoint: Endpoint) -> Arc<ListenerState> {
        let state = Arc::new(ListenerState::new(endpoint.clone()));
        self.listeners.write().await.insert(endpoint, state.clone());
        state
    }

    pub(crate) async fn unbind_listener(&self, endpoint: &Endpoint) {
        self.listeners.write().await.remove(endpoint);
    }

    /// Establish a connection from `local` to `remote`: validate route,
    /// validate listener, sample reliability, schedule the two inverse
    /// `Connection` objects, return the client side.
    pub(crate) async fn connect(self: &Arc<Self>, local: Endpoint, remote: Endpoint) -> Result<Connection, NetSimError> {
        if !self.is_started() {
            return Err(NetSimError::NotStarted);
        }
        let path = self.find_path(&local.address, &remote.address).await;
        if path.is_empty() {
            return Err(NetSimError::NoRoute { from: local.address, to: remote.address });
        }
        {
            let listeners = self.listeners.read().await;
            match listeners.get(&remote) {
                Some(l) if l.is_listening() => {}
                _ => return Err(NetSimError::ConnectionRefused(remote)),
            }
        }

        let delay = self.apply_path(&path).await.map_err(|(from, to)| NetSimError::Dropped { from, to })?;

        let client_conn_id = ConnectionId::new(local.clone(), remote.clone());
        let server_conn_id = client_conn_id.reversed();
        let client_state = Arc::new(ConnectionState::new(local.clone(), remote.clone()));
        let server_state = Arc::new(ConnectionState::new(remote.clone(), local.clone()));

        let (reply_tx, reply_rx) = oneshot::channel();
        self.schedule(
            delay,
            ScheduledEvent::ConnectionEstablish {
                listener_endpoint: remote,
                client_conn_id: client_conn_id.clone(),
                server_conn_id,
                client_state: client_state.clone(),
                server_state,
                reply: reply_tx,
            },
        )
        .await;

        reply_rx.await.map_err(|_| NetSimError::NotStarted)??;
        Ok(Connection::new(client_conn_id, client_state, self.clone()))
    }

    pub(crate) async fn write_connection(self: &Arc<Self>, conn_id: &ConnectionId, data: Vec<u8>) -> Result<(), NetSimError> {
        if !self.is_started() {
            return Err(NetSimError::NotStarted);
        }
        let path = self.find_path(&conn_id.src.address, &conn_id.dst.address).await;
        if path.is_empty() {
            return Err(NetSimError::NoRoute { from: conn_id.src.address.clone(), to: conn_id.dst.address.clone() });
        }
        let delay = self.apply_path(&path).await.map_err(|(from, to)| NetSimError::Dropped { from, to })?;
        let sampled_deadline = Instant::now() + delay;

        // A later write's sampled deadline can land before an earlier write's
        // deadline once the path's latency has changed mid-connection (e.g. an
        // edge healing after a partition). Clamp to the previous write's
        // deadline on this `ConnectionId` so bytes still arrive in write order.
        let mut conn_deadlines = self.conn_write_deadlines.lock().await;
        let deadline = match conn_deadlines.get(conn_id) {
            Some(prev) if *prev > sampled_deadline => *prev,
            _ => sampled_deadline,
        };
        conn_deadlines.insert(conn_id.clone(), deadline);
        drop(conn_deadlines);

        self.schedule_at(deadline, ScheduledEvent::ConnectionData { conn_id: conn_id.clone(), data }).await;
        Ok(())
    }
}

/// A discrete-event, seedable simulation of a lossy packet-switched network.
///
/// Owns a dedicated background task that drains the delivery scheduler;
/// dropping the last clone of the simulator does not stop that task, call
/// [`Simulator::stop`] explicitly (or let the process exit).
#[derive(Clone)]
pub struct Simulator {
    inner: Arc<Inner>,
    scheduler: Arc<JoinHandle<()>>,
}

impl Simulator {
    pub fn new(config: SimulatorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_rng(rand::thread_rng()).expect("thread_rng is infallible"),
        };
        let inner = Arc::new(Inner {
            topology: RwLock::new(HashMap::new()),
            message_queues: Mutex::new(HashMap::new()),
            message_notify: Notify::new(),
            connections: RwLock::new(HashMap::new()),
            listeners: RwLock::new(HashMap::new()),
            used_ports: Mutex::new(HashMap::new()),
            rng: Mutex::new(rng),
            started: AtomicBool::new(false),
            timers: Mutex::new(BinaryHeap::new()),
            timer_notify: Notify::new(),
            next_seq: AtomicU64::new(0),
            conn_write_deadlines: Mutex::new(HashMap::new()),
        });
        let scheduler = tokio::spawn(Self::run_scheduler(inner.clone()));
        Self { inner, scheduler: Arc::new(scheduler) }
    }

    pub fn start(&self) {
        self.inner.started.store(true, Ordering::SeqCst);
    }

    pub fn stop(&self) {
        self.inner.started.store(false, Ordering::SeqCst);
    }

    pub fn is_started(&self) -> bool {
        self.inner.is_started()
    }

    /// Drop every node, edge, connection, listener, and scheduled event,
    /// restoring a just-constructed simulator's empty state.
    pub async fn reset(&self) {
        self.inner.topology.write().await.clear();
        self.inner.message_queues.lock().await.clear();
        self.inner.connections.write().await.clear();
        self.inner.listeners.write().await.clear();
        self.inner.used_ports.lock().await.clear();
        self.inner.timers.lock().await.clear();
        self.inner.conn_write_deadlines.lock().await.clear();
    }

    pub async fn add_node(&self, address: impl Into<Address>) {
        let address = address.into();
        let mut topology = self.inner.topology.write().await;
        topology.entry(address).or_insert_with(HashMap::new);
    }

    /// Remove `address` from the topology along with every edge, connection,
    /// and listener involving it.
    pub async fn remove_node(&self, address: &str) {
        {
            let mut topology = self.inner.topology.write().await;
            topology.remove(address);
            for edges in topology.values_mut() {
                edges.remove(address);
            }
        }
        {
            let mut connections = self.inner.connections.write().await;
            connections.retain(|id, state| {
                let involved = id.src.address == address || id.dst.address == address;
                if involved {
                    state.force_close();
                }
                !involved
            });
        }
        {
            let mut listeners = self.inner.listeners.write().await;
            listeners.retain(|endpoint, state| {
                let involved = endpoint.address == address;
                if involved {
                    state.force_close();
                }
                !involved
            });
        }
        self.inner.used_ports.lock().await.remove(address);
        self.inner.message_queues.lock().await.remove(address);
        self.inner
            .conn_write_deadlines
            .lock()
            .await
            .retain(|id, _| id.src.address != address && id.dst.address != address);
    }

    pub async fn add_edge(&self, from: impl Into<Address>, to: impl Into<Address>, edge: NetworkEdge) {
        let from = from.into();
        let to = to.into();
        let mut topology = self.inner.topology.write().await;
        topology.entry(from).or_insert_with(HashMap::new).insert(to, edge);
    }

    pub async fn remove_edge(&self, from: &str, to: &str) {
        let mut topology = self.inner.topology.write().await;
        if let Some(edges) = topology.get_mut(from) {
            edges.remove(to);
        }
    }

    pub async fn has_node(&self, address: &str) -> bool {
        self.inner.topology.read().await.contains_key(address)
    }

    pub async fn has_edge(&self, from: &str, to: &str) -> bool {
        self.inner.topology.read().await.get(from).map_or(false, |edges| edges.contains_key(to))
    }

    pub async fn get_edge(&self, from: &str, to: &str) -> Option<NetworkEdge> {
        self.inner.topology.read().await.get(from).and_then(|edges| edges.get(to)).copied()
    }

    /// Create a [`Node`] handle bound to `address`. `address` must already
    /// have been registered with [`Simulator::add_node`].
    pub fn create_node(&self, address: impl Into<Address>) -> Node {
        Node::new(address.into(), self.inner.clone())
    }

    async fn run_scheduler(inner: Arc<Inner>) {
        loop {
            let next_deadline = { inner.timers.lock().await.peek().map(|Reverse(e)| e.deadline) };
            match next_deadline {
                None => inner.timer_notify.notified().await,
                Some(deadline) => {
                    tokio::select! {
                        _ = sleep_until(deadline) => {
                            Self::drain_due(&inner).await;
                        }
                        _ = inner.timer_notify.notified() => {}
                    }
                }
            }
        }
    }

    async fn drain_due(inner: &Arc<Inner>) {
        let now = Instant::now();
        let mut due = Vec::new();
        {
            let mut timers = inner.timers.lock().await;
            while let Some(Reverse(top)) = timers.peek() {
                if top.deadline <= now {
                    due.push(timers.pop().unwrap().0.event);
                } else {
                    break;
                }
            }
        }
        for event in due {
            Self::process_event(inner, event).await;
        }
    }

    async fn process_event(inner: &Arc<Inner>, event: ScheduledEvent) {
        match event {
            ScheduledEvent::Message(msg) => {
                let mut queues = inner.message_queues.lock().await;
                queues.entry(msg.destination.address.clone()).or_insert_with(VecDeque::new).push_back(msg);
                drop(queues);
                inner.message_notify.notify_waiters();
            }
            ScheduledEvent::ConnectionData { conn_id, data } => {
                let dest_id = conn_id.reversed();
                let connections = inner.connections.read().await;
                if let Some(state) = connections.get(&dest_id) {
                    state.deliver(data).await;
                }
            }
            ScheduledEvent::ConnectionEstablish {
                listener_endpoint,
                client_conn_id,
                server_conn_id,
                client_state,
                server_state,
                reply,
            } => {
                let listeners = inner.listeners.read().await;
                match listeners.get(&listener_endpoint) {
                    Some(listener) if listener.is_listening() => {
                        let mut connections = inner.connections.write().await;
                        connections.insert(client_conn_id, client_state);
                        connections.insert(server_conn_id, server_state.clone());
                        drop(connections);
                        listener.queue_pending(server_state).await;
                        let _ = reply.send(Ok(()));
                    }
                    _ => {
                        let _ = reply.send(Err(NetSimError::ConnectionRefused(listener_endpoint)));
                    }
                }
            }
        }
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if Arc::strong_count(&self.scheduler) == 1 {
            self.scheduler.abort();
        }
    }
}
