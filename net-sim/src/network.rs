//! The bridge between `net-sim` and `raft`: a `RaftNetwork` implementation
//! over the simulator's connection primitives, and a server loop dispatching
//! inbound RPCs into a local `Raft` handle.
//!
//! One persistent connection per ordered pair of nodes, each RPC framed as
//! length-prefixed `JsonCodec` bytes reusing `raft::network`'s `serde_json`
//! wire format directly.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use raft::network::{Codec, JsonCodec, RaftNetwork as RaftNetworkTrait, RpcEnvelope, RpcResponseEnvelope};
use raft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse, Raft,
    RequestVoteRequest, RequestVoteResponse,
};
use raft::raft_types::NodeId;
use raft::storage::Persistence;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::connection::Connection;
use crate::error::NetSimError;
use crate::node::Node;
use crate::types::Port;

async fn write_frame(conn: &Connection, bytes: &[u8]) -> Result<(), NetSimError> {
    let mut framed = Vec::with_capacity(4 + bytes.len());
    framed.extend_from_slice(&(bytes.len() as u32).to_be_bytes());
    framed.extend_from_slice(bytes);
    conn.write(framed).await
}

/// Pulls length-prefixed frames off a connection one at a time, buffering
/// whatever bytes arrive past the current frame's boundary for next time.
struct FrameReader {
    buf: VecDeque<u8>,
}

impl FrameReader {
    fn new() -> Self {
        Self { buf: VecDeque::new() }
    }

    async fn read_frame(&mut self, conn: &Connection) -> Result<Vec<u8>, NetSimError> {
        loop {
            if self.buf.len() >= 4 {
                let len = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]) as usize;
                if self.buf.len() >= 4 + len {
                    self.buf.drain(..4);
                    return Ok(self.buf.drain(..len).collect());
                }
            }
            let chunk = conn.read().await?;
            self.buf.extend(chunk);
        }
    }
}

struct PeerLink {
    conn: Connection,
    reader: FrameReader,
}

/// A `RaftNetwork` implementation that routes every RPC through the
/// simulator, maintaining one lazily-established connection per target node.
pub struct SimNetwork {
    node: Node,
    rpc_port: Port,
    addr_of: Arc<dyn Fn(NodeId) -> String + Send + Sync>,
    codec: JsonCodec,
    links: Mutex<HashMap<NodeId, Arc<Mutex<Option<PeerLink>>>>>,
}

impl SimNetwork {
    pub fn new(node: Node, rpc_port: Port, addr_of: impl Fn(NodeId) -> String + Send + Sync + 'static) -> Self {
        Self { node, rpc_port, addr_of: Arc::new(addr_of), codec: JsonCodec, links: Mutex::new(HashMap::new()) }
    }

    async fn link_for(&self, target: NodeId) -> Arc<Mutex<Option<PeerLink>>> {
        self.links.lock().await.entry(target).or_insert_with(|| Arc::new(Mutex::new(None))).clone()
    }

    async fn call(&self, target: NodeId, request: RpcEnvelope) -> anyhow::Result<RpcResponseEnvelope> {
        let link = self.link_for(target).await;
        let mut guard = link.lock().await;

        if guard.is_none() || !guard.as_ref().unwrap().conn.is_open() {
            let address = (self.addr_of)(target);
            let conn = self.node.connect(address, self.rpc_port).await?;
            *guard = Some(PeerLink { conn, reader: FrameReader::new() });
        }

        let bytes = self.codec.encode_request(&request)?;
        let link = guard.as_mut().expect("just established above");
        write_frame(&link.conn, &bytes).await?;
        let response_bytes = link.reader.read_frame(&link.conn).await?;
        Ok(self.codec.decode_response(&response_bytes)?)
    }
}

#[async_trait]
impl RaftNetworkTrait for SimNetwork {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest,
    ) -> anyhow::Result<AppendEntriesResponse> {
        match self.call(target, RpcEnvelope::AppendEntries(rpc)).await? {
            RpcResponseEnvelope::AppendEntries(response) => Ok(response),
            _ => anyhow::bail!("peer {} returned a mismatched response kind for append_entries", target),
        }
    }

    async fn send_vote(&self, target: NodeId, rpc: RequestVoteRequest) -> anyhow::Result<RequestVoteResponse> {
        match self.call(target, RpcEnvelope::RequestVote(rpc)).await? {
            RpcResponseEnvelope::RequestVote(response) => Ok(response),
            _ => anyhow::bail!("peer {} returned a mismatched response kind for request_vote", target),
        }
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        match self.call(target, RpcEnvelope::InstallSnapshot(rpc)).await? {
            RpcResponseEnvelope::InstallSnapshot(response) => Ok(response),
            _ => anyhow::bail!("peer {} returned a mismatched response kind for install_snapshot", target),
        }
    }
}

/// Binds `node` on `rpc_port` and dispatches every inbound RPC to `raft`,
/// one spawned task per accepted connection. Returns the listener's accept
/// loop as a background task; dropping the returned handle does not stop it.
pub fn spawn_server<N, S>(node: Node, rpc_port: Port, raft: Raft<N, S>) -> JoinHandle<()>
where
    N: RaftNetworkTrait + 'static,
    S: Persistence + 'static,
{
    tokio::spawn(async move {
        let listener = match node.bind_port(rpc_port).await {
            Ok(listener) => listener,
            Err(e) => {
                tracing::error!(error = %e, port = rpc_port, "failed to bind raft rpc listener");
                return;
            }
        };
        loop {
            match listener.accept().await {
                Ok(conn) => {
                    let raft = raft.clone();
                    tokio::spawn(serve_connection(conn, raft));
                }
                Err(_) => return,
            }
        }
    })
}

async fn serve_connection<N, S>(conn: Connection, raft: Raft<N, S>)
where
    N: RaftNetworkTrait + 'static,
    S: Persistence + 'static,
{
    let codec = JsonCodec;
    let mut reader = FrameReader::new();
    loop {
        let request_bytes = match reader.read_frame(&conn).await {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        let envelope = match codec.decode_request(&request_bytes) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "failed to decode inbound rpc envelope");
                return;
            }
        };
        let response = match envelope {
            RpcEnvelope::AppendEntries(request) => {
                raft.append_entries(request).await.map(RpcResponseEnvelope::AppendEntries)
            }
            RpcEnvelope::RequestVote(request) => raft.vote(request).await.map(RpcResponseEnvelope::RequestVote),
            RpcEnvelope::InstallSnapshot(request) => {
                raft.install_snapshot(request).await.map(RpcResponseEnvelope::InstallSnapshot)
            }
        };
        let response = match response {
            Ok(response) => response,
            Err(e) => {
                tracing::warn!(error = %e, "raft core rejected an inbound rpc");
                return;
            }
        };
        let response_bytes = match codec.encode_response(&response) {
            Ok(bytes) => bytes,
            Err(_) => return,
        };
        if write_frame(&conn, &response_bytes).await.is_err() {
            return;
        }
    }
}
