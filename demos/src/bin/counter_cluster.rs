//! Brings up a three-node counter cluster over the network simulator,
//! initializes it, and drives a handful of client writes against whichever
//! node ends up elected leader.
//!
//! Spawns one `Raft` per node against a shared transport and polls
//! `metrics()` for the leader to appear.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use demos::CounterStateMachine;
use memstore::MemStore;
use net_sim::{spawn_server, NetworkEdge, SimNetwork, Simulator, SimulatorConfig};
use raft::{ClientWriteRequest, Config, NodeId, Raft, State};

const RPC_PORT: u16 = 9000;
const NODE_IDS: [NodeId; 3] = [1, 2, 3];

fn node_address(id: NodeId) -> String {
    format!("node-{id}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let sim = Simulator::new(SimulatorConfig::default());
    for id in NODE_IDS {
        sim.add_node(node_address(id)).await;
    }
    for from in NODE_IDS {
        for to in NODE_IDS {
            if from != to {
                sim.add_edge(node_address(from), node_address(to), NetworkEdge::new(Duration::from_millis(5), 1.0))
                    .await;
            }
        }
    }
    sim.start();

    let config = Arc::new(Config::build().validate()?);
    let mut handles = Vec::new();
    for id in NODE_IDS {
        let node = sim.create_node(node_address(id));
        let network = Arc::new(SimNetwork::new(node.clone(), RPC_PORT, |target| node_address(target)));
        let storage = Arc::new(MemStore::new(id, CounterStateMachine::default()));
        let raft = Raft::new(id, config.clone(), network, storage);
        spawn_server(node, RPC_PORT, raft.clone());
        handles.push(raft);
    }

    let members: BTreeSet<NodeId> = NODE_IDS.iter().copied().collect();
    handles[0].initialize(members).await?;

    let leader = handles[0].wait(Duration::from_secs(5)).state(State::Leader).await;
    let leader = match leader {
        Ok(_) => &handles[0],
        Err(_) => {
            // node 0 didn't win this election; fall back to polling every
            // node's view of current_leader.
            let metrics = handles[0].metrics().borrow().clone();
            let leader_id = metrics.current_leader.unwrap_or(1);
            handles.iter().find(|r| r.metrics().borrow().id == leader_id).unwrap_or(&handles[0])
        }
    };

    for command in ["INC", "INC", "INC", "DEC", "GET"] {
        let response = leader.client_write(ClientWriteRequest::new(command.as_bytes().to_vec(), None)).await?;
        println!("{command} -> {}", String::from_utf8_lossy(&response.data));
    }

    for raft in &handles {
        raft.shutdown().await?;
    }
    Ok(())
}
