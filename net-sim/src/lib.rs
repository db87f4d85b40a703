//! A deterministic, seedable discrete-event network simulator.
//!
//! A directed weighted graph of simulated links, per-node datagram inboxes,
//! and connection-oriented byte streams with configurable latency and drop
//! probability. Used by `raft`'s test suite as the default transport in
//! place of a real socket layer, via [`network::SimNetwork`].

mod connection;
mod error;
mod listener;
mod network;
mod node;
mod simulator;
mod types;

pub use connection::Connection;
pub use error::NetSimError;
pub use listener::Listener;
pub use network::{spawn_server, SimNetwork};
pub use node::Node;
pub use simulator::{Simulator, SimulatorConfig};
pub use types::{Address, ConnectionId, Endpoint, Message, NetworkEdge, Port};
