//! Wire-level types shared by the whole simulator.
//!
//! `NetworkEdge`, `Endpoint`, `ConnectionId`, and `Message` use plain string
//! addresses and `u16` ports; nothing in this crate needs a separate
//! IPv4/IPv6 wrapper type.

use std::time::Duration;

pub type Address = String;
pub type Port = u16;

/// A directed link in the simulated topology: the delay and drop probability
/// applied to every message routed across it.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkEdge {
    pub latency: Duration,
    pub reliability: f64,
}

impl Default for NetworkEdge {
    fn default() -> Self {
        Self { latency: Duration::from_millis(0), reliability: 1.0 }
    }
}

impl NetworkEdge {
    pub fn new(latency: Duration, reliability: f64) -> Self {
        Self { latency, reliability }
    }
}

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct Endpoint {
    pub address: Address,
    pub port: Port,
}

impl Endpoint {
    pub fn new(address: impl Into<Address>, port: Port) -> Self {
        Self { address: address.into(), port }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// Identifies one direction of a connection. The peer holds the reversed
/// tuple: `ConnectionId{src, dst}` on one side is registered as
/// `ConnectionId{dst, src}` on the other.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ConnectionId {
    pub src: Endpoint,
    pub dst: Endpoint,
}

impl ConnectionId {
    pub fn new(src: Endpoint, dst: Endpoint) -> Self {
        Self { src, dst }
    }

    pub fn reversed(&self) -> Self {
        Self { src: self.dst.clone(), dst: self.src.clone() }
    }
}

/// A single datagram routed through [`crate::simulator::Simulator::send`].
#[derive(Clone, Debug)]
pub struct Message {
    pub source: Endpoint,
    pub destination: Endpoint,
    pub payload: Vec<u8>,
}
