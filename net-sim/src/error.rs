//! Error taxonomy for the simulator. Kept as distinct variants rather than
//! collapsing everything into `Timeout`, per the decision recorded in
//! `DESIGN.md`.

use thiserror::Error;

use crate::types::{Address, Endpoint, Port};

#[derive(Debug, Error)]
pub enum NetSimError {
    #[error("simulator is not started")]
    NotStarted,

    #[error("node {0:?} is not registered with the simulator")]
    NodeNotFound(Address),

    #[error("no route from {from:?} to {to:?}")]
    NoRoute { from: Address, to: Address },

    #[error("connection refused: no listener on {0}")]
    ConnectionRefused(Endpoint),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("message dropped in transit from {from:?} to {to:?} (reliability failure)")]
    Dropped { from: Address, to: Address },

    #[error("operation timed out")]
    Timeout,

    #[error("port {0} already in use")]
    PortInUse(Port),

    #[error("no ephemeral ports available on {0:?}")]
    NoPortsAvailable(Address),
}
