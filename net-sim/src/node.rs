//! A node's view of the network: its own address, datagram send/receive,
//! and connection-oriented bind/connect.
//!
//! `address()`, `send`/`receive`, `connect`, `bind`, plus private ephemeral
//! port allocation.

use std::sync::Arc;

use tokio::time::{timeout, Duration};

use crate::connection::Connection;
use crate::error::NetSimError;
use crate::listener::{Listener, ListenerState};
use crate::simulator::Inner;
use crate::types::{Address, Endpoint, Message, Port};

/// A handle bound to one address in a [`crate::simulator::Simulator`].
/// Cheap to clone; every clone shares the same simulator state.
#[derive(Clone)]
pub struct Node {
    address: Address,
    inner: Arc<Inner>,
}

impl Node {
    pub(crate) fn new(address: Address, inner: Arc<Inner>) -> Self {
        Self { address, inner }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send a connectionless datagram to `destination`.
    pub async fn send(&self, destination: Endpoint, payload: Vec<u8>) -> Result<(), NetSimError> {
        let msg = Message { source: Endpoint::new(self.address.clone(), 0), destination, payload };
        self.inner.send_message(msg).await
    }

    pub async fn send_timeout(&self, destination: Endpoint, payload: Vec<u8>, duration: Duration) -> Result<(), NetSimError> {
        timeout(duration, self.send(destination, payload)).await.map_err(|_| NetSimError::Timeout)?
    }

    /// Wait for the next datagram addressed to this node.
    pub async fn receive(&self) -> Message {
        loop {
            let notified = self.inner.message_notify().notified();
            if let Some(msg) = self.inner.receive_message(&self.address).await {
                return msg;
            }
            notified.await;
        }
    }

    pub async fn receive_timeout(&self, duration: Duration) -> Result<Message, NetSimError> {
        timeout(duration, self.receive()).await.map_err(|_| NetSimError::Timeout)
    }

    /// Open a connection to `(dst_address, dst_port)` from a freshly
    /// allocated ephemeral source port.
    pub async fn connect(&self, dst_address: impl Into<Address>, dst_port: Port) -> Result<Connection, NetSimError> {
        let src_port = self.inner.allocate_ephemeral_port(&self.address).await?;
        self.connect_from(src_port, dst_address, dst_port).await
    }

    pub async fn connect_from(
        &self,
        src_port: Port,
        dst_address: impl Into<Address>,
        dst_port: Port,
    ) -> Result<Connection, NetSimError> {
        let local = Endpoint::new(self.address.clone(), src_port);
        let remote = Endpoint::new(dst_address.into(), dst_port);
        self.inner.connect(local, remote).await
    }

    pub async fn connect_timeout(
        &self,
        dst_address: impl Into<Address>,
        dst_port: Port,
        duration: Duration,
    ) -> Result<Connection, NetSimError> {
        let dst_address = dst_address.into();
        timeout(duration, self.connect(dst_address, dst_port)).await.map_err(|_| NetSimError::Timeout)?
    }

    /// Bind a listener on a freshly allocated ephemeral port.
    pub async fn bind(&self) -> Result<Listener, NetSimError> {
        let port = self.inner.allocate_ephemeral_port(&self.address).await?;
        self.bind_port(port).await
    }

    pub async fn bind_port(&self, port: Port) -> Result<Listener, NetSimError> {
        self.inner.reserve_port(&self.address, port).await?;
        let endpoint = Endpoint::new(self.address.clone(), port);
        let state: Arc<ListenerState> = self.inner.bind_listener(endpoint).await;
        Ok(Listener::new(state, self.inner.clone(), self.address.clone()))
    }
}
