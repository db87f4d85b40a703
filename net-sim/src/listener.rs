//! A bound, listening endpoint that accepts inbound connections.
//!
//! A FIFO of pending connections woken on arrival or close via a `Notify`
//! plus an `AtomicBool` closed flag.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};

use crate::connection::{Connection, ConnectionState};
use crate::error::NetSimError;
use crate::simulator::Inner;
use crate::types::Endpoint;

pub(crate) struct ListenerState {
    endpoint: Endpoint,
    listening: AtomicBool,
    pending: Mutex<VecDeque<Arc<ConnectionState>>>,
    notify: Notify,
}

impl ListenerState {
    pub(crate) fn new(endpoint: Endpoint) -> Self {
        Self { endpoint, listening: AtomicBool::new(true), pending: Mutex::new(VecDeque::new()), notify: Notify::new() }
    }

    pub(crate) fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    pub(crate) async fn queue_pending(&self, conn: Arc<ConnectionState>) {
        self.pending.lock().await.push_back(conn);
        self.notify.notify_waiters();
    }

    /// Mark this listener closed without going through the owning [`Listener`]
    /// handle, used when [`crate::simulator::Simulator::remove_node`] tears
    /// down every listener bound to a removed address.
    pub(crate) fn force_close(&self) {
        self.listening.store(false, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

/// The user-facing handle returned by [`crate::node::Node::bind`].
pub struct Listener {
    state: Arc<ListenerState>,
    inner: Arc<Inner>,
    local_address: String,
}

impl Listener {
    pub(crate) fn new(state: Arc<ListenerState>, inner: Arc<Inner>, local_address: String) -> Self {
        Self { state, inner, local_address }
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.state.endpoint
    }

    pub fn is_listening(&self) -> bool {
        self.state.is_listening()
    }

    /// Wait for the oldest queued inbound connection. Closing the listener
    /// wakes every waiter with `ConnectionClosed`.
    pub async fn accept(&self) -> Result<Connection, NetSimError> {
        loop {
            let notified = self.state.notify.notified();
            {
                let mut pending = self.state.pending.lock().await;
                if let Some(conn_state) = pending.pop_front() {
                    let id = crate::types::ConnectionId::new(conn_state.local(), conn_state.remote());
                    return Ok(Connection::new(id, conn_state, self.inner.clone()));
                }
            }
            if !self.is_listening() {
                return Err(NetSimError::ConnectionClosed);
            }
            notified.await;
        }
    }

    pub async fn accept_timeout(&self, duration: Duration) -> Result<Connection, NetSimError> {
        timeout(duration, self.accept()).await.map_err(|_| NetSimError::Timeout)?
    }

    pub async fn close(&self) {
        self.state.listening.store(false, Ordering::SeqCst);
        self.state.notify.notify_waiters();
        self.inner.unbind_listener(&self.state.endpoint).await;
        self.inner.release_port(&self.local_address, self.state.endpoint.port).await;
    }
}
