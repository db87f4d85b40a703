//! A connection-oriented byte stream between two simulated endpoints.
//!
//! `read`/`write`/`close`/`is_open` plus `local_endpoint`/`remote_endpoint`.
//! A pending `read()` waits on a `tokio::sync::Notify` rather than blocking a
//! dedicated thread per waiter.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout, Duration};

use crate::error::NetSimError;
use crate::simulator::Inner;
use crate::types::{ConnectionId, Endpoint};

pub(crate) struct ConnectionState {
    local: Endpoint,
    remote: Endpoint,
    open: AtomicBool,
    read_buffer: Mutex<VecDeque<u8>>,
    read_notify: Notify,
}

impl ConnectionState {
    pub(crate) fn new(local: Endpoint, remote: Endpoint) -> Self {
        Self { local, remote, open: AtomicBool::new(true), read_buffer: Mutex::new(VecDeque::new()), read_notify: Notify::new() }
    }

    pub(crate) fn local(&self) -> Endpoint {
        self.local.clone()
    }

    pub(crate) fn remote(&self) -> Endpoint {
        self.remote.clone()
    }

    pub(crate) async fn deliver(&self, data: Vec<u8>) {
        if !self.open.load(Ordering::SeqCst) {
            return;
        }
        self.read_buffer.lock().await.extend(data);
        self.read_notify.notify_waiters();
    }

    pub(crate) fn force_close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.read_notify.notify_waiters();
    }
}

/// The user-facing handle to one direction of an established connection.
pub struct Connection {
    id: ConnectionId,
    state: Arc<ConnectionState>,
    inner: Arc<Inner>,
}

impl Connection {
    pub(crate) fn new(id: ConnectionId, state: Arc<ConnectionState>, inner: Arc<Inner>) -> Self {
        Self { id, state, inner }
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.state.local
    }

    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.state.remote
    }

    pub fn is_open(&self) -> bool {
        self.state.open.load(Ordering::SeqCst)
    }

    /// Route `data` toward the peer, subject to the path's reliability and
    /// latency. A reliability drop surfaces as [`NetSimError::Dropped`]
    /// rather than silently vanishing.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), NetSimError> {
        if !self.is_open() {
            return Err(NetSimError::ConnectionClosed);
        }
        self.inner.write_connection(&self.id, data).await
    }

    pub async fn write_timeout(&self, data: Vec<u8>, duration: Duration) -> Result<(), NetSimError> {
        timeout(duration, self.write(data)).await.map_err(|_| NetSimError::Timeout)?
    }

    /// Wait for at least one byte to be available, then drain and return
    /// whatever has accumulated in the read buffer. Returns
    /// `ConnectionClosed` once the peer has closed and the buffer is empty.
    pub async fn read(&self) -> Result<Vec<u8>, NetSimError> {
        loop {
            // Register for the next notification before checking state, so a
            // delivery racing with this check isn't missed.
            let notified = self.state.read_notify.notified();
            {
                let mut buf = self.state.read_buffer.lock().await;
                if !buf.is_empty() {
                    return Ok(buf.drain(..).collect());
                }
            }
            if !self.is_open() {
                return Err(NetSimError::ConnectionClosed);
            }
            notified.await;
        }
    }

    pub async fn read_timeout(&self, duration: Duration) -> Result<Vec<u8>, NetSimError> {
        timeout(duration, self.read()).await.map_err(|_| NetSimError::Timeout)?
    }

    pub fn close(&self) {
        self.state.force_close();
    }
}
