//! Observability surface published by a running `Raft` node.
//!
//! A cheap, lock-free `watch` channel any number of observers can poll or
//! await on, plus a small combinator type used by tests to block until a
//! condition holds.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::timeout;

use crate::quorum::ClusterConfiguration;
use crate::raft_types::{LogId, NodeId, Term};

/// The three roles a node can occupy. Learner/witness roles are out of scope.
#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum State {
    Follower,
    Candidate,
    Leader,
}

/// Per-follower replication progress, published only while this node is Leader.
#[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LeaderMetrics {
    pub term: Term,
    pub replication: BTreeMap<NodeId, LogId>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    pub state: State,
    pub current_term: Term,
    pub last_log_index: u64,
    pub last_applied: u64,
    pub current_leader: Option<NodeId>,
    pub membership: ClusterConfiguration,
    pub snapshot: Option<LogId>,
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership: ClusterConfiguration::new_initial(id),
            snapshot: None,
            leader_metrics: None,
        }
    }
}

/// A handle tests and client code can poll for a `RaftMetrics` condition to
/// become true, with a timeout.
#[derive(Clone)]
pub struct Wait {
    pub rx: watch::Receiver<RaftMetrics>,
    pub timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum WaitError {
    #[error("timed out after {0:?} waiting for the expected condition")]
    Timeout(Duration),
    #[error("the metrics channel was closed")]
    ChannelClosed,
}

impl Wait {
    async fn poll_until<F>(&self, mut condition: F) -> Result<RaftMetrics, WaitError>
    where
        F: FnMut(&RaftMetrics) -> bool,
    {
        let mut rx = self.rx.clone();
        let current = rx.borrow().clone();
        if condition(&current) {
            return Ok(current);
        }
        timeout(self.timeout, async {
            loop {
                if rx.changed().await.is_err() {
                    return Err(WaitError::ChannelClosed);
                }
                let snapshot = rx.borrow().clone();
                if condition(&snapshot) {
                    return Ok(snapshot);
                }
            }
        })
        .await
        .map_err(|_| WaitError::Timeout(self.timeout))?
    }

    pub async fn log_index(&self, expected: u64) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.last_log_index == expected).await
    }

    pub async fn applied_index(&self, expected: u64) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.last_applied == expected).await
    }

    pub async fn state(&self, expected: State) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.state == expected).await
    }

    pub async fn current_leader(&self, expected: Option<NodeId>) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.current_leader == expected).await
    }

    pub async fn snapshot(&self, expected: LogId) -> Result<RaftMetrics, WaitError> {
        self.poll_until(|m| m.snapshot == Some(expected)).await
    }
}
