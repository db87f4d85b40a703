//! Bridges "entry committed and applied" events to client-visible futures.
//!
//! A registry of pending operations keyed by log index, each completed via a
//! `oneshot` channel rather than an arbitrary callback — sending on a
//! `oneshot::Sender` never blocks or calls back into the core, so fulfilling
//! an operation can never reacquire the core's state synchronously.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::RaftError;
use crate::raft_types::{LogIndex, Term};

/// What a pending operation resolves to: the bytes the state machine
/// returned for the committed entry.
pub type CommitResult = Result<Vec<u8>, RaftError>;

struct PendingOperation {
    tx: oneshot::Sender<CommitResult>,
    submitted_at: Instant,
    timeout: Option<Duration>,
}

impl PendingOperation {
    fn is_timed_out(&self, now: Instant) -> bool {
        match self.timeout {
            Some(timeout) => now.duration_since(self.submitted_at) >= timeout,
            None => false,
        }
    }
}

/// Registry of client operations waiting on a log index to be committed and
/// applied. Owned exclusively by the Raft core task, so no internal locking
/// is needed — the single-writer actor model makes the mutex implicit.
#[derive(Default)]
pub struct CommitWaiter {
    pending: BTreeMap<LogIndex, Vec<PendingOperation>>,
}

impl CommitWaiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new pending operation at `index`, returning the receiver
    /// half the caller should await. Multiple registrations at the same
    /// index are permitted.
    pub fn register(&mut self, index: LogIndex, timeout: Option<Duration>) -> oneshot::Receiver<CommitResult> {
        let (tx, rx) = oneshot::channel();
        let op = PendingOperation { tx, submitted_at: Instant::now(), timeout };
        self.pending.entry(index).or_default().push(op);
        rx
    }

    /// Fulfill every pending operation with `entry_index <= commit_index`,
    /// fetching each entry's result lazily via `result_for`. If `result_for`
    /// itself fails (e.g. because the state machine application errored),
    /// that failure is routed to the waiting callers instead.
    pub fn notify_committed_and_applied<F>(&mut self, commit_index: LogIndex, mut result_for: F)
    where
        F: FnMut(LogIndex) -> CommitResult,
    {
        let ready_indices: Vec<LogIndex> =
            self.pending.range(..=commit_index).map(|(index, _)| *index).collect();
        for index in ready_indices {
            if let Some(ops) = self.pending.remove(&index) {
                let result = result_for(index);
                for op in ops {
                    let _ = op.tx.send(clone_result(&result));
                }
            }
        }
    }

    /// Reject every operation whose deadline has passed. Returns the number cancelled.
    pub fn cancel_timed_out(&mut self) -> usize {
        let now = Instant::now();
        let mut cancelled = 0;
        self.pending.retain(|index, ops| {
            let (timed_out, keep): (Vec<_>, Vec<_>) = ops.drain(..).partition(|op| op.is_timed_out(now));
            for op in timed_out {
                cancelled += 1;
                let _ = op.tx.send(Err(RaftError::CommitTimeout {
                    index: *index,
                    duration_ms: op.timeout.map(|d| d.as_millis() as u64).unwrap_or(0),
                }));
            }
            *ops = keep;
            !ops.is_empty()
        });
        cancelled
    }

    /// Reject every pending operation with a generic reason and clear the registry.
    pub fn cancel_all(&mut self, reason: impl Into<String> + Clone) {
        for (_, ops) in std::mem::take(&mut self.pending) {
            for op in ops {
                let _ = op.tx.send(Err(RaftError::Protocol(reason.clone().into())));
            }
        }
    }

    /// Reject every pending operation because leadership was lost.
    pub fn cancel_leadership_lost(&mut self, old_term: Term, new_term: Term) {
        for (_, ops) in std::mem::take(&mut self.pending) {
            for op in ops {
                let _ = op.tx.send(Err(RaftError::LeadershipLost { old_term, new_term }));
            }
        }
    }

    /// Reject operations with `entry_index == index`. Returns the number cancelled.
    pub fn cancel_for_index(&mut self, index: LogIndex, reason: impl Into<String> + Clone) -> usize {
        match self.pending.remove(&index) {
            Some(ops) => {
                let count = ops.len();
                for op in ops {
                    let _ = op.tx.send(Err(RaftError::Protocol(reason.clone().into())));
                }
                count
            }
            None => 0,
        }
    }

    /// Reject operations with `entry_index > after_index`, used when the log
    /// is truncated on an AppendEntries conflict or a snapshot install.
    /// Returns the number cancelled.
    pub fn cancel_after(&mut self, after_index: LogIndex, reason: impl Into<String> + Clone) -> usize {
        let tail: Vec<LogIndex> = self.pending.range((after_index + 1)..).map(|(i, _)| *i).collect();
        let mut cancelled = 0;
        for index in tail {
            cancelled += self.cancel_for_index(index, reason.clone());
        }
        cancelled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.values().map(|v| v.len()).sum()
    }

    pub fn pending_count_for(&self, index: LogIndex) -> usize {
        self.pending.get(&index).map(|v| v.len()).unwrap_or(0)
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

fn clone_result(result: &CommitResult) -> CommitResult {
    match result {
        Ok(bytes) => Ok(bytes.clone()),
        Err(err) => Err(match err {
            RaftError::NotLeader(id) => RaftError::NotLeader(*id),
            RaftError::LeadershipLost { old_term, new_term } => {
                RaftError::LeadershipLost { old_term: *old_term, new_term: *new_term }
            }
            RaftError::CommitTimeout { index, duration_ms } => {
                RaftError::CommitTimeout { index: *index, duration_ms: *duration_ms }
            }
            RaftError::Protocol(msg) => RaftError::Protocol(msg.clone()),
            _ => RaftError::Fatal,
        }),
    }
}
