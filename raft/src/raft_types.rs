//! The small value types shared by every module in this crate.

use std::fmt;

/// The identifier of a single node in a cluster.
pub type NodeId = u64;

/// An election term. Monotonically increasing; term 0 never elects a leader.
pub type Term = u64;

/// A 1-based position in the replicated log. Index 0 means "before the log".
pub type LogIndex = u64;

/// A `(term, index)` pair, compared lexicographically on `(term, index)` to
/// decide which of two logs is more up to date.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: Term,
    pub index: LogIndex,
}

impl LogId {
    pub const fn new(term: Term, index: LogIndex) -> Self {
        Self { term, index }
    }

    /// The `LogId` preceding the first entry of any log.
    pub const fn none() -> Self {
        Self { term: 0, index: 0 }
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

/// A client's identity, used to key the session table for at-most-once execution.
pub type ClientId = String;

/// A per-client monotonically increasing request sequence number.
pub type SerialId = u64;
