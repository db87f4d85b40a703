//! Runtime configuration for a `Raft` node.
//!
//! A plain data struct plus a validating builder, so call sites read
//! `Config::build().election_timeout_min(200).validate()`.

use std::time::Duration;

use crate::error::ConfigError;

/// Configuration for a Raft node, its election timing, replication batching,
/// and snapshotting thresholds.
#[derive(Clone, Debug)]
pub struct Config {
    /// Lower bound of the randomized election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// Upper bound of the randomized election timeout, in milliseconds. Must exceed `election_timeout_min`.
    pub election_timeout_max: u64,
    /// Interval between leader heartbeats, in milliseconds. Must be less than `election_timeout_min`.
    pub heartbeat_interval: u64,
    /// Per-RPC-attempt timeout, in milliseconds.
    pub rpc_timeout: u64,
    /// Maximum number of log entries batched into a single AppendEntries RPC.
    pub max_entries_per_append: u64,
    /// Log size, in bytes, above which a snapshot is triggered.
    pub snapshot_threshold_bytes: u64,
    /// Maximum payload size of a single InstallSnapshot chunk, in bytes.
    pub snapshot_chunk_size: u64,
    /// Capacity of the client session LRU used for at-most-once semantics.
    pub session_table_capacity: usize,
    /// Period on which the core loop checks election/heartbeat timers and drains
    /// timed-out commit waiters and configuration changes.
    pub tick_interval: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            election_timeout_min: 150,
            election_timeout_max: 300,
            heartbeat_interval: 50,
            rpc_timeout: 100,
            max_entries_per_append: 100,
            snapshot_threshold_bytes: 10_000_000,
            snapshot_chunk_size: 1_000_000,
            session_table_capacity: 10_000,
            tick_interval: 50,
        }
    }
}

impl Config {
    /// Start building a config from defaults.
    pub fn build() -> ConfigBuilder {
        ConfigBuilder { inner: Config::default() }
    }

    pub fn election_timeout_min_duration(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min)
    }

    pub fn election_timeout_max_duration(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max)
    }

    pub fn heartbeat_interval_duration(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval)
    }

    pub fn rpc_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout)
    }

    pub fn tick_interval_duration(&self) -> Duration {
        Duration::from_millis(self.tick_interval)
    }

    /// Validate internal consistency. Called by `ConfigBuilder::validate`, and
    /// again defensively at `RaftCore` startup.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.election_timeout_min >= self.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeout {
                min: self.election_timeout_min,
                max: self.election_timeout_max,
            });
        }
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(ConfigError::HeartbeatTooSlow {
                heartbeat: self.heartbeat_interval,
                election_timeout_min: self.election_timeout_min,
            });
        }
        if self.max_entries_per_append == 0 {
            return Err(ConfigError::ZeroMaxEntriesPerAppend);
        }
        if self.snapshot_chunk_size == 0 {
            return Err(ConfigError::ZeroSnapshotChunkSize);
        }
        Ok(())
    }
}

/// Builder for `Config`. Every setter takes `self` by value so calls chain.
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    inner: Config,
}

macro_rules! setter {
    ($name:ident, $ty:ty) => {
        pub fn $name(mut self, value: $ty) -> Self {
            self.inner.$name = value;
            self
        }
    };
}

impl ConfigBuilder {
    setter!(election_timeout_min, u64);
    setter!(election_timeout_max, u64);
    setter!(heartbeat_interval, u64);
    setter!(rpc_timeout, u64);
    setter!(max_entries_per_append, u64);
    setter!(snapshot_threshold_bytes, u64);
    setter!(snapshot_chunk_size, u64);
    setter!(session_table_capacity, usize);
    setter!(tick_interval, u64);

    /// Validate and finish building.
    pub fn validate(self) -> Result<Config, ConfigError> {
        self.inner.validate()?;
        Ok(self.inner)
    }
}
