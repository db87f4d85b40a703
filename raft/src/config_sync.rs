//! Drives the two-phase joint-consensus membership change.
//!
//! An explicit three-phase state machine (`None` -> `JointPending` ->
//! `FinalPending` -> `None`) that rejects concurrent `start()` calls and
//! completes the caller's future only once C_new itself has committed.

use std::time::{Duration, Instant};

use tokio::sync::oneshot;

use crate::error::{ConfigChangePhase, RaftError};
use crate::quorum::ClusterConfiguration;
use crate::raft_types::LogIndex;

#[derive(Debug)]
struct InProgress {
    phase: ConfigChangePhase,
    target: ClusterConfiguration,
    started_at: Instant,
    timeout: Duration,
    joint_config_index: Option<LogIndex>,
    tx: oneshot::Sender<Result<(), RaftError>>,
}

/// State machine coordinating a single in-flight membership change at a time.
#[derive(Default)]
pub struct ConfigurationSynchronizer {
    state: Option<InProgress>,
}

impl ConfigurationSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_in_progress(&self) -> bool {
        self.state.is_some()
    }

    pub fn current_phase(&self) -> ConfigChangePhase {
        self.state.as_ref().map(|s| s.phase).unwrap_or(ConfigChangePhase::None)
    }

    pub fn target_configuration(&self) -> Option<&ClusterConfiguration> {
        self.state.as_ref().map(|s| &s.target)
    }

    pub fn is_waiting_for_joint_consensus(&self) -> bool {
        matches!(self.current_phase(), ConfigChangePhase::JointPending)
    }

    pub fn is_waiting_for_final_configuration(&self) -> bool {
        matches!(self.current_phase(), ConfigChangePhase::FinalPending)
    }

    /// Begin a membership change to `new_config`. Rejects (returns `Err` with
    /// the receiver dropped) if a change is already in progress.
    pub fn start(
        &mut self,
        new_config: ClusterConfiguration,
        timeout: Duration,
    ) -> Result<oneshot::Receiver<Result<(), RaftError>>, RaftError> {
        if self.state.is_some() {
            return Err(RaftError::ConfigChangeInProgress);
        }
        let (tx, rx) = oneshot::channel();
        self.state = Some(InProgress {
            phase: ConfigChangePhase::JointPending,
            target: new_config,
            started_at: Instant::now(),
            timeout,
            joint_config_index: None,
            tx,
        });
        Ok(rx)
    }

    /// Notify the synchronizer that `config` committed at `committed_index`.
    /// Returns the next configuration entry to append, if the commit moves
    /// the state machine into a new phase requiring one.
    pub fn notify_committed(
        &mut self,
        config: &ClusterConfiguration,
        committed_index: LogIndex,
    ) -> Option<ClusterConfiguration> {
        let in_progress = self.state.as_mut()?;
        match in_progress.phase {
            ConfigChangePhase::None => None,
            ConfigChangePhase::JointPending if config.is_joint() => {
                in_progress.joint_config_index = Some(committed_index);
                in_progress.phase = ConfigChangePhase::FinalPending;
                Some(in_progress.target.to_final())
            }
            ConfigChangePhase::FinalPending if !config.is_joint() && config.nodes == in_progress.target.nodes => {
                let in_progress = self.state.take().unwrap();
                let _ = in_progress.tx.send(Ok(()));
                None
            }
            _ => None,
        }
    }

    pub fn cancel(&mut self, reason: impl Into<String>) {
        if let Some(in_progress) = self.state.take() {
            let _ = in_progress.tx.send(Err(RaftError::ConfigurationChange {
                phase: in_progress.phase,
                reason: reason.into(),
            }));
        }
    }

    pub fn is_timed_out(&self) -> bool {
        match &self.state {
            Some(s) => s.started_at.elapsed() >= s.timeout,
            None => false,
        }
    }

    /// Cancels the in-flight change with a timeout reason if its deadline has passed.
    pub fn handle_timeout(&mut self) {
        if self.is_timed_out() {
            self.cancel("configuration change timed out");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use maplit::btreeset;

    #[tokio::test]
    async fn rejects_concurrent_start() {
        let mut sync = ConfigurationSynchronizer::new();
        let _rx = sync.start(ClusterConfiguration::new_uniform(btreeset! {1, 2, 3}), Duration::from_secs(60)).unwrap();
        let err = sync.start(ClusterConfiguration::new_uniform(btreeset! {1, 2}), Duration::from_secs(60));
        assert!(matches!(err, Err(RaftError::ConfigChangeInProgress)));
    }

    #[tokio::test]
    async fn completes_after_joint_then_final_commit() {
        let mut sync = ConfigurationSynchronizer::new();
        let rx = sync.start(ClusterConfiguration::new_uniform(btreeset! {1, 2, 3, 4}), Duration::from_secs(60)).unwrap();

        let joint = ClusterConfiguration::new_joint(btreeset! {1, 2, 3}, btreeset! {1, 2, 3, 4});
        let next = sync.notify_committed(&joint, 10);
        assert!(next.is_some());
        assert!(sync.is_waiting_for_final_configuration());

        let final_cfg = next.unwrap();
        let _ = sync.notify_committed(&final_cfg, 11);
        assert!(!sync.is_in_progress());
        assert!(rx.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn timeout_rejects_the_caller() {
        let mut sync = ConfigurationSynchronizer::new();
        let rx = sync.start(ClusterConfiguration::new_uniform(btreeset! {1, 2}), Duration::from_millis(0)).unwrap();
        sync.handle_timeout();
        assert!(rx.await.unwrap().is_err());
        assert!(!sync.is_in_progress());
    }
}
