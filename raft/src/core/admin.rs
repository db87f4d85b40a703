//! Cluster bootstrap (`initialize`) and membership changes (`add_server`/`remove_server`).
//!
//! `initialize` may only run on a pristine node (empty log, term 0); the two
//! membership ops drive the `ConfigurationSynchronizer`'s joint-consensus
//! two-phase commit (there is no distinct non-voter catch-up role here,
//! just voters).

use std::collections::BTreeSet;

use tokio::sync::oneshot;

use crate::error::{ChangeMembershipError, InitializeError, RaftError};
use crate::network::RaftNetwork;
use crate::quorum::ClusterConfiguration;
use crate::raft::{Entry, EntryPayload};
use crate::raft_types::{LogId, NodeId};
use crate::storage::Persistence;

use super::RaftCore;

impl<N, S> RaftCore<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    /// Bootstrap a pristine node with `members` (always including this
    /// node's own id) as the cluster's initial membership, then start
    /// campaigning for leadership.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    pub(crate) async fn handle_initialize(&mut self, mut members: BTreeSet<NodeId>) -> Result<(), InitializeError> {
        if self.current_term != 0 || self.last_log_id.index != 0 {
            return Err(InitializeError::NotPristine);
        }
        members.insert(self.id);
        let config = ClusterConfiguration::new_uniform(members);
        let log_id = LogId::new(0, 1);
        self.storage
            .append_to_log(&[Entry::new_config(log_id, config)])
            .await
            .map_err(|e| InitializeError::Fatal(RaftError::Persistence(e)))?;
        self.last_log_id = log_id;
        self.advance_commit_index(1).await;
        self.start_election().await;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self, tx), fields(id = self.id))]
    pub(crate) async fn handle_add_server(&mut self, target: NodeId, tx: oneshot::Sender<Result<(), ChangeMembershipError>>) {
        if !self.is_leader() {
            let _ = tx.send(Err(RaftError::NotLeader(self.id).into()));
            return;
        }
        if self.membership.contains(target) {
            let _ = tx.send(Err(RaftError::NodeAlreadyMember(target).into()));
            return;
        }
        if self.config_sync.is_in_progress() {
            let _ = tx.send(Err(RaftError::ConfigChangeInProgress.into()));
            return;
        }
        let mut new_nodes = self.membership.nodes.clone();
        new_nodes.insert(target);
        self.start_membership_change(new_nodes, tx).await;
    }

    #[tracing::instrument(level = "debug", skip(self, tx), fields(id = self.id))]
    pub(crate) async fn handle_remove_server(
        &mut self,
        target: NodeId,
        tx: oneshot::Sender<Result<(), ChangeMembershipError>>,
    ) {
        if !self.is_leader() {
            let _ = tx.send(Err(RaftError::NotLeader(self.id).into()));
            return;
        }
        if !self.membership.contains(target) {
            let _ = tx.send(Err(RaftError::NodeNotMember(target).into()));
            return;
        }
        if self.config_sync.is_in_progress() {
            let _ = tx.send(Err(RaftError::ConfigChangeInProgress.into()));
            return;
        }
        let mut new_nodes = self.membership.nodes.clone();
        new_nodes.remove(&target);
        if new_nodes.is_empty() {
            let _ = tx.send(Err(RaftError::ConfigurationChange {
                phase: crate::error::ConfigChangePhase::None,
                reason: "cannot remove the last member of a cluster".into(),
            }
            .into()));
            return;
        }
        self.start_membership_change(new_nodes, tx).await;
    }

    /// Enter joint consensus for `new_nodes`, appending C_old,new immediately.
    /// The synchronizer appends C_new itself once C_old,new commits, and
    /// fulfills `tx` only once C_new has also committed.
    async fn start_membership_change(
        &mut self,
        new_nodes: BTreeSet<NodeId>,
        tx: oneshot::Sender<Result<(), ChangeMembershipError>>,
    ) {
        let joint = ClusterConfiguration::new_joint(self.membership.nodes.clone(), new_nodes);
        // Generous relative to election timing: a membership change spans at
        // least two round trips of replication across the whole cluster.
        let change_timeout = self.config.election_timeout_max_duration() * 20;

        match self.config_sync.start(joint.clone(), change_timeout) {
            Ok(rx) => {
                let log_id = LogId::new(self.current_term, self.last_log_id.index + 1);
                let targets = joint.all_nodes();
                let _ = self.append_and_replicate(log_id, EntryPayload::Configuration(joint), None).await;
                // Both the old and new membership must see this entry to ever
                // reach a joint-consensus quorum, so a newly added peer needs
                // a replication stream before it can be counted at all.
                self.sync_leader_streams(&targets);
                tokio::spawn(async move {
                    let result = rx.await.unwrap_or(Err(RaftError::Fatal));
                    let _ = tx.send(result.map_err(ChangeMembershipError::from));
                });
            }
            Err(e) => {
                let _ = tx.send(Err(e.into()));
            }
        }
    }
}
