//! The InstallSnapshot RPC handler: chunked snapshot receipt on the follower
//! side. A chunk at `offset == 0` always (re)starts the receive buffer, which
//! is how a new leader's snapshot stream preempts one left over from a prior,
//! now-superseded leader.

use crate::error::RaftError;
use crate::metrics::State;
use crate::network::RaftNetwork;
use crate::raft::{InstallSnapshotRequest, InstallSnapshotResponse};
use crate::raft_types::LogId;
use crate::storage::{Persistence, SnapshotMeta};

use super::RaftCore;

impl<N, S> RaftCore<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    #[tracing::instrument(level = "debug", skip(self, request), fields(id = self.id))]
    pub(crate) async fn handle_install_snapshot_request(
        &mut self,
        request: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse, RaftError> {
        if request.term < self.current_term {
            return Ok(InstallSnapshotResponse { term: self.current_term });
        }
        if request.term > self.current_term {
            self.step_down(request.term).await;
        } else if !matches!(self.target_state, State::Follower) {
            self.target_state = State::Follower;
            self.leader_state = None;
        }
        self.current_leader = Some(request.leader_id);
        self.reset_election_timer();

        if request.offset == 0 || self.snapshot_writer.is_none() {
            if let Some(handle) = self.compacting.take() {
                handle.abort();
                tracing::debug!("aborted in-flight local compaction superseded by incoming leader snapshot");
            }
            self.snapshot_writer = Some(self.storage.begin_receiving_snapshot().await.map_err(RaftError::Persistence)?);
        }
        if let Some(writer) = self.snapshot_writer.as_mut() {
            writer.write_at(request.offset, &request.data);
        }

        if request.done {
            let writer = self.snapshot_writer.take().expect("just written to above");
            let meta = SnapshotMeta {
                last_included_index: request.last_included_index,
                last_included_term: request.last_included_term,
                membership: request.configuration.clone(),
            };
            self.storage.finalize_snapshot_installation(meta, writer).await.map_err(RaftError::Persistence)?;

            self.commit_waiter.cancel_after(self.last_applied, "log superseded by installed snapshot");
            self.last_log_id = LogId::new(request.last_included_term, request.last_included_index);
            self.last_applied = request.last_included_index;
            self.commit_index = request.last_included_index;
            self.current_snapshot = Some(self.last_log_id);
            // A node catching up purely via InstallSnapshot (e.g. one just
            // added through `add_server` whose Configuration entry already
            // fell behind the leader's compaction point) otherwise never
            // learns real membership beyond whatever it started with.
            self.membership = request.configuration.clone();
            self.publish_metrics();
        }

        Ok(InstallSnapshotResponse { term: self.current_term })
    }
}
