//! The AppendEntries RPC handler: the replication consistency check,
//! conflict-hint generation, and commit-index advancement on the follower side.

use crate::error::RaftError;
use crate::metrics::State;
use crate::raft::{AppendEntriesRequest, AppendEntriesResponse};
use crate::network::RaftNetwork;
use crate::storage::Persistence;

use super::RaftCore;

impl<N, S> RaftCore<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    #[tracing::instrument(level = "debug", skip(self, request), fields(id = self.id))]
    pub(crate) async fn handle_append_entries_request(
        &mut self,
        request: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse, RaftError> {
        if request.term < self.current_term {
            return Ok(AppendEntriesResponse {
                term: self.current_term,
                success: false,
                conflict_index: None,
                conflict_term: None,
            });
        }

        if request.term > self.current_term {
            self.step_down(request.term).await;
        } else if !matches!(self.target_state, State::Follower) {
            self.target_state = State::Follower;
            self.leader_state = None;
        }
        self.current_leader = Some(request.leader_id);
        self.reset_election_timer();

        // Consistency check against `prev_log_index`/`prev_log_term`.
        if request.prev_log_index > 0 {
            match self.storage.try_get_log_entry(request.prev_log_index).await {
                Ok(Some(entry)) if entry.log_id.term == request.prev_log_term => {}
                Ok(Some(entry)) => {
                    let conflict_term = entry.log_id.term;
                    let conflict_index = self.first_index_of_term(conflict_term, request.prev_log_index).await;
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index: Some(conflict_index),
                        conflict_term: Some(conflict_term),
                    });
                }
                Ok(None) => {
                    let conflict_index = self.last_log_id.index + 1;
                    return Ok(AppendEntriesResponse {
                        term: self.current_term,
                        success: false,
                        conflict_index: Some(conflict_index),
                        conflict_term: None,
                    });
                }
                Err(e) => return Err(RaftError::Persistence(e)),
            }
        }

        // Append/overwrite entries, skipping any that already match.
        let mut index = request.prev_log_index;
        let mut truncated_at = None;
        for entry in &request.entries {
            index += 1;
            match self.storage.try_get_log_entry(index).await.map_err(RaftError::Persistence)? {
                Some(existing) if existing.log_id.term == entry.log_id.term => continue,
                Some(_) => {
                    truncated_at = Some(index);
                    break;
                }
                None => break,
            }
        }
        if let Some(from) = truncated_at {
            self.storage.delete_logs_from(from).await.map_err(RaftError::Persistence)?;
            self.commit_waiter.cancel_after(from.saturating_sub(1), "log truncated by leader");
        }
        let to_append: Vec<_> = request
            .entries
            .iter()
            .filter(|e| e.log_id.index > truncated_at.map(|t| t - 1).unwrap_or(request.prev_log_index))
            .cloned()
            .collect();
        if !to_append.is_empty() {
            self.storage.append_to_log(&to_append).await.map_err(RaftError::Persistence)?;
            if let Some(last) = to_append.last() {
                // A genuine truncate-and-overwrite (`truncated_at` is `Some`)
                // legitimately shrinks the log and must always move
                // `last_log_id` to the new tail. Otherwise `to_append` may
                // just be a stale, delayed retransmission of an earlier
                // `AppendEntries` that a later one already advanced the log
                // past (e.g. edge latency dropping mid-flight, or a leader's
                // abandoned retry) — only move `last_log_id` forward then.
                if truncated_at.is_some() || last.log_id.index > self.last_log_id.index {
                    self.last_log_id = last.log_id;
                }
            }
        }

        if request.leader_commit > self.commit_index {
            let new_commit = request.leader_commit.min(self.last_log_id.index);
            if new_commit > self.commit_index {
                self.advance_commit_index(new_commit).await;
            }
        }

        self.publish_metrics();
        Ok(AppendEntriesResponse { term: self.current_term, success: true, conflict_index: None, conflict_term: None })
    }

    /// Walk backward from `before_or_at` to find the first index in the log
    /// carrying term `term`, so the leader can skip the whole mismatched term
    /// in one backtrack step.
    async fn first_index_of_term(&self, term: crate::raft_types::Term, before_or_at: crate::raft_types::LogIndex) -> crate::raft_types::LogIndex {
        let mut first = before_or_at;
        let mut probe = before_or_at;
        while probe > 0 {
            match self.storage.try_get_log_entry(probe).await {
                Ok(Some(entry)) if entry.log_id.term == term => {
                    first = probe;
                    probe -= 1;
                }
                _ => break,
            }
        }
        first
    }
}
