//! RequestVote handling and the candidate campaign.

use std::collections::BTreeSet;

use crate::error::RaftError;
use crate::metrics::State;
use crate::network::RaftNetwork;
use crate::raft::{EntryPayload, RequestVoteRequest, RequestVoteResponse};
use crate::raft_types::{LogId, NodeId, Term};
use crate::storage::{HardState, Persistence};

use super::{InternalEvent, RaftCore};

impl<N, S> RaftCore<N, S>
where
    N: RaftNetwork + 'static,
    S: Persistence + 'static,
{
    #[tracing::instrument(level = "debug", skip(self, request), fields(id = self.id))]
    pub(crate) async fn handle_vote_request(
        &mut self,
        request: RequestVoteRequest,
    ) -> Result<RequestVoteResponse, RaftError> {
        if request.term < self.current_term {
            return Ok(RequestVoteResponse { term: self.current_term, vote_granted: false });
        }
        if request.term > self.current_term {
            self.step_down(request.term).await;
        }

        let candidate_up_to_date =
            (request.last_log_term, request.last_log_index) >= (self.last_log_id.term, self.last_log_id.index);
        let can_vote = self.voted_for.is_none() || self.voted_for == Some(request.candidate_id);
        let vote_granted = can_vote && candidate_up_to_date;

        if vote_granted {
            self.voted_for = Some(request.candidate_id);
            let _ = self
                .storage
                .save_hard_state(&HardState { current_term: self.current_term, voted_for: self.voted_for })
                .await;
            self.reset_election_timer();
        }

        Ok(RequestVoteResponse { term: self.current_term, vote_granted })
    }

    /// A follower or candidate whose election timer expires starts a new
    /// campaign: increment term, vote for self, persist, broadcast
    /// RequestVote, resample the timeout.
    #[tracing::instrument(level = "debug", skip(self), fields(id = self.id))]
    pub(crate) async fn start_election(&mut self) {
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.target_state = State::Candidate;
        self.current_leader = None;
        self.votes_received = BTreeSet::new();
        self.votes_received.insert(self.id); // vote for self
        let _ = self
            .storage
            .save_hard_state(&HardState { current_term: self.current_term, voted_for: self.voted_for })
            .await;
        self.reset_election_timer();
        self.publish_metrics();

        let term = self.current_term;
        let peers: BTreeSet<NodeId> = self.membership.all_nodes().into_iter().filter(|id| *id != self.id).collect();

        let id = self.id;
        let votes = self.votes_received.clone();
        if self.membership.has_quorum(|node| node == id || votes.contains(&node)) {
            // Single-node cluster (or already a quorum of one): a vote for
            // self is already enough.
            self.win_election().await;
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: self.last_log_id.index,
            last_log_term: self.last_log_id.term,
        };

        for peer in peers {
            let network = self.network.clone();
            let tx = self.tx_internal.clone();
            let request = request.clone();
            tokio::spawn(async move {
                let event = match network.send_vote(peer, request.clone()).await {
                    Ok(resp) => InternalEvent::VoteResponse {
                        term_of_request: request.term,
                        voter: peer,
                        granted: resp.vote_granted,
                        voter_term: resp.term,
                    },
                    Err(_) => InternalEvent::VoteResponse {
                        term_of_request: request.term,
                        voter: peer,
                        granted: false,
                        voter_term: 0,
                    },
                };
                let _ = tx.send(event);
            });
        }
    }

    pub(crate) async fn handle_vote_response(
        &mut self,
        term_of_request: Term,
        voter: NodeId,
        granted: bool,
        voter_term: Term,
    ) {
        if !matches!(self.target_state, State::Candidate) || term_of_request != self.current_term {
            return;
        }
        if voter_term > self.current_term {
            self.step_down(voter_term).await;
            return;
        }
        if !granted {
            return;
        }
        self.votes_received.insert(voter);
        let id = self.id;
        let votes = self.votes_received.clone();
        if self.membership.has_quorum(|node| node == id || votes.contains(&node)) {
            self.win_election().await;
        }
    }

    /// Become leader and append the NoOp entry that both asserts leadership
    /// and, once committed, enables indirectly committing prior-term entries.
    async fn win_election(&mut self) {
        self.become_leader();
        let noop_index = self.last_log_id.index + 1;
        let log_id = LogId::new(self.current_term, noop_index);
        self.append_and_replicate(log_id, EntryPayload::Blank, None).await;
        self.publish_metrics();
    }
}
