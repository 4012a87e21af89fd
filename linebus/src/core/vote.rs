use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio::time::Duration;
use tokio::time::Instant;
use tracing_futures::Instrument;

use crate::core::CandidateState;
use crate::core::RaftCore;
use crate::core::State;
use crate::core::UpdateCurrentLeader;
use crate::error::RaftResult;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::storage::LogStore;
use crate::NodeId;
use crate::RaftNetwork;

impl<N: RaftNetwork, S: LogStore> RaftCore<N, S> {
    /// An RPC invoked by candidates to gather votes.
    ///
    /// Grants the vote iff the candidate's term is current, this node has
    /// not already voted for someone else this term, and the candidate's
    /// log is at least as up-to-date as this node's. The vote is
    /// persisted before the response is sent.
    #[tracing::instrument(level = "debug", skip(self, rpc))]
    pub(super) async fn handle_vote_request(&mut self, rpc: VoteRequest) -> RaftResult<VoteResponse> {
        if rpc.term < self.current_term {
            tracing::debug!(
                { candidate = rpc.candidate_id, self.current_term, rpc_term = rpc.term },
                "RequestVote RPC term is less than current term"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Do not respond to the request if we've received a heartbeat
        // within the election timeout minimum: a live leader should not
        // be deposed by a disconnected node rejoining with a high term.
        if let Some(inst) = &self.last_heartbeat {
            let now = Instant::now();
            let delta = now.duration_since(*inst);
            if self.config.election_timeout_min >= (delta.as_millis() as u64) {
                tracing::debug!(
                    { candidate = rpc.candidate_id },
                    "rejecting vote request received within election timeout minimum"
                );
                return Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: false,
                });
            }
        }

        // Per §5.1, if the request term is greater than local term, update
        // local term and ensure this node is in follower state.
        if rpc.term > self.current_term {
            self.update_current_term(rpc.term, None);
            self.update_next_election_timeout(false);
            self.set_target_state(State::Follower);
            self.save_hard_state().await?;
        }

        // Check if candidate's log is at least as up-to-date as this
        // node's: a strictly higher last log term, or the same last log
        // term with at least as high an index.
        let candidate_is_uptodate = rpc.last_log_term > self.last_log_id.term
            || (rpc.last_log_term == self.last_log_id.term && rpc.last_log_index >= self.last_log_id.index);
        if !candidate_is_uptodate {
            tracing::debug!(
                { candidate = rpc.candidate_id },
                "rejecting vote request as candidate's log is not up-to-date"
            );
            return Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            });
        }

        // Candidate's log is up-to-date; vote iff we have not yet voted
        // for a different candidate this term.
        match &self.voted_for {
            Some(candidate_id) if candidate_id != &rpc.candidate_id => Ok(VoteResponse {
                term: self.current_term,
                vote_granted: false,
            }),
            _ => {
                self.voted_for = Some(rpc.candidate_id);
                self.set_target_state(State::Follower);
                self.update_next_election_timeout(false);
                self.save_hard_state().await?;
                tracing::debug!({ candidate = rpc.candidate_id }, "voted for candidate");
                Ok(VoteResponse {
                    term: self.current_term,
                    vote_granted: true,
                })
            }
        }
    }
}

impl<'a, N: RaftNetwork, S: LogStore> CandidateState<'a, N, S> {
    /// Handle response from a vote request sent to a peer.
    #[tracing::instrument(level = "debug", skip(self, res))]
    pub(super) async fn handle_vote_response(&mut self, res: VoteResponse, target: NodeId) -> RaftResult<()> {
        // If peer's term is greater than current term, revert to follower state.
        if res.term > self.core.current_term {
            self.core.update_current_term(res.term, None);
            self.core.update_current_leader(UpdateCurrentLeader::Unknown);
            self.core.set_target_state(State::Follower);
            self.core.save_hard_state().await?;
            tracing::debug!("reverting to follower state due to greater term observed in RequestVote RPC response");
            return Ok(());
        }

        if res.vote_granted {
            self.votes_granted += 1;
            if self.votes_granted >= self.votes_needed {
                // If the campaign was successful, go into leader state.
                tracing::debug!("transitioning to leader state as minimum number of votes have been received");
                self.core.set_target_state(State::Leader);
                self.core.update_next_election_timeout(false);
            }
        }

        Ok(())
    }

    /// Build a future of vote request responses from all of the peers
    /// snapshotted at the start of this candidacy.
    #[tracing::instrument(level = "debug", skip(self))]
    pub(super) fn spawn_parallel_vote_requests(&self) -> mpsc::Receiver<(VoteResponse, NodeId)> {
        let all_members = self.election_peers.clone();
        let (tx, rx) = mpsc::channel(all_members.len().max(1));
        let rpc = VoteRequest::new(
            self.core.current_term,
            self.core.id,
            self.core.last_log_id.index,
            self.core.last_log_id.term,
        );
        let ttl = Duration::from_millis(self.core.config.election_timeout_min);
        for member in all_members {
            let rpc = rpc.clone();
            let (network, tx_inner) = (self.core.network.clone(), tx.clone());
            let _ = tokio::spawn(
                async move {
                    match timeout(ttl, send_vote_rpc(network, member, rpc)).await {
                        Ok(Ok(res)) => {
                            let _ = tx_inner.send((res, member)).await;
                        }
                        Ok(Err(err)) => {
                            tracing::warn!({error=%err, target=member}, "error while requesting vote from peer")
                        }
                        Err(_) => {
                            tracing::warn!({target=member}, "timeout while requesting vote from peer")
                        }
                    }
                }
                .instrument(tracing::debug_span!("spawn")),
            );
        }
        rx
    }
}

async fn send_vote_rpc<N: RaftNetwork>(
    network: Arc<N>,
    target: NodeId,
    rpc: VoteRequest,
) -> anyhow::Result<VoteResponse> {
    network.send_vote(target, rpc).await
}
