//! Leader election: RequestVote on both sides and the transition to leader.

use std::collections::HashSet;

use tokio::time::Instant;

use mimir_storage::{LogEntry, LogStorage};
use mimir_types::{MimirError, NodeId, Role};

use crate::message::{VoteRequest, VoteResponse};
use crate::network::RaftNetwork;
use crate::replication::Progress;
use crate::sequencer::{Event, Sequencer};

impl<L: LogStorage, N: RaftNetwork> Sequencer<L, N> {
    pub(crate) async fn start_election(&mut self) -> Result<(), MimirError> {
        self.current_term += 1;
        self.role = Role::Candidate;
        self.leader_id = None;
        self.voted_for = Some(self.id);
        self.persist_vote().await?;
        self.election_id = self.next_request_id();
        self.votes = HashSet::from([self.id]);
        self.reset_election_deadline();
        tracing::info!(
            node_id = self.id,
            term = self.current_term,
            last_log_index = self.last_log.index,
            "starting election"
        );

        if self.votes.len() >= self.quorum() {
            return self.become_leader().await;
        }

        let req = VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log.index,
            last_log_term: self.last_log.term,
        };
        let term = self.current_term;
        let request_id = self.election_id;
        for peer in self.peers.clone() {
            let req = req.clone();
            self.dispatch(
                move |net| async move { net.request_vote(peer, req).await },
                move |result| Event::VoteReply { peer, request_id, term, result },
            );
        }
        Ok(())
    }

    pub(crate) async fn handle_vote_request(
        &mut self,
        req: VoteRequest,
    ) -> Result<VoteResponse, MimirError> {
        self.observe_term(req.term).await?;
        if req.term < self.current_term {
            return Ok(VoteResponse { term: self.current_term, granted: false });
        }

        let free = self.voted_for.is_none() || self.voted_for == Some(req.candidate_id);
        let up_to_date =
            (req.last_log_term, req.last_log_index) >= (self.last_log.term, self.last_log.index);
        let granted = free && up_to_date;
        if granted {
            self.voted_for = Some(req.candidate_id);
            self.persist_vote().await?;
            self.reset_election_deadline();
        }
        tracing::debug!(
            node_id = self.id,
            term = self.current_term,
            candidate = req.candidate_id,
            granted,
            "vote request"
        );
        Ok(VoteResponse { term: self.current_term, granted })
    }

    pub(crate) async fn on_vote_reply(
        &mut self,
        peer: NodeId,
        request_id: u64,
        term: u64,
        result: Result<VoteResponse, MimirError>,
    ) -> Result<(), MimirError> {
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(node_id = self.id, peer, error = %e, "vote request failed");
                return Ok(());
            }
        };
        if resp.term > self.current_term {
            return self.observe_term(resp.term).await;
        }
        let current = self.role == Role::Candidate
            && request_id == self.election_id
            && term == self.current_term;
        if !current || !resp.granted {
            return Ok(());
        }
        self.votes.insert(peer);
        if self.votes.len() >= self.quorum() {
            self.become_leader().await?;
        }
        Ok(())
    }

    pub(crate) async fn become_leader(&mut self) -> Result<(), MimirError> {
        let now = Instant::now();
        self.role = Role::Leader;
        self.leader_id = Some(self.id);
        self.votes.clear();
        self.snapshot = None;
        let next = self.last_log.index + 1;
        self.progress = self.peers.iter().map(|p| (*p, Progress::new(next, now))).collect();

        // Entries from earlier terms only commit behind one of ours.
        let noop = LogEntry::noop(next, self.current_term);
        let id = noop.log_id();
        self.log.append(vec![noop]).await?;
        self.last_log = id;
        self.term_start_index = id.index;
        self.leader_commit = self.commit_index;
        tracing::info!(node_id = self.id, term = self.current_term, index = id.index, "became leader");

        self.next_heartbeat = now + self.config.heartbeat_interval();
        self.advance_commit();
        self.replicate_all(true).await
    }
}
