//! The per-node sequencer task. It alone owns the term, the vote, the role and
//! the log; every protocol message and client proposal goes through its inbox.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch, Semaphore};
use tokio::time::Instant;

use mimir_storage::{LogEntry, LogId, LogStorage, Snapshot, Vote};
use mimir_types::{ApplyResult, ConfigCommand, MimirError, NodeId, Role};

use crate::config::RaftConfig;
use crate::message::{
    AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::network::RaftNetwork;
use crate::replication::Progress;
use crate::rsm::{ApplyMsg, Waiters};

pub(crate) type ApplyWaiter = oneshot::Receiver<Result<ApplyResult, MimirError>>;

pub(crate) enum Event {
    Vote(VoteRequest, oneshot::Sender<VoteResponse>),
    Append(AppendRequest, oneshot::Sender<AppendResponse>),
    InstallSnapshot(SnapshotRequest, oneshot::Sender<SnapshotResponse>),
    Propose(ConfigCommand, oneshot::Sender<Result<ApplyWaiter, MimirError>>),
    /// Leader-only: confirm leadership and return the commit index a
    /// linearizable read must wait for.
    ReadIndex(oneshot::Sender<Result<u64, MimirError>>),
    VoteReply {
        peer: NodeId,
        request_id: u64,
        term: u64,
        result: Result<VoteResponse, MimirError>,
    },
    AppendReply {
        peer: NodeId,
        request_id: u64,
        term: u64,
        result: Result<AppendResponse, MimirError>,
    },
    SnapshotReply {
        peer: NodeId,
        request_id: u64,
        term: u64,
        last_included: u64,
        result: Result<SnapshotResponse, MimirError>,
    },
}

/// Externally visible consensus state, republished after every event.
#[derive(Debug, Clone, PartialEq)]
pub struct RaftStatus {
    pub role: Role,
    pub term: u64,
    pub leader_id: Option<NodeId>,
    pub commit_index: u64,
    /// Highest commit index announced by the leader (own value when leading).
    pub leader_commit: u64,
}

/// Channels and shared state the sequencer is wired to.
pub(crate) struct Wiring<L, N> {
    pub log: Arc<L>,
    pub network: Arc<N>,
    pub inbox: mpsc::Sender<Event>,
    pub apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    pub applied_rx: watch::Receiver<u64>,
    pub status_tx: watch::Sender<RaftStatus>,
    pub waiters: Arc<Waiters>,
}

pub(crate) struct Sequencer<L, N> {
    pub(crate) id: NodeId,
    pub(crate) peers: Vec<NodeId>,
    pub(crate) config: RaftConfig,
    pub(crate) log: Arc<L>,
    pub(crate) network: Arc<N>,
    pub(crate) inbox: mpsc::Sender<Event>,
    pub(crate) rpc_slots: Arc<Semaphore>,
    pub(crate) apply_tx: mpsc::UnboundedSender<ApplyMsg>,
    pub(crate) applied_rx: watch::Receiver<u64>,
    status_tx: watch::Sender<RaftStatus>,
    pub(crate) waiters: Arc<Waiters>,

    pub(crate) current_term: u64,
    pub(crate) voted_for: Option<NodeId>,

    pub(crate) role: Role,
    pub(crate) leader_id: Option<NodeId>,
    pub(crate) commit_index: u64,
    pub(crate) leader_commit: u64,
    pub(crate) last_log: LogId,
    pub(crate) last_purged: LogId,
    pub(crate) election_deadline: Instant,
    next_request_id: u64,

    pub(crate) election_id: u64,
    pub(crate) votes: HashSet<NodeId>,

    pub(crate) progress: HashMap<NodeId, Progress>,
    /// Index of the NoOp appended when this node last became leader.
    pub(crate) term_start_index: u64,
    pub(crate) next_heartbeat: Instant,
    pub(crate) snapshot: Option<Snapshot>,
}

impl<L: LogStorage, N: RaftNetwork> Sequencer<L, N> {
    /// Rebuild volatile state from the persisted vote and log. `applied` is
    /// the state machine's `last_applied`, which is known to be committed.
    pub(crate) async fn recover(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        applied: u64,
        wiring: Wiring<L, N>,
    ) -> Result<Self, MimirError> {
        let Wiring { log, network, inbox, apply_tx, applied_rx, status_tx, waiters } = wiring;

        let vote = log.read_vote().await?.unwrap_or(Vote { term: 0, voted_for: None });
        let state = log.log_state().await?;
        let last_purged = state.last_purged.unwrap_or_default();
        let last_log = match state.last_index {
            Some(index) => {
                let term = log.get_entry(index).await?.map(|e| e.term).unwrap_or(0);
                LogId { index, term }
            }
            None => last_purged,
        };
        tracing::info!(
            node_id = id,
            term = vote.term,
            last_log_index = last_log.index,
            applied,
            "recovered raft state"
        );

        let now = Instant::now();
        Ok(Sequencer {
            id,
            peers: peers.into_iter().filter(|p| *p != id).collect(),
            rpc_slots: Arc::new(Semaphore::new(config.max_inflight_rpcs)),
            election_deadline: now + config.random_election_timeout(),
            next_heartbeat: now,
            config,
            log,
            network,
            inbox,
            apply_tx,
            applied_rx,
            status_tx,
            waiters,
            current_term: vote.term,
            voted_for: vote.voted_for,
            role: Role::Follower,
            leader_id: None,
            commit_index: applied,
            leader_commit: applied,
            last_log,
            last_purged,
            next_request_id: 0,
            election_id: 0,
            votes: HashSet::new(),
            progress: HashMap::new(),
            term_start_index: 0,
            snapshot: None,
        })
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<Event>) {
        self.publish_status();
        loop {
            let deadline = self.next_deadline();
            let outcome = tokio::select! {
                ev = rx.recv() => match ev {
                    Some(ev) => self.handle(ev).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline) => self.on_tick().await,
            };
            if let Err(e) = outcome {
                tracing::error!(node_id = self.id, term = self.current_term, error = %e, "sequencer step failed");
                if self.role != Role::Follower {
                    self.step_down();
                }
            }
            self.publish_status();
        }
        tracing::debug!(node_id = self.id, "sequencer stopped");
    }

    async fn handle(&mut self, ev: Event) -> Result<(), MimirError> {
        match ev {
            Event::Vote(req, reply) => {
                let resp = self.handle_vote_request(req).await?;
                let _ = reply.send(resp);
            }
            Event::Append(req, reply) => {
                let resp = self.handle_append(req).await?;
                let _ = reply.send(resp);
            }
            Event::InstallSnapshot(req, reply) => {
                let resp = self.handle_install_snapshot(req).await?;
                let _ = reply.send(resp);
            }
            Event::Propose(cmd, reply) => {
                let result = self.handle_propose(cmd).await;
                let failed = result.as_ref().err().filter(|e| !matches!(e, MimirError::NotLeader { .. })).cloned();
                let _ = reply.send(result);
                if let Some(e) = failed {
                    return Err(e);
                }
            }
            Event::ReadIndex(reply) => {
                let _ = reply.send(self.read_index());
            }
            Event::VoteReply { peer, request_id, term, result } => {
                self.on_vote_reply(peer, request_id, term, result).await?;
            }
            Event::AppendReply { peer, request_id, term, result } => {
                self.on_append_reply(peer, request_id, term, result).await?;
            }
            Event::SnapshotReply { peer, request_id, term, last_included, result } => {
                self.on_snapshot_reply(peer, request_id, term, last_included, result).await?;
            }
        }
        Ok(())
    }

    fn next_deadline(&self) -> Instant {
        if self.role == Role::Leader {
            self.progress
                .values()
                .filter_map(|p| p.retry_at)
                .fold(self.next_heartbeat, Instant::min)
        } else {
            self.election_deadline
        }
    }

    async fn on_tick(&mut self) -> Result<(), MimirError> {
        let now = Instant::now();
        if self.role == Role::Leader {
            if now >= self.next_heartbeat {
                if !self.check_quorum(now) {
                    return Ok(());
                }
                self.next_heartbeat = now + self.config.heartbeat_interval();
                self.replicate_all(true).await?;
                self.maybe_compact().await?;
            } else {
                self.replicate_all(false).await?;
            }
        } else if now >= self.election_deadline {
            self.start_election().await?;
        }
        Ok(())
    }

    async fn handle_propose(&mut self, cmd: ConfigCommand) -> Result<ApplyWaiter, MimirError> {
        if self.role != Role::Leader {
            return Err(MimirError::NotLeader { leader: self.leader_id });
        }
        let entry = LogEntry::command(self.last_log.index + 1, self.current_term, &cmd)?;
        let id = entry.log_id();
        self.log.append(vec![entry]).await?;
        self.last_log = id;
        let waiter = self.waiters.register(id.index, id.term);
        tracing::debug!(node_id = self.id, term = id.term, index = id.index, "proposed");
        self.advance_commit();
        self.replicate_all(false).await?;
        Ok(waiter)
    }

    fn read_index(&self) -> Result<u64, MimirError> {
        if self.role != Role::Leader {
            return Err(MimirError::NotLeader { leader: self.leader_id });
        }
        if self.commit_index < self.term_start_index {
            return Err(MimirError::Transient("leader has not committed in its term yet".into()));
        }
        if !self.lease_valid(Instant::now()) {
            return Err(MimirError::Transient("leader lease not confirmed".into()));
        }
        Ok(self.commit_index)
    }

    // -----------------------------------------------------------------------
    // Shared helpers
    // -----------------------------------------------------------------------

    pub(crate) fn quorum(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    pub(crate) fn next_request_id(&mut self) -> u64 {
        self.next_request_id += 1;
        self.next_request_id
    }

    pub(crate) fn reset_election_deadline(&mut self) {
        self.election_deadline = Instant::now() + self.config.random_election_timeout();
    }

    pub(crate) async fn persist_vote(&self) -> Result<(), MimirError> {
        self.log
            .save_vote(Vote { term: self.current_term, voted_for: self.voted_for })
            .await
    }

    /// Adopt a higher term seen in any message. Does not touch the election
    /// timer.
    pub(crate) async fn observe_term(&mut self, term: u64) -> Result<(), MimirError> {
        if term > self.current_term {
            tracing::info!(
                node_id = self.id,
                old_term = self.current_term,
                term,
                "observed higher term"
            );
            self.current_term = term;
            self.voted_for = None;
            self.persist_vote().await?;
            if self.role != Role::Follower {
                self.step_down();
            }
            self.leader_id = None;
        }
        Ok(())
    }

    /// Become a follower of `leader` in `term` and restart the election timer.
    pub(crate) async fn follow(&mut self, term: u64, leader: NodeId) -> Result<(), MimirError> {
        self.observe_term(term).await?;
        if self.role != Role::Follower {
            self.step_down();
        }
        if self.leader_id != Some(leader) {
            tracing::info!(node_id = self.id, term, leader_id = leader, "following leader");
        }
        self.leader_id = Some(leader);
        self.reset_election_deadline();
        Ok(())
    }

    /// Drop to follower in the current term.
    pub(crate) fn step_down(&mut self) {
        if self.role == Role::Leader {
            tracing::warn!(node_id = self.id, term = self.current_term, "stepping down");
            self.waiters.fail_above(self.commit_index, MimirError::LeadershipLost);
            self.progress.clear();
        }
        self.role = Role::Follower;
        self.leader_id = None;
        self.votes.clear();
        self.reset_election_deadline();
    }

    /// Term of the entry at `index`, or `None` if it is compacted away or
    /// beyond the end of the log.
    pub(crate) async fn term_at(&self, index: u64) -> Result<Option<u64>, MimirError> {
        if index == 0 {
            return Ok(Some(0));
        }
        if index == self.last_purged.index {
            return Ok(Some(self.last_purged.term));
        }
        if index < self.last_purged.index || index > self.last_log.index {
            return Ok(None);
        }
        if index == self.last_log.index {
            return Ok(Some(self.last_log.term));
        }
        Ok(self.log.get_entry(index).await?.map(|e| e.term))
    }

    pub(crate) fn set_commit(&mut self, index: u64) {
        if index <= self.commit_index {
            return;
        }
        self.commit_index = index;
        if self.role == Role::Leader {
            self.leader_commit = index;
        }
        tracing::trace!(node_id = self.id, commit_index = index, "commit advanced");
        let _ = self.apply_tx.send(ApplyMsg::Commit(index));
    }

    /// Run one peer RPC on its own task, bounded by the in-flight semaphore,
    /// and feed the result back into the inbox.
    pub(crate) fn dispatch<T, F, Fut, W>(&self, call: F, wrap: W)
    where
        T: Send + 'static,
        F: FnOnce(Arc<N>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, MimirError>> + Send + 'static,
        W: FnOnce(Result<T, MimirError>) -> Event + Send + 'static,
    {
        let network = self.network.clone();
        let slots = self.rpc_slots.clone();
        let inbox = self.inbox.clone();
        let timeout = self.config.rpc_timeout();
        tokio::spawn(async move {
            let result = match slots.acquire_owned().await {
                Ok(_permit) => match tokio::time::timeout(timeout, call(network)).await {
                    Ok(r) => r,
                    Err(_) => Err(MimirError::Timeout),
                },
                Err(_) => Err(MimirError::Unavailable("rpc slots closed".into())),
            };
            let _ = inbox.send(wrap(result)).await;
        });
    }

    /// Ask the apply task for a snapshot of the state machine.
    pub(crate) async fn build_snapshot(&self) -> Result<Snapshot, MimirError> {
        let (tx, rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyMsg::BuildSnapshot(tx))
            .map_err(|_| MimirError::Consensus("apply task stopped".into()))?;
        rx.await.map_err(|_| MimirError::Consensus("apply task stopped".into()))?
    }

    /// Compact the log once enough applied entries have piled up.
    pub(crate) async fn maybe_compact(&mut self) -> Result<(), MimirError> {
        let applied = *self.applied_rx.borrow();
        let threshold = self.config.snapshot_threshold;
        if threshold == 0 || applied < self.last_purged.index + threshold {
            return Ok(());
        }
        let fresh = self
            .snapshot
            .as_ref()
            .is_some_and(|s| s.meta.last_log_index + threshold > applied);
        if !fresh {
            self.snapshot = Some(self.build_snapshot().await?);
        }
        let Some(snap_index) = self.snapshot.as_ref().map(|s| s.meta.last_log_index) else {
            return Ok(());
        };

        let mut upto = snap_index.min(self.last_log.index);
        if self.role == Role::Leader {
            let now = Instant::now();
            let window = self.config.election_timeout_max();
            if let Some(lowest) = self
                .progress
                .values()
                .filter(|p| now.duration_since(p.last_contact) <= window)
                .map(|p| p.match_index)
                .min()
            {
                upto = upto.min(lowest);
            }
        }
        if upto <= self.last_purged.index {
            return Ok(());
        }
        let Some(term) = self.term_at(upto).await? else {
            return Ok(());
        };
        let id = LogId { index: upto, term };
        self.log.purge(id).await?;
        self.last_purged = id;
        tracing::info!(node_id = self.id, upto, snapshot_index = snap_index, "compacted log");
        Ok(())
    }

    fn publish_status(&self) {
        let status = RaftStatus {
            role: self.role,
            term: self.current_term,
            leader_id: self.leader_id,
            commit_index: self.commit_index,
            leader_commit: self.leader_commit,
        };
        self.status_tx.send_if_modified(|cur| {
            if *cur == status {
                false
            } else {
                *cur = status;
                true
            }
        });
    }
}
