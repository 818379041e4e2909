//! Log replication: the leader's per-peer send loop and commit advancement,
//! and the follower's AppendEntries / InstallSnapshot handling.

use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;

use mimir_storage::{LogStorage, Snapshot};
use mimir_types::{MimirError, NodeId, Role};

use crate::message::{AppendRequest, AppendResponse, SnapshotRequest, SnapshotResponse};
use crate::network::RaftNetwork;
use crate::rsm::ApplyMsg;
use crate::sequencer::{Event, Sequencer};

/// Leader-side view of one follower.
#[derive(Debug, Clone)]
pub(crate) struct Progress {
    pub next_index: u64,
    pub match_index: u64,
    /// Request id of the RPC currently outstanding, if any.
    pub inflight: Option<u64>,
    pub last_contact: Instant,
    pub backoff: Duration,
    pub retry_at: Option<Instant>,
}

impl Progress {
    pub(crate) fn new(next_index: u64, now: Instant) -> Self {
        Progress {
            next_index,
            match_index: 0,
            inflight: None,
            last_contact: now,
            backoff: Duration::ZERO,
            retry_at: None,
        }
    }

    /// Exponential backoff after a failed RPC, capped at `cap`.
    fn failed(&mut self, now: Instant, cap: Duration) {
        let floor = (cap / 8).max(Duration::from_millis(1));
        self.backoff = (self.backoff * 2).clamp(floor, cap);
        self.retry_at = Some(now + self.backoff);
    }

    fn answered(&mut self, now: Instant) {
        self.last_contact = now;
        self.backoff = Duration::ZERO;
        self.retry_at = None;
    }
}

impl<L: LogStorage, N: RaftNetwork> Sequencer<L, N> {
    // -----------------------------------------------------------------------
    // Leader side
    // -----------------------------------------------------------------------

    /// Send to every peer that is idle and due. With `heartbeat` set, idle
    /// peers get an AppendEntries even when there is nothing new.
    pub(crate) async fn replicate_all(&mut self, heartbeat: bool) -> Result<(), MimirError> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let now = Instant::now();
        let due: Vec<NodeId> = self
            .progress
            .iter()
            .filter(|(_, p)| p.inflight.is_none())
            .filter(|(_, p)| match p.retry_at {
                Some(at) => at <= now,
                None => heartbeat || p.next_index <= self.last_log.index,
            })
            .map(|(id, _)| *id)
            .collect();
        for peer in due {
            self.send_to(peer).await?;
        }
        Ok(())
    }

    pub(crate) async fn send_to(&mut self, peer: NodeId) -> Result<(), MimirError> {
        let Some(next) = self.progress.get(&peer).map(|p| p.next_index) else {
            return Ok(());
        };
        let prev = next - 1;
        let prev_term = if next <= self.last_purged.index { None } else { self.term_at(prev).await? };
        let Some(prev_term) = prev_term else {
            return self.send_snapshot(peer).await;
        };

        let last = self.last_log.index.min(prev + self.config.max_append_entries as u64);
        let entries = self.log.get_entries(next, last).await?;
        let request_id = self.next_request_id();
        if let Some(p) = self.progress.get_mut(&peer) {
            p.inflight = Some(request_id);
            p.retry_at = None;
        }

        let term = self.current_term;
        let req = AppendRequest {
            term,
            leader_id: self.id,
            prev_log_index: prev,
            prev_log_term: prev_term,
            entries,
            leader_commit: self.commit_index,
        };
        self.dispatch(
            move |net| async move { net.append_entries(peer, req).await },
            move |result| Event::AppendReply { peer, request_id, term, result },
        );
        Ok(())
    }

    async fn send_snapshot(&mut self, peer: NodeId) -> Result<(), MimirError> {
        let usable = self
            .snapshot
            .as_ref()
            .is_some_and(|s| s.meta.last_log_index >= self.last_purged.index);
        if !usable {
            self.snapshot = Some(self.build_snapshot().await?);
        }
        let Some(snapshot) = self.snapshot.clone() else {
            return Ok(());
        };
        let last_included = snapshot.meta.last_log_index;
        let request_id = self.next_request_id();
        if let Some(p) = self.progress.get_mut(&peer) {
            p.inflight = Some(request_id);
            p.retry_at = None;
        }
        tracing::info!(node_id = self.id, peer, last_included, "sending snapshot");

        let term = self.current_term;
        let req = SnapshotRequest { term, leader_id: self.id, snapshot };
        self.dispatch(
            move |net| async move { net.install_snapshot(peer, req).await },
            move |result| Event::SnapshotReply { peer, request_id, term, last_included, result },
        );
        Ok(())
    }

    pub(crate) async fn on_append_reply(
        &mut self,
        peer: NodeId,
        request_id: u64,
        term: u64,
        result: Result<AppendResponse, MimirError>,
    ) -> Result<(), MimirError> {
        if !self.take_inflight(peer, request_id) {
            return Ok(());
        }
        let now = Instant::now();
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(node_id = self.id, peer, error = %e, "append entries failed");
                let cap = self.config.heartbeat_interval();
                if let Some(p) = self.progress.get_mut(&peer) {
                    p.failed(now, cap);
                }
                return Ok(());
            }
        };
        if resp.term > self.current_term {
            return self.observe_term(resp.term).await;
        }
        if term != self.current_term || self.role != Role::Leader {
            return Ok(());
        }

        let Some(p) = self.progress.get_mut(&peer) else {
            return Ok(());
        };
        p.answered(now);
        if resp.success {
            p.match_index = p.match_index.max(resp.match_index);
            p.next_index = p.match_index + 1;
        } else {
            p.next_index = (p.next_index - 1).min(resp.match_index + 1).max(1);
            tracing::debug!(node_id = self.id, peer, next_index = p.next_index, "log mismatch, backing up");
        }
        let behind = p.next_index <= self.last_log.index;

        if resp.success {
            self.advance_commit();
        }
        if behind {
            self.send_to(peer).await?;
        }
        Ok(())
    }

    pub(crate) async fn on_snapshot_reply(
        &mut self,
        peer: NodeId,
        request_id: u64,
        term: u64,
        last_included: u64,
        result: Result<SnapshotResponse, MimirError>,
    ) -> Result<(), MimirError> {
        if !self.take_inflight(peer, request_id) {
            return Ok(());
        }
        let now = Instant::now();
        let resp = match result {
            Ok(resp) => resp,
            Err(e) => {
                tracing::warn!(node_id = self.id, peer, error = %e, "install snapshot failed");
                let cap = self.config.heartbeat_interval();
                if let Some(p) = self.progress.get_mut(&peer) {
                    p.failed(now, cap);
                }
                return Ok(());
            }
        };
        if resp.term > self.current_term {
            return self.observe_term(resp.term).await;
        }
        if term != self.current_term || self.role != Role::Leader {
            return Ok(());
        }
        let Some(p) = self.progress.get_mut(&peer) else {
            return Ok(());
        };
        p.answered(now);
        p.match_index = p.match_index.max(last_included);
        p.next_index = p.match_index + 1;
        let behind = p.next_index <= self.last_log.index;
        self.advance_commit();
        if behind {
            self.send_to(peer).await?;
        }
        Ok(())
    }

    /// Clear the outstanding marker if `request_id` is the one we are waiting
    /// for. Stale replies return false.
    fn take_inflight(&mut self, peer: NodeId, request_id: u64) -> bool {
        match self.progress.get_mut(&peer) {
            Some(p) if p.inflight == Some(request_id) => {
                p.inflight = None;
                true
            }
            _ => false,
        }
    }

    /// Commit the highest index stored on a majority, but only once it is an
    /// entry of the current term.
    pub(crate) fn advance_commit(&mut self) {
        if self.role != Role::Leader {
            return;
        }
        let mut matched: Vec<u64> = self.progress.values().map(|p| p.match_index).collect();
        matched.push(self.last_log.index);
        matched.sort_unstable_by(|a, b| b.cmp(a));
        let candidate = matched[self.quorum() - 1];
        if candidate > self.commit_index && candidate >= self.term_start_index {
            self.set_commit(candidate);
        }
    }

    fn contacted_quorum(&self, now: Instant, window: Duration) -> bool {
        let live = 1 + self
            .progress
            .values()
            .filter(|p| now.duration_since(p.last_contact) <= window)
            .count();
        live >= self.quorum()
    }

    /// Step down if a majority has been silent for a full max election
    /// timeout. Returns whether this node is still leader.
    pub(crate) fn check_quorum(&mut self, now: Instant) -> bool {
        if self.contacted_quorum(now, self.config.election_timeout_max()) {
            return true;
        }
        tracing::warn!(node_id = self.id, term = self.current_term, "lost contact with quorum");
        self.step_down();
        false
    }

    pub(crate) fn lease_valid(&self, now: Instant) -> bool {
        self.contacted_quorum(now, self.config.lease())
    }

    // -----------------------------------------------------------------------
    // Follower side
    // -----------------------------------------------------------------------

    pub(crate) async fn handle_append(
        &mut self,
        req: AppendRequest,
    ) -> Result<AppendResponse, MimirError> {
        if req.term < self.current_term {
            return Ok(AppendResponse { term: self.current_term, success: false, match_index: 0 });
        }
        if req.term == self.current_term && self.role == Role::Leader {
            tracing::error!(
                node_id = self.id,
                term = req.term,
                other = req.leader_id,
                "two leaders in one term"
            );
            self.step_down();
            return Ok(AppendResponse { term: self.current_term, success: false, match_index: 0 });
        }
        self.follow(req.term, req.leader_id).await?;
        self.leader_commit = self.leader_commit.max(req.leader_commit);

        let base = self.last_purged;
        let mut prev_index = req.prev_log_index;
        let mut prev_term = req.prev_log_term;
        let mut entries = req.entries;
        if prev_index < base.index {
            // Everything up to the snapshot is committed and therefore matches.
            entries.retain(|e| e.index > base.index);
            prev_index = base.index;
            prev_term = base.term;
        }

        if prev_index > self.last_log.index {
            return Ok(self.reject(self.last_log.index));
        }
        if self.term_at(prev_index).await? != Some(prev_term) {
            return Ok(self.reject(self.commit_index.min(prev_index.saturating_sub(1))));
        }

        let last_new = prev_index + entries.len() as u64;
        let overlap_end = self.last_log.index.min(last_new);
        let existing = if overlap_end > prev_index {
            self.log.get_entries(prev_index + 1, overlap_end).await?
        } else {
            Vec::new()
        };
        let first_new = entries.iter().enumerate().position(|(offset, entry)| {
            !existing
                .get(offset)
                .is_some_and(|ours| ours.index == entry.index && ours.term == entry.term)
        });

        if let Some(offset) = first_new {
            let start = entries[offset].index;
            if start <= self.last_log.index {
                if start <= self.commit_index {
                    tracing::error!(
                        node_id = self.id,
                        index = start,
                        commit_index = self.commit_index,
                        "leader tried to overwrite a committed entry"
                    );
                    return Ok(self.reject(self.commit_index));
                }
                tracing::debug!(node_id = self.id, from = start, "truncating conflicting suffix");
                self.log.truncate(start).await?;
            }
            let tail = entries.split_off(offset);
            if let Some(last) = tail.last().map(|e| e.log_id()) {
                self.log.append(tail).await?;
                self.last_log = last;
            }
        }

        if req.leader_commit > self.commit_index {
            self.set_commit(req.leader_commit.min(last_new));
        }
        self.maybe_compact().await?;
        Ok(AppendResponse { term: self.current_term, success: true, match_index: last_new })
    }

    fn reject(&self, hint: u64) -> AppendResponse {
        AppendResponse { term: self.current_term, success: false, match_index: hint }
    }

    pub(crate) async fn handle_install_snapshot(
        &mut self,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, MimirError> {
        if req.term < self.current_term {
            return Ok(SnapshotResponse { term: self.current_term });
        }
        self.follow(req.term, req.leader_id).await?;

        let meta = req.snapshot.meta.clone();
        let index = meta.last_log_index;
        if index <= self.commit_index {
            return Ok(SnapshotResponse { term: self.current_term });
        }

        self.install_into_state_machine(req.snapshot).await?;

        let keep_suffix = self.term_at(index).await? == Some(meta.last_log_term);
        if !keep_suffix {
            self.log.truncate(0).await?;
            self.last_log = meta.log_id();
        }
        self.log.purge(meta.log_id()).await?;
        self.last_purged = meta.log_id();
        if self.last_log.index < index {
            self.last_log = meta.log_id();
        }
        self.commit_index = index;
        self.leader_commit = self.leader_commit.max(index);
        self.snapshot = None;
        tracing::info!(node_id = self.id, index, keep_suffix, "snapshot installed from leader");
        Ok(SnapshotResponse { term: self.current_term })
    }

    async fn install_into_state_machine(&self, snapshot: Snapshot) -> Result<(), MimirError> {
        let (tx, rx) = oneshot::channel();
        self.apply_tx
            .send(ApplyMsg::Install(snapshot, tx))
            .map_err(|_| MimirError::Consensus("apply task stopped".into()))?;
        rx.await.map_err(|_| MimirError::Consensus("apply task stopped".into()))?
    }
}
