//! Client-facing handle to one Raft node: proposals with deadlines,
//! leader forwarding and the three read modes.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use mimir_storage::{LogStorage, StateMachineStore};
use mimir_types::{
    ApplyResult, ConfigCommand, ConfigEntry, ConfigVersion, Health, InvalidationEvent, MimirError,
    NodeId, Page, ReadMode, Role,
};

use crate::config::RaftConfig;
use crate::message::{
    AppendRequest, AppendResponse, ForwardRequest, ForwardResponse, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::network::RaftNetwork;
use crate::rsm::{Feed, StateMachineWorker, Waiters};
use crate::sequencer::{Event, RaftStatus, Sequencer, Wiring};
use crate::RaftNode;

struct NodeInner<S, N> {
    id: NodeId,
    config: RaftConfig,
    inbox: mpsc::Sender<Event>,
    status: watch::Receiver<RaftStatus>,
    applied: watch::Receiver<u64>,
    store: Arc<S>,
    network: Arc<N>,
    events: Feed,
    /// Highest log index of a write this node has seen acknowledged.
    observed: AtomicU64,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<S, N> Drop for NodeInner<S, N> {
    fn drop(&mut self) {
        let tasks = self.tasks.get_mut().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
    }
}

/// A running Raft node over state store `S` and peer transport `N`.
///
/// Cheap to clone; the background tasks stop when the last clone is dropped
/// or on [`ConfigNode::shutdown`].
pub struct ConfigNode<S, N> {
    inner: Arc<NodeInner<S, N>>,
}

impl<S, N> Clone for ConfigNode<S, N> {
    fn clone(&self) -> Self {
        ConfigNode { inner: self.inner.clone() }
    }
}

fn stopped() -> MimirError {
    MimirError::Unavailable("raft node stopped".into())
}

impl<S: StateMachineStore, N: RaftNetwork> ConfigNode<S, N> {
    /// Recover state from `log` and `store` and spawn the sequencer and the
    /// apply task. `peers` may include `id` itself.
    pub async fn start<L: LogStorage>(
        id: NodeId,
        peers: Vec<NodeId>,
        config: RaftConfig,
        log: Arc<L>,
        store: Arc<S>,
        network: Arc<N>,
    ) -> Result<Self, MimirError> {
        config.validate()?;
        let applied = store.last_applied().await?.map(|id| id.index).unwrap_or(0);

        let (inbox, inbox_rx) = mpsc::channel(config.inbox_capacity);
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (applied_tx, applied_rx) = watch::channel(applied);
        let (status_tx, status_rx) = watch::channel(RaftStatus {
            role: Role::Follower,
            term: 0,
            leader_id: None,
            commit_index: applied,
            leader_commit: applied,
        });
        let events = Feed::new(config.event_capacity);
        let waiters = Arc::new(Waiters::default());

        let worker = StateMachineWorker {
            node_id: id,
            log: log.clone(),
            store: store.clone(),
            waiters: waiters.clone(),
            events: events.clone(),
            applied_tx,
            last_applied: applied,
        };
        let wiring = Wiring {
            log,
            network: network.clone(),
            inbox: inbox.clone(),
            apply_tx,
            applied_rx: applied_rx.clone(),
            status_tx,
            waiters,
        };
        let sequencer = Sequencer::recover(id, peers, config.clone(), applied, wiring).await?;

        let tasks = vec![tokio::spawn(worker.run(apply_rx)), tokio::spawn(sequencer.run(inbox_rx))];
        tracing::info!(node_id = id, applied, "raft node started");

        Ok(ConfigNode {
            inner: Arc::new(NodeInner {
                id,
                config,
                inbox,
                status: status_rx,
                applied: applied_rx,
                store,
                network,
                events,
                observed: AtomicU64::new(applied),
                tasks: Mutex::new(tasks),
            }),
        })
    }

    pub fn id(&self) -> NodeId {
        self.inner.id
    }

    pub fn status(&self) -> RaftStatus {
        self.inner.status.borrow().clone()
    }

    pub fn last_applied(&self) -> u64 {
        *self.inner.applied.borrow()
    }

    pub fn store(&self) -> &Arc<S> {
        &self.inner.store
    }

    /// Stop the background tasks. Later calls fail with `Unavailable`.
    pub fn shutdown(&self) {
        let mut tasks = self.inner.tasks.lock().unwrap_or_else(|e| e.into_inner());
        for task in tasks.drain(..) {
            task.abort();
        }
        tracing::info!(node_id = self.inner.id, "raft node stopped");
    }

    async fn call<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> Event,
    ) -> Result<T, MimirError> {
        let (tx, rx) = oneshot::channel();
        self.inner.inbox.send(make(tx)).await.map_err(|_| stopped())?;
        rx.await
            .map_err(|_| MimirError::Transient("request dropped by the sequencer".into()))
    }

    // -----------------------------------------------------------------------
    // Peer RPC entry points
    // -----------------------------------------------------------------------

    pub async fn handle_vote(&self, req: VoteRequest) -> Result<VoteResponse, MimirError> {
        self.call(|tx| Event::Vote(req, tx)).await
    }

    pub async fn handle_append(&self, req: AppendRequest) -> Result<AppendResponse, MimirError> {
        self.call(|tx| Event::Append(req, tx)).await
    }

    pub async fn handle_install_snapshot(
        &self,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, MimirError> {
        self.call(|tx| Event::InstallSnapshot(req, tx)).await
    }

    /// Serve an operation a follower relayed here. Never forwards again; a
    /// node that is not leader answers `NotLeader`.
    pub async fn handle_forward(&self, req: ForwardRequest) -> Result<ForwardResponse, MimirError> {
        let deadline = self.deadline();
        match req {
            ForwardRequest::Propose(cmd) => {
                self.propose_local(cmd, deadline).await.map(ForwardResponse::Applied)
            }
            ForwardRequest::Read { namespace, key, version } => self
                .leader_read(&namespace, &key, version, deadline)
                .await
                .map(ForwardResponse::Entry),
        }
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    fn deadline(&self) -> Instant {
        Instant::now() + self.inner.config.request_timeout()
    }

    async fn propose_local(
        &self,
        cmd: ConfigCommand,
        deadline: Instant,
    ) -> Result<ApplyResult, MimirError> {
        let waiter = self.call(|tx| Event::Propose(cmd, tx)).await??;
        match tokio::time::timeout_at(deadline, waiter).await {
            Err(_) => Err(MimirError::Timeout),
            Ok(Err(_)) => Err(MimirError::LeadershipLost),
            Ok(Ok(result)) => result,
        }
    }

    async fn forward(
        &self,
        leader: NodeId,
        req: ForwardRequest,
        deadline: Instant,
    ) -> Result<ForwardResponse, MimirError> {
        match tokio::time::timeout_at(deadline, self.inner.network.forward(leader, req)).await {
            Err(_) => Err(MimirError::Timeout),
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                tracing::warn!(node_id = self.inner.id, leader, error = %e, "forward to leader failed");
                Err(MimirError::NotLeader { leader: Some(leader) })
            }
        }
    }

    /// Wait until some leader is known, bounded by `deadline` and by two max
    /// election timeouts.
    async fn wait_for_leader(&self, deadline: Instant) -> Result<NodeId, MimirError> {
        let limit = deadline.min(Instant::now() + self.inner.config.election_timeout_max() * 2);
        let mut rx = self.inner.status.clone();
        let wait = async { rx.wait_for(|s| s.leader_id.is_some()).await.map(|s| s.leader_id) };
        match tokio::time::timeout_at(limit, wait).await {
            Ok(Ok(Some(leader))) => Ok(leader),
            Ok(Ok(None)) | Err(_) => Err(MimirError::Unavailable("no leader elected".into())),
            Ok(Err(_)) => Err(stopped()),
        }
    }

    async fn wait_applied(&self, index: u64, deadline: Instant) -> Result<(), MimirError> {
        let mut rx = self.inner.applied.clone();
        let wait = async { rx.wait_for(|applied| *applied >= index).await.map(|_| ()) };
        match tokio::time::timeout_at(deadline, wait).await {
            Err(_) => Err(MimirError::Timeout),
            Ok(Err(_)) => Err(stopped()),
            Ok(Ok(())) => Ok(()),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    async fn read_local(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
    ) -> Result<Option<ConfigEntry>, MimirError> {
        match version {
            None => self.inner.store.get_entry(namespace, key).await,
            Some(v) => Ok(self
                .inner
                .store
                .get_version(namespace, key, v)
                .await?
                .map(|v| v.to_entry())),
        }
    }

    /// Confirm leadership, wait for this node to apply the confirmed commit
    /// index, then read locally.
    async fn leader_read(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
        deadline: Instant,
    ) -> Result<Option<ConfigEntry>, MimirError> {
        let index = loop {
            match self.call(Event::ReadIndex).await? {
                Ok(index) => break index,
                Err(MimirError::Transient(reason)) => {
                    if Instant::now() >= deadline {
                        tracing::debug!(node_id = self.inner.id, %reason, "read index not confirmed");
                        return Err(MimirError::Timeout);
                    }
                    tokio::time::sleep(self.inner.config.heartbeat_interval()).await;
                }
                Err(e) => return Err(e),
            }
        };
        self.wait_applied(index, deadline).await?;
        self.read_local(namespace, key, version).await
    }

    async fn linearizable_read(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
        deadline: Instant,
    ) -> Result<Option<ConfigEntry>, MimirError> {
        let leader = match self.status().leader_id {
            Some(leader) => leader,
            None => self.wait_for_leader(deadline).await?,
        };
        if leader == self.inner.id {
            return self.leader_read(namespace, key, version, deadline).await;
        }
        let req = ForwardRequest::Read {
            namespace: namespace.to_string(),
            key: key.to_string(),
            version,
        };
        match self.forward(leader, req, deadline).await? {
            ForwardResponse::Entry(entry) => Ok(entry),
            ForwardResponse::Applied(_) => {
                Err(MimirError::Consensus("leader answered a read with a write result".into()))
            }
        }
    }

    async fn sequential_read(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
        deadline: Instant,
    ) -> Result<Option<ConfigEntry>, MimirError> {
        let status = self.status();
        let known = if status.role == Role::Leader { status.commit_index } else { status.leader_commit };
        let target = known.max(self.inner.observed.load(Ordering::Acquire));
        if self.last_applied() >= target {
            return self.read_local(namespace, key, version).await;
        }
        if status.role == Role::Leader || status.leader_id.is_none() {
            self.wait_applied(target, deadline).await?;
            return self.read_local(namespace, key, version).await;
        }
        self.linearizable_read(namespace, key, version, deadline).await
    }
}

/// No known leader, or applying has fallen more than `max_lag` entries
/// behind the commit index.
fn degraded(status: &RaftStatus, last_applied: u64, max_lag: u64) -> bool {
    status.leader_id.is_none() || status.commit_index.saturating_sub(last_applied) > max_lag
}

impl<S: StateMachineStore, N: RaftNetwork> RaftNode for ConfigNode<S, N> {
    fn node_id(&self) -> NodeId {
        self.inner.id
    }

    async fn propose(&self, cmd: ConfigCommand) -> Result<ApplyResult, MimirError> {
        let deadline = self.deadline();
        let mut retried = false;
        let result = loop {
            match self.propose_local(cmd.clone(), deadline).await {
                Err(MimirError::NotLeader { leader: Some(leader) }) if leader != self.inner.id => {
                    break match self.forward(leader, ForwardRequest::Propose(cmd), deadline).await? {
                        ForwardResponse::Applied(result) => Ok(result),
                        ForwardResponse::Entry(_) => Err(MimirError::Consensus(
                            "leader answered a write with a read result".into(),
                        )),
                    };
                }
                Err(MimirError::NotLeader { .. }) => {
                    self.wait_for_leader(deadline).await?;
                }
                Err(MimirError::Transient(reason)) if !retried => {
                    tracing::debug!(node_id = self.inner.id, %reason, "retrying proposal");
                    retried = true;
                }
                other => break other,
            }
            if Instant::now() >= deadline {
                return Err(MimirError::Timeout);
            }
        };
        if let Ok(applied) = &result {
            self.inner.observed.fetch_max(applied.index, Ordering::AcqRel);
        }
        result
    }

    async fn read(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
        mode: ReadMode,
    ) -> Result<Option<ConfigEntry>, MimirError> {
        let deadline = self.deadline();
        match mode {
            ReadMode::Eventual => self.read_local(namespace, key, version).await,
            ReadMode::Sequential => self.sequential_read(namespace, key, version, deadline).await,
            ReadMode::Linearizable => {
                self.linearizable_read(namespace, key, version, deadline).await
            }
        }
    }

    /// Served from this node's applied history.
    async fn list_versions(
        &self,
        namespace: &str,
        key: &str,
        page: Page,
    ) -> Result<Vec<ConfigVersion>, MimirError> {
        self.inner.store.list_versions(namespace, key, page).await
    }

    fn health(&self) -> Health {
        let status = self.status();
        let last_applied = self.last_applied();
        Health {
            node_id: self.inner.id,
            role: status.role,
            term: status.term,
            commit_index: status.commit_index,
            last_applied,
            leader_id: status.leader_id,
            degraded: degraded(&status, last_applied, self.inner.config.degraded_apply_lag),
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.inner.events.subscribe()
    }

    fn last_published(&self) -> u64 {
        self.inner.events.published()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalRouter;
    use mimir_storage::mem::{MemLogStorage, MemStateMachine};
    use mimir_storage::{LogEntry, Vote};
    use mimir_types::ConfigValue;
    use std::collections::HashSet;
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;

    type Node = ConfigNode<MemStateMachine, crate::local::LocalTransport<MemStateMachine>>;

    fn put(key: &str, value: i64) -> ConfigCommand {
        ConfigCommand::Put {
            namespace: "app".into(),
            key: key.into(),
            value: ConfigValue::Int(value),
            description: None,
            expected_version: None,
            created_by: "test".into(),
            issued_at_ms: 1,
        }
    }

    async fn single() -> Node {
        let router = LocalRouter::new();
        let node = ConfigNode::start(
            1,
            vec![1],
            RaftConfig::default(),
            Arc::new(MemLogStorage::new()),
            Arc::new(MemStateMachine::new()),
            Arc::new(router.transport(1)),
        )
        .await
        .unwrap();
        router.register(node.clone());
        node
    }

    #[tokio::test(start_paused = true)]
    async fn single_node_elects_itself_and_commits() {
        let node = single().await;
        let result = node.propose(put("a", 1)).await.unwrap();
        assert_eq!(result.new_version, 1);
        assert_eq!(node.health().role, Role::Leader);

        let entry = node.read("app", "a", None, ReadMode::Linearizable).await.unwrap().unwrap();
        assert_eq!(entry.value, ConfigValue::Int(1));
        assert!(!node.health().degraded);
    }

    #[tokio::test(start_paused = true)]
    async fn conflict_is_reported_to_the_proposer() {
        let node = single().await;
        node.propose(put("a", 1)).await.unwrap();
        let mut cmd = put("a", 2);
        if let ConfigCommand::Put { expected_version, .. } = &mut cmd {
            *expected_version = Some(7);
        }
        let err = node.propose(cmd).await.unwrap_err();
        assert_eq!(err, MimirError::Conflict { expected: 7, actual: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn subscribers_see_committed_changes() {
        let node = single().await;
        let mut events = node.subscribe();
        node.propose(put("a", 1)).await.unwrap();
        let ev = events.recv().await.unwrap();
        assert!(matches!(ev, InvalidationEvent::Changed { version: 1, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_rejects_new_requests() {
        let node = single().await;
        node.propose(put("a", 1)).await.unwrap();
        node.shutdown();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let err = node.propose(put("a", 2)).await.unwrap_err();
        assert!(err.is_unreachable(), "{err:?}");
    }

    /// Member 1 of a three node cluster whose peers never run. The election
    /// timer is long enough that it stays a follower for the whole test.
    async fn follower() -> (Node, Arc<MemLogStorage>) {
        let router = LocalRouter::new();
        let log = Arc::new(MemLogStorage::new());
        let config = RaftConfig {
            election_timeout_min_ms: 60_000,
            election_timeout_max_ms: 60_000,
            ..RaftConfig::default()
        };
        let node = ConfigNode::start(
            1,
            vec![1, 2, 3],
            config,
            log.clone(),
            Arc::new(MemStateMachine::new()),
            Arc::new(router.transport(1)),
        )
        .await
        .unwrap();
        router.register(node.clone());
        (node, log)
    }

    fn vote(term: u64, candidate_id: NodeId, last_log_index: u64, last_log_term: u64) -> VoteRequest {
        VoteRequest { term, candidate_id, last_log_index, last_log_term }
    }

    fn append(
        term: u64,
        leader_id: NodeId,
        prev: (u64, u64),
        entries: &[(u64, u64)],
        leader_commit: u64,
    ) -> AppendRequest {
        AppendRequest {
            term,
            leader_id,
            prev_log_index: prev.0,
            prev_log_term: prev.1,
            entries: entries.iter().map(|&(index, term)| LogEntry::noop(index, term)).collect(),
            leader_commit,
        }
    }

    async fn term_of(log: &MemLogStorage, index: u64) -> Option<u64> {
        log.get_entry(index).await.unwrap().map(|e| e.term)
    }

    #[tokio::test]
    async fn one_vote_per_term() {
        let (node, log) = follower().await;

        assert!(node.handle_vote(vote(2, 2, 0, 0)).await.unwrap().granted);
        let second = node.handle_vote(vote(2, 3, 0, 0)).await.unwrap();
        assert!(!second.granted);
        assert_eq!(second.term, 2);
        // Asking again for the same candidate is answered the same way.
        assert!(node.handle_vote(vote(2, 2, 0, 0)).await.unwrap().granted);
        assert_eq!(log.read_vote().await.unwrap(), Some(Vote { term: 2, voted_for: Some(2) }));

        // A new term frees the vote.
        assert!(node.handle_vote(vote(3, 3, 0, 0)).await.unwrap().granted);
    }

    #[tokio::test]
    async fn candidate_with_older_last_term_is_refused() {
        let (node, _log) = follower().await;
        let resp = node.handle_append(append(3, 2, (0, 0), &[(1, 1), (2, 3)], 0)).await.unwrap();
        assert!(resp.success);

        // Longer log but an older last term loses.
        let resp = node.handle_vote(vote(4, 3, 5, 2)).await.unwrap();
        assert!(!resp.granted);
        assert_eq!(resp.term, 4);

        // The refusal did not spend the vote.
        assert!(node.handle_vote(vote(4, 3, 2, 3)).await.unwrap().granted);
    }

    #[tokio::test]
    async fn conflicting_uncommitted_suffix_is_replaced() {
        let (node, log) = follower().await;
        let resp = node
            .handle_append(append(2, 2, (0, 0), &[(1, 1), (2, 1), (3, 1)], 1))
            .await
            .unwrap();
        assert_eq!((resp.success, resp.match_index), (true, 3));

        let resp = node.handle_append(append(3, 3, (1, 1), &[(2, 3)], 1)).await.unwrap();
        assert_eq!((resp.success, resp.match_index), (true, 2));
        assert_eq!(term_of(&log, 2).await, Some(3));
        assert_eq!(term_of(&log, 3).await, None);
        assert_eq!(log.log_state().await.unwrap().last_index, Some(2));
    }

    #[tokio::test]
    async fn committed_entries_are_never_overwritten() {
        let (node, log) = follower().await;
        let resp = node.handle_append(append(2, 2, (0, 0), &[(1, 1), (2, 2)], 2)).await.unwrap();
        assert!(resp.success);
        assert_eq!(node.status().commit_index, 2);

        let resp = node.handle_append(append(3, 3, (0, 0), &[(1, 1), (2, 3)], 2)).await.unwrap();
        assert!(!resp.success);
        assert_eq!(resp.match_index, 2);
        assert_eq!(term_of(&log, 2).await, Some(2));
        assert_eq!(node.status().commit_index, 2);
    }

    /// Peers that grant every vote and hold the log only up to `held` until
    /// released. Each acknowledges the held prefix once, then stops answering
    /// appends that reach past it.
    struct LaggingPeers {
        held: u64,
        released: AtomicBool,
        acked: std::sync::Mutex<HashSet<NodeId>>,
    }

    impl RaftNetwork for LaggingPeers {
        async fn request_vote(&self, _: NodeId, req: VoteRequest) -> Result<VoteResponse, MimirError> {
            Ok(VoteResponse { term: req.term, granted: true })
        }

        async fn append_entries(
            &self,
            target: NodeId,
            req: AppendRequest,
        ) -> Result<AppendResponse, MimirError> {
            let last = req.prev_log_index + req.entries.len() as u64;
            if last <= self.held || self.released.load(Ordering::SeqCst) {
                return Ok(AppendResponse { term: req.term, success: true, match_index: last });
            }
            if self.acked.lock().unwrap().insert(target) {
                return Ok(AppendResponse { term: req.term, success: true, match_index: self.held });
            }
            Err(MimirError::Unavailable(format!("node {target} lagging")))
        }

        async fn install_snapshot(
            &self,
            target: NodeId,
            _: SnapshotRequest,
        ) -> Result<SnapshotResponse, MimirError> {
            Err(MimirError::Unavailable(format!("node {target} lagging")))
        }

        async fn forward(
            &self,
            target: NodeId,
            _: ForwardRequest,
        ) -> Result<Result<ForwardResponse, MimirError>, MimirError> {
            Err(MimirError::Unavailable(format!("node {target} lagging")))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn old_term_entries_commit_only_behind_the_new_leader_noop() {
        let log = Arc::new(MemLogStorage::new());
        log.append(vec![LogEntry::noop(1, 1), LogEntry::noop(2, 1)]).await.unwrap();
        log.save_vote(Vote { term: 1, voted_for: Some(1) }).await.unwrap();
        let peers = Arc::new(LaggingPeers {
            held: 2,
            released: AtomicBool::new(false),
            acked: std::sync::Mutex::new(HashSet::new()),
        });
        let node = ConfigNode::start(
            1,
            vec![1, 2, 3],
            RaftConfig::default(),
            log.clone(),
            Arc::new(MemStateMachine::new()),
            peers.clone(),
        )
        .await
        .unwrap();

        while node.status().role != Role::Leader {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(node.status().term, 2);
        assert_eq!(term_of(&log, 3).await, Some(2));

        // Both peers store entries 1 and 2 of term 1, a majority, but the
        // leader's own no-op is not replicated yet.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(peers.acked.lock().unwrap().len(), 2);
        assert_eq!(node.status().role, Role::Leader);
        assert_eq!(node.status().commit_index, 0);

        peers.released.store(true, Ordering::SeqCst);
        tokio::time::timeout(Duration::from_secs(1), async {
            while node.last_applied() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(node.status().commit_index, 3);
    }

    #[test]
    fn degraded_without_leader_or_with_apply_lag() {
        let status = RaftStatus {
            role: Role::Follower,
            term: 3,
            leader_id: Some(2),
            commit_index: 500,
            leader_commit: 500,
        };
        assert!(!degraded(&status, 490, 64));
        assert!(degraded(&status, 400, 64));
        assert!(degraded(&RaftStatus { leader_id: None, ..status.clone() }, 500, 64));
    }
}
