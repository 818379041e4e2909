//! Replicated state machine: one task applies committed entries strictly in
//! index order and publishes what changed.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::{broadcast, mpsc, oneshot, watch};

use mimir_storage::{ApplyOutcome, LogEntry, LogStorage, Snapshot, StateMachineStore};
use mimir_types::{ApplyResult, AuditRecord, EntryType, InvalidationEvent, MimirError, NodeId};

/// Entries read from the log per batch.
const APPLY_BATCH: u64 = 256;

/// The commit feed, plus the index of the newest event put on it.
#[derive(Clone)]
pub(crate) struct Feed {
    tx: broadcast::Sender<InvalidationEvent>,
    published: Arc<AtomicU64>,
}

impl Feed {
    pub(crate) fn new(capacity: usize) -> Self {
        Feed { tx: broadcast::channel(capacity).0, published: Arc::new(AtomicU64::new(0)) }
    }

    /// Bumps `published` before sending, so anyone who has seen the change
    /// acknowledged also sees the index.
    pub(crate) fn publish(&self, event: InvalidationEvent, index: u64) {
        self.published.fetch_max(index, Ordering::SeqCst);
        let _ = self.tx.send(event);
    }

    pub(crate) fn published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.tx.subscribe()
    }
}

pub(crate) enum ApplyMsg {
    /// Commit index advanced to this value.
    Commit(u64),
    Install(Snapshot, oneshot::Sender<Result<(), MimirError>>),
    BuildSnapshot(oneshot::Sender<Result<Snapshot, MimirError>>),
}

struct Waiter {
    term: u64,
    tx: oneshot::Sender<Result<ApplyResult, MimirError>>,
}

/// Proposals waiting for their entry to be applied, keyed by log index.
#[derive(Default)]
pub(crate) struct Waiters {
    inner: Mutex<BTreeMap<u64, Waiter>>,
}

impl Waiters {
    pub(crate) fn register(
        &self,
        index: u64,
        term: u64,
    ) -> oneshot::Receiver<Result<ApplyResult, MimirError>> {
        let (tx, rx) = oneshot::channel();
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.insert(index, Waiter { term, tx });
        rx
    }

    /// Deliver the outcome for `index`. A waiter registered under another
    /// term lost its entry to a different leader.
    fn resolve(&self, index: u64, term: u64, outcome: Result<ApplyResult, MimirError>) {
        let waiter = {
            let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            g.remove(&index)
        };
        if let Some(w) = waiter {
            let outcome = if w.term == term { outcome } else { Err(MimirError::LeadershipLost) };
            let _ = w.tx.send(outcome);
        }
    }

    /// Fail every waiter whose entry sits above `commit_index`.
    pub(crate) fn fail_above(&self, commit_index: u64, err: MimirError) {
        let failed = {
            let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
            g.split_off(&(commit_index + 1))
        };
        for (_, w) in failed {
            let _ = w.tx.send(Err(err.clone()));
        }
    }
}

pub(crate) struct StateMachineWorker<L, S> {
    pub node_id: NodeId,
    pub log: Arc<L>,
    pub store: Arc<S>,
    pub waiters: Arc<Waiters>,
    pub events: Feed,
    pub applied_tx: watch::Sender<u64>,
    pub last_applied: u64,
}

impl<L: LogStorage, S: StateMachineStore> StateMachineWorker<L, S> {
    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ApplyMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                ApplyMsg::Commit(commit) => {
                    if let Err(e) = self.apply_to(commit).await {
                        tracing::error!(node_id = self.node_id, commit, error = %e, "apply stalled");
                    }
                }
                ApplyMsg::Install(snapshot, reply) => {
                    let _ = reply.send(self.install(snapshot).await);
                }
                ApplyMsg::BuildSnapshot(reply) => {
                    let _ = reply.send(self.store.build_snapshot().await);
                }
            }
        }
        tracing::debug!(node_id = self.node_id, "apply task stopped");
    }

    async fn apply_to(&mut self, commit: u64) -> Result<(), MimirError> {
        while self.last_applied < commit {
            let from = self.last_applied + 1;
            let to = commit.min(from + APPLY_BATCH - 1);
            let entries = self.log.get_entries(from, to).await?;
            if entries.first().map(|e| e.index) != Some(from) {
                return Err(MimirError::Consensus(format!("committed entry {from} missing from log")));
            }
            for entry in entries {
                if entry.index != self.last_applied + 1 {
                    return Err(MimirError::Consensus(format!(
                        "log gap before index {}",
                        entry.index
                    )));
                }
                self.apply_entry(entry).await?;
            }
        }
        Ok(())
    }

    async fn apply_entry(&mut self, entry: LogEntry) -> Result<(), MimirError> {
        let id = entry.log_id();
        if entry.entry_type == EntryType::NoOp {
            self.store.skip(id, None).await?;
            return self.advance(id.index);
        }

        let cmd = match entry.decode_command() {
            Ok(cmd) => cmd,
            Err(e) => {
                tracing::error!(
                    node_id = self.node_id,
                    index = id.index,
                    term = id.term,
                    error = %e,
                    "skipping malformed log entry"
                );
                let record = AuditRecord { index: id.index, term: id.term, reason: e.to_string() };
                self.store.skip(id, Some(record)).await?;
                self.waiters.resolve(id.index, id.term, Err(MimirError::Consensus(e.to_string())));
                return self.advance(id.index);
            }
        };

        match self.store.apply(id, cmd).await? {
            ApplyOutcome::Applied(result) => {
                tracing::debug!(
                    node_id = self.node_id,
                    index = id.index,
                    namespace = %result.namespace,
                    key = %result.key,
                    version = result.new_version,
                    "applied"
                );
                self.events.publish(result.invalidation(), id.index);
                self.waiters.resolve(id.index, id.term, Ok(result));
            }
            ApplyOutcome::Rejected(e) => {
                tracing::debug!(node_id = self.node_id, index = id.index, error = %e, "command rejected");
                self.waiters.resolve(id.index, id.term, Err(e));
            }
            ApplyOutcome::Skipped | ApplyOutcome::AlreadyApplied => {}
        }
        self.advance(id.index)
    }

    fn advance(&mut self, index: u64) -> Result<(), MimirError> {
        self.last_applied = index;
        self.applied_tx.send_replace(index);
        Ok(())
    }

    async fn install(&mut self, snapshot: Snapshot) -> Result<(), MimirError> {
        let index = snapshot.meta.last_log_index;
        if index <= self.last_applied {
            return Ok(());
        }
        self.store.install_snapshot(snapshot).await?;
        tracing::info!(node_id = self.node_id, index, "installed snapshot");
        self.events.publish(InvalidationEvent::Reset { index }, index);
        self.advance(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_storage::mem::{MemLogStorage, MemStateMachine};
    use mimir_types::{ConfigCommand, ConfigValue};

    fn put(key: &str, value: i64) -> ConfigCommand {
        ConfigCommand::Put {
            namespace: "ns".into(),
            key: key.into(),
            value: ConfigValue::Int(value),
            description: None,
            expected_version: None,
            created_by: "t".into(),
            issued_at_ms: 0,
        }
    }

    struct Harness {
        log: Arc<MemLogStorage>,
        store: Arc<MemStateMachine>,
        waiters: Arc<Waiters>,
        tx: mpsc::UnboundedSender<ApplyMsg>,
        applied: watch::Receiver<u64>,
        events: broadcast::Receiver<InvalidationEvent>,
    }

    fn spawn_worker() -> Harness {
        let log = Arc::new(MemLogStorage::new());
        let store = Arc::new(MemStateMachine::new());
        let waiters = Arc::new(Waiters::default());
        let feed = Feed::new(16);
        let events = feed.subscribe();
        let (applied_tx, applied) = watch::channel(0);
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = StateMachineWorker {
            node_id: 1,
            log: log.clone(),
            store: store.clone(),
            waiters: waiters.clone(),
            events: feed,
            applied_tx,
            last_applied: 0,
        };
        tokio::spawn(worker.run(rx));
        Harness { log, store, waiters, tx, applied, events }
    }

    #[tokio::test]
    async fn applies_in_order_and_publishes() {
        let mut h = spawn_worker();
        h.log
            .append(vec![
                LogEntry::noop(1, 1),
                LogEntry::command(2, 1, &put("a", 1)).unwrap(),
                LogEntry::command(3, 1, &put("a", 2)).unwrap(),
            ])
            .await
            .unwrap();
        let waiter = h.waiters.register(3, 1);
        h.tx.send(ApplyMsg::Commit(3)).unwrap();

        let result = waiter.await.unwrap().unwrap();
        assert_eq!(result.new_version, 2);
        h.applied.wait_for(|&a| a == 3).await.unwrap();

        let first = h.events.recv().await.unwrap();
        assert!(matches!(first, InvalidationEvent::Changed { version: 1, index: 2, .. }));
    }

    #[tokio::test]
    async fn malformed_entry_is_audited_not_fatal() {
        let mut h = spawn_worker();
        let bad = LogEntry { index: 1, term: 1, entry_type: EntryType::Put, payload: vec![0xff; 3] };
        h.log.append(vec![bad, LogEntry::command(2, 1, &put("a", 1)).unwrap()]).await.unwrap();
        h.tx.send(ApplyMsg::Commit(2)).unwrap();
        h.applied.wait_for(|&a| a == 2).await.unwrap();

        let trail = h.store.audit_trail().await.unwrap();
        assert_eq!(trail.len(), 1);
        assert_eq!(trail[0].index, 1);
        assert_eq!(h.store.get_entry("ns", "a").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn term_mismatch_reports_leadership_lost() {
        let mut h = spawn_worker();
        let waiter = h.waiters.register(1, 1);
        h.log.append(vec![LogEntry::command(1, 2, &put("a", 1)).unwrap()]).await.unwrap();
        h.tx.send(ApplyMsg::Commit(1)).unwrap();
        assert_eq!(waiter.await.unwrap(), Err(MimirError::LeadershipLost));
        h.applied.wait_for(|&a| a == 1).await.unwrap();
    }

    #[test]
    fn fail_above_keeps_committed_waiters() {
        let waiters = Waiters::default();
        let mut low = waiters.register(5, 1);
        let mut high = waiters.register(6, 1);
        waiters.fail_above(5, MimirError::LeadershipLost);
        assert!(low.try_recv().is_err());
        assert_eq!(high.try_recv().unwrap(), Err(MimirError::LeadershipLost));
    }
}
