pub mod config;
mod election;
pub mod local;
pub mod message;
pub mod network;
pub mod node;
mod replication;
mod rsm;
mod sequencer;
pub mod versions;

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{broadcast, Mutex};

use mimir_storage::mem::MemStateMachine;
use mimir_storage::{ApplyOutcome, LogId, StateMachineStore};
use mimir_types::{
    ApplyResult, ConfigCommand, ConfigEntry, ConfigVersion, Health, InvalidationEvent, MimirError,
    NodeId, Page, ReadMode, Role,
};

pub use config::RaftConfig;
pub use network::RaftNetwork;
pub use node::ConfigNode;
pub use sequencer::RaftStatus;
pub use versions::VersionManager;

// ---------------------------------------------------------------------------
// RaftNode trait
// Uses RPITIT (Return Position Impl Trait In Trait, stable since Rust 1.75).
// The explicit `+ Send` bound on each future ensures generic callers can
// `.await` across thread boundaries.
// ---------------------------------------------------------------------------

pub trait RaftNode: Send + Sync + 'static {
    fn node_id(&self) -> NodeId;

    /// Commit `cmd` through the leader and wait for it to be applied.
    fn propose(
        &self,
        cmd: ConfigCommand,
    ) -> impl Future<Output = Result<ApplyResult, MimirError>> + Send;

    /// `version == None` means the head, tombstones included.
    fn read(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
        mode: ReadMode,
    ) -> impl Future<Output = Result<Option<ConfigEntry>, MimirError>> + Send;

    fn list_versions(
        &self,
        namespace: &str,
        key: &str,
        page: Page,
    ) -> impl Future<Output = Result<Vec<ConfigVersion>, MimirError>> + Send;

    fn health(&self) -> Health;

    /// Feed of applied changes on this node.
    fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent>;

    /// Log index of the newest event sent on the [`RaftNode::subscribe`]
    /// feed. Raised before the matching write is acknowledged.
    fn last_published(&self) -> u64;
}

// ---------------------------------------------------------------------------
// StubRaftNode: applies straight to an in-memory store, no replication
// ---------------------------------------------------------------------------

pub struct StubRaftNode {
    store: MemStateMachine,
    next_index: Mutex<u64>,
    available: AtomicBool,
    events: broadcast::Sender<InvalidationEvent>,
    published: AtomicU64,
}

impl StubRaftNode {
    pub fn new() -> Self {
        StubRaftNode {
            store: MemStateMachine::new(),
            next_index: Mutex::new(0),
            available: AtomicBool::new(true),
            events: broadcast::channel(1024).0,
            published: AtomicU64::new(0),
        }
    }

    /// While unavailable every call fails with `Unavailable`, as if the
    /// cluster had lost quorum.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), MimirError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MimirError::Unavailable("stub node switched off".into()))
        }
    }
}

impl Default for StubRaftNode {
    fn default() -> Self {
        Self::new()
    }
}

impl RaftNode for StubRaftNode {
    fn node_id(&self) -> NodeId {
        1
    }

    async fn propose(&self, cmd: ConfigCommand) -> Result<ApplyResult, MimirError> {
        self.check()?;
        let mut next = self.next_index.lock().await;
        *next += 1;
        let id = LogId { index: *next, term: 1 };
        match self.store.apply(id, cmd).await? {
            ApplyOutcome::Applied(result) => {
                self.published.fetch_max(result.index, Ordering::SeqCst);
                let _ = self.events.send(result.invalidation());
                Ok(result)
            }
            ApplyOutcome::Rejected(e) => Err(e),
            ApplyOutcome::Skipped | ApplyOutcome::AlreadyApplied => {
                Err(MimirError::Consensus(format!("entry {} was not applied", id.index)))
            }
        }
    }

    async fn read(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
        _mode: ReadMode,
    ) -> Result<Option<ConfigEntry>, MimirError> {
        self.check()?;
        match version {
            None => self.store.get_entry(namespace, key).await,
            Some(v) => Ok(self.store.get_version(namespace, key, v).await?.map(|v| v.to_entry())),
        }
    }

    async fn list_versions(
        &self,
        namespace: &str,
        key: &str,
        page: Page,
    ) -> Result<Vec<ConfigVersion>, MimirError> {
        self.check()?;
        self.store.list_versions(namespace, key, page).await
    }

    fn health(&self) -> Health {
        let up = self.available.load(Ordering::SeqCst);
        let applied = self.published.load(Ordering::SeqCst);
        Health {
            node_id: 1,
            role: if up { Role::Leader } else { Role::Follower },
            term: 1,
            commit_index: applied,
            last_applied: applied,
            leader_id: up.then_some(1),
            degraded: !up,
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<InvalidationEvent> {
        self.events.subscribe()
    }

    fn last_published(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use tokio::sync::mpsc;

    use super::*;
    use mimir_types::ConfigValue;

    fn put(value: i64) -> ConfigCommand {
        ConfigCommand::Put {
            namespace: "ns".into(),
            key: "foo".into(),
            value: ConfigValue::Int(value),
            description: None,
            expected_version: None,
            created_by: "test".into(),
            issued_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn test_stub_raft_node() {
        let node = StubRaftNode::new();
        assert_eq!(node.node_id(), 1);

        let resp = node.propose(put(1)).await.unwrap();
        assert_eq!(resp.new_version, 1);
        assert_eq!(resp.previous_value, None);

        let entry = node.read("ns", "foo", None, ReadMode::Linearizable).await.unwrap().unwrap();
        assert_eq!(entry.value, ConfigValue::Int(1));

        let resp = node.propose(put(2)).await.unwrap();
        assert_eq!(resp.previous_value, Some(ConfigValue::Int(1)));

        let old = node.read("ns", "foo", Some(1), ReadMode::Eventual).await.unwrap().unwrap();
        assert_eq!(old.value, ConfigValue::Int(1));

        node.set_available(false);
        assert!(node.read("ns", "foo", None, ReadMode::Eventual).await.unwrap_err().is_unreachable());
        assert!(node.health().degraded);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_stub_raft_node_parallel_propose() {
        let node = Arc::new(StubRaftNode::new());

        let (send, mut recv) = mpsc::unbounded_channel();
        for n in 1..201 {
            let send_clone = send.clone();
            let node_clone = node.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(rand::random::<u64>() % 50)).await;
                let resp = node_clone.propose(put(n)).await.unwrap();
                let _ = send_clone.send(resp.new_version);
            });
        }

        drop(send);
        let mut versions = Vec::new();
        while let Some(version) = recv.recv().await {
            versions.push(version);
        }
        versions.sort_unstable();
        assert_eq!(versions, (1..201).collect::<Vec<u64>>());
    }
}
