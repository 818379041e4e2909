use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;

use mimir_types::{
    AuditRecord, ConfigCommand, ConfigEntry, ConfigVersion, MimirError, Page,
};

use crate::apply::{evaluate, prunable};
use crate::codec::{decode, encode};
use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{
    ApplyOutcome, LogEntry, LogId, LogState, RetentionPolicy, Snapshot, SnapshotContents,
    SnapshotMeta, VersionRef, Vote,
};

// ---------------------------------------------------------------------------
// MemLogStorage
// ---------------------------------------------------------------------------

struct MemLogInner {
    entries: BTreeMap<u64, LogEntry>,
    last_purged: Option<LogId>,
    vote: Option<Vote>,
}

/// In-memory `LogStorage` backed by a `BTreeMap`.
///
/// Intended for tests; not persisted across restarts.
pub struct MemLogStorage {
    inner: Arc<RwLock<MemLogInner>>,
}

impl MemLogStorage {
    pub fn new() -> Self {
        MemLogStorage {
            inner: Arc::new(RwLock::new(MemLogInner {
                entries: BTreeMap::new(),
                last_purged: None,
                vote: None,
            })),
        }
    }
}

impl Default for MemLogStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl LogStorage for MemLogStorage {
    async fn log_state(&self) -> Result<LogState, MimirError> {
        let g = self.inner.read().await;
        Ok(LogState {
            first_index: g.entries.keys().next().copied(),
            last_index: g.entries.keys().next_back().copied(),
            last_purged: g.last_purged,
        })
    }

    async fn get_entry(&self, index: u64) -> Result<Option<LogEntry>, MimirError> {
        Ok(self.inner.read().await.entries.get(&index).cloned())
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, MimirError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let g = self.inner.read().await;
        Ok(g.entries.range(from..=to_inclusive).map(|(_, e)| e.clone()).collect())
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), MimirError> {
        let mut g = self.inner.write().await;
        for entry in entries {
            g.entries.insert(entry.index, entry);
        }
        Ok(())
    }

    async fn truncate(&self, from_index: u64) -> Result<(), MimirError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx < from_index);
        Ok(())
    }

    async fn purge(&self, upto: LogId) -> Result<(), MimirError> {
        let mut g = self.inner.write().await;
        g.entries.retain(|&idx, _| idx > upto.index);
        g.last_purged = Some(upto);
        Ok(())
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), MimirError> {
        self.inner.write().await.vote = Some(vote);
        Ok(())
    }

    async fn read_vote(&self) -> Result<Option<Vote>, MimirError> {
        Ok(self.inner.read().await.vote.clone())
    }
}

// ---------------------------------------------------------------------------
// MemStateMachine
// ---------------------------------------------------------------------------

type NsKey = (String, String);

#[derive(Default)]
struct MemSmInner {
    heads: BTreeMap<NsKey, ConfigEntry>,
    /// (namespace, key) → version → record.
    history: BTreeMap<NsKey, BTreeMap<u64, ConfigVersion>>,
    audit: BTreeMap<u64, AuditRecord>,
    last_applied: Option<LogId>,
}

impl MemSmInner {
    fn already_applied(&self, id: LogId) -> bool {
        self.last_applied.is_some_and(|la| id.index <= la.index)
    }
}

/// In-memory `StateMachineStore` with full version history.
///
/// Intended for tests; not persisted across restarts.
pub struct MemStateMachine {
    inner: Arc<RwLock<MemSmInner>>,
}

impl MemStateMachine {
    pub fn new() -> Self {
        MemStateMachine { inner: Arc::new(RwLock::new(MemSmInner::default())) }
    }
}

impl Default for MemStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachineStore for MemStateMachine {
    async fn last_applied(&self) -> Result<Option<LogId>, MimirError> {
        Ok(self.inner.read().await.last_applied)
    }

    async fn apply(&self, id: LogId, cmd: ConfigCommand) -> Result<ApplyOutcome, MimirError> {
        let mut g = self.inner.write().await;
        if g.already_applied(id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        let slot = (cmd.namespace().to_string(), cmd.key().to_string());
        let evaluated = evaluate(g.heads.get(&slot), id, cmd);
        let outcome = match evaluated {
            Ok(m) => {
                g.history.entry(slot.clone()).or_default().insert(m.version.version, m.version);
                g.heads.insert(slot, m.head);
                ApplyOutcome::Applied(m.result)
            }
            Err(e) => ApplyOutcome::Rejected(e),
        };
        g.last_applied = Some(id);
        Ok(outcome)
    }

    async fn skip(&self, id: LogId, audit: Option<AuditRecord>) -> Result<ApplyOutcome, MimirError> {
        let mut g = self.inner.write().await;
        if g.already_applied(id) {
            return Ok(ApplyOutcome::AlreadyApplied);
        }
        if let Some(record) = audit {
            g.audit.insert(record.index, record);
        }
        g.last_applied = Some(id);
        Ok(ApplyOutcome::Skipped)
    }

    async fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>, MimirError> {
        let g = self.inner.read().await;
        Ok(g.heads.get(&(namespace.to_string(), key.to_string())).cloned())
    }

    async fn get_version(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
    ) -> Result<Option<ConfigVersion>, MimirError> {
        let g = self.inner.read().await;
        Ok(g.history
            .get(&(namespace.to_string(), key.to_string()))
            .and_then(|vs| vs.get(&version))
            .cloned())
    }

    async fn list_versions(
        &self,
        namespace: &str,
        key: &str,
        page: Page,
    ) -> Result<Vec<ConfigVersion>, MimirError> {
        let g = self.inner.read().await;
        Ok(g.history
            .get(&(namespace.to_string(), key.to_string()))
            .map(|vs| {
                vs.values()
                    .rev()
                    .skip(page.offset as usize)
                    .take(page.effective_limit())
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn prune_history(
        &self,
        policy: RetentionPolicy,
        now_ms: i64,
        pinned: HashSet<VersionRef>,
    ) -> Result<u64, MimirError> {
        let mut g = self.inner.write().await;
        let MemSmInner { heads, history, .. } = &mut *g;
        let mut removed = 0u64;
        for (slot, versions) in history.iter_mut() {
            let head_version = heads.get(slot).map(|h| h.version).unwrap_or(0);
            let all: Vec<ConfigVersion> = versions.values().cloned().collect();
            for v in prunable(&all, head_version, policy, now_ms, &pinned) {
                versions.remove(&v);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn audit_trail(&self) -> Result<Vec<AuditRecord>, MimirError> {
        Ok(self.inner.read().await.audit.values().cloned().collect())
    }

    async fn build_snapshot(&self) -> Result<Snapshot, MimirError> {
        let g = self.inner.read().await;
        let contents = SnapshotContents {
            entries: g.heads.values().cloned().collect(),
            history: g.history.values().flat_map(|vs| vs.values().cloned()).collect(),
            audit: g.audit.values().cloned().collect(),
        };
        let last = g.last_applied.unwrap_or_default();
        Ok(Snapshot {
            meta: SnapshotMeta {
                last_log_index: last.index,
                last_log_term: last.term,
                snapshot_id: uuid::Uuid::new_v4().to_string(),
            },
            data: encode(&contents)?,
        })
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), MimirError> {
        let contents: SnapshotContents = decode(&snapshot.data)?;
        let mut g = self.inner.write().await;
        g.heads = contents
            .entries
            .into_iter()
            .map(|e| ((e.namespace.clone(), e.key.clone()), e))
            .collect();
        g.history = BTreeMap::new();
        for v in contents.history {
            g.history
                .entry((v.namespace.clone(), v.key.clone()))
                .or_default()
                .insert(v.version, v);
        }
        g.audit = contents.audit.into_iter().map(|a| (a.index, a)).collect();
        g.last_applied = Some(snapshot.meta.log_id());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_types::{ConfigStatus, ConfigValue};

    fn at(index: u64) -> LogId {
        LogId { index, term: 1 }
    }

    fn put(key: &str, value: &str) -> ConfigCommand {
        ConfigCommand::Put {
            namespace: "app".into(),
            key: key.into(),
            value: ConfigValue::from(value),
            description: None,
            expected_version: None,
            created_by: "test".into(),
            issued_at_ms: 0,
        }
    }

    fn delete(key: &str) -> ConfigCommand {
        ConfigCommand::Delete {
            namespace: "app".into(),
            key: key.into(),
            expected_version: None,
            created_by: "test".into(),
            issued_at_ms: 0,
        }
    }

    #[tokio::test]
    async fn log_append_and_read() {
        let log = MemLogStorage::new();
        log.append(vec![LogEntry::noop(1, 1), LogEntry::noop(2, 1), LogEntry::noop(3, 2)])
            .await
            .unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(1));
        assert_eq!(state.last_index, Some(3));
        let es = log.get_entries(2, 3).await.unwrap();
        assert_eq!(es.len(), 2);
        assert_eq!(es[1].term, 2);
        assert!(log.get_entries(3, 2).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn log_truncate() {
        let log = MemLogStorage::new();
        log.append((1..=5).map(|i| LogEntry::noop(i, 1)).collect()).await.unwrap();
        log.truncate(3).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.last_index, Some(2));
    }

    #[tokio::test]
    async fn log_purge() {
        let log = MemLogStorage::new();
        log.append((1..=5).map(|i| LogEntry::noop(i, 1)).collect()).await.unwrap();
        log.purge(LogId { index: 3, term: 1 }).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.first_index, Some(4));
        assert_eq!(state.last_purged, Some(LogId { index: 3, term: 1 }));
        assert!(log.get_entry(2).await.unwrap().is_none());

        log.purge(LogId { index: 5, term: 1 }).await.unwrap();
        let state = log.log_state().await.unwrap();
        assert_eq!(state.last_index, None);
        assert_eq!(state.last_index(), 5);
    }

    #[tokio::test]
    async fn vote_round_trip() {
        let log = MemLogStorage::new();
        assert!(log.read_vote().await.unwrap().is_none());
        log.save_vote(Vote { term: 3, voted_for: Some(2) }).await.unwrap();
        assert_eq!(log.read_vote().await.unwrap(), Some(Vote { term: 3, voted_for: Some(2) }));
    }

    #[tokio::test]
    async fn versions_increment_per_key() {
        let sm = MemStateMachine::new();
        sm.apply(at(1), put("a", "1")).await.unwrap();
        sm.apply(at(2), put("b", "1")).await.unwrap();
        let out = sm.apply(at(3), put("a", "2")).await.unwrap();
        let ApplyOutcome::Applied(result) = out else { panic!("expected applied") };
        assert_eq!(result.new_version, 2);
        assert_eq!(result.previous_value, Some(ConfigValue::from("1")));

        let head = sm.get_entry("app", "a").await.unwrap().unwrap();
        assert_eq!(head.version, 2);
        assert_eq!(head.committed_at_log_index, 3);
        assert_eq!(sm.last_applied().await.unwrap(), Some(at(3)));
    }

    #[tokio::test]
    async fn replayed_index_is_noop() {
        let sm = MemStateMachine::new();
        sm.apply(at(1), put("a", "1")).await.unwrap();
        let again = sm.apply(at(1), put("a", "1")).await.unwrap();
        assert_eq!(again, ApplyOutcome::AlreadyApplied);
        assert_eq!(sm.get_entry("app", "a").await.unwrap().unwrap().version, 1);
    }

    #[tokio::test]
    async fn rejection_advances_last_applied() {
        let sm = MemStateMachine::new();
        let out = sm.apply(at(1), delete("missing")).await.unwrap();
        assert_eq!(out, ApplyOutcome::Rejected(MimirError::NotFound));
        assert_eq!(sm.last_applied().await.unwrap(), Some(at(1)));
    }

    #[tokio::test]
    async fn delete_keeps_history() {
        let sm = MemStateMachine::new();
        sm.apply(at(1), put("a", "1")).await.unwrap();
        sm.apply(at(2), delete("a")).await.unwrap();
        let head = sm.get_entry("app", "a").await.unwrap().unwrap();
        assert_eq!(head.status, ConfigStatus::Deleted);
        let vs = sm.list_versions("app", "a", Page::default()).await.unwrap();
        assert_eq!(vs.iter().map(|v| v.version).collect::<Vec<_>>(), vec![2, 1]);
        assert!(sm.get_version("app", "a", 1).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn list_versions_pages_newest_first() {
        let sm = MemStateMachine::new();
        for i in 1..=5 {
            sm.apply(at(i), put("a", &i.to_string())).await.unwrap();
        }
        let vs = sm.list_versions("app", "a", Page { offset: 1, limit: 2 }).await.unwrap();
        assert_eq!(vs.iter().map(|v| v.version).collect::<Vec<_>>(), vec![4, 3]);
    }

    #[tokio::test]
    async fn skip_records_audit() {
        let sm = MemStateMachine::new();
        let rec = AuditRecord { index: 1, term: 1, reason: "bad payload".into() };
        assert_eq!(sm.skip(at(1), Some(rec.clone())).await.unwrap(), ApplyOutcome::Skipped);
        assert_eq!(sm.audit_trail().await.unwrap(), vec![rec]);
        assert_eq!(sm.skip(at(1), None).await.unwrap(), ApplyOutcome::AlreadyApplied);
    }

    #[tokio::test]
    async fn prune_respects_pins() {
        let sm = MemStateMachine::new();
        for i in 1..=4 {
            sm.apply(at(i), put("a", &i.to_string())).await.unwrap();
        }
        let pinned = HashSet::from([VersionRef {
            namespace: "app".into(),
            key: "a".into(),
            version: 1,
        }]);
        let policy = RetentionPolicy { max_versions: 1, max_age_ms: 0 };
        assert_eq!(sm.prune_history(policy, 0, pinned).await.unwrap(), 2);
        let vs = sm.list_versions("app", "a", Page::default()).await.unwrap();
        assert_eq!(vs.iter().map(|v| v.version).collect::<Vec<_>>(), vec![4, 1]);
    }

    #[tokio::test]
    async fn snapshot_round_trip() {
        let sm = MemStateMachine::new();
        sm.apply(LogId { index: 1, term: 1 }, put("a", "1")).await.unwrap();
        sm.apply(LogId { index: 2, term: 2 }, put("a", "2")).await.unwrap();
        sm.skip(LogId { index: 3, term: 2 }, Some(AuditRecord {
            index: 3,
            term: 2,
            reason: "x".into(),
        }))
        .await
        .unwrap();

        let snap = sm.build_snapshot().await.unwrap();
        assert_eq!(snap.meta.log_id(), LogId { index: 3, term: 2 });

        let sm2 = MemStateMachine::new();
        sm2.install_snapshot(snap).await.unwrap();
        assert_eq!(sm2.get_entry("app", "a").await.unwrap().unwrap().version, 2);
        assert_eq!(sm2.get_version("app", "a", 1).await.unwrap().unwrap().value, ConfigValue::from("1"));
        assert_eq!(sm2.audit_trail().await.unwrap().len(), 1);
        assert_eq!(sm2.last_applied().await.unwrap(), Some(LogId { index: 3, term: 2 }));
    }
}
