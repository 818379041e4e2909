use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use mimir_types::{AuditRecord, ConfigCommand, ConfigEntry, ConfigVersion, MimirError, Page};

use crate::apply::{evaluate, prunable};
use crate::codec::{decode, encode};
use crate::keys::{
    audit_key, entry_key, history_key, history_prefix, meta_key, raft_log_key,
};
use crate::traits::{LogStorage, StateMachineStore};
use crate::types::{
    ApplyOutcome, LogEntry, LogId, LogState, RetentionPolicy, Snapshot, SnapshotContents,
    SnapshotMeta, VersionRef, Vote,
};

const LAST_APPLIED: &str = "last_applied";
const LAST_PURGED: &str = "last_purged";
const VOTE: &str = "vote";

fn fjall_err(e: fjall::Error) -> MimirError {
    MimirError::Storage(e.to_string())
}

fn join_err(e: tokio::task::JoinError) -> MimirError {
    MimirError::Storage(e.to_string())
}

// ---------------------------------------------------------------------------
// FjallStore - shared handle wrapping all five keyspaces
// ---------------------------------------------------------------------------

/// Shared storage handle.
///
/// All five keyspaces live in a single fjall `Database` so that cross-keyspace
/// write batches are atomic.
pub struct FjallStore {
    pub db: fjall::Database,
    /// Raft log entries: `index(8)` → bincode(LogEntry)
    pub raft_log: fjall::Keyspace,
    /// Current heads: `ns ++ \x00 ++ key` → bincode(ConfigEntry)
    pub entries: fjall::Keyspace,
    /// Version history: `ns ++ \x00 ++ key ++ \x00 ++ version(8)` → bincode(ConfigVersion)
    pub history: fjall::Keyspace,
    /// Skipped entries: `index(8)` → bincode(AuditRecord)
    pub audit: fjall::Keyspace,
    /// `last_applied`, `last_purged`, `vote` → bincode(value)
    pub meta: fjall::Keyspace,
}

impl FjallStore {
    /// Open (or create) a `FjallStore` at `path`.
    pub fn open(path: &Path) -> Result<Arc<Self>, MimirError> {
        let db = fjall::Database::builder(path).open().map_err(fjall_err)?;
        let raft_log =
            db.keyspace("raft_log", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let entries =
            db.keyspace("entries", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let history =
            db.keyspace("history", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let audit =
            db.keyspace("audit", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        let meta =
            db.keyspace("meta", fjall::KeyspaceCreateOptions::default).map_err(fjall_err)?;
        Ok(Arc::new(FjallStore { db, raft_log, entries, history, audit, meta }))
    }

    /// A batch that is fsynced before `commit` returns. Raft log and vote
    /// writes use it since they must survive a crash once acknowledged.
    fn durable_batch(&self) -> fjall::OwnedWriteBatch {
        self.db.batch().durability(Some(fjall::PersistMode::SyncAll))
    }

    fn read_meta<T: for<'de> serde::Deserialize<'de>>(
        &self,
        label: &str,
    ) -> Result<Option<T>, MimirError> {
        match self.meta.get(meta_key(label)).map_err(fjall_err)? {
            Some(b) => Ok(Some(decode::<T>(&b)?)),
            None => Ok(None),
        }
    }

    fn all_keys(ks: &fjall::Keyspace) -> Result<Vec<Vec<u8>>, MimirError> {
        ks.iter()
            .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
            .collect()
    }

    fn all_values<T: for<'de> serde::Deserialize<'de>>(
        ks: &fjall::Keyspace,
    ) -> Result<Vec<T>, MimirError> {
        ks.iter()
            .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<T>(&v)))
            .collect()
    }

    fn versions_of(&self, namespace: &str, key: &str) -> Result<Vec<ConfigVersion>, MimirError> {
        self.history
            .prefix(history_prefix(namespace, key))
            .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode(&v)))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// FjallLogStorage
// ---------------------------------------------------------------------------

/// `LogStorage` backed by fjall.
///
/// All blocking I/O is wrapped in `tokio::task::spawn_blocking`.
pub struct FjallLogStorage(pub Arc<FjallStore>);

impl LogStorage for FjallLogStorage {
    async fn log_state(&self) -> Result<LogState, MimirError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<LogState, MimirError> {
            let mut first_index: Option<u64> = None;
            let mut last_index: Option<u64> = None;

            for guard in store.raft_log.range(raft_log_key(0)..=raft_log_key(u64::MAX)) {
                let (k, _) = guard.into_inner().map_err(fjall_err)?;
                let idx_bytes: [u8; 8] = k[..]
                    .try_into()
                    .map_err(|_| MimirError::Storage("short raft_log key".into()))?;
                let idx = u64::from_be_bytes(idx_bytes);
                if first_index.is_none() {
                    first_index = Some(idx);
                }
                last_index = Some(idx);
            }

            let last_purged = store.read_meta::<LogId>(LAST_PURGED)?;
            Ok(LogState { first_index, last_index, last_purged })
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entry(&self, index: u64) -> Result<Option<LogEntry>, MimirError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Option<LogEntry>, MimirError> {
            match store.raft_log.get(raft_log_key(index)).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<LogEntry>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entries(&self, from: u64, to_inclusive: u64) -> Result<Vec<LogEntry>, MimirError> {
        if from > to_inclusive {
            return Ok(Vec::new());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<Vec<LogEntry>, MimirError> {
            store
                .raft_log
                .range(raft_log_key(from)..=raft_log_key(to_inclusive))
                .map(|g| g.into_inner().map_err(fjall_err).and_then(|(_, v)| decode::<LogEntry>(&v)))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn append(&self, entries: Vec<LogEntry>) -> Result<(), MimirError> {
        if entries.is_empty() {
            return Ok(());
        }
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MimirError> {
            let mut batch = store.durable_batch();
            for entry in &entries {
                batch.insert(&store.raft_log, raft_log_key(entry.index).to_vec(), encode(entry)?);
            }
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn truncate(&self, from_index: u64) -> Result<(), MimirError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MimirError> {
            let keys: Vec<Vec<u8>> = store
                .raft_log
                .range(raft_log_key(from_index)..=raft_log_key(u64::MAX))
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            if !keys.is_empty() {
                let mut batch = store.durable_batch();
                for k in keys {
                    batch.remove(&store.raft_log, k);
                }
                batch.commit().map_err(fjall_err)?;
            }
            Ok(())
        })
        .await
        .map_err(join_err)?
    }

    async fn purge(&self, upto: LogId) -> Result<(), MimirError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MimirError> {
            let keys: Vec<Vec<u8>> = store
                .raft_log
                .range(raft_log_key(0)..=raft_log_key(upto.index))
                .map(|g| g.into_inner().map(|(k, _)| k.to_vec()).map_err(fjall_err))
                .collect::<Result<_, _>>()?;

            let mut batch = store.durable_batch();
            for k in keys {
                batch.remove(&store.raft_log, k);
            }
            batch.insert(&store.meta, meta_key(LAST_PURGED), encode(&upto)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn save_vote(&self, vote: Vote) -> Result<(), MimirError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MimirError> {
            let mut batch = store.durable_batch();
            batch.insert(&store.meta, meta_key(VOTE), encode(&vote)?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }

    async fn read_vote(&self) -> Result<Option<Vote>, MimirError> {
        let store = self.0.clone();
        tokio::task::spawn_blocking(move || store.read_meta::<Vote>(VOTE))
            .await
            .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// FjallStateMachine
// ---------------------------------------------------------------------------

/// `StateMachineStore` backed by fjall.
///
/// Each apply writes the new head, the new history record and `last_applied`
/// in one batch, so a crash never leaves them out of step.
pub struct FjallStateMachine {
    pub store: Arc<FjallStore>,
}

impl FjallStateMachine {
    pub fn new(store: Arc<FjallStore>) -> Self {
        FjallStateMachine { store }
    }
}

impl StateMachineStore for FjallStateMachine {
    async fn last_applied(&self) -> Result<Option<LogId>, MimirError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || store.read_meta::<LogId>(LAST_APPLIED))
            .await
            .map_err(join_err)?
    }

    async fn apply(&self, id: LogId, cmd: ConfigCommand) -> Result<ApplyOutcome, MimirError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<ApplyOutcome, MimirError> {
            let last = store.read_meta::<LogId>(LAST_APPLIED)?;
            if last.is_some_and(|la| id.index <= la.index) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }

            let ek = entry_key(cmd.namespace(), cmd.key());
            let head = store
                .entries
                .get(&ek)
                .map_err(fjall_err)?
                .map(|b| decode::<ConfigEntry>(&b))
                .transpose()?;

            let mut batch = store.db.batch();
            let outcome = match evaluate(head.as_ref(), id, cmd) {
                Ok(m) => {
                    batch.insert(&store.entries, ek, encode(&m.head)?);
                    batch.insert(
                        &store.history,
                        history_key(&m.version.namespace, &m.version.key, m.version.version),
                        encode(&m.version)?,
                    );
                    ApplyOutcome::Applied(m.result)
                }
                Err(e) => ApplyOutcome::Rejected(e),
            };
            batch.insert(&store.meta, meta_key(LAST_APPLIED), encode(&id)?);
            batch.commit().map_err(fjall_err)?;
            Ok(outcome)
        })
        .await
        .map_err(join_err)?
    }

    async fn skip(&self, id: LogId, audit: Option<AuditRecord>) -> Result<ApplyOutcome, MimirError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<ApplyOutcome, MimirError> {
            let last = store.read_meta::<LogId>(LAST_APPLIED)?;
            if last.is_some_and(|la| id.index <= la.index) {
                return Ok(ApplyOutcome::AlreadyApplied);
            }
            let mut batch = store.db.batch();
            if let Some(record) = audit {
                batch.insert(&store.audit, audit_key(record.index).to_vec(), encode(&record)?);
            }
            batch.insert(&store.meta, meta_key(LAST_APPLIED), encode(&id)?);
            batch.commit().map_err(fjall_err)?;
            Ok(ApplyOutcome::Skipped)
        })
        .await
        .map_err(join_err)?
    }

    async fn get_entry(&self, namespace: &str, key: &str) -> Result<Option<ConfigEntry>, MimirError> {
        let store = self.store.clone();
        let ek = entry_key(namespace, key);
        tokio::task::spawn_blocking(move || -> Result<Option<ConfigEntry>, MimirError> {
            match store.entries.get(ek).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<ConfigEntry>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn get_version(
        &self,
        namespace: &str,
        key: &str,
        version: u64,
    ) -> Result<Option<ConfigVersion>, MimirError> {
        let store = self.store.clone();
        let hk = history_key(namespace, key, version);
        tokio::task::spawn_blocking(move || -> Result<Option<ConfigVersion>, MimirError> {
            match store.history.get(hk).map_err(fjall_err)? {
                Some(b) => Ok(Some(decode::<ConfigVersion>(&b)?)),
                None => Ok(None),
            }
        })
        .await
        .map_err(join_err)?
    }

    async fn list_versions(
        &self,
        namespace: &str,
        key: &str,
        page: Page,
    ) -> Result<Vec<ConfigVersion>, MimirError> {
        let store = self.store.clone();
        let prefix = history_prefix(namespace, key);
        tokio::task::spawn_blocking(move || -> Result<Vec<ConfigVersion>, MimirError> {
            // Versions sort ascending under the prefix; collect raw values and
            // decode only the requested page.
            let raw: Vec<_> = store
                .history
                .prefix(prefix)
                .map(|g| g.into_inner().map(|(_, v)| v).map_err(fjall_err))
                .collect::<Result<_, _>>()?;
            raw.iter()
                .rev()
                .skip(page.offset as usize)
                .take(page.effective_limit())
                .map(|v| decode::<ConfigVersion>(v))
                .collect()
        })
        .await
        .map_err(join_err)?
    }

    async fn prune_history(
        &self,
        policy: RetentionPolicy,
        now_ms: i64,
        pinned: HashSet<VersionRef>,
    ) -> Result<u64, MimirError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<u64, MimirError> {
            let heads = FjallStore::all_values::<ConfigEntry>(&store.entries)?;
            let mut batch = store.db.batch();
            let mut removed = 0u64;
            for head in &heads {
                let versions = store.versions_of(&head.namespace, &head.key)?;
                for v in prunable(&versions, head.version, policy, now_ms, &pinned) {
                    batch.remove(&store.history, history_key(&head.namespace, &head.key, v));
                    removed += 1;
                }
            }
            if removed > 0 {
                batch.commit().map_err(fjall_err)?;
            }
            Ok(removed)
        })
        .await
        .map_err(join_err)?
    }

    async fn audit_trail(&self) -> Result<Vec<AuditRecord>, MimirError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || FjallStore::all_values::<AuditRecord>(&store.audit))
            .await
            .map_err(join_err)?
    }

    async fn build_snapshot(&self) -> Result<Snapshot, MimirError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<Snapshot, MimirError> {
            let contents = SnapshotContents {
                entries: FjallStore::all_values(&store.entries)?,
                history: FjallStore::all_values(&store.history)?,
                audit: FjallStore::all_values(&store.audit)?,
            };
            let last = store.read_meta::<LogId>(LAST_APPLIED)?.unwrap_or_default();
            Ok(Snapshot {
                meta: SnapshotMeta {
                    last_log_index: last.index,
                    last_log_term: last.term,
                    snapshot_id: uuid::Uuid::new_v4().to_string(),
                },
                data: encode(&contents)?,
            })
        })
        .await
        .map_err(join_err)?
    }

    async fn install_snapshot(&self, snapshot: Snapshot) -> Result<(), MimirError> {
        let store = self.store.clone();
        tokio::task::spawn_blocking(move || -> Result<(), MimirError> {
            let contents: SnapshotContents = decode(&snapshot.data)?;

            let mut batch = store.db.batch();
            for k in FjallStore::all_keys(&store.entries)? {
                batch.remove(&store.entries, k);
            }
            for k in FjallStore::all_keys(&store.history)? {
                batch.remove(&store.history, k);
            }
            for k in FjallStore::all_keys(&store.audit)? {
                batch.remove(&store.audit, k);
            }
            for e in &contents.entries {
                batch.insert(&store.entries, entry_key(&e.namespace, &e.key), encode(e)?);
            }
            for v in &contents.history {
                batch.insert(
                    &store.history,
                    history_key(&v.namespace, &v.key, v.version),
                    encode(v)?,
                );
            }
            for a in &contents.audit {
                batch.insert(&store.audit, audit_key(a.index).to_vec(), encode(a)?);
            }
            batch.insert(&store.meta, meta_key(LAST_APPLIED), encode(&snapshot.meta.log_id())?);
            batch.commit().map_err(fjall_err)
        })
        .await
        .map_err(join_err)?
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
