//! Read-through cache in front of a [`RaftNode`], invalidated by the node's
//! commit feed, with a bounded-staleness fallback for when the node cannot
//! answer.

mod fallback;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use moka::sync::Cache;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use mimir_consensus::RaftNode;
use mimir_types::{ApplyResult, ConfigEntry, ConfigValue, InvalidationEvent, MimirError, ReadMode};

use fallback::{Fallback, KeyHistory};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_entries: u64,
    /// Upper bound on how long a head stays cached without an invalidation.
    pub ttl_secs: u64,
    /// Versions per key kept for degraded reads.
    pub fallback_versions: u64,
    /// Keys whose version history is tracked at once.
    pub max_tracked_keys: u64,
    /// A key's history is forgotten after this long without reads or
    /// invalidations.
    pub history_idle_secs: u64,
    /// Re-read a key right after it is invalidated instead of on next access.
    pub refresh_on_invalidate: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_entries: 10_000,
            ttl_secs: 300,
            fallback_versions: 10,
            max_tracked_keys: 100_000,
            history_idle_secs: 3_600,
            refresh_on_invalidate: false,
        }
    }
}

/// One cached value. Never authoritative.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRecord {
    pub namespace: String,
    pub key: String,
    pub value: ConfigValue,
    pub version: u64,
    pub updated_at_ms: i64,
    pub last_refreshed: Instant,
    /// Served from the fallback because the node was unreachable.
    pub degraded: bool,
}

impl CacheRecord {
    fn from_entry(entry: ConfigEntry) -> Self {
        CacheRecord {
            namespace: entry.namespace,
            key: entry.key,
            value: entry.value,
            version: entry.version,
            updated_at_ms: entry.updated_at_ms,
            last_refreshed: Instant::now(),
            degraded: false,
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub degraded: u64,
}

type Slot = (String, String);
type SharedHistory = Arc<Mutex<KeyHistory>>;

pub struct ConfigCache<R> {
    node: Arc<R>,
    config: CacheConfig,
    heads: Cache<Slot, CacheRecord>,
    /// Per-key lock; head inserts and evictions for a key happen under it.
    histories: Cache<Slot, SharedHistory>,
    /// Index of the newest feed event this cache has processed.
    synced: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    degraded: AtomicU64,
}

fn slot(namespace: &str, key: &str) -> Slot {
    (namespace.to_string(), key.to_string())
}

fn lock(history: &SharedHistory) -> MutexGuard<'_, KeyHistory> {
    history.lock().unwrap_or_else(|e| e.into_inner())
}

fn event_index(event: &InvalidationEvent) -> u64 {
    match event {
        InvalidationEvent::Changed { index, .. } | InvalidationEvent::Reset { index } => *index,
    }
}

impl<R: RaftNode> ConfigCache<R> {
    pub fn new(node: Arc<R>, config: CacheConfig) -> Self {
        let heads = Cache::builder()
            .max_capacity(config.max_entries)
            .time_to_live(Duration::from_secs(config.ttl_secs.max(1)))
            .build();
        let histories = Cache::builder()
            .max_capacity(config.max_tracked_keys)
            .time_to_idle(Duration::from_secs(config.history_idle_secs.max(1)))
            .build();
        ConfigCache {
            node,
            config,
            heads,
            histories,
            synced: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            degraded: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> &Arc<R> {
        &self.node
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            degraded: self.degraded.load(Ordering::Relaxed),
        }
    }

    /// Read the head (`version == None`) or one version of a key. Deleted
    /// keys read as `None`.
    ///
    /// Linearizable reads skip the cache lookup but still refresh it.
    pub async fn get(
        &self,
        namespace: &str,
        key: &str,
        version: Option<u64>,
        mode: ReadMode,
    ) -> Result<Option<CacheRecord>, MimirError> {
        let slot = slot(namespace, key);
        if mode != ReadMode::Linearizable {
            if let Some(hit) = self.lookup(&slot, version, mode) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Some(hit));
            }
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        match self.node.read(namespace, key, version, mode).await {
            Ok(Some(entry)) => Ok(self.populate(slot, entry, version.is_none())),
            Ok(None) => Ok(None),
            Err(e) if e.is_unreachable() => self.degraded_read(&slot, version, e),
            Err(e) => Err(e),
        }
    }

    fn lookup(&self, slot: &Slot, version: Option<u64>, mode: ReadMode) -> Option<CacheRecord> {
        match version {
            None => {
                // Heads may predate changes the node applied but this cache
                // has not consumed yet.
                if mode == ReadMode::Sequential
                    && self.synced.load(Ordering::SeqCst) < self.node.last_published()
                {
                    return None;
                }
                self.heads.get(slot)
            }
            // Versions are immutable, so any retained copy is current.
            Some(v) => {
                let shared = self.histories.get(slot)?;
                let history = lock(&shared);
                history.version(v).cloned()
            }
        }
    }

    fn history(&self, slot: &Slot) -> SharedHistory {
        self.histories.get_with(slot.clone(), SharedHistory::default)
    }

    /// Remember what the node returned. A head is cached only if no newer
    /// version has been announced meanwhile.
    fn populate(&self, slot: Slot, entry: ConfigEntry, is_head: bool) -> Option<CacheRecord> {
        let active = entry.is_active();
        let record = CacheRecord::from_entry(entry);
        let shared = self.history(&slot);
        let mut history = lock(&shared);
        if !active {
            history.observe_delete(record.version);
            self.heads.invalidate(&slot);
            return None;
        }
        let fresh = record.version >= history.newest_known;
        history.remember(&record, self.config.fallback_versions as usize);
        if is_head && fresh {
            self.heads.insert(slot, record.clone());
        }
        Some(record)
    }

    fn degraded_read(
        &self,
        slot: &Slot,
        version: Option<u64>,
        cause: MimirError,
    ) -> Result<Option<CacheRecord>, MimirError> {
        let answer = self.histories.get(slot).and_then(|shared| {
            let history = lock(&shared);
            let answer = match history.degraded(version, self.config.fallback_versions) {
                Fallback::Live(record) => Some(Some(record.clone())),
                Fallback::Deleted => Some(None),
                Fallback::Missing => None,
            };
            answer
        });
        match answer {
            Some(found) => {
                self.degraded.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    namespace = %slot.0,
                    key = %slot.1,
                    version = found.as_ref().map(|r| r.version),
                    deleted = found.is_none(),
                    cause = %cause,
                    "serving degraded read"
                );
                Ok(found.map(|mut record| {
                    record.degraded = true;
                    record
                }))
            }
            None => Err(MimirError::StaleDataUnavailable(format!(
                "{}/{} has no retained version within the last {} ({cause})",
                slot.0, slot.1, self.config.fallback_versions
            ))),
        }
    }

    fn evict(&self, event: &InvalidationEvent) {
        match event {
            InvalidationEvent::Changed { namespace, key, version, deleted, .. } => {
                let slot = slot(namespace, key);
                let shared = self.history(&slot);
                let mut history = lock(&shared);
                if *deleted {
                    history.observe_delete(*version);
                } else {
                    history.observe(*version);
                }
                let stale = self.heads.get(&slot).is_some_and(|r| r.version < *version);
                if stale {
                    self.heads.invalidate(&slot);
                }
            }
            InvalidationEvent::Reset { index } => {
                tracing::info!(index, "state replaced, dropping cached heads");
                self.heads.invalidate_all();
            }
        }
    }

    /// Apply one event from the commit feed.
    pub fn invalidate(&self, event: &InvalidationEvent) {
        self.evict(event);
        self.synced.fetch_max(event_index(event), Ordering::SeqCst);
    }

    /// Evict what a write acknowledged through this cache replaced, ahead
    /// of the feed delivering it.
    pub fn note_write(&self, result: &ApplyResult) {
        self.evict(&result.invalidation());
    }

    /// Consume the node's commit feed until it closes.
    pub async fn run_invalidation(self: Arc<Self>, mut events: broadcast::Receiver<InvalidationEvent>) {
        loop {
            match events.recv().await {
                Ok(event) => {
                    self.invalidate(&event);
                    if self.config.refresh_on_invalidate {
                        self.refresh(&event).await;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "invalidation feed lagged, dropping cached heads");
                    let published = self.node.last_published();
                    self.heads.invalidate_all();
                    self.synced.fetch_max(published, Ordering::SeqCst);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        tracing::debug!("invalidation feed closed");
    }

    async fn refresh(&self, event: &InvalidationEvent) {
        let InvalidationEvent::Changed { namespace, key, .. } = event else {
            return;
        };
        match self.node.read(namespace, key, None, ReadMode::Eventual).await {
            Ok(Some(entry)) => {
                self.populate(slot(namespace, key), entry, true);
            }
            Ok(None) => {}
            Err(e) => tracing::debug!(%namespace, %key, error = %e, "cache refresh failed"),
        }
    }

    /// Subscribe to the node's feed and spawn the consumer.
    pub fn spawn_invalidation(self: &Arc<Self>) -> JoinHandle<()> {
        let events = self.node.subscribe();
        tokio::spawn(self.clone().run_invalidation(events))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_consensus::StubRaftNode;
    use mimir_types::ConfigCommand;

    fn put(key: &str, value: i64) -> ConfigCommand {
        ConfigCommand::Put {
            namespace: "app".into(),
            key: key.into(),
            value: ConfigValue::Int(value),
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

    fn cache_with(config: CacheConfig) -> (Arc<StubRaftNode>, Arc<ConfigCache<StubRaftNode>>) {
        let node = Arc::new(StubRaftNode::new());
        let cache = Arc::new(ConfigCache::new(node.clone(), config));
        (node, cache)
    }

    async fn get(cache: &ConfigCache<StubRaftNode>, key: &str) -> Result<Option<CacheRecord>, MimirError> {
        cache.get("app", key, None, ReadMode::Sequential).await
    }

    #[tokio::test]
    async fn read_through_then_hit() {
        let (node, cache) = cache_with(CacheConfig::default());
        let mut feed = node.subscribe();
        node.propose(put("a", 1)).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());

        assert_eq!(get(&cache, "a").await.unwrap().unwrap().version, 1);
        assert_eq!(get(&cache, "a").await.unwrap().unwrap().version, 1);
        assert_eq!(cache.stats(), CacheStats { hits: 1, misses: 1, degraded: 0 });
        assert!(get(&cache, "missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn commit_evicts_older_head() {
        let (node, cache) = cache_with(CacheConfig::default());
        let mut feed = node.subscribe();
        node.propose(put("a", 1)).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());
        get(&cache, "a").await.unwrap();

        node.propose(put("a", 2)).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());
        let record = get(&cache, "a").await.unwrap().unwrap();
        assert_eq!((record.value, record.version), (ConfigValue::Int(2), 2));
        assert_eq!(cache.stats().hits, 0);
    }

    #[tokio::test]
    async fn delete_reads_as_missing() {
        let (node, cache) = cache_with(CacheConfig::default());
        let mut feed = node.subscribe();
        node.propose(put("a", 1)).await.unwrap();
        get(&cache, "a").await.unwrap();
        node.propose(delete("a")).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());
        cache.invalidate(&feed.recv().await.unwrap());
        assert!(get(&cache, "a").await.unwrap().is_none());
    }

    #[test]
    fn older_read_never_overwrites_newer_announcement() {
        let (_, cache) = cache_with(CacheConfig::default());
        cache.invalidate(&InvalidationEvent::Changed {
            namespace: "app".into(),
            key: "a".into(),
            version: 5,
            index: 9,
            deleted: false,
        });
        let entry = ConfigEntry {
            namespace: "app".into(),
            key: "a".into(),
            value: ConfigValue::Int(4),
            version: 4,
            status: mimir_types::ConfigStatus::Active,
            created_by: "test".into(),
            description: None,
            committed_at_log_index: 8,
            updated_at_ms: 0,
        };
        assert!(cache.populate(slot("app", "a"), entry, true).is_some());
        assert!(cache.heads.get(&slot("app", "a")).is_none());
    }

    #[tokio::test]
    async fn degraded_within_window() {
        let (node, cache) = cache_with(CacheConfig::default());
        node.propose(put("a", 1)).await.unwrap();
        node.propose(put("a", 2)).await.unwrap();
        get(&cache, "a").await.unwrap();
        cache.heads.invalidate_all();

        node.set_available(false);
        let record = get(&cache, "a").await.unwrap().unwrap();
        assert!(record.degraded);
        assert_eq!(record.version, 2);
        assert_eq!(cache.stats().degraded, 1);
    }

    #[tokio::test]
    async fn stale_beyond_window_is_refused() {
        let (node, cache) = cache_with(CacheConfig { fallback_versions: 2, ..Default::default() });
        let mut feed = node.subscribe();
        node.propose(put("a", 1)).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());
        get(&cache, "a").await.unwrap();
        for v in 2..=4 {
            node.propose(put("a", v)).await.unwrap();
            cache.invalidate(&feed.recv().await.unwrap());
        }

        node.set_available(false);
        let err = get(&cache, "a").await.unwrap_err();
        assert!(matches!(err, MimirError::StaleDataUnavailable(_)), "{err:?}");
        assert!(get(&cache, "never-read").await.is_err());
    }

    #[tokio::test]
    async fn deleted_key_stays_deleted_when_degraded() {
        let (node, cache) = cache_with(CacheConfig::default());
        let mut feed = node.subscribe();
        node.propose(put("a", 1)).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());
        get(&cache, "a").await.unwrap();
        node.propose(delete("a")).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());

        node.set_available(false);
        assert!(get(&cache, "a").await.unwrap().is_none());
        assert_eq!(cache.stats().degraded, 1);
        // The old version is still readable by number.
        let old = cache.get("app", "a", Some(1), ReadMode::Sequential).await.unwrap().unwrap();
        assert_eq!(old.value, ConfigValue::Int(1));
    }

    #[tokio::test]
    async fn tombstone_read_through_hides_fallback() {
        let (node, cache) = cache_with(CacheConfig::default());
        node.propose(put("a", 1)).await.unwrap();
        get(&cache, "a").await.unwrap();
        node.propose(delete("a")).await.unwrap();
        assert!(get(&cache, "a").await.unwrap().is_none());

        node.set_available(false);
        assert!(get(&cache, "a").await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn acknowledged_write_is_visible_to_next_read() {
        let (node, cache) = cache_with(CacheConfig::default());
        let task = cache.spawn_invalidation();
        for i in 0..200 {
            let key = format!("k{}", i % 7);
            let first = node.propose(put(&key, 1)).await.unwrap();
            assert_eq!(get(&cache, &key).await.unwrap().unwrap().version, first.new_version);
            let second = node.propose(put(&key, 2)).await.unwrap();
            let got = get(&cache, &key).await.unwrap().unwrap();
            assert_eq!(got.version, second.new_version, "iteration {i}");
        }
        task.abort();
    }

    #[tokio::test]
    async fn note_write_evicts_before_the_feed_arrives() {
        let (node, cache) = cache_with(CacheConfig::default());
        let mut feed = node.subscribe();
        node.propose(put("a", 1)).await.unwrap();
        cache.invalidate(&feed.recv().await.unwrap());
        get(&cache, "a").await.unwrap();

        let applied = node.propose(put("a", 2)).await.unwrap();
        cache.note_write(&applied);
        assert!(cache.heads.get(&slot("app", "a")).is_none());
        let record = cache.get("app", "a", None, ReadMode::Eventual).await.unwrap().unwrap();
        assert_eq!(record.version, 2);
    }

    #[test]
    fn tracked_keys_are_bounded() {
        let (_, cache) = cache_with(CacheConfig { max_tracked_keys: 16, ..Default::default() });
        for i in 0..500u64 {
            cache.invalidate(&InvalidationEvent::Changed {
                namespace: "app".into(),
                key: format!("k{i}"),
                version: 1,
                index: i + 1,
                deleted: false,
            });
        }
        cache.histories.run_pending_tasks();
        assert!(cache.histories.entry_count() <= 16);
    }

    #[tokio::test]
    async fn consumer_task_tracks_feed() {
        let (node, cache) = cache_with(CacheConfig { refresh_on_invalidate: true, ..Default::default() });
        let task = cache.spawn_invalidation();
        node.propose(put("a", 1)).await.unwrap();
        node.propose(put("a", 2)).await.unwrap();
        for _ in 0..100 {
            if cache.heads.get(&slot("app", "a")).is_some_and(|r| r.version == 2) {
                break;
            }
            tokio::task::yield_now().await;
        }
        node.set_available(false);
        assert_eq!(get(&cache, "a").await.unwrap().unwrap().version, 2);
        task.abort();
    }
}
