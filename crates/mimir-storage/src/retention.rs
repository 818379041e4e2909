use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::traits::StateMachineStore;
use crate::types::{RetentionPolicy, VersionRef};

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Versions that retention must not drop.
///
/// A rollback pins its target between reading it and its entry being
/// applied. Pins are counted, so overlapping rollbacks to the same version
/// are fine.
#[derive(Clone, Default)]
pub struct PinRegistry {
    inner: Arc<Mutex<HashMap<VersionRef, usize>>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin `version` until the returned guard is dropped.
    pub fn pin(&self, version: VersionRef) -> PinGuard {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *g.entry(version.clone()).or_insert(0) += 1;
        PinGuard { registry: self.clone(), version }
    }

    pub fn pinned(&self) -> HashSet<VersionRef> {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.keys().cloned().collect()
    }

    fn release(&self, version: &VersionRef) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(count) = g.get_mut(version) {
            *count -= 1;
            if *count == 0 {
                g.remove(version);
            }
        }
    }
}

/// Releases its pin on drop.
pub struct PinGuard {
    registry: PinRegistry,
    version: VersionRef,
}

impl Drop for PinGuard {
    fn drop(&mut self) {
        self.registry.release(&self.version);
    }
}

/// Periodically prunes version history outside the retention policy.
///
/// Pruning is local to each node; history beyond retention is not part of the
/// replicated contract.
pub struct RetentionTask<S> {
    store: Arc<S>,
    policy: RetentionPolicy,
    pins: PinRegistry,
    interval: Duration,
}

impl<S: StateMachineStore> RetentionTask<S> {
    pub fn new(store: Arc<S>, policy: RetentionPolicy, pins: PinRegistry, interval: Duration) -> Self {
        RetentionTask { store, policy, pins, interval }
    }

    /// Run one pruning pass. Returns the number of versions removed.
    pub async fn run_once(&self) -> u64 {
        match self.store.prune_history(self.policy, now_ms(), self.pins.pinned()).await {
            Ok(removed) => {
                if removed > 0 {
                    tracing::info!(removed, "pruned config versions");
                }
                removed
            }
            Err(e) => {
                tracing::warn!(error = %e, "retention pass failed");
                0
            }
        }
    }

    /// Run the pruning loop until the task is cancelled.
    pub async fn run(self) {
        if self.policy == RetentionPolicy::unbounded() {
            tracing::debug!("retention unbounded; pruning disabled");
            return;
        }
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.run_once().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStateMachine;
    use crate::types::LogId;
    use mimir_types::{ConfigCommand, ConfigValue, Page};

    fn vref(version: u64) -> VersionRef {
        VersionRef { namespace: "ns".into(), key: "k".into(), version }
    }

    #[test]
    fn pins_are_counted() {
        let pins = PinRegistry::new();
        let a = pins.pin(vref(1));
        let b = pins.pin(vref(1));
        drop(a);
        assert!(pins.pinned().contains(&vref(1)));
        drop(b);
        assert!(pins.pinned().is_empty());
    }

    #[tokio::test]
    async fn run_once_skips_pinned_versions() {
        let sm = Arc::new(MemStateMachine::new());
        for i in 1..=5u64 {
            let cmd = ConfigCommand::Put {
                namespace: "ns".into(),
                key: "k".into(),
                value: ConfigValue::Int(i as i64),
                description: None,
                expected_version: None,
                created_by: "t".into(),
                issued_at_ms: 0,
            };
            sm.apply(LogId { index: i, term: 1 }, cmd).await.unwrap();
        }
        let pins = PinRegistry::new();
        let _guard = pins.pin(vref(2));
        let task = RetentionTask::new(
            sm.clone(),
            RetentionPolicy { max_versions: 2, max_age_ms: 0 },
            pins,
            Duration::from_secs(60),
        );
        assert_eq!(task.run_once().await, 2);
        let left: Vec<u64> = sm
            .list_versions("ns", "k", Page::default())
            .await
            .unwrap()
            .iter()
            .map(|v| v.version)
            .collect();
        assert_eq!(left, vec![5, 4, 2]);
    }
}
