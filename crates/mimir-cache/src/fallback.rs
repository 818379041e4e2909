use std::collections::VecDeque;

use crate::CacheRecord;

/// What a degraded read may answer for one key.
#[derive(Debug, PartialEq)]
pub(crate) enum Fallback<'a> {
    Live(&'a CacheRecord),
    /// The newest thing known about the key is its deletion.
    Deleted,
    /// Nothing retained inside the window.
    Missing,
}

/// Per-key memory of recent versions, used when the backing node cannot
/// answer.
#[derive(Debug, Default)]
pub(crate) struct KeyHistory {
    /// Newest version this node has heard of, served or not.
    pub newest_known: u64,
    /// Newest version known to be a tombstone.
    deleted_at: Option<u64>,
    /// Ascending by version, at most `capacity` long.
    records: VecDeque<CacheRecord>,
}

impl KeyHistory {
    pub(crate) fn observe(&mut self, version: u64) {
        self.newest_known = self.newest_known.max(version);
    }

    pub(crate) fn observe_delete(&mut self, version: u64) {
        self.observe(version);
        self.deleted_at = self.deleted_at.max(Some(version));
    }

    pub(crate) fn remember(&mut self, record: &CacheRecord, capacity: usize) {
        self.observe(record.version);
        if capacity == 0 {
            return;
        }
        match self.records.binary_search_by_key(&record.version, |r| r.version) {
            Ok(pos) => self.records[pos] = record.clone(),
            Err(pos) => self.records.insert(pos, record.clone()),
        }
        while self.records.len() > capacity {
            self.records.pop_front();
        }
    }

    /// Whether `version` is one of the last `window` versions of the newest
    /// known one.
    fn within(&self, version: u64, window: u64) -> bool {
        version + window > self.newest_known
    }

    pub(crate) fn version(&self, version: u64) -> Option<&CacheRecord> {
        self.records
            .binary_search_by_key(&version, |r| r.version)
            .ok()
            .map(|pos| &self.records[pos])
    }

    /// The answer a degraded read may give: the requested version, or for a
    /// head read the newest retained one unless a later deletion is known.
    /// Either must lie inside the window.
    pub(crate) fn degraded(&self, version: Option<u64>, window: u64) -> Fallback<'_> {
        let record = match version {
            Some(v) => self.version(v),
            None => {
                let newest = self.records.back();
                if let Some(deleted) = self.deleted_at {
                    if newest.map_or(true, |r| r.version < deleted) {
                        return if self.within(deleted, window) {
                            Fallback::Deleted
                        } else {
                            Fallback::Missing
                        };
                    }
                }
                newest
            }
        };
        match record {
            Some(r) if self.within(r.version, window) => Fallback::Live(r),
            _ => Fallback::Missing,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_types::ConfigValue;
    use std::time::Instant;

    fn record(version: u64) -> CacheRecord {
        CacheRecord {
            namespace: "ns".into(),
            key: "k".into(),
            value: ConfigValue::Int(version as i64),
            version,
            updated_at_ms: 0,
            last_refreshed: Instant::now(),
            degraded: false,
        }
    }

    fn live(f: Fallback<'_>) -> Option<u64> {
        match f {
            Fallback::Live(r) => Some(r.version),
            _ => None,
        }
    }

    #[test]
    fn keeps_only_the_newest_versions() {
        let mut h = KeyHistory::default();
        for v in [3, 1, 2, 5, 4] {
            h.remember(&record(v), 3);
        }
        assert!(h.version(1).is_none());
        assert!(h.version(2).is_none());
        assert_eq!(h.version(3).map(|r| r.version), Some(3));
        assert_eq!(h.newest_known, 5);
    }

    #[test]
    fn degraded_respects_window() {
        let mut h = KeyHistory::default();
        h.remember(&record(4), 10);
        h.observe(6);
        assert_eq!(live(h.degraded(None, 3)), Some(4));
        assert_eq!(h.degraded(None, 2), Fallback::Missing);
        assert_eq!(h.degraded(Some(5), 10), Fallback::Missing);
    }

    #[test]
    fn deletion_hides_older_values() {
        let mut h = KeyHistory::default();
        h.remember(&record(1), 10);
        h.observe_delete(2);
        assert_eq!(h.degraded(None, 10), Fallback::Deleted);
        // The live version itself stays readable by number.
        assert_eq!(live(h.degraded(Some(1), 10)), Some(1));

        h.remember(&record(3), 10);
        assert_eq!(live(h.degraded(None, 10)), Some(3));
    }

    #[test]
    fn old_deletion_outside_window_is_missing() {
        let mut h = KeyHistory::default();
        h.observe_delete(2);
        h.observe(9);
        assert_eq!(h.degraded(None, 3), Fallback::Missing);
    }
}
