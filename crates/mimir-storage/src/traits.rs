use std::collections::HashSet;
use std::future::Future;

use mimir_types::{AuditRecord, ConfigCommand, ConfigEntry, ConfigVersion, MimirError, Page};

use crate::types::{
    ApplyOutcome, LogEntry, LogId, LogState, RetentionPolicy, Snapshot, VersionRef, Vote,
};

/// Persistent storage for the Raft log.
///
/// Methods use RPITIT (`-> impl Future + Send`) matching the `RaftNode` trait
/// style in `mimir-consensus`.
pub trait LogStorage: Send + Sync + 'static {
    /// Return first index, last index, and last purged position.
    fn log_state(&self) -> impl Future<Output = Result<LogState, MimirError>> + Send;

    /// Return the entry at `index`, or `None` if it has been purged or does
    /// not exist.
    fn get_entry(&self, index: u64)
        -> impl Future<Output = Result<Option<LogEntry>, MimirError>> + Send;

    /// Return all entries in the inclusive range `[from, to_inclusive]`.
    fn get_entries(&self, from: u64, to_inclusive: u64)
        -> impl Future<Output = Result<Vec<LogEntry>, MimirError>> + Send;

    /// Append entries to the log, overwriting any existing entry at the same
    /// index.
    fn append(&self, entries: Vec<LogEntry>)
        -> impl Future<Output = Result<(), MimirError>> + Send;

    /// Delete all entries with `index >= from_index` (conflict resolution).
    fn truncate(&self, from_index: u64) -> impl Future<Output = Result<(), MimirError>> + Send;

    /// Delete all entries with `index <= upto.index` and record `upto` as the
    /// last purged position.
    fn purge(&self, upto: LogId) -> impl Future<Output = Result<(), MimirError>> + Send;

    /// Durably persist the vote (called before granting a vote).
    fn save_vote(&self, vote: Vote) -> impl Future<Output = Result<(), MimirError>> + Send;

    /// Retrieve the last persisted vote.
    fn read_vote(&self) -> impl Future<Output = Result<Option<Vote>, MimirError>> + Send;
}

/// Versioned configuration state machine.
///
/// Holds the head of every (namespace, key), its full version history (up to
/// retention), and the audit trail of skipped log entries.
pub trait StateMachineStore: Send + Sync + 'static {
    /// Position of the last applied entry, or `None` if nothing was applied.
    fn last_applied(&self) -> impl Future<Output = Result<Option<LogId>, MimirError>> + Send;

    /// Apply a committed command at log position `id`.
    ///
    /// Deterministic refusals come back as [`ApplyOutcome::Rejected`] and
    /// still advance `last_applied`. An `id` at or below `last_applied` is
    /// ignored.
    fn apply(&self, id: LogId, cmd: ConfigCommand)
        -> impl Future<Output = Result<ApplyOutcome, MimirError>> + Send;

    /// Advance `last_applied` past an entry that changes no state (a NoOp or
    /// a malformed entry, which also records `audit`).
    fn skip(&self, id: LogId, audit: Option<AuditRecord>)
        -> impl Future<Output = Result<ApplyOutcome, MimirError>> + Send;

    /// Current head of a key, including tombstones.
    fn get_entry(&self, namespace: &str, key: &str)
        -> impl Future<Output = Result<Option<ConfigEntry>, MimirError>> + Send;

    /// One stored version, or `None` if it never existed or was pruned.
    fn get_version(&self, namespace: &str, key: &str, version: u64)
        -> impl Future<Output = Result<Option<ConfigVersion>, MimirError>> + Send;

    /// Stored versions of a key, newest first.
    fn list_versions(&self, namespace: &str, key: &str, page: Page)
        -> impl Future<Output = Result<Vec<ConfigVersion>, MimirError>> + Send;

    /// Drop versions outside `policy`. The head version and anything in
    /// `pinned` are always kept. Returns the number of versions removed.
    fn prune_history(&self, policy: RetentionPolicy, now_ms: i64, pinned: HashSet<VersionRef>)
        -> impl Future<Output = Result<u64, MimirError>> + Send;

    /// Skipped log entries, ascending by index.
    fn audit_trail(&self) -> impl Future<Output = Result<Vec<AuditRecord>, MimirError>> + Send;

    /// Serialize heads, history, and audit trail into a `Snapshot` taken at
    /// `last_applied`.
    fn build_snapshot(&self) -> impl Future<Output = Result<Snapshot, MimirError>> + Send;

    /// Replace all state with a snapshot received from the leader.
    fn install_snapshot(&self, snapshot: Snapshot)
        -> impl Future<Output = Result<(), MimirError>> + Send;
}
