use mimir_types::{
    ApplyResult, AuditRecord, ConfigCommand, ConfigEntry, ConfigVersion, EntryType, MimirError,
    NodeId,
};

use crate::codec::{decode, encode};

/// A single entry in the Raft log.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub index: u64,
    pub term: u64,
    pub entry_type: EntryType,
    /// bincode(`ConfigCommand`) for mutations, empty for `NoOp`.
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn noop(index: u64, term: u64) -> Self {
        LogEntry { index, term, entry_type: EntryType::NoOp, payload: Vec::new() }
    }

    pub fn command(index: u64, term: u64, cmd: &ConfigCommand) -> Result<Self, MimirError> {
        Ok(LogEntry { index, term, entry_type: cmd.entry_type(), payload: encode(cmd)? })
    }

    pub fn log_id(&self) -> LogId {
        LogId { index: self.index, term: self.term }
    }

    /// Decode the payload. The decoded variant must agree with `entry_type`.
    pub fn decode_command(&self) -> Result<ConfigCommand, MimirError> {
        let cmd: ConfigCommand = decode(&self.payload)?;
        if cmd.entry_type() != self.entry_type {
            return Err(MimirError::Storage(format!(
                "entry type {:?} does not match payload {:?}",
                self.entry_type,
                cmd.entry_type()
            )));
        }
        Ok(cmd)
    }
}

/// `(index, term)` pair identifying a log position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub index: u64,
    pub term: u64,
}

/// Persisted vote, written before granting a vote or starting a candidacy.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Vote {
    pub term: u64,
    /// `None` means the node has not voted yet in this term.
    pub voted_for: Option<NodeId>,
}

/// Summary of the current log extent.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
pub struct LogState {
    /// Smallest index currently in the log (`None` if log is empty).
    pub first_index: Option<u64>,
    /// Largest index currently in the log (`None` if log is empty).
    pub last_index: Option<u64>,
    /// Last position compacted into a snapshot.
    pub last_purged: Option<LogId>,
}

impl LogState {
    /// Index of the last entry, falling back to the purge point, then 0.
    pub fn last_index(&self) -> u64 {
        self.last_index
            .or(self.last_purged.map(|p| p.index))
            .unwrap_or(0)
    }
}

/// What applying a committed entry did to the state machine.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    Applied(ApplyResult),
    /// Deterministically refused (conflict, missing key); the index still
    /// counts as applied.
    Rejected(MimirError),
    /// NoOp or malformed entry; index advanced, nothing else changed.
    Skipped,
    /// Index was at or below `last_applied`; nothing changed.
    AlreadyApplied,
}

/// Metadata identifying a snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotMeta {
    pub last_log_index: u64,
    pub last_log_term: u64,
    /// UUID v4 string identifying this snapshot.
    pub snapshot_id: String,
}

impl SnapshotMeta {
    pub fn log_id(&self) -> LogId {
        LogId { index: self.last_log_index, term: self.last_log_term }
    }
}

/// Internal serialized format stored in [`Snapshot::data`].
///
/// History and the audit trail travel with the heads so that version reads
/// and rollbacks keep working on a follower that installs the snapshot.
#[derive(serde::Serialize, serde::Deserialize)]
pub(crate) struct SnapshotContents {
    pub entries: Vec<ConfigEntry>,
    pub history: Vec<ConfigVersion>,
    pub audit: Vec<AuditRecord>,
}

/// A full state-machine snapshot.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Snapshot {
    pub meta: SnapshotMeta,
    pub data: Vec<u8>,
}

/// Count- and age-based bound on retained versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Keep at most this many newest versions per key (`0` = unbounded).
    pub max_versions: u64,
    /// Drop versions created more than this many ms ago (`0` = unbounded).
    pub max_age_ms: i64,
}

impl RetentionPolicy {
    pub fn unbounded() -> Self {
        RetentionPolicy { max_versions: 0, max_age_ms: 0 }
    }
}

/// Identifies one stored version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VersionRef {
    pub namespace: String,
    pub key: String,
    pub version: u64,
}
