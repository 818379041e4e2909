mod diff;
mod error;
mod value;

pub use diff::{diff, ChangeKind, FieldChange};
pub use error::MimirError;
pub use value::ConfigValue;

pub type NodeId = u64;

/// Kind of a Raft log entry. Every non-`NoOp` entry carries an encoded
/// [`ConfigCommand`] of the matching variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum EntryType {
    Put,
    Delete,
    Rollback,
    NoOp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ConfigStatus {
    Active,
    Deleted,
}

/// Current head of a (namespace, key).
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConfigEntry {
    pub namespace: String,
    pub key: String,
    pub value: ConfigValue,
    pub version: u64,
    pub status: ConfigStatus,
    pub created_by: String,
    pub description: Option<String>,
    pub committed_at_log_index: u64,
    pub updated_at_ms: i64,
}

impl ConfigEntry {
    pub fn is_active(&self) -> bool {
        self.status == ConfigStatus::Active
    }
}

/// Immutable record of one version of a (namespace, key). The head version is
/// stored here too, so history is complete up to retention.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ConfigVersion {
    pub namespace: String,
    pub key: String,
    pub version: u64,
    pub value: ConfigValue,
    pub status: ConfigStatus,
    pub created_by: String,
    pub description: Option<String>,
    pub committed_at_log_index: u64,
    pub created_at_ms: i64,
    /// Set when this version was produced by rolling back to an older one.
    pub rollback_of: Option<u64>,
}

impl ConfigVersion {
    pub fn to_entry(&self) -> ConfigEntry {
        ConfigEntry {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            value: self.value.clone(),
            version: self.version,
            status: self.status,
            created_by: self.created_by.clone(),
            description: self.description.clone(),
            committed_at_log_index: self.committed_at_log_index,
            updated_at_ms: self.created_at_ms,
        }
    }
}

/// Commands proposed through Raft; the bincode encoding of one of these is
/// the payload of a log entry.
///
/// `issued_at_ms` is stamped before the command enters the log so that every
/// node applies the same timestamp.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ConfigCommand {
    Put {
        namespace: String,
        key: String,
        value: ConfigValue,
        description: Option<String>,
        /// `None` skips the optimistic-concurrency check.
        expected_version: Option<u64>,
        created_by: String,
        issued_at_ms: i64,
    },
    Delete {
        namespace: String,
        key: String,
        expected_version: Option<u64>,
        created_by: String,
        issued_at_ms: i64,
    },
    Rollback {
        namespace: String,
        key: String,
        target_version: u64,
        /// Value of `target_version`, captured when the rollback was proposed.
        value: ConfigValue,
        /// Head version observed when the rollback was proposed.
        expected_version: u64,
        created_by: String,
        issued_at_ms: i64,
    },
}

impl ConfigCommand {
    pub fn entry_type(&self) -> EntryType {
        match self {
            ConfigCommand::Put { .. } => EntryType::Put,
            ConfigCommand::Delete { .. } => EntryType::Delete,
            ConfigCommand::Rollback { .. } => EntryType::Rollback,
        }
    }

    pub fn namespace(&self) -> &str {
        match self {
            ConfigCommand::Put { namespace, .. }
            | ConfigCommand::Delete { namespace, .. }
            | ConfigCommand::Rollback { namespace, .. } => namespace,
        }
    }

    pub fn key(&self) -> &str {
        match self {
            ConfigCommand::Put { key, .. }
            | ConfigCommand::Delete { key, .. }
            | ConfigCommand::Rollback { key, .. } => key,
        }
    }
}

/// Result of applying one committed mutation.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ApplyResult {
    pub namespace: String,
    pub key: String,
    pub new_version: u64,
    pub previous_value: Option<ConfigValue>,
    pub index: u64,
    /// The new version is a tombstone.
    pub deleted: bool,
}

impl ApplyResult {
    pub fn invalidation(&self) -> InvalidationEvent {
        InvalidationEvent::Changed {
            namespace: self.namespace.clone(),
            key: self.key.clone(),
            version: self.new_version,
            index: self.index,
            deleted: self.deleted,
        }
    }
}

/// Published by the state machine after every applied mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum InvalidationEvent {
    Changed {
        namespace: String,
        key: String,
        version: u64,
        index: u64,
        deleted: bool,
    },
    /// The whole state was replaced (snapshot installed).
    Reset { index: u64 },
}

/// A committed entry that could not be applied and was skipped.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuditRecord {
    pub index: u64,
    pub term: u64,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ReadMode {
    /// Served by a leader holding a quorum lease, after applying its commit index.
    Linearizable,
    /// Served locally once this node has applied the leader's known commit
    /// index, otherwise forwarded to the leader.
    Sequential,
    /// Whatever this node has applied.
    Eventual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct Health {
    pub node_id: NodeId,
    pub role: Role,
    pub term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    pub leader_id: Option<NodeId>,
    pub degraded: bool,
}

/// Request classes used by admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpClass {
    Read,
    Write,
    Admin,
}

/// Newest-first pagination over version history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct Page {
    pub offset: u32,
    /// `0` means server default (20).
    pub limit: u32,
}

impl Page {
    pub const DEFAULT_LIMIT: u32 = 20;

    pub fn effective_limit(&self) -> usize {
        (if self.limit == 0 { Self::DEFAULT_LIMIT } else { self.limit }) as usize
    }
}

impl Default for Page {
    fn default() -> Self {
        Page { offset: 0, limit: Self::DEFAULT_LIMIT }
    }
}

/// Reject empty or NUL-containing names; storage keys use `\x00` as a delimiter.
pub fn validate_name(what: &str, name: &str) -> Result<(), MimirError> {
    if name.is_empty() {
        return Err(MimirError::InvalidArgument(format!("{what} must not be empty")));
    }
    if name.contains('\0') {
        return Err(MimirError::InvalidArgument(format!("{what} must not contain NUL")));
    }
    Ok(())
}
