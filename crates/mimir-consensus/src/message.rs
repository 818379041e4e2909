//! Peer-to-peer messages. Each is carried bincode-encoded in a
//! `RaftMessage { data }` envelope on the wire.

use mimir_storage::{LogEntry, Snapshot};
use mimir_types::{ApplyResult, ConfigCommand, ConfigEntry, NodeId};

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VoteRequest {
    pub term: u64,
    pub candidate_id: NodeId,
    pub last_log_index: u64,
    pub last_log_term: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct VoteResponse {
    pub term: u64,
    pub granted: bool,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AppendRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub prev_log_index: u64,
    pub prev_log_term: u64,
    pub entries: Vec<LogEntry>,
    pub leader_commit: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AppendResponse {
    pub term: u64,
    pub success: bool,
    /// On success the last index now known to match the leader; on failure a
    /// hint for where the leader should retry from.
    pub match_index: u64,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotRequest {
    pub term: u64,
    pub leader_id: NodeId,
    pub snapshot: Snapshot,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct SnapshotResponse {
    pub term: u64,
}

/// Client operation relayed from a follower to the leader.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ForwardRequest {
    Propose(ConfigCommand),
    /// Linearizable read.
    Read {
        namespace: String,
        key: String,
        version: Option<u64>,
    },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum ForwardResponse {
    Applied(ApplyResult),
    Entry(Option<ConfigEntry>),
}
