use crate::NodeId;

/// Error taxonomy shared by every crate in the workspace.
///
/// `Clone` so that one apply outcome can be handed to several waiters;
/// serializable so forwarded requests can carry it back.
#[derive(thiserror::Error, Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub enum MimirError {
    #[error("not found")]
    NotFound,
    #[error("not the leader; hint: {leader:?}")]
    NotLeader { leader: Option<NodeId> },
    #[error("version conflict: expected {expected}, got {actual}")]
    Conflict { expected: u64, actual: u64 },
    #[error("operation timed out; outcome unknown")]
    Timeout,
    #[error("leadership lost before commit; outcome unknown")]
    LeadershipLost,
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("stale data unavailable: {0}")]
    StaleDataUnavailable(String),
    #[error("transient failure: {0}")]
    Transient(String),
    #[error("rate limited")]
    RateLimited,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("consensus error: {0}")]
    Consensus(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl MimirError {
    /// True when the backing path could not be reached at all, as opposed to
    /// answering with a definite error. Degraded reads are only allowed then.
    pub fn is_unreachable(&self) -> bool {
        matches!(
            self,
            MimirError::Unavailable(_)
                | MimirError::Timeout
                | MimirError::Transient(_)
                | MimirError::NotLeader { .. }
        )
    }
}
