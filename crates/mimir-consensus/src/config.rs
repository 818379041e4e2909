use std::time::Duration;

use mimir_types::MimirError;

/// Timing and sizing knobs for one Raft node.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct RaftConfig {
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    /// Upper bound on a single peer RPC before it counts as failed.
    pub rpc_timeout_ms: u64,
    /// Peer RPCs in flight at once across all peers.
    pub max_inflight_rpcs: usize,
    /// Entries carried by one AppendEntries.
    pub max_append_entries: usize,
    /// Applied entries kept in the log before compacting into a snapshot.
    pub snapshot_threshold: u64,
    /// Deadline for a client proposal or a forwarded request.
    pub request_timeout_ms: u64,
    pub inbox_capacity: usize,
    /// Buffer of the invalidation broadcast feed.
    pub event_capacity: usize,
    /// Committed but unapplied entries beyond which health reports degraded.
    pub degraded_apply_lag: u64,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            election_timeout_min_ms: 150,
            election_timeout_max_ms: 300,
            rpc_timeout_ms: 100,
            max_inflight_rpcs: 64,
            max_append_entries: 256,
            snapshot_threshold: 1024,
            request_timeout_ms: 5_000,
            inbox_capacity: 1024,
            event_capacity: 1024,
            degraded_apply_lag: 1024,
        }
    }
}

impl RaftConfig {
    pub fn validate(&self) -> Result<(), MimirError> {
        if self.election_timeout_min_ms < 10 {
            return Err(MimirError::InvalidArgument(
                "raft.election_timeout_min_ms must be at least 10".into(),
            ));
        }
        if self.election_timeout_max_ms < self.election_timeout_min_ms {
            return Err(MimirError::InvalidArgument(
                "raft.election_timeout_max_ms must be >= election_timeout_min_ms".into(),
            ));
        }
        if self.rpc_timeout_ms == 0 || self.rpc_timeout_ms >= self.election_timeout_min_ms {
            return Err(MimirError::InvalidArgument(
                "raft.rpc_timeout_ms must be in (0, election_timeout_min_ms)".into(),
            ));
        }
        if self.max_inflight_rpcs == 0 || self.max_append_entries == 0 {
            return Err(MimirError::InvalidArgument(
                "raft.max_inflight_rpcs and raft.max_append_entries must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis((self.election_timeout_min_ms / 10).max(1))
    }

    pub fn election_timeout_max(&self) -> Duration {
        Duration::from_millis(self.election_timeout_max_ms)
    }

    /// How long a quorum acknowledgement keeps a leader's reads safe.
    pub fn lease(&self) -> Duration {
        Duration::from_millis(self.election_timeout_min_ms)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.rpc_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Uniform draw from `[min, max]`.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let ms = rand::thread_rng()
            .gen_range(self.election_timeout_min_ms..=self.election_timeout_max_ms);
        Duration::from_millis(ms)
    }
}
