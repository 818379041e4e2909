use mimir_proto::v1;
use mimir_types::{
    ChangeKind, ConfigStatus, ConfigValue, ConfigVersion, FieldChange, Health, MimirError, ReadMode,
    Role,
};
use tonic::metadata::MetadataValue;
use tonic::Status;

/// Metadata key carrying the current leader's node id on UNAVAILABLE.
pub const LEADER_ID_HEADER: &str = "mimir-leader-id";
/// Metadata key the auth layer fills with the verified client id.
pub const CLIENT_ID_HEADER: &str = "x-mimir-client-id";
pub const ANONYMOUS: &str = "anonymous";

pub fn client_id<T>(request: &tonic::Request<T>) -> String {
    request
        .metadata()
        .get(CLIENT_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .unwrap_or(ANONYMOUS)
        .to_string()
}

pub fn proto_read_consistency(raw: i32) -> ReadMode {
    match v1::ReadConsistency::try_from(raw).unwrap_or(v1::ReadConsistency::Sequential) {
        v1::ReadConsistency::Linearizable => ReadMode::Linearizable,
        v1::ReadConsistency::Sequential => ReadMode::Sequential,
        v1::ReadConsistency::Eventual => ReadMode::Eventual,
    }
}

pub fn parse_value(raw: &str) -> Result<ConfigValue, Status> {
    ConfigValue::from_json_str(raw)
        .map_err(|e| Status::invalid_argument(format!("value_json is not valid JSON: {e}")))
}

pub fn header(health: &Health) -> v1::ResponseHeader {
    v1::ResponseHeader {
        node_id: health.node_id,
        term: health.term,
        commit_index: health.commit_index,
        leader_id: health.leader_id,
    }
}

pub fn role_to_proto(role: Role) -> v1::Role {
    match role {
        Role::Follower => v1::Role::Follower,
        Role::Candidate => v1::Role::Candidate,
        Role::Leader => v1::Role::Leader,
    }
}

pub fn version_to_proto(v: ConfigVersion) -> v1::ConfigVersion {
    v1::ConfigVersion {
        namespace: v.namespace,
        key: v.key,
        version: v.version,
        value_json: v.value.to_json_string(),
        deleted: v.status == ConfigStatus::Deleted,
        created_by: v.created_by,
        description: v.description,
        committed_at_log_index: v.committed_at_log_index,
        created_at_ms: v.created_at_ms,
        rollback_of: v.rollback_of,
    }
}

pub fn change_to_proto(c: FieldChange) -> v1::FieldChange {
    let kind = match c.kind {
        ChangeKind::Added => v1::ChangeKind::Added,
        ChangeKind::Removed => v1::ChangeKind::Removed,
        ChangeKind::Modified => v1::ChangeKind::Modified,
    };
    v1::FieldChange {
        path: c.path,
        kind: kind.into(),
        old_json: c.old.map(|v| v.to_json_string()),
        new_json: c.new.map(|v| v.to_json_string()),
    }
}

pub fn mimir_to_status(err: MimirError) -> Status {
    match &err {
        MimirError::NotFound => Status::not_found(err.to_string()),
        MimirError::NotLeader { leader } => {
            let mut status = Status::unavailable(err.to_string());
            if let Some(id) = leader {
                if let Ok(val) = MetadataValue::try_from(id.to_string()) {
                    status.metadata_mut().insert(LEADER_ID_HEADER, val);
                }
            }
            status
        }
        MimirError::Unavailable(_) | MimirError::LeadershipLost => {
            Status::unavailable(err.to_string())
        }
        MimirError::Conflict { .. } => Status::aborted(err.to_string()),
        MimirError::Timeout => Status::deadline_exceeded(err.to_string()),
        MimirError::StaleDataUnavailable(_) => Status::failed_precondition(err.to_string()),
        MimirError::RateLimited => Status::resource_exhausted(err.to_string()),
        MimirError::InvalidArgument(_) => Status::invalid_argument(err.to_string()),
        MimirError::Storage(_) | MimirError::Consensus(_) | MimirError::Transient(_) => {
            Status::internal(err.to_string())
        }
    }
}

/// Transport-level failure talking to a peer.
pub fn status_to_mimir(status: Status) -> MimirError {
    match status.code() {
        tonic::Code::DeadlineExceeded => MimirError::Timeout,
        _ => MimirError::Unavailable(format!("peer rpc failed: {}", status.message())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_leader_carries_hint() {
        let status = mimir_to_status(MimirError::NotLeader { leader: Some(3) });
        assert_eq!(status.code(), tonic::Code::Unavailable);
        assert_eq!(status.metadata().get(LEADER_ID_HEADER).unwrap(), "3");
    }

    #[test]
    fn error_codes() {
        let cases = [
            (MimirError::NotFound, tonic::Code::NotFound),
            (MimirError::Conflict { expected: 1, actual: 2 }, tonic::Code::Aborted),
            (MimirError::Timeout, tonic::Code::DeadlineExceeded),
            (MimirError::LeadershipLost, tonic::Code::Unavailable),
            (MimirError::StaleDataUnavailable("x".into()), tonic::Code::FailedPrecondition),
            (MimirError::RateLimited, tonic::Code::ResourceExhausted),
            (MimirError::InvalidArgument("x".into()), tonic::Code::InvalidArgument),
            (MimirError::Transient("x".into()), tonic::Code::Internal),
        ];
        for (err, code) in cases {
            assert_eq!(mimir_to_status(err).code(), code);
        }
    }

    #[test]
    fn client_id_defaults_to_anonymous() {
        let mut req = tonic::Request::new(());
        assert_eq!(client_id(&req), ANONYMOUS);
        req.metadata_mut().insert(CLIENT_ID_HEADER, "svc-a".parse().unwrap());
        assert_eq!(client_id(&req), "svc-a");
    }

    #[test]
    fn unknown_consistency_is_sequential() {
        assert_eq!(proto_read_consistency(99), ReadMode::Sequential);
        assert_eq!(proto_read_consistency(1), ReadMode::Linearizable);
    }
}
