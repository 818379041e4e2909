//! Backend-independent command evaluation and retention selection.
//!
//! Both backends call into these so that every node derives the same state
//! from the same log.

use std::collections::HashSet;

use mimir_types::{
    ApplyResult, ConfigCommand, ConfigEntry, ConfigStatus, ConfigVersion, MimirError,
};

use crate::types::{LogId, RetentionPolicy, VersionRef};

/// State changes produced by one command.
pub(crate) struct Mutation {
    pub head: ConfigEntry,
    pub version: ConfigVersion,
    pub result: ApplyResult,
}

fn check_expected(head: Option<&ConfigEntry>, expected: Option<u64>) -> Result<(), MimirError> {
    let actual = head.map(|h| h.version).unwrap_or(0);
    match expected {
        Some(expected) if expected != actual => Err(MimirError::Conflict { expected, actual }),
        _ => Ok(()),
    }
}

/// Evaluate `cmd` against the current head of its key.
pub(crate) fn evaluate(
    head: Option<&ConfigEntry>,
    id: LogId,
    cmd: ConfigCommand,
) -> Result<Mutation, MimirError> {
    let next_version = head.map(|h| h.version + 1).unwrap_or(1);
    let previous_value = head.filter(|h| h.is_active()).map(|h| h.value.clone());

    let version = match cmd {
        ConfigCommand::Put {
            namespace,
            key,
            value,
            description,
            expected_version,
            created_by,
            issued_at_ms,
        } => {
            check_expected(head, expected_version)?;
            ConfigVersion {
                namespace,
                key,
                version: next_version,
                value,
                status: ConfigStatus::Active,
                created_by,
                description,
                committed_at_log_index: id.index,
                created_at_ms: issued_at_ms,
                rollback_of: None,
            }
        }
        ConfigCommand::Delete { namespace, key, expected_version, created_by, issued_at_ms } => {
            let current = head.filter(|h| h.is_active()).ok_or(MimirError::NotFound)?;
            check_expected(head, expected_version)?;
            ConfigVersion {
                namespace,
                key,
                version: next_version,
                value: current.value.clone(),
                status: ConfigStatus::Deleted,
                created_by,
                description: current.description.clone(),
                committed_at_log_index: id.index,
                created_at_ms: issued_at_ms,
                rollback_of: None,
            }
        }
        ConfigCommand::Rollback {
            namespace,
            key,
            target_version,
            value,
            expected_version,
            created_by,
            issued_at_ms,
        } => {
            let current = head.ok_or(MimirError::NotFound)?;
            if target_version == 0 || target_version >= current.version {
                return Err(MimirError::InvalidArgument(format!(
                    "rollback target {target_version} is not an earlier version"
                )));
            }
            check_expected(head, Some(expected_version))?;
            ConfigVersion {
                namespace,
                key,
                version: next_version,
                value,
                status: ConfigStatus::Active,
                created_by,
                description: Some(format!("rollback to version {target_version}")),
                committed_at_log_index: id.index,
                created_at_ms: issued_at_ms,
                rollback_of: Some(target_version),
            }
        }
    };

    let result = ApplyResult {
        namespace: version.namespace.clone(),
        key: version.key.clone(),
        new_version: version.version,
        previous_value,
        index: id.index,
        deleted: version.status == ConfigStatus::Deleted,
    };
    Ok(Mutation { head: version.to_entry(), version, result })
}

/// Versions of one key (ascending) that `policy` says to drop.
pub(crate) fn prunable(
    versions: &[ConfigVersion],
    head_version: u64,
    policy: RetentionPolicy,
    now_ms: i64,
    pinned: &HashSet<VersionRef>,
) -> Vec<u64> {
    let len = versions.len() as u64;
    versions
        .iter()
        .enumerate()
        .filter(|(pos, v)| {
            let over_count = policy.max_versions > 0 && len - (*pos as u64) > policy.max_versions;
            let too_old =
                policy.max_age_ms > 0 && now_ms.saturating_sub(v.created_at_ms) > policy.max_age_ms;
            over_count || too_old
        })
        .map(|(_, v)| v)
        .filter(|v| v.version != head_version)
        .filter(|v| {
            !pinned.contains(&VersionRef {
                namespace: v.namespace.clone(),
                key: v.key.clone(),
                version: v.version,
            })
        })
        .map(|v| v.version)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use mimir_types::ConfigValue;

    fn put(value: i64, expected: Option<u64>) -> ConfigCommand {
        ConfigCommand::Put {
            namespace: "ns".into(),
            key: "k".into(),
            value: ConfigValue::Int(value),
            description: None,
            expected_version: expected,
            created_by: "alice".into(),
            issued_at_ms: 1_000,
        }
    }

    fn at(index: u64) -> LogId {
        LogId { index, term: 1 }
    }

    #[test]
    fn first_put_is_version_one() {
        let m = evaluate(None, at(1), put(1, None)).unwrap();
        assert_eq!(m.result.new_version, 1);
        assert_eq!(m.result.previous_value, None);
        assert_eq!(m.head.committed_at_log_index, 1);
        assert_eq!(m.head.updated_at_ms, 1_000);
    }

    #[test]
    fn put_with_stale_expected_version_conflicts() {
        let head = evaluate(None, at(1), put(1, None)).unwrap().head;
        let err = evaluate(Some(&head), at(2), put(2, Some(5))).err().unwrap();
        assert_eq!(err, MimirError::Conflict { expected: 5, actual: 1 });
    }

    #[test]
    fn expected_zero_means_must_not_exist() {
        assert!(evaluate(None, at(1), put(1, Some(0))).is_ok());
        let head = evaluate(None, at(1), put(1, None)).unwrap().head;
        assert!(evaluate(Some(&head), at(2), put(2, Some(0))).is_err());
    }

    #[test]
    fn delete_makes_tombstone_version() {
        let head = evaluate(None, at(1), put(7, None)).unwrap().head;
        let del = ConfigCommand::Delete {
            namespace: "ns".into(),
            key: "k".into(),
            expected_version: None,
            created_by: "bob".into(),
            issued_at_ms: 2_000,
        };
        let m = evaluate(Some(&head), at(2), del.clone()).unwrap();
        assert_eq!(m.version.version, 2);
        assert_eq!(m.version.status, ConfigStatus::Deleted);
        assert_eq!(m.version.value, ConfigValue::Int(7));
        assert_eq!(m.result.previous_value, Some(ConfigValue::Int(7)));

        // Deleting again is NotFound.
        let err = evaluate(Some(&m.head), at(3), del).err().unwrap();
        assert_eq!(err, MimirError::NotFound);
    }

    #[test]
    fn rollback_requires_current_head() {
        let v1 = evaluate(None, at(1), put(1, None)).unwrap().head;
        let v2 = evaluate(Some(&v1), at(2), put(2, None)).unwrap().head;
        let rb = |expected| ConfigCommand::Rollback {
            namespace: "ns".into(),
            key: "k".into(),
            target_version: 1,
            value: ConfigValue::Int(1),
            expected_version: expected,
            created_by: "ops".into(),
            issued_at_ms: 3_000,
        };
        let m = evaluate(Some(&v2), at(3), rb(2)).unwrap();
        assert_eq!(m.version.version, 3);
        assert_eq!(m.version.rollback_of, Some(1));
        assert_eq!(m.head.value, ConfigValue::Int(1));

        let err = evaluate(Some(&m.head), at(4), rb(2)).err().unwrap();
        assert_eq!(err, MimirError::Conflict { expected: 2, actual: 3 });
    }

    fn versions(n: u64) -> Vec<ConfigVersion> {
        let mut head = None;
        let mut out = Vec::new();
        for i in 1..=n {
            let mut cmd = put(i as i64, None);
            if let ConfigCommand::Put { issued_at_ms, .. } = &mut cmd {
                *issued_at_ms = i as i64 * 1_000;
            }
            let m = evaluate(head.as_ref(), at(i), cmd).unwrap();
            head = Some(m.head);
            out.push(m.version);
        }
        out
    }

    #[test]
    fn prune_by_count_keeps_newest() {
        let vs = versions(5);
        let policy = RetentionPolicy { max_versions: 2, max_age_ms: 0 };
        assert_eq!(prunable(&vs, 5, policy, 0, &HashSet::new()), vec![1, 2, 3]);
    }

    #[test]
    fn prune_by_age_never_drops_head_or_pins() {
        let vs = versions(3);
        let policy = RetentionPolicy { max_versions: 0, max_age_ms: 500 };
        let pinned = HashSet::from([VersionRef {
            namespace: "ns".into(),
            key: "k".into(),
            version: 1,
        }]);
        assert_eq!(prunable(&vs, 3, policy, 100_000, &pinned), vec![2]);
    }

    #[test]
    fn unbounded_policy_prunes_nothing() {
        let vs = versions(4);
        assert!(prunable(&vs, 4, RetentionPolicy::unbounded(), i64::MAX, &HashSet::new()).is_empty());
    }
}
