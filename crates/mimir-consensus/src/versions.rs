use std::sync::Arc;

use mimir_storage::retention::now_ms;
use mimir_storage::{PinRegistry, VersionRef};
use mimir_types::{
    diff, ApplyResult, ConfigCommand, ConfigVersion, FieldChange, MimirError, Page, ReadMode,
};

use crate::RaftNode;

/// History queries and rollback on top of a [`RaftNode`].
///
/// Rollback never edits history: it proposes a new version carrying the
/// target's value, guarded by the head version it observed.
pub struct VersionManager<R> {
    node: Arc<R>,
    pins: PinRegistry,
}

impl<R: RaftNode> VersionManager<R> {
    /// `pins` must be the registry the node's retention task consults.
    pub fn new(node: Arc<R>, pins: PinRegistry) -> Self {
        VersionManager { node, pins }
    }

    pub async fn list(
        &self,
        namespace: &str,
        key: &str,
        page: Page,
    ) -> Result<Vec<ConfigVersion>, MimirError> {
        self.node.list_versions(namespace, key, page).await
    }

    /// Field-level changes going from version `from` to version `to`.
    pub async fn diff(
        &self,
        namespace: &str,
        key: &str,
        from: u64,
        to: u64,
    ) -> Result<Vec<FieldChange>, MimirError> {
        let old = self
            .node
            .read(namespace, key, Some(from), ReadMode::Sequential)
            .await?
            .ok_or(MimirError::NotFound)?;
        let new = self
            .node
            .read(namespace, key, Some(to), ReadMode::Sequential)
            .await?
            .ok_or(MimirError::NotFound)?;
        Ok(diff(&old.value, &new.value))
    }

    pub async fn rollback(
        &self,
        namespace: &str,
        key: &str,
        target_version: u64,
        created_by: &str,
    ) -> Result<ApplyResult, MimirError> {
        let head = self
            .node
            .read(namespace, key, None, ReadMode::Linearizable)
            .await?
            .ok_or(MimirError::NotFound)?;
        if target_version == 0 || target_version >= head.version {
            return Err(MimirError::InvalidArgument(format!(
                "rollback target {target_version} must be below the current version {}",
                head.version
            )));
        }

        let _pin = self.pins.pin(VersionRef {
            namespace: namespace.to_string(),
            key: key.to_string(),
            version: target_version,
        });
        let target = self
            .node
            .read(namespace, key, Some(target_version), ReadMode::Linearizable)
            .await?
            .ok_or(MimirError::NotFound)?;
        if !target.is_active() {
            return Err(MimirError::InvalidArgument(format!(
                "rollback target {target_version} is a deletion; roll back to a live version"
            )));
        }

        tracing::info!(
            namespace,
            key,
            target_version,
            head_version = head.version,
            created_by,
            "proposing rollback"
        );
        self.node
            .propose(ConfigCommand::Rollback {
                namespace: namespace.to_string(),
                key: key.to_string(),
                target_version,
                value: target.value,
                expected_version: head.version,
                created_by: created_by.to_string(),
                issued_at_ms: now_ms(),
            })
            .await
    }
}
