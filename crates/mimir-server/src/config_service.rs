use std::sync::Arc;
use std::time::Instant;

use mimir_cache::ConfigCache;
use mimir_consensus::{RaftNode, VersionManager};
use mimir_proto::v1::{
    config_service_server::ConfigService, BatchEntry, BatchGetConfigRequest,
    BatchGetConfigResponse, DeleteConfigRequest, DeleteConfigResponse, DiffRequest, DiffResponse,
    GetConfigRequest, GetConfigResponse, HealthRequest, HealthResponse, ListVersionsRequest,
    ListVersionsResponse, PutConfigRequest, PutConfigResponse, ResponseHeader, RollbackRequest,
    RollbackResponse,
};
use mimir_storage::retention::now_ms;
use mimir_storage::PinRegistry;
use mimir_types::{validate_name, ConfigCommand, MimirError, OpClass, Page};
use tonic::{Request, Response, Status};

use crate::convert::{
    change_to_proto, client_id, header, mimir_to_status, parse_value, proto_read_consistency,
    role_to_proto, version_to_proto,
};
use crate::limiter::AdmissionControl;

pub struct ConfigServiceImpl<R> {
    node: Arc<R>,
    cache: Arc<ConfigCache<R>>,
    versions: VersionManager<R>,
    admission: Arc<AdmissionControl>,
    max_batch_keys: usize,
}

impl<R: RaftNode> ConfigServiceImpl<R> {
    /// `pins` must be shared with the node's retention task.
    pub fn new(
        cache: Arc<ConfigCache<R>>,
        pins: PinRegistry,
        admission: Arc<AdmissionControl>,
        max_batch_keys: usize,
    ) -> Self {
        let node = cache.node().clone();
        ConfigServiceImpl {
            versions: VersionManager::new(node.clone(), pins),
            node,
            cache,
            admission,
            max_batch_keys,
        }
    }

    fn admit(&self, client: &str, class: OpClass, method: &'static str) -> Result<(), Status> {
        if self.admission.allow(client, class) {
            return Ok(());
        }
        tracing::warn!(method, client, ?class, "rate limited");
        Err(mimir_to_status(MimirError::RateLimited))
    }

    fn header(&self) -> Option<ResponseHeader> {
        Some(header(&self.node.health()))
    }
}

fn validate(namespace: &str, key: &str) -> Result<(), Status> {
    validate_name("namespace", namespace).map_err(mimir_to_status)?;
    validate_name("key", key).map_err(mimir_to_status)
}

/// Log latency and outcome of one call and convert the error.
fn finish<T>(
    method: &'static str,
    client: &str,
    started: Instant,
    result: Result<T, MimirError>,
) -> Result<T, Status> {
    let elapsed_ms = started.elapsed().as_secs_f64() * 1_000.0;
    match &result {
        Ok(_) => tracing::info!(method, client, elapsed_ms, outcome = "ok", "request"),
        Err(e) => tracing::warn!(method, client, elapsed_ms, outcome = "error", error = %e, "request"),
    }
    result.map_err(mimir_to_status)
}

#[tonic::async_trait]
impl<R: RaftNode> ConfigService for ConfigServiceImpl<R> {
    async fn get_config(
        &self,
        request: Request<GetConfigRequest>,
    ) -> Result<Response<GetConfigResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Read, "GetConfig")?;
        let req = request.into_inner();
        validate(&req.namespace, &req.key)?;
        let started = Instant::now();

        let mode = proto_read_consistency(req.consistency);
        let result = self.cache.get(&req.namespace, &req.key, req.version, mode).await;
        let record = finish("GetConfig", &client, started, result)?.ok_or_else(|| {
            Status::not_found(format!("{}/{} not found", req.namespace, req.key))
        })?;
        Ok(Response::new(GetConfigResponse {
            header: self.header(),
            value_json: record.value.to_json_string(),
            version: record.version,
            updated_at_ms: record.updated_at_ms,
            degraded: record.degraded,
        }))
    }

    async fn batch_get_config(
        &self,
        request: Request<BatchGetConfigRequest>,
    ) -> Result<Response<BatchGetConfigResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Read, "BatchGetConfig")?;
        let req = request.into_inner();
        if req.keys.len() > self.max_batch_keys {
            return Err(Status::invalid_argument(format!(
                "at most {} keys per batch",
                self.max_batch_keys
            )));
        }
        for key in &req.keys {
            validate(&req.namespace, key)?;
        }
        let started = Instant::now();

        let mode = proto_read_consistency(req.consistency);
        let mut entries = Vec::with_capacity(req.keys.len());
        let mut failure = None;
        for key in &req.keys {
            match self.cache.get(&req.namespace, key, None, mode).await {
                Ok(Some(record)) => entries.push(BatchEntry {
                    key: record.key,
                    value_json: record.value.to_json_string(),
                    version: record.version,
                    degraded: record.degraded,
                }),
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }
        let result = match failure {
            Some(e) => Err(e),
            None => Ok(entries),
        };
        let entries = finish("BatchGetConfig", &client, started, result)?;
        Ok(Response::new(BatchGetConfigResponse { header: self.header(), entries }))
    }

    async fn put_config(
        &self,
        request: Request<PutConfigRequest>,
    ) -> Result<Response<PutConfigResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Write, "PutConfig")?;
        let req = request.into_inner();
        validate(&req.namespace, &req.key)?;
        let value = parse_value(&req.value_json)?;
        let started = Instant::now();

        let cmd = ConfigCommand::Put {
            namespace: req.namespace,
            key: req.key,
            value,
            description: req.description,
            expected_version: req.expected_version,
            created_by: client.clone(),
            issued_at_ms: now_ms(),
        };
        let result = self.node.propose(cmd).await;
        let applied = finish("PutConfig", &client, started, result)?;
        self.cache.note_write(&applied);
        Ok(Response::new(PutConfigResponse { header: self.header(), version: applied.new_version }))
    }

    async fn delete_config(
        &self,
        request: Request<DeleteConfigRequest>,
    ) -> Result<Response<DeleteConfigResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Write, "DeleteConfig")?;
        let req = request.into_inner();
        validate(&req.namespace, &req.key)?;
        let started = Instant::now();

        let cmd = ConfigCommand::Delete {
            namespace: req.namespace,
            key: req.key,
            expected_version: req.expected_version,
            created_by: client.clone(),
            issued_at_ms: now_ms(),
        };
        let result = self.node.propose(cmd).await;
        let applied = finish("DeleteConfig", &client, started, result)?;
        self.cache.note_write(&applied);
        Ok(Response::new(DeleteConfigResponse {
            header: self.header(),
            version: applied.new_version,
        }))
    }

    async fn list_versions(
        &self,
        request: Request<ListVersionsRequest>,
    ) -> Result<Response<ListVersionsResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Read, "ListVersions")?;
        let req = request.into_inner();
        validate(&req.namespace, &req.key)?;
        let started = Instant::now();

        let page = Page { offset: req.offset, limit: req.limit };
        let result = self.versions.list(&req.namespace, &req.key, page).await;
        let versions = finish("ListVersions", &client, started, result)?;
        Ok(Response::new(ListVersionsResponse {
            header: self.header(),
            versions: versions.into_iter().map(version_to_proto).collect(),
        }))
    }

    async fn diff(&self, request: Request<DiffRequest>) -> Result<Response<DiffResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Read, "Diff")?;
        let req = request.into_inner();
        validate(&req.namespace, &req.key)?;
        let started = Instant::now();

        let result =
            self.versions.diff(&req.namespace, &req.key, req.from_version, req.to_version).await;
        let changes = finish("Diff", &client, started, result)?;
        Ok(Response::new(DiffResponse {
            header: self.header(),
            changes: changes.into_iter().map(change_to_proto).collect(),
        }))
    }

    async fn rollback(
        &self,
        request: Request<RollbackRequest>,
    ) -> Result<Response<RollbackResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Admin, "Rollback")?;
        let req = request.into_inner();
        validate(&req.namespace, &req.key)?;
        let started = Instant::now();

        let result = self
            .versions
            .rollback(&req.namespace, &req.key, req.target_version, &client)
            .await;
        let applied = finish("Rollback", &client, started, result)?;
        self.cache.note_write(&applied);
        Ok(Response::new(RollbackResponse {
            header: self.header(),
            new_version: applied.new_version,
        }))
    }

    async fn health(
        &self,
        request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        let client = client_id(&request);
        self.admit(&client, OpClass::Admin, "Health")?;
        let health = self.node.health();
        Ok(Response::new(HealthResponse {
            node_id: health.node_id,
            role: role_to_proto(health.role).into(),
            term: health.term,
            commit_index: health.commit_index,
            last_applied: health.last_applied,
            leader_id: health.leader_id,
            degraded: health.degraded,
        }))
    }
}
