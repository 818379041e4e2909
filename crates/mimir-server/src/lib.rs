mod config_service;
pub mod convert;
pub mod limiter;
mod network;
mod raft_service;

use std::future::Future;
use std::time::Duration;

use anyhow::Context;
use mimir_consensus::{ConfigNode, RaftNetwork, RaftNode};
use mimir_proto::v1::{
    config_service_server::ConfigServiceServer, raft_service_server::RaftServiceServer,
};
use mimir_storage::StateMachineStore;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic_reflection::server::Builder as ReflectionBuilder;

pub use config_service::ConfigServiceImpl;
pub use limiter::{AdmissionConfig, AdmissionControl};
pub use network::GrpcNetwork;
pub use raft_service::RaftServiceImpl;

/// Transport settings shared by both listeners.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server-side deadline for any single gRPC call.
    pub request_timeout_ms: u64,
    /// Largest message either port accepts or sends. Snapshots travel as a
    /// single message, so this bounds the state size a lagging peer can
    /// catch up from.
    pub max_message_bytes: usize,
    pub max_batch_keys: usize,
    pub peer_connect_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        ServerConfig {
            request_timeout_ms: 10_000,
            max_message_bytes: 64 * 1024 * 1024,
            max_batch_keys: 100,
            peer_connect_timeout_ms: 1_000,
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn peer_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.peer_connect_timeout_ms)
    }
}

/// Serve `ConfigService` on `listener` until `shutdown` resolves.
pub async fn serve_client<R: RaftNode>(
    listener: TcpListener,
    service: ConfigServiceImpl<R>,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(mimir_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, "client gRPC server starting");
    let service = ConfigServiceServer::new(service)
        .max_decoding_message_size(config.max_message_bytes)
        .max_encoding_message_size(config.max_message_bytes);
    tonic::transport::Server::builder()
        .timeout(config.request_timeout())
        .add_service(service)
        .add_service(reflection)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("client gRPC server failed")
}

/// Serve the peer protocol for `node` on `listener` until `shutdown`
/// resolves.
pub async fn serve_cluster<S: StateMachineStore, N: RaftNetwork>(
    listener: TcpListener,
    node: ConfigNode<S, N>,
    config: &ServerConfig,
    shutdown: impl Future<Output = ()>,
) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    let reflection = ReflectionBuilder::configure()
        .register_encoded_file_descriptor_set(mimir_proto::FILE_DESCRIPTOR_SET)
        .build_v1()
        .context("failed to build reflection service")?;
    tracing::info!(%addr, node_id = node.id(), "cluster gRPC server starting");
    let service = RaftServiceServer::new(RaftServiceImpl::new(node))
        .max_decoding_message_size(config.max_message_bytes)
        .max_encoding_message_size(config.max_message_bytes);
    tonic::transport::Server::builder()
        .timeout(config.request_timeout())
        .add_service(service)
        .add_service(reflection)
        .serve_with_incoming_shutdown(TcpListenerStream::new(listener), shutdown)
        .await
        .context("cluster gRPC server failed")
}
