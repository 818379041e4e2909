//! Peer transport over the cluster gRPC port.

use std::collections::HashMap;
use std::time::Duration;

use mimir_consensus::message::{
    AppendRequest, AppendResponse, ForwardRequest, ForwardResponse, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use mimir_consensus::RaftNetwork;
use mimir_proto::v1::{raft_service_client::RaftServiceClient, RaftMessage};
use mimir_storage::codec;
use mimir_types::{MimirError, NodeId};
use tonic::transport::Channel;

use crate::convert::status_to_mimir;

pub struct GrpcNetwork {
    clients: HashMap<NodeId, RaftServiceClient<Channel>>,
}

impl GrpcNetwork {
    /// One lazily connected channel per peer; nothing is dialed until the
    /// first RPC. Must be called inside a tokio runtime.
    pub fn new(
        peers: &HashMap<NodeId, String>,
        connect_timeout: Duration,
        max_message_bytes: usize,
    ) -> Result<Self, MimirError> {
        let mut clients = HashMap::with_capacity(peers.len());
        for (&id, addr) in peers {
            let endpoint = if addr.contains("://") { addr.clone() } else { format!("http://{addr}") };
            let channel = Channel::from_shared(endpoint)
                .map_err(|e| {
                    MimirError::InvalidArgument(format!("bad address for peer {id}: {addr}: {e}"))
                })?
                .connect_timeout(connect_timeout)
                .tcp_nodelay(true)
                .connect_lazy();
            let client = RaftServiceClient::new(channel)
                .max_decoding_message_size(max_message_bytes)
                .max_encoding_message_size(max_message_bytes);
            clients.insert(id, client);
        }
        Ok(GrpcNetwork { clients })
    }

    fn client(&self, target: NodeId) -> Result<RaftServiceClient<Channel>, MimirError> {
        self.clients
            .get(&target)
            .cloned()
            .ok_or_else(|| MimirError::Unavailable(format!("unknown peer {target}")))
    }
}

fn envelope<T: serde::Serialize>(msg: &T) -> Result<RaftMessage, MimirError> {
    Ok(RaftMessage { data: codec::encode(msg)? })
}

fn open<T: for<'de> serde::Deserialize<'de>>(
    reply: Result<tonic::Response<RaftMessage>, tonic::Status>,
) -> Result<T, MimirError> {
    let reply = reply.map_err(status_to_mimir)?;
    codec::decode(&reply.into_inner().data)
}

impl RaftNetwork for GrpcNetwork {
    async fn request_vote(
        &self,
        target: NodeId,
        req: VoteRequest,
    ) -> Result<VoteResponse, MimirError> {
        let msg = envelope(&req)?;
        open(self.client(target)?.request_vote(msg).await)
    }

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendRequest,
    ) -> Result<AppendResponse, MimirError> {
        let msg = envelope(&req)?;
        open(self.client(target)?.append_entries(msg).await)
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, MimirError> {
        let msg = envelope(&req)?;
        open(self.client(target)?.install_snapshot(msg).await)
    }

    async fn forward(
        &self,
        target: NodeId,
        req: ForwardRequest,
    ) -> Result<Result<ForwardResponse, MimirError>, MimirError> {
        let msg = envelope(&req)?;
        open(self.client(target)?.forward(msg).await)
    }
}
