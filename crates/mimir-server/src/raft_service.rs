use mimir_consensus::{ConfigNode, RaftNetwork};
use mimir_proto::v1::{raft_service_server::RaftService, RaftMessage};
use mimir_storage::{codec, StateMachineStore};
use tonic::{Request, Response, Status};

use crate::convert::mimir_to_status;

/// Inbound side of the peer protocol: unwraps the bincode envelope and hands
/// the message to the local node.
pub struct RaftServiceImpl<S, N> {
    node: ConfigNode<S, N>,
}

impl<S, N> RaftServiceImpl<S, N> {
    pub fn new(node: ConfigNode<S, N>) -> Self {
        RaftServiceImpl { node }
    }
}

fn unwrap_msg<T: for<'de> serde::Deserialize<'de>>(
    request: Request<RaftMessage>,
) -> Result<T, Status> {
    codec::decode(&request.into_inner().data)
        .map_err(|e| Status::invalid_argument(format!("undecodable raft message: {e}")))
}

fn wrap_msg<T: serde::Serialize>(msg: &T) -> Result<Response<RaftMessage>, Status> {
    let data = codec::encode(msg).map_err(mimir_to_status)?;
    Ok(Response::new(RaftMessage { data }))
}

#[tonic::async_trait]
impl<S: StateMachineStore, N: RaftNetwork> RaftService for RaftServiceImpl<S, N> {
    async fn request_vote(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req = unwrap_msg(request)?;
        let resp = self.node.handle_vote(req).await.map_err(mimir_to_status)?;
        wrap_msg(&resp)
    }

    async fn append_entries(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req = unwrap_msg(request)?;
        let resp = self.node.handle_append(req).await.map_err(mimir_to_status)?;
        wrap_msg(&resp)
    }

    async fn install_snapshot(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req = unwrap_msg(request)?;
        let resp = self.node.handle_install_snapshot(req).await.map_err(mimir_to_status)?;
        wrap_msg(&resp)
    }

    /// The leader's own outcome travels in the payload, so an application
    /// error such as a version conflict still answers OK at the gRPC level.
    async fn forward(
        &self,
        request: Request<RaftMessage>,
    ) -> Result<Response<RaftMessage>, Status> {
        let req = unwrap_msg(request)?;
        let outcome = self.node.handle_forward(req).await;
        wrap_msg(&outcome)
    }
}
