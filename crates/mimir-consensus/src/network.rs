use std::future::Future;

use mimir_types::{MimirError, NodeId};

use crate::message::{
    AppendRequest, AppendResponse, ForwardRequest, ForwardResponse, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};

/// Outbound peer transport.
///
/// An `Err` means the peer could not be reached or did not answer; protocol
/// level refusals travel inside the response types. `forward` carries the
/// leader's own result for the relayed operation, so it nests a `Result`.
pub trait RaftNetwork: Send + Sync + 'static {
    fn request_vote(&self, target: NodeId, req: VoteRequest)
        -> impl Future<Output = Result<VoteResponse, MimirError>> + Send;

    fn append_entries(&self, target: NodeId, req: AppendRequest)
        -> impl Future<Output = Result<AppendResponse, MimirError>> + Send;

    fn install_snapshot(&self, target: NodeId, req: SnapshotRequest)
        -> impl Future<Output = Result<SnapshotResponse, MimirError>> + Send;

    fn forward(&self, target: NodeId, req: ForwardRequest)
        -> impl Future<Output = Result<Result<ForwardResponse, MimirError>, MimirError>> + Send;
}
