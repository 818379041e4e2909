//! In-process transport: nodes of one cluster living in the same runtime,
//! with switchable isolation for partition tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use mimir_storage::StateMachineStore;
use mimir_types::{MimirError, NodeId};

use crate::message::{
    AppendRequest, AppendResponse, ForwardRequest, ForwardResponse, SnapshotRequest,
    SnapshotResponse, VoteRequest, VoteResponse,
};
use crate::network::RaftNetwork;
use crate::node::ConfigNode;

pub type LocalNode<S> = ConfigNode<S, LocalTransport<S>>;

struct RouterInner<S> {
    nodes: HashMap<NodeId, LocalNode<S>>,
    isolated: HashSet<NodeId>,
}

/// Registry of every node reachable in-process.
pub struct LocalRouter<S> {
    inner: Arc<Mutex<RouterInner<S>>>,
}

impl<S> Clone for LocalRouter<S> {
    fn clone(&self) -> Self {
        LocalRouter { inner: self.inner.clone() }
    }
}

impl<S: StateMachineStore> Default for LocalRouter<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S: StateMachineStore> LocalRouter<S> {
    pub fn new() -> Self {
        LocalRouter {
            inner: Arc::new(Mutex::new(RouterInner {
                nodes: HashMap::new(),
                isolated: HashSet::new(),
            })),
        }
    }

    /// Transport for the node with id `from`.
    pub fn transport(&self, from: NodeId) -> LocalTransport<S> {
        LocalTransport { from, router: self.clone() }
    }

    pub fn register(&self, node: LocalNode<S>) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.nodes.insert(node.id(), node);
    }

    /// Unregister and return a node, e.g. to stop it.
    pub fn remove(&self, id: NodeId) -> Option<LocalNode<S>> {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.nodes.remove(&id)
    }

    pub fn node(&self, id: NodeId) -> Option<LocalNode<S>> {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.nodes.get(&id).cloned()
    }

    /// Cut `id` off from every other node, in both directions.
    pub fn isolate(&self, id: NodeId) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.isolated.insert(id);
    }

    pub fn heal(&self, id: NodeId) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.isolated.remove(&id);
    }

    pub fn heal_all(&self) {
        let mut g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        g.isolated.clear();
    }

    fn route(&self, from: NodeId, to: NodeId) -> Result<LocalNode<S>, MimirError> {
        let g = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if g.isolated.contains(&from) || g.isolated.contains(&to) {
            return Err(MimirError::Unavailable(format!("node {to} unreachable from {from}")));
        }
        g.nodes
            .get(&to)
            .cloned()
            .ok_or_else(|| MimirError::Unavailable(format!("node {to} not running")))
    }
}

/// One node's view of the [`LocalRouter`].
pub struct LocalTransport<S> {
    from: NodeId,
    router: LocalRouter<S>,
}

impl<S: StateMachineStore> RaftNetwork for LocalTransport<S> {
    async fn request_vote(&self, target: NodeId, req: VoteRequest) -> Result<VoteResponse, MimirError> {
        self.router.route(self.from, target)?.handle_vote(req).await
    }

    async fn append_entries(
        &self,
        target: NodeId,
        req: AppendRequest,
    ) -> Result<AppendResponse, MimirError> {
        self.router.route(self.from, target)?.handle_append(req).await
    }

    async fn install_snapshot(
        &self,
        target: NodeId,
        req: SnapshotRequest,
    ) -> Result<SnapshotResponse, MimirError> {
        self.router.route(self.from, target)?.handle_install_snapshot(req).await
    }

    async fn forward(
        &self,
        target: NodeId,
        req: ForwardRequest,
    ) -> Result<Result<ForwardResponse, MimirError>, MimirError> {
        let node = self.router.route(self.from, target)?;
        Ok(node.handle_forward(req).await)
    }
}
