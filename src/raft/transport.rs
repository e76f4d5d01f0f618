use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use derive_more::Display;
use futures::future::{self, BoxFuture};
use futures::FutureExt;

use crate::raft::client::RaftClient;
use crate::raft::rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::raft::NodeId;

#[derive(Clone, Debug, Display, PartialEq, Serialize, Deserialize)]
pub enum TransportError {
    #[display(fmt = "peer {} is unreachable", _0)]
    Unreachable(NodeId),
    #[display(fmt = "request timed out")]
    Timeout,
    #[display(fmt = "io error: {}", _0)]
    Io(String),
    #[display(fmt = "peer failed to serve request: {}", _0)]
    Remote(String),
    #[display(fmt = "connection closed")]
    Closed,
}

impl std::error::Error for TransportError {}

/// Carries RPCs to peers. A failed call means no response this round, and the caller treats it
/// as an abstention.
pub trait Transport: Send + Sync + 'static {
    fn request_vote(
        &self,
        peer: &NodeId,
        req: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse, TransportError>>;

    fn append_entries(
        &self,
        peer: &NodeId,
        req: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse, TransportError>>;
}

#[derive(Default)]
struct Links {
    nodes: HashMap<NodeId, RaftClient>,
    isolated: HashSet<NodeId>,
    cut: HashSet<(NodeId, NodeId)>,
}

/// Routes calls between nodes in the same process. Links can be cut to simulate partitions.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    links: Arc<RwLock<Links>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Links> {
        match self.links.read() {
            Ok(links) => links,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, Links> {
        match self.links.write() {
            Ok(links) => links,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Make a node reachable under its client's id.
    pub fn register(&self, client: RaftClient) {
        self.write().nodes.insert(client.id().clone(), client);
    }

    /// A transport that sends as `from`.
    pub fn transport<S: Into<NodeId>>(&self, from: S) -> MemoryTransport {
        MemoryTransport {
            from: from.into(),
            network: self.clone(),
        }
    }

    /// Drop all traffic to and from the node.
    pub fn isolate(&self, id: &str) {
        self.write().isolated.insert(id.to_string());
    }

    pub fn heal(&self, id: &str) {
        self.write().isolated.remove(id);
    }

    /// Drop traffic between two nodes in both directions.
    pub fn cut(&self, a: &str, b: &str) {
        self.write().cut.insert((a.to_string(), b.to_string()));
    }

    pub fn repair(&self, a: &str, b: &str) {
        let mut links = self.write();
        links.cut.remove(&(a.to_string(), b.to_string()));
        links.cut.remove(&(b.to_string(), a.to_string()));
    }

    fn route(&self, from: &NodeId, to: &NodeId) -> Result<RaftClient, TransportError> {
        let links = self.read();
        let blocked = links.isolated.contains(from)
            || links.isolated.contains(to)
            || links.cut.contains(&(from.clone(), to.clone()))
            || links.cut.contains(&(to.clone(), from.clone()));
        if blocked {
            return Err(TransportError::Unreachable(to.clone()));
        }
        links
            .nodes
            .get(to)
            .cloned()
            .ok_or_else(|| TransportError::Unreachable(to.clone()))
    }

    fn reachable(&self, from: &NodeId, to: &NodeId) -> bool {
        self.route(from, to).is_ok()
    }
}

#[derive(Clone)]
pub struct MemoryTransport {
    from: NodeId,
    network: MemoryNetwork,
}

impl Transport for MemoryTransport {
    fn request_vote(
        &self,
        peer: &NodeId,
        req: VoteRequest,
    ) -> BoxFuture<'static, Result<VoteResponse, TransportError>> {
        let client = match self.network.route(&self.from, peer) {
            Ok(client) => client,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let (network, from, to) = (self.network.clone(), self.from.clone(), peer.clone());
        async move {
            let res = client
                .request_vote(req)
                .await
                .map_err(|err| TransportError::Remote(err.to_string()))?;
            // the link may have been cut while the request was in flight
            if !network.reachable(&from, &to) {
                return Err(TransportError::Unreachable(to));
            }
            Ok(res)
        }
        .boxed()
    }

    fn append_entries(
        &self,
        peer: &NodeId,
        req: AppendRequest,
    ) -> BoxFuture<'static, Result<AppendResponse, TransportError>> {
        let client = match self.network.route(&self.from, peer) {
            Ok(client) => client,
            Err(err) => return future::ready(Err(err)).boxed(),
        };
        let (network, from, to) = (self.network.clone(), self.from.clone(), peer.clone());
        async move {
            let res = client
                .append_entries(req)
                .await
                .map_err(|err| TransportError::Remote(err.to_string()))?;
            if !network.reachable(&from, &to) {
                return Err(TransportError::Unreachable(to));
            }
            Ok(res)
        }
        .boxed()
    }
}
