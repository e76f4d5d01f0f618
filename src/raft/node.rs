use std::sync::Arc;

use futures::future::RemoteHandle;
use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::error::{RaftError, Result};
use crate::raft::client::RaftClient;
use crate::raft::config::RaftConfig;
use crate::raft::fsm::{ApplyCallback, StateChangeCallback};
use crate::raft::log::Log;
use crate::raft::rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::raft::server::Server;
use crate::raft::store::Store;
use crate::raft::transport::Transport;
use crate::raft::{Command, LogIndex, NodeId, Status};
use crate::util::Shutdown;

/// Collaborators held until the node is started.
struct Setup {
    store: Box<dyn Store>,
    transport: Arc<dyn Transport>,
    apply: Box<dyn ApplyCallback>,
    on_state_change: Box<dyn StateChangeCallback>,
    request_rx: UnboundedReceiver<Command>,
}

/// Owner of one raft node. The node runs as a background task between [`RaftNode::start`] and
/// [`RaftNode::stop`]; everything else goes through a [`RaftClient`], which may be cloned and
/// handed to transports and lock instances.
pub struct RaftNode {
    id: NodeId,
    config: RaftConfig,
    client: RaftClient,
    setup: Option<Setup>,
    shutdown: Shutdown,
    handle: Option<RemoteHandle<Result<()>>>,
    stopped: bool,
}

impl RaftNode {
    pub fn new(
        config: RaftConfig,
        store: Box<dyn Store>,
        transport: Arc<dyn Transport>,
        apply: impl ApplyCallback,
        on_state_change: impl StateChangeCallback,
    ) -> Result<RaftNode> {
        config.validate().map_err(|err| RaftError::Config {
            file_path: String::new(),
            error_msg: err.to_string(),
        })?;

        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let id = config.id.clone();
        Ok(RaftNode {
            client: RaftClient::new(id.clone(), request_tx),
            id,
            config,
            setup: Some(Setup {
                store,
                transport,
                apply: Box::new(apply),
                on_state_change: Box::new(on_state_change),
                request_rx,
            }),
            shutdown: Shutdown::new(),
            handle: None,
            stopped: false,
        })
    }

    pub fn id(&self) -> &NodeId {
        &self.id
    }

    pub fn client(&self) -> RaftClient {
        self.client.clone()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Start the node as a follower with a fresh election timer. Starting a running node does
    /// nothing; a stopped node can't be restarted.
    pub fn start(&mut self) -> Result<()> {
        if self.stopped {
            return Err(RaftError::Stopped);
        }
        let setup = match self.setup.take() {
            Some(setup) => setup,
            None => return Ok(()),
        };

        let log = Log::new(setup.store)?;
        let server = Server {
            config: self.config.clone(),
            log,
            transport: setup.transport,
            apply: setup.apply,
            on_state_change: setup.on_state_change,
            request_rx: setup.request_rx,
        };
        self.handle = Some(server.spawn(&self.shutdown)?);
        tracing::info!(id = %self.id, "raft node started");
        Ok(())
    }

    /// Stop the node and wait for its tasks to finish. Responses still in flight are dropped.
    /// Stopping twice is a no-op.
    pub async fn stop(&mut self) -> Result<()> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        self.setup = None;
        self.shutdown.shutdown();

        match self.handle.take() {
            Some(handle) => match handle.await {
                Ok(()) | Err(RaftError::Stopped) => Ok(()),
                Err(err) => Err(err),
            },
            None => Ok(()),
        }
    }

    /// Wait until the node stops because of a fatal error. Dropping the returned future leaves
    /// the node running, so it can be raced against a shutdown signal and then stopped.
    pub async fn wait(&mut self) -> Result<()> {
        let res = match self.handle.as_mut() {
            Some(handle) => handle.await,
            None => return Ok(()),
        };
        self.handle = None;
        self.stopped = true;
        res
    }

    pub async fn propose(&self, command: Vec<u8>) -> Result<LogIndex> {
        self.client.propose(command).await
    }

    pub async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.client.request_vote(req).await
    }

    pub async fn handle_append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        self.client.append_entries(req).await
    }

    pub async fn state(&self) -> Result<Status> {
        self.client.status().await
    }
}

impl Drop for RaftNode {
    fn drop(&mut self) {
        self.shutdown.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use crate::error::RaftError;
    use crate::raft::config::RaftConfig;
    use crate::raft::store::MemoryStore;
    use crate::raft::transport::MemoryNetwork;
    use crate::raft::{LogIndex, RaftNode, RaftRole, Term};

    fn single_node(
        applied: Arc<Mutex<Vec<(LogIndex, Vec<u8>)>>>,
        roles: Arc<Mutex<Vec<(RaftRole, Term)>>>,
    ) -> RaftNode {
        let network = MemoryNetwork::new();
        let node = RaftNode::new(
            RaftConfig::default(),
            Box::new(MemoryStore::new()),
            Arc::new(network.transport("node-1")),
            move |index: LogIndex, command: &[u8]| {
                applied.lock().unwrap().push((index, command.to_vec()))
            },
            move |role: RaftRole, term: Term| roles.lock().unwrap().push((role, term)),
        )
        .unwrap();
        network.register(node.client());
        node
    }

    async fn wait_for_leader(node: &RaftNode) {
        for _ in 0..100 {
            if node.state().await.unwrap().role == RaftRole::Leader {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("node was never elected");
    }

    #[tokio::test]
    #[tracing_test::traced_test]
    async fn single_node_commits_proposals() {
        let applied = Arc::new(Mutex::new(vec![]));
        let roles = Arc::new(Mutex::new(vec![]));
        let mut node = single_node(applied.clone(), roles.clone());
        node.start().unwrap();
        wait_for_leader(&node).await;

        assert_eq!(node.propose(b"x=1".to_vec()).await.unwrap(), 1);
        assert_eq!(node.propose(b"x=2".to_vec()).await.unwrap(), 2);
        assert_eq!(
            *applied.lock().unwrap(),
            vec![(1, b"x=1".to_vec()), (2, b"x=2".to_vec())]
        );

        let state = node.state().await.unwrap();
        assert_eq!(state.commit_index, 2);
        assert_eq!(state.last_applied, 2);
        assert!(state.peers.is_empty());
        assert_eq!(
            *roles.lock().unwrap(),
            vec![(RaftRole::Candidate, 1), (RaftRole::Leader, 1)]
        );

        node.stop().await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let mut node = single_node(Arc::default(), Arc::default());
        node.start().unwrap();
        // starting twice is harmless
        node.start().unwrap();
        node.stop().await.unwrap();
        node.stop().await.unwrap();

        assert_eq!(node.start(), Err(RaftError::Stopped));
        assert_eq!(node.state().await.unwrap_err(), RaftError::Stopped);
    }

    #[tokio::test]
    async fn abandoned_wait_leaves_node_running() {
        let applied = Arc::new(Mutex::new(vec![]));
        let mut node = single_node(applied.clone(), Arc::default());
        node.start().unwrap();
        wait_for_leader(&node).await;

        let res = tokio::time::timeout(Duration::from_millis(50), node.wait()).await;
        assert!(res.is_err());
        assert!(node.is_running());
        assert_eq!(node.propose(b"x=1".to_vec()).await.unwrap(), 1);

        node.stop().await.unwrap();
        assert!(!node.is_running());
        assert_eq!(node.state().await.unwrap_err(), RaftError::Stopped);
    }

    #[tokio::test]
    async fn stop_before_start() {
        let mut node = single_node(Arc::default(), Arc::default());
        node.stop().await.unwrap();
        assert_eq!(
            node.propose(b"x=1".to_vec()).await.unwrap_err(),
            RaftError::Stopped
        );
    }

    #[test]
    fn rejects_invalid_config() {
        let config = RaftConfig {
            heartbeat_interval_ms: 500,
            ..Default::default()
        };
        let res = RaftNode::new(
            config,
            Box::new(MemoryStore::new()),
            Arc::new(MemoryNetwork::new().transport("node-1")),
            |_: LogIndex, _: &[u8]| {},
            |_: RaftRole, _: Term| {},
        );
        assert!(matches!(res, Err(RaftError::Config { .. })));
    }
}
