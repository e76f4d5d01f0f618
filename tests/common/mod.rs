//! An in-process cluster wired over a `MemoryNetwork`, with the applied commands and role
//! transitions of every node recorded for assertions.

#![allow(dead_code)]

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use raftlock::lock::LockTable;
use raftlock::raft::config::RaftConfig;
use raftlock::raft::fsm::ApplyCallback;
use raftlock::raft::store::{MemoryStore, Store};
use raftlock::raft::transport::MemoryNetwork;
use raftlock::raft::{LogIndex, Node, NodeId, RaftClient, RaftNode, RaftRole, Status, Term};

pub type Applied = Arc<Mutex<Vec<(LogIndex, Vec<u8>)>>>;
pub type Transitions = Arc<Mutex<Vec<(RaftRole, Term)>>>;

pub fn node_ids(size: usize) -> Vec<NodeId> {
    (1..=size).map(|i| format!("node-{}", i)).collect()
}

/// Config for `id` in a cluster of `ids`. Peer addresses are only used by TCP transports.
pub fn test_config(id: &str, ids: &[NodeId]) -> RaftConfig {
    RaftConfig {
        id: id.to_string(),
        nodes: ids
            .iter()
            .enumerate()
            .filter(|(_, peer)| peer.as_str() != id)
            .map(|(i, peer)| Node {
                id: peer.clone(),
                addr: format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
            })
            .collect(),
        ..Default::default()
    }
}

/// A node along with everything its callbacks observed.
pub struct TestNode {
    pub node: RaftNode,
    pub applied: Applied,
    pub transitions: Transitions,
    pub locks: LockTable,
}

impl TestNode {
    pub fn new(config: RaftConfig, store: Box<dyn Store>, network: &MemoryNetwork) -> Self {
        let applied = Applied::default();
        let transitions = Transitions::default();
        let locks = LockTable::new();

        let apply = {
            let applied = applied.clone();
            let mut locks = locks.clone();
            move |index: LogIndex, command: &[u8]| {
                applied.lock().unwrap().push((index, command.to_vec()));
                locks.apply(index, command);
            }
        };
        let on_state_change = {
            let transitions = transitions.clone();
            move |role: RaftRole, term: Term| transitions.lock().unwrap().push((role, term))
        };

        let transport = Arc::new(network.transport(config.id.clone()));
        let node = RaftNode::new(config, store, transport, apply, on_state_change).unwrap();
        network.register(node.client());
        TestNode {
            node,
            applied,
            transitions,
            locks,
        }
    }

    pub fn id(&self) -> &NodeId {
        self.node.id()
    }

    pub fn client(&self) -> RaftClient {
        self.node.client()
    }

    pub fn applied(&self) -> Vec<(LogIndex, Vec<u8>)> {
        self.applied.lock().unwrap().clone()
    }

    pub fn transitions(&self) -> Vec<(RaftRole, Term)> {
        self.transitions.lock().unwrap().clone()
    }

    pub fn has_applied(&self, index: LogIndex, command: &[u8]) -> bool {
        self.applied
            .lock()
            .unwrap()
            .iter()
            .any(|(i, c)| *i == index && c == command)
    }
}

pub struct TestCluster {
    pub network: MemoryNetwork,
    pub nodes: HashMap<NodeId, TestNode>,
}

impl TestCluster {
    /// Create a cluster of `size` nodes with in-memory storage. Nodes aren't started yet.
    pub fn new(size: usize) -> Self {
        let network = MemoryNetwork::new();
        let ids = node_ids(size);
        let nodes = ids
            .iter()
            .map(|id| {
                let store = Box::new(MemoryStore::new());
                let node = TestNode::new(test_config(id, &ids), store, &network);
                (id.clone(), node)
            })
            .collect();
        TestCluster { network, nodes }
    }

    /// Create and start a cluster.
    pub fn start(size: usize) -> Self {
        let mut cluster = TestCluster::new(size);
        for node in cluster.nodes.values_mut() {
            node.node.start().unwrap();
        }
        cluster
    }

    pub async fn shutdown(&mut self) {
        for node in self.nodes.values_mut() {
            node.node.stop().await.unwrap();
        }
    }

    pub fn node(&self, id: &str) -> &TestNode {
        &self.nodes[id]
    }

    pub fn ids(&self) -> Vec<NodeId> {
        let mut ids: Vec<_> = self.nodes.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn status(&self, id: &str) -> Status {
        self.node(id).node.state().await.unwrap()
    }

    pub async fn statuses(&self) -> Vec<Status> {
        let mut statuses = vec![];
        for id in self.ids() {
            statuses.push(self.status(&id).await);
        }
        statuses
    }

    /// Wait for a leader among `group`, returning the latest if more than one believes itself
    /// leader. Stale leaders outside `group` are ignored.
    pub async fn wait_for_leader_in(&self, group: &[NodeId], timeout: Duration) -> Option<Status> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            let mut leader: Option<Status> = None;
            for id in group {
                let status = self.status(id).await;
                if status.role == RaftRole::Leader
                    && leader.as_ref().map_or(true, |l| status.term > l.term)
                {
                    leader = Some(status);
                }
            }
            if leader.is_some() {
                return leader;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    pub async fn wait_for_leader(&self) -> Status {
        self.wait_for_leader_in(&self.ids(), Duration::from_secs(5))
            .await
            .expect("no leader was elected")
    }

    /// Every recorded leader transition, as (term, node).
    pub fn leader_terms(&self) -> Vec<(Term, NodeId)> {
        let mut terms = vec![];
        for (id, node) in &self.nodes {
            for (role, term) in node.transitions() {
                if role == RaftRole::Leader {
                    terms.push((term, id.clone()));
                }
            }
        }
        terms.sort();
        terms
    }
}

/// Poll `condition` until it holds, failing the test after `timeout`.
pub async fn eventually<F, Fut>(what: &str, timeout: Duration, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

/// Propose `command` to whichever node currently leads, retrying across leadership changes.
pub async fn propose(cluster: &TestCluster, command: &[u8]) -> LogIndex {
    for _ in 0..50 {
        let leader = cluster.wait_for_leader().await;
        let client = cluster.node(&leader.id).client();
        match tokio::time::timeout(Duration::from_secs(1), client.propose(command.to_vec())).await {
            Ok(Ok(index)) => return index,
            _ => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
    panic!("no leader accepted {:?}", String::from_utf8_lossy(command));
}
