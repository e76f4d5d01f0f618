use std::time::SystemTime;

use tokio::sync::mpsc::{self, UnboundedReceiver};

use crate::raft::candidate::Candidate;
use crate::raft::config::RaftConfig;
use crate::raft::follower::Follower;
use crate::raft::fsm::Instruction;
use crate::raft::leader::Leader;
use crate::raft::log::Log;
use crate::raft::rpc::{Message, VoteResponse};
use crate::raft::store::MemoryStore;
use crate::raft::{Apply, Command, Entry, LogIndex, Node, Raft, RaftHandle, Term};

pub(crate) type Receivers = (UnboundedReceiver<Message>, UnboundedReceiver<Instruction>);

pub(crate) fn config(peers: &[&str]) -> RaftConfig {
    RaftConfig {
        id: "node-1".to_string(),
        nodes: peers
            .iter()
            .enumerate()
            .map(|(i, id)| Node {
                id: id.to_string(),
                addr: format!("127.0.0.1:{}", 7000 + i).parse().unwrap(),
            })
            .collect(),
        ..Default::default()
    }
}

pub(crate) fn entry(term: Term, index: LogIndex, command: &str) -> Entry {
    Entry {
        term,
        index,
        command: command.as_bytes().to_vec(),
        timestamp: SystemTime::now(),
    }
}

/// A follower in a single node cluster.
pub(crate) fn new_follower() -> (Receivers, Raft<Follower>) {
    new_follower_with_peers(&[])
}

pub(crate) fn new_follower_with_peers(peers: &[&str]) -> (Receivers, Raft<Follower>) {
    let log = Log::new(Box::new(MemoryStore::new())).unwrap();
    let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
    let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
    (
        (rpc_rx, fsm_rx),
        Raft::new(config(peers), log, rpc_tx, fsm_tx).unwrap(),
    )
}

/// A candidate in term 1 that has voted for itself.
pub(crate) fn candidate(peers: &[&str]) -> (Receivers, Raft<Candidate>) {
    let (receivers, follower) = new_follower_with_peers(peers);
    match follower.apply(Command::Timeout).unwrap() {
        RaftHandle::Candidate(candidate) => (receivers, candidate),
        node => panic!("expected candidate, got {:?}", node),
    }
}

/// A leader of term 1, elected with the vote of the first peer.
pub(crate) fn leader(peers: &[&str]) -> (Receivers, Raft<Leader>) {
    let (receivers, candidate) = candidate(peers);
    let vote = Command::VoteResponse {
        from: peers[0].to_string(),
        res: VoteResponse {
            term: 1,
            granted: true,
        },
    };
    match candidate.apply(vote).unwrap() {
        RaftHandle::Leader(leader) => (receivers, leader),
        node => panic!("expected leader, got {:?}", node),
    }
}

pub(crate) fn drain_requests(rpc_rx: &mut UnboundedReceiver<Message>) -> Vec<Message> {
    let mut messages = vec![];
    while let Ok(msg) = rpc_rx.try_recv() {
        messages.push(msg);
    }
    messages
}
