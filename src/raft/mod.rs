//! This implementation of the [Raft](raft.github.io) consensus algorithm is used to replicate a
//! log of opaque commands across a small, fixed cluster. Raft elects a leader that coordinates
//! replication and ensures each entry is stored on a quorum of nodes before it is applied to the
//! local state machine.
//!
//! The state machine is a typestate: [`Raft<Follower>`], [`Raft<Candidate>`] and
//! [`Raft<Leader>`] each implement [`Apply`], and applying a [`Command`] consumes the instance and
//! yields whichever role follows. A single event loop owns the instance, so every RPC, timer
//! expiry and client proposal is serialized through it. Outbound RPCs and entries ready to be
//! applied leave the state machine over channels and are handled by the event loop and the
//! fsm driver respectively.

use std::fmt;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::time::SystemTime;

use derive_more::Display;
use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{RaftError, Result};
use crate::raft::candidate::Candidate;
use crate::raft::config::RaftConfig;
use crate::raft::follower::Follower;
use crate::raft::fsm::Instruction;
use crate::raft::leader::Leader;
use crate::raft::log::Log;
use crate::raft::rpc::{
    Address, AppendRequest, AppendResponse, Message, Request, VoteRequest, VoteResponse,
};

mod candidate;
pub mod client;
pub mod config;
mod election;
mod follower;
pub mod fsm;
mod leader;
pub mod log;
pub mod node;
mod progress;
pub mod rpc;
mod server;
pub mod store;
pub mod tcp;
mod timer;
pub mod transport;

#[cfg(test)]
mod test;

pub use client::RaftClient;
pub use node::RaftNode;

/// A unique id that identifies an instance of Raft within the cluster.
pub type NodeId = String;

/// A term serves as a logical clock that increases monotonically when a new election begins.
pub type Term = u64;
/// Each entry has an index in the log, which with the term, describes the unique position of an entry in the log.
pub type LogIndex = u64;

/// Channel over which the state machine answers a request.
pub type Reply<T> = oneshot::Sender<T>;

/// Commands that can be applied to the state machine.
#[derive(Debug)]
pub enum Command {
    /// The election timer expired.
    Timeout,
    /// The heartbeat timer expired.
    Heartbeat,
    /// Request that this instance vote for a candidate.
    VoteRequest {
        req: VoteRequest,
        reply: Reply<VoteResponse>,
    },
    /// A peer answered our vote request.
    VoteResponse { from: NodeId, res: VoteResponse },
    /// Request from the leader to append entries to our log.
    AppendEntries {
        req: AppendRequest,
        reply: Reply<AppendResponse>,
    },
    /// A peer answered our append request.
    AppendResponse {
        /// The id of the responding node.
        from: NodeId,
        /// The index preceding the entries that were sent.
        prev_log_index: LogIndex,
        /// How many entries were sent.
        entries: u64,
        res: AppendResponse,
    },
    /// Propose a command for replication. Answered once the command is applied locally.
    Propose {
        command: Vec<u8>,
        reply: Reply<Result<LogIndex>>,
    },
    /// Read the current status of the node.
    State { reply: Reply<Status> },
    /// Read every entry of the local log.
    Entries { reply: Reply<Result<Vec<Entry>>> },
}

impl Command {
    /// The term carried by a peer's request or response, if any.
    pub fn term(&self) -> Option<Term> {
        match self {
            Command::VoteRequest { req, .. } => Some(req.term),
            Command::VoteResponse { res, .. } => Some(res.term),
            Command::AppendEntries { req, .. } => Some(req.term),
            Command::AppendResponse { res, .. } => Some(res.term),
            _ => None,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Shared behavior that all roles of the state machine must implement.
pub trait Role: Debug {
    fn role(&self) -> RaftRole;

    /// When the election timer fires, if it is running in this role.
    fn election_deadline(&self) -> Option<Instant> {
        None
    }

    /// When the heartbeat timer fires, if it is running in this role.
    fn heartbeat_deadline(&self) -> Option<Instant> {
        None
    }
}

/// An entry in the replicated log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// The term of the leader that created the entry.
    pub term: Term,
    /// The index of the entry within the log, starting at 1.
    pub index: LogIndex,
    /// The opaque command to hand to the state machine.
    pub command: Vec<u8>,
    pub timestamp: SystemTime,
}

/// Contains information about nodes in raft cluster.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Node {
    /// The id of the node.
    pub id: NodeId,
    /// The socket address for the TCP connection.
    pub addr: SocketAddr,
}

/// The part of [`State`] that must survive restarts.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: Term,
    pub voted_for: Option<NodeId>,
}

/// Volatile and persistent state that is common to all roles.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct State {
    /// The current term of the state machine. It never decreases, and a node that sees a
    /// higher term in any request or response adopts it and returns to follower.
    pub current_term: Term,
    /// Who the node has voted for in the current term.
    pub voted_for: Option<NodeId>,
    /// Highest index known to be stored on a quorum.
    pub commit_index: LogIndex,
    /// Highest index handed to the state machine.
    pub last_applied: LogIndex,
}

#[derive(Clone, Copy, Debug, Display, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

/// A point in time snapshot of a node, for diagnostics and tests.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub id: NodeId,
    pub role: RaftRole,
    pub term: Term,
    pub voted_for: Option<NodeId>,
    /// The leader of the current term, if known.
    pub leader: Option<NodeId>,
    pub commit_index: LogIndex,
    pub last_applied: LogIndex,
    pub last_log_index: LogIndex,
    pub peers: Vec<NodeId>,
}

/// The primary struct representing the state machine. Contains fields common all roles.
pub struct Raft<T: Role> {
    /// The identifier for this node.
    pub id: NodeId,
    /// Configuration for this instance.
    pub config: RaftConfig,
    /// Volatile and persistent state for the state machine. Note that specific additional per-role
    /// state may be contained in that role.
    pub state: State,
    /// An instance containing role specific state and behavior.
    pub role: T,
    /// The replicated log, backed by persistent storage.
    pub log: Log,
    /// Channel to send messages to other nodes.
    pub rpc_tx: UnboundedSender<Message>,
    /// Channel to send entries to fsm driver.
    pub fsm_tx: UnboundedSender<Instruction>,
}

impl<T: Role> Debug for Raft<T> {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Raft {{ id: {}, role: {:?}, state: {:?}, log: {:?} }}",
            self.id, self.role, self.state, self.log
        )
    }
}

// Base methods for general operations (+ debugging and testing).
impl<T: Role> Raft<T> {
    /// Adopt a newer term, clearing the vote. Persisted before returning.
    pub fn term(&mut self, term: Term) -> Result<()> {
        tracing::debug!(id = %self.id, from = self.state.current_term, to = term, "adopting term");
        self.state.current_term = term;
        self.state.voted_for = None;
        self.persist()
    }

    /// Write the current term and vote through to storage.
    pub fn persist(&mut self) -> Result<()> {
        self.log.save_hard_state(HardState {
            current_term: self.state.current_term,
            voted_for: self.state.voted_for.clone(),
        })
    }

    pub fn peers(&self) -> Vec<NodeId> {
        self.config.peers()
    }

    /// All members of the cluster, including this node.
    pub fn voters(&self) -> Vec<NodeId> {
        let mut voters = self.peers();
        voters.push(self.id.clone());
        voters
    }

    pub fn log_command(&self, cmd: &Command) {
        match cmd {
            Command::Heartbeat => {}
            Command::State { .. } | Command::Entries { .. } => {}
            Command::AppendEntries { req, .. } if req.entries.is_empty() => {}
            Command::AppendResponse { entries: 0, .. } => {}
            _ => tracing::trace!(id = %self.id, "start command {}", cmd),
        };
    }

    pub fn send(&self, to: Address, request: Request) -> Result<()> {
        let msg = Message::new(self.id.clone(), to, request);
        self.rpc_tx.send(msg).map_err(RaftError::from)?;
        Ok(())
    }

    pub fn send_all(&self, request: Request) -> Result<()> {
        self.send(Address::Peers, request)
    }

    /// Report the current role and term to the state change callback.
    pub fn notify_role(&self) -> Result<()> {
        self.fsm_tx.send(Instruction::StateChange {
            role: self.role.role(),
            term: self.state.current_term,
        })?;
        Ok(())
    }

    /// Hand every committed but unapplied entry to the fsm driver, in order.
    pub fn apply_committed(&mut self) -> Result<()> {
        while self.state.last_applied < self.state.commit_index {
            let index = self.state.last_applied + 1;
            let entry = self.log.get(index)?.ok_or_else(|| RaftError::Internal {
                error_msg: format!("committed entry {} missing from log", index),
            })?;
            self.fsm_tx.send(Instruction::Apply { entry })?;
            self.state.last_applied = index;
        }
        Ok(())
    }

    /// Raise the commit index, never lowering it, and apply what became committed.
    pub fn advance_commit(&mut self, index: LogIndex) -> Result<()> {
        if index > self.state.commit_index {
            tracing::debug!(id = %self.id, from = self.state.commit_index, to = index, "commit");
            self.state.commit_index = index;
            self.apply_committed()?;
        }
        Ok(())
    }

    fn status(&self, leader: Option<NodeId>) -> Status {
        Status {
            id: self.id.clone(),
            role: self.role.role(),
            term: self.state.current_term,
            voted_for: self.state.voted_for.clone(),
            leader,
            commit_index: self.state.commit_index,
            last_applied: self.state.last_applied,
            last_log_index: self.log.last_index(),
            peers: self.peers(),
        }
    }
}

/// Handle to some variant of the state machine. Commands should always be dispatched to the
/// state machine via [`Apply`]. The concrete variant of the state machine should not be matched
/// on directly, as state transitions are handled entirely by the roles.
// Since applying command to the state machine can potentially result in any state transition,
// the result that we get back needs to be general to the possible return types -- easiest
// way here is just to store the differently sized structs per state in an enum, which will be
// sized to the largest variant.
#[derive(Debug)]
pub enum RaftHandle {
    /// An instance of the state machine in the follower role.
    Follower(Raft<Follower>),
    /// An instance of the state machine in the candidate role.
    Candidate(Raft<Candidate>),
    /// An instance of the state machine in the leader role.
    Leader(Raft<Leader>),
}

impl RaftHandle {
    /// Obtain a new instance of raft initialized in the follower state, restoring the term and
    /// vote from the log's storage.
    pub fn new(
        config: RaftConfig,
        log: Log,
        rpc_tx: UnboundedSender<Message>,
        fsm_tx: UnboundedSender<Instruction>,
    ) -> Result<RaftHandle> {
        let raft = Raft::new(config, log, rpc_tx, fsm_tx)?;
        Ok(RaftHandle::Follower(raft))
    }

    pub fn is_follower(&self) -> bool {
        matches!(self, Self::Follower(_))
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, Self::Candidate(_))
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Self::Leader(_))
    }

    pub fn role(&self) -> RaftRole {
        match self {
            RaftHandle::Follower(raft) => raft.role.role(),
            RaftHandle::Candidate(raft) => raft.role.role(),
            RaftHandle::Leader(raft) => raft.role.role(),
        }
    }

    pub fn election_deadline(&self) -> Option<Instant> {
        match self {
            RaftHandle::Follower(raft) => raft.role.election_deadline(),
            RaftHandle::Candidate(raft) => raft.role.election_deadline(),
            RaftHandle::Leader(raft) => raft.role.election_deadline(),
        }
    }

    pub fn heartbeat_deadline(&self) -> Option<Instant> {
        match self {
            RaftHandle::Follower(raft) => raft.role.heartbeat_deadline(),
            RaftHandle::Candidate(raft) => raft.role.heartbeat_deadline(),
            RaftHandle::Leader(raft) => raft.role.heartbeat_deadline(),
        }
    }

    pub fn status(&self) -> Status {
        match self {
            RaftHandle::Follower(raft) => raft.status(raft.role.leader_id.clone()),
            RaftHandle::Candidate(raft) => raft.status(None),
            RaftHandle::Leader(raft) => raft.status(Some(raft.id.clone())),
        }
    }

    pub fn entries(&self) -> Result<Vec<Entry>> {
        match self {
            RaftHandle::Follower(raft) => raft.log.entries(),
            RaftHandle::Candidate(raft) => raft.log.entries(),
            RaftHandle::Leader(raft) => raft.log.entries(),
        }
    }
}

impl Apply for RaftHandle {
    fn apply(self, cmd: Command) -> Result<RaftHandle> {
        match cmd {
            // reads are answered the same way in every role
            Command::State { reply } => {
                let _ = reply.send(self.status());
                Ok(self)
            }
            Command::Entries { reply } => {
                let _ = reply.send(self.entries());
                Ok(self)
            }
            cmd => match self {
                RaftHandle::Follower(raft) => raft.apply(cmd),
                RaftHandle::Candidate(raft) => raft.apply(cmd),
                RaftHandle::Leader(raft) => raft.apply(cmd),
            },
        }
    }
}

/// Applying a command is the basic way the state machine is moved forward. Each role implements
/// trait to handle how it responds (or does not respond) to particular commands.
pub trait Apply {
    /// Apply a command to the raft state machine, which may result in a new raft state. Errors
    /// should occur for only truly exceptional conditions, such as a failure to persist state,
    /// and are provided to allow the wrapping server containing this state machine to shut down.
    fn apply(self, cmd: Command) -> Result<RaftHandle>;
}
