use crate::raft::{Entry, LogIndex, NodeId, Status, Term};

/// Sent by candidates to gather votes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteRequest {
    /// The term of the candidate.
    pub term: Term,
    /// The id of the candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoteResponse {
    /// The voter's current term.
    pub term: Term,
    /// Whether the vote was granted to the candidate.
    pub granted: bool,
}

/// Sent by the leader to replicate entries. Also used as a heartbeat when empty.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendRequest {
    pub term: Term,
    pub leader_id: NodeId,
    /// The index of the entry immediately preceding `entries`.
    pub prev_log_index: LogIndex,
    /// The term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    pub entries: Vec<Entry>,
    /// The leader's commit index.
    pub leader_commit: LogIndex,
}

impl AppendRequest {
    /// Whether `entries` directly follow `prev_log_index` with consecutive indices.
    pub fn is_contiguous(&self) -> bool {
        self.entries
            .iter()
            .zip(1..)
            .all(|(entry, offset)| Some(entry.index) == self.prev_log_index.checked_add(offset))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AppendResponse {
    pub term: Term,
    pub success: bool,
    /// On success, the index up to which the follower's log matches the leader's. On failure,
    /// the follower's last log index, which the leader uses to skip ahead when backing off.
    pub last_index: LogIndex,
}

/// A request between peers, or from a client to the node it is connected to.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Request {
    Vote(VoteRequest),
    Append(AppendRequest),
    /// Replicate a command. Only the leader accepts proposals.
    Propose(Vec<u8>),
    Status,
    Acquire {
        lock_name: String,
        holder: String,
        timeout_ms: u64,
    },
    Release {
        lock_name: String,
        holder: String,
        timeout_ms: u64,
    },
    /// Read the holder of a lock from the node's local projection.
    Holder { lock_name: String },
}

impl Request {
    /// Whether this is raft traffic between peers rather than a client request.
    pub fn is_peer(&self) -> bool {
        matches!(self, Request::Vote(_) | Request::Append(_))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum Response {
    Vote(VoteResponse),
    Append(AppendResponse),
    /// The index a proposal was committed and applied at.
    Proposed(LogIndex),
    Status(Status),
    /// Whether an acquire or release took effect.
    Lock(bool),
    Holder(Option<NodeId>),
    /// The request must go to the leader, if one is known.
    NotLeader(Option<NodeId>),
    /// The request did not complete in time. It may still take effect.
    Timeout,
    /// The node could not serve the request.
    Error(String),
}

#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum Address {
    /// Broadcast to all peers.
    Peers,
    /// A remote peer.
    Peer(NodeId),
}

/// An outbound request produced by the state machine.
#[derive(Clone, Debug, PartialEq)]
pub struct Message {
    pub from: NodeId,
    pub to: Address,
    pub request: Request,
}

impl Message {
    pub fn new(from: NodeId, to: Address, request: Request) -> Message {
        Message { from, to, request }
    }
}
