use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::oneshot;

use crate::error::Result;
use crate::raft::rpc::{AppendRequest, AppendResponse, VoteRequest, VoteResponse};
use crate::raft::{Command, Entry, LogIndex, NodeId, Status};

/// A cheap, cloneable handle that submits commands into a node's event loop. Every call fails
/// with [`RaftError::Stopped`](crate::error::RaftError::Stopped) once the node is gone.
#[derive(Clone, Debug)]
pub struct RaftClient {
    id: NodeId,
    request_tx: UnboundedSender<Command>,
}

impl RaftClient {
    /// Creates a new Raft client.
    pub(crate) fn new(id: NodeId, request_tx: UnboundedSender<Command>) -> Self {
        Self { id, request_tx }
    }

    /// The id of the node this client talks to.
    pub fn id(&self) -> &NodeId {
        &self.id
    }

    /// Executes a request against the node's event loop.
    async fn request<T>(&self, build: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.request_tx.send(build(response_tx))?;
        Ok(response_rx.await?)
    }

    /// Proposes a command for replication. Resolves with the command's index once it is
    /// committed and applied on this node, or fails with `NotLeader`.
    pub async fn propose(&self, command: Vec<u8>) -> Result<LogIndex> {
        self.request(|reply| Command::Propose { command, reply })
            .await?
    }

    pub async fn request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        self.request(|reply| Command::VoteRequest { req, reply })
            .await
    }

    pub async fn append_entries(&self, req: AppendRequest) -> Result<AppendResponse> {
        self.request(|reply| Command::AppendEntries { req, reply })
            .await
    }

    pub async fn status(&self) -> Result<Status> {
        self.request(|reply| Command::State { reply }).await
    }

    /// The node's whole log.
    pub async fn entries(&self) -> Result<Vec<Entry>> {
        self.request(|reply| Command::Entries { reply }).await?
    }
}
