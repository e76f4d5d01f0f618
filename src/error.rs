use derive_more::Display;

use crate::raft::transport::TransportError;
use crate::raft::NodeId;

pub type Result<T> = std::result::Result<T, RaftError>;

#[derive(Debug, Display, Clone, PartialEq)]
pub enum RaftError {
    /// The request must be served by the leader. Carries the leader of the current term if known.
    #[display(fmt = "not the leader (leader: {:?})", _0)]
    NotLeader(Option<NodeId>),
    #[display(fmt = "raft node is stopped")]
    Stopped,
    #[display(fmt = "operation timed out")]
    Timeout,
    #[display(fmt = "transport error: {}", _0)]
    Transport(TransportError),
    /// Failure reading or writing persistent state. Fatal to the node.
    #[display(fmt = "storage error: {}", error_msg)]
    Storage { error_msg: String },
    #[display(fmt = "config error in {}: {}", file_path, error_msg)]
    Config { file_path: String, error_msg: String },
    #[display(fmt = "internal error: {}", error_msg)]
    Internal { error_msg: String },
}

impl std::error::Error for RaftError {}

impl From<TransportError> for RaftError {
    fn from(err: TransportError) -> Self {
        RaftError::Transport(err)
    }
}

impl From<sled::Error> for RaftError {
    fn from(err: sled::Error) -> Self {
        RaftError::Storage {
            error_msg: err.to_string(),
        }
    }
}

impl From<Box<bincode::ErrorKind>> for RaftError {
    fn from(err: Box<bincode::ErrorKind>) -> Self {
        RaftError::Storage {
            error_msg: err.to_string(),
        }
    }
}

impl From<std::io::Error> for RaftError {
    fn from(err: std::io::Error) -> Self {
        RaftError::Internal {
            error_msg: err.to_string(),
        }
    }
}

impl From<serde_json::error::Error> for RaftError {
    fn from(err: serde_json::error::Error) -> Self {
        RaftError::Internal {
            error_msg: err.to_string(),
        }
    }
}

impl From<tokio::task::JoinError> for RaftError {
    fn from(err: tokio::task::JoinError) -> Self {
        RaftError::Internal {
            error_msg: err.to_string(),
        }
    }
}

impl From<tokio::time::error::Elapsed> for RaftError {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        RaftError::Timeout
    }
}

// A dropped reply channel means the event loop has gone away.
impl From<tokio::sync::oneshot::error::RecvError> for RaftError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        RaftError::Stopped
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for RaftError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        RaftError::Stopped
    }
}
