pub mod config;
pub mod error;
pub mod lock;
pub mod logger;
pub mod raft;
pub mod util;

use std::sync::Arc;

use futures::FutureExt;
use tokio::net::TcpListener;

use crate::config::RaftlockConfig;
use crate::error::Result;
use crate::lock::LockTable;
use crate::raft::store::SledStore;
use crate::raft::tcp::{self, TcpTransport};
use crate::raft::{RaftNode, RaftRole, Term};
use crate::util::Shutdown;

#[macro_use]
extern crate serde_derive;

/// Run a node over TCP with its state in sled, applying lock commands to a [`LockTable`], until
/// `shutdown` fires. Peers and clients share the listener.
pub async fn run(config: RaftlockConfig, mut shutdown: Shutdown) -> Result<()> {
    let raft = config.raft;
    let store = SledStore::open(&raft.data_directory)?;
    let transport = TcpTransport::new(&raft.nodes);
    let id = raft.id.clone();
    let locks = LockTable::new();
    let mut node = RaftNode::new(
        raft.clone(),
        Box::new(store),
        Arc::new(transport),
        locks.clone(),
        move |role: RaftRole, term: Term| tracing::info!(%id, %role, term, "role changed"),
    )?;

    let listener = TcpListener::bind(raft.addr()).await?;
    tracing::info!(id = %raft.id, addr = %raft.addr(), "listening");
    let (task, receive) =
        tcp::receive_task(shutdown.clone(), listener, node.client(), locks).remote_handle();
    tokio::spawn(task);

    node.start()?;
    let res = tokio::select! {
        _ = shutdown.wait() => node.stop().await,
        res = node.wait() => res,
    };

    // the node may have stopped on its own
    shutdown.shutdown();
    receive.await?;
    res
}
