use std::sync::Arc;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::mpsc::{self, UnboundedReceiver};
use tokio::task::JoinSet;

use crate::error::{RaftError, Result};
use crate::raft::config::RaftConfig;
use crate::raft::fsm::{self, ApplyCallback, StateChangeCallback};
use crate::raft::log::Log;
use crate::raft::rpc::{Address, Message, Request};
use crate::raft::timer::sleep_until;
use crate::raft::transport::Transport;
use crate::raft::{Apply, Command, NodeId, RaftHandle};
use crate::util::Shutdown;

/// Everything needed to run one node.
pub struct Server {
    pub config: RaftConfig,
    pub log: Log,
    pub transport: Arc<dyn Transport>,
    pub apply: Box<dyn ApplyCallback>,
    pub on_state_change: Box<dyn StateChangeCallback>,
    pub request_rx: UnboundedReceiver<Command>,
}

impl Server {
    /// Spawn the fsm driver and the event loop. Both observe `shutdown`, which is subscribed to
    /// before this returns.
    pub fn spawn(self, shutdown: &Shutdown) -> Result<RemoteHandle<Result<()>>> {
        let Server {
            config,
            log,
            transport,
            apply,
            on_state_change,
            request_rx,
        } = self;
        let id = config.id.clone();

        // state machine driver
        let (rpc_tx, rpc_rx) = mpsc::unbounded_channel();
        let (fsm_tx, fsm_rx) = mpsc::unbounded_channel();
        let driver = fsm::Driver::new(fsm_rx, apply, on_state_change);
        let (task, driver) = driver.run(shutdown.clone()).remote_handle();
        tokio::spawn(task);

        // main event loop
        let raft = RaftHandle::new(config, log, rpc_tx, fsm_tx)?;
        let (task, event_loop) =
            event_loop(shutdown.clone(), raft, transport, rpc_rx, request_rx).remote_handle();
        tokio::spawn(task);

        let (task, handle) = async move {
            let (raft, _) = tokio::try_join!(event_loop, driver)?;
            tracing::info!(id = %id, status = ?raft.status(), "raft stopped");
            Ok::<(), RaftError>(())
        }
        .remote_handle();
        tokio::spawn(task);
        Ok(handle)
    }
}

/// The actor owning the state machine. Timer expiries, inbound requests and RPC responses are
/// applied one at a time; outbound RPCs run concurrently and their responses are fed back in as
/// they complete.
async fn event_loop(
    mut shutdown: Shutdown,
    mut raft: RaftHandle,
    transport: Arc<dyn Transport>,
    mut rpc_rx: UnboundedReceiver<Message>,
    mut request_rx: UnboundedReceiver<Command>,
) -> Result<RaftHandle> {
    let peers = raft.status().peers;
    let rpc_timeout = match &raft {
        RaftHandle::Follower(raft) => raft.config.rpc_timeout(),
        RaftHandle::Candidate(raft) => raft.config.rpc_timeout(),
        RaftHandle::Leader(raft) => raft.config.rpc_timeout(),
    };
    let mut inflight: JoinSet<Option<Command>> = JoinSet::new();

    loop {
        let election = sleep_until(raft.election_deadline());
        let heartbeat = sleep_until(raft.heartbeat_deadline());

        tokio::select! {
            // shutdown
            _ = shutdown.wait() => break,
            // timers
            _ = election => raft = raft.apply(Command::Timeout)?,
            _ = heartbeat => raft = raft.apply(Command::Heartbeat)?,
            // requests from clients and peers
            cmd = request_rx.recv() => match cmd {
                Some(cmd) => raft = raft.apply(cmd)?,
                None => break,
            },
            // outgoing messages from raft
            Some(msg) = rpc_rx.recv() => {
                dispatch(&mut inflight, &transport, &peers, rpc_timeout, msg)
            }
            // responses to outgoing messages
            Some(res) = inflight.join_next(), if !inflight.is_empty() => match res {
                Ok(Some(cmd)) => raft = raft.apply(cmd)?,
                Ok(None) => {}
                Err(err) => tracing::warn!(?err, "rpc task failed"),
            },
        }
    }

    // responses for requests still in flight are discarded
    inflight.shutdown().await;
    Ok(raft)
}

fn dispatch(
    inflight: &mut JoinSet<Option<Command>>,
    transport: &Arc<dyn Transport>,
    peers: &[NodeId],
    rpc_timeout: Duration,
    msg: Message,
) {
    let to = match msg.to {
        Address::Peers => peers.to_vec(),
        Address::Peer(peer) => vec![peer],
    };
    for peer in to {
        inflight.spawn(call(transport.clone(), peer, msg.request.clone(), rpc_timeout));
    }
}

/// Perform one RPC, turning the response into a command. Failures are abstentions.
async fn call(
    transport: Arc<dyn Transport>,
    peer: NodeId,
    request: Request,
    rpc_timeout: Duration,
) -> Option<Command> {
    match request {
        Request::Vote(req) => {
            match tokio::time::timeout(rpc_timeout, transport.request_vote(&peer, req)).await {
                Ok(Ok(res)) => Some(Command::VoteResponse { from: peer, res }),
                Ok(Err(err)) => {
                    tracing::trace!(%peer, %err, "vote request failed");
                    None
                }
                Err(_) => {
                    tracing::trace!(%peer, "vote request timed out");
                    None
                }
            }
        }
        Request::Append(req) => {
            let prev_log_index = req.prev_log_index;
            let entries = req.entries.len() as u64;
            match tokio::time::timeout(rpc_timeout, transport.append_entries(&peer, req)).await {
                Ok(Ok(res)) => Some(Command::AppendResponse {
                    from: peer,
                    prev_log_index,
                    entries,
                    res,
                }),
                Ok(Err(err)) => {
                    tracing::trace!(%peer, %err, "append request failed");
                    None
                }
                Err(_) => {
                    tracing::trace!(%peer, "append request timed out");
                    None
                }
            }
        }
        request => {
            tracing::warn!(%peer, ?request, "not sending client request to a peer");
            None
        }
    }
}
