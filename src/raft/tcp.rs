use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::future::{self, BoxFuture};
use futures::{FutureExt, SinkExt, TryStreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_serde::formats::Json;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::error::{RaftError, Result};
use crate::lock::{DistributedLock, LockTable};
use crate::raft::client::RaftClient;
use crate::raft::rpc::{
    AppendRequest, AppendResponse, Request, Response, VoteRequest, VoteResponse,
};
use crate::raft::transport::{Transport, TransportError};
use crate::raft::{LogIndex, Node, NodeId, Status};
use crate::util::Shutdown;

/// Frames are length delimited JSON. Peers and clients send a `Request` and read back a
/// `Response`.
type Connection = tokio_serde::Framed<
    Framed<TcpStream, LengthDelimitedCodec>,
    Response,
    Request,
    Json<Response, Request>,
>;

type Inbound = tokio_serde::Framed<
    Framed<TcpStream, LengthDelimitedCodec>,
    Request,
    Response,
    Json<Request, Response>,
>;

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        TransportError::Io(err.to_string())
    }
}

#[derive(Clone)]
struct Peer {
    addr: SocketAddr,
    /// An idle connection, checked out for the duration of a call.
    conn: Arc<Mutex<Option<Connection>>>,
}

/// Sends RPCs to peers over TCP, keeping one idle connection per peer.
#[derive(Clone)]
pub struct TcpTransport {
    peers: HashMap<NodeId, Peer>,
}

impl TcpTransport {
    pub fn new(nodes: &[Node]) -> Self {
        let peers = nodes
            .iter()
            .map(|node| {
                let peer = Peer {
                    addr: node.addr,
                    conn: Arc::new(Mutex::new(None)),
                };
                (node.id.clone(), peer)
            })
            .collect();
        TcpTransport { peers }
    }

    fn call(
        &self,
        id: &NodeId,
        request: Request,
    ) -> BoxFuture<'static, std::result::Result<Response, TransportError>> {
        let peer = match self.peers.get(id) {
            Some(peer) => peer.clone(),
            None => return future::ready(Err(TransportError::Unreachable(id.clone()))).boxed(),
        };

        async move {
            let idle = peer.conn.lock().unwrap_or_else(PoisonError::into_inner).take();
            let mut conn = match idle {
                Some(conn) => conn,
                None => {
                    let stream = TcpStream::connect(peer.addr).await?;
                    stream.set_nodelay(true)?;
                    tokio_serde::Framed::new(
                        Framed::new(stream, LengthDelimitedCodec::new()),
                        Json::default(),
                    )
                }
            };

            // a connection that fails or is dropped mid call is never returned to the slot
            conn.send(request).await?;
            let response = conn.try_next().await?.ok_or(TransportError::Closed)?;
            *peer.conn.lock().unwrap_or_else(PoisonError::into_inner) = Some(conn);

            match response {
                Response::Error(err) => Err(TransportError::Remote(err)),
                response => Ok(response),
            }
        }
        .boxed()
    }
}

impl Transport for TcpTransport {
    fn request_vote(
        &self,
        peer: &NodeId,
        req: VoteRequest,
    ) -> BoxFuture<'static, std::result::Result<VoteResponse, TransportError>> {
        let call = self.call(peer, Request::Vote(req));
        async move {
            match call.await? {
                Response::Vote(res) => Ok(res),
                res => Err(TransportError::Remote(format!("unexpected response: {:?}", res))),
            }
        }
        .boxed()
    }

    fn append_entries(
        &self,
        peer: &NodeId,
        req: AppendRequest,
    ) -> BoxFuture<'static, std::result::Result<AppendResponse, TransportError>> {
        let call = self.call(peer, Request::Append(req));
        async move {
            match call.await? {
                Response::Append(res) => Ok(res),
                res => Err(TransportError::Remote(format!("unexpected response: {:?}", res))),
            }
        }
        .boxed()
    }
}

/// Accept connections from peers and clients and serve their requests against the local node
/// until shutdown. `locks` must be the apply callback of the node behind `client`.
pub async fn receive_task(
    mut shutdown: Shutdown,
    listener: TcpListener,
    client: RaftClient,
    locks: LockTable,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = shutdown.wait() => break,

            accepted = listener.accept() => {
                let (stream, addr) = match accepted {
                    Ok(accepted) => accepted,
                    Err(err) => {
                        tracing::warn!(%err, "failed to accept peer");
                        continue;
                    }
                };
                tracing::debug!(%addr, "peer connected");
                let shutdown = shutdown.clone();
                let client = client.clone();
                let locks = locks.clone();
                tokio::spawn(async move {
                    match serve(shutdown, stream, client, locks).await {
                        Ok(()) => tracing::debug!(%addr, "peer disconnected"),
                        Err(err) => tracing::warn!(%addr, %err, "error serving peer"),
                    }
                });
            }
        }
    }

    tracing::info!("receive complete");
    Ok(())
}

/// Requests on one connection are answered in order.
async fn serve(
    mut shutdown: Shutdown,
    stream: TcpStream,
    client: RaftClient,
    locks: LockTable,
) -> Result<()> {
    stream.set_nodelay(true)?;
    let mut frames: Inbound = tokio_serde::Framed::new(
        Framed::new(stream, LengthDelimitedCodec::new()),
        Json::default(),
    );

    loop {
        let request = tokio::select! {
            _ = shutdown.wait() => break,
            request = frames.try_next() => match request? {
                Some(request) => request,
                None => break,
            },
        };
        if request.is_peer() {
            tracing::trace!(?request, "received request");
        } else {
            tracing::debug!(?request, "received client request");
        }

        let response = respond(request, &client, &locks).await;
        frames.send(response).await?;
    }
    Ok(())
}

async fn respond(request: Request, client: &RaftClient, locks: &LockTable) -> Response {
    let res = match request {
        Request::Vote(req) => client.request_vote(req).await.map(Response::Vote),
        Request::Append(req) => client.append_entries(req).await.map(Response::Append),
        Request::Propose(command) => client.propose(command).await.map(Response::Proposed),
        Request::Status => client.status().await.map(Response::Status),
        Request::Acquire {
            lock_name,
            holder,
            timeout_ms,
        } => DistributedLock::new(lock_name, client.clone(), locks.clone())
            .acquire(&holder, Duration::from_millis(timeout_ms))
            .await
            .map(Response::Lock),
        Request::Release {
            lock_name,
            holder,
            timeout_ms,
        } => DistributedLock::new(lock_name, client.clone(), locks.clone())
            .release(&holder, Duration::from_millis(timeout_ms))
            .await
            .map(Response::Lock),
        Request::Holder { lock_name } => Ok(Response::Holder(locks.holder(&lock_name))),
    };

    match res {
        Ok(response) => response,
        Err(RaftError::NotLeader(leader)) => Response::NotLeader(leader),
        Err(RaftError::Timeout) => Response::Timeout,
        Err(err) => Response::Error(err.to_string()),
    }
}

/// A client connection to one node, for submitting commands and taking locks from outside the
/// cluster. Requests that only the leader serves fail with `NotLeader` elsewhere.
pub struct TcpClient {
    conn: Connection,
}

impl TcpClient {
    pub async fn connect(addr: SocketAddr) -> Result<TcpClient> {
        let stream = TcpStream::connect(addr).await.map_err(TransportError::from)?;
        stream.set_nodelay(true).map_err(TransportError::from)?;
        let conn = tokio_serde::Framed::new(
            Framed::new(stream, LengthDelimitedCodec::new()),
            Json::default(),
        );
        Ok(TcpClient { conn })
    }

    async fn call(&mut self, request: Request) -> Result<Response> {
        self.conn.send(request).await.map_err(TransportError::from)?;
        let response = self
            .conn
            .try_next()
            .await
            .map_err(TransportError::from)?
            .ok_or(TransportError::Closed)?;

        match response {
            Response::NotLeader(leader) => Err(RaftError::NotLeader(leader)),
            Response::Timeout => Err(RaftError::Timeout),
            Response::Error(err) => Err(TransportError::Remote(err).into()),
            response => Ok(response),
        }
    }

    /// Propose a command, resolving with its index once the leader has applied it.
    pub async fn propose(&mut self, command: Vec<u8>) -> Result<LogIndex> {
        match self.call(Request::Propose(command)).await? {
            Response::Proposed(index) => Ok(index),
            res => Err(unexpected(res)),
        }
    }

    pub async fn status(&mut self) -> Result<Status> {
        match self.call(Request::Status).await? {
            Response::Status(status) => Ok(status),
            res => Err(unexpected(res)),
        }
    }

    /// Take `lock_name` for `holder`, with the same outcomes as [`DistributedLock::acquire`].
    pub async fn acquire(
        &mut self,
        lock_name: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let request = Request::Acquire {
            lock_name: lock_name.to_string(),
            holder: holder.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.call(request).await? {
            Response::Lock(acquired) => Ok(acquired),
            res => Err(unexpected(res)),
        }
    }

    pub async fn release(
        &mut self,
        lock_name: &str,
        holder: &str,
        timeout: Duration,
    ) -> Result<bool> {
        let request = Request::Release {
            lock_name: lock_name.to_string(),
            holder: holder.to_string(),
            timeout_ms: timeout.as_millis() as u64,
        };
        match self.call(request).await? {
            Response::Lock(released) => Ok(released),
            res => Err(unexpected(res)),
        }
    }

    /// The holder of `lock_name` as seen by this node, which may lag the leader.
    pub async fn holder(&mut self, lock_name: &str) -> Result<Option<NodeId>> {
        let request = Request::Holder {
            lock_name: lock_name.to_string(),
        };
        match self.call(request).await? {
            Response::Holder(holder) => Ok(holder),
            res => Err(unexpected(res)),
        }
    }
}

fn unexpected(res: Response) -> RaftError {
    TransportError::Remote(format!("unexpected response: {:?}", res)).into()
}
