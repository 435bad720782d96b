//! Router-facing request API module.
//!
//! Routers connect over TCP, announce a 64-bit router ID, and stream block
//! requests; replies travel back on the same connection. Each request's
//! response channel is registered here, in the RPC entry path, before the
//! request is ever handed to the batcher, so the channel provably exists by
//! the time the request's enqueue entry is proposed. A waiter task per
//! request awaits the one-shot under a deadline and sweeps its own
//! registration if the deadline passes.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::shardnode::waiters::ResponseWaiters;
use crate::shardnode::{OpKind, PathId, ReplicaId, RequestId, StorageId};
use crate::utils::OramShardError;

use flashmap;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{ReadHalf, WriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::{mpsc, Notify, OnceCell};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration};

/// Router ID type, announced by each connecting router.
pub type RouterId = u64;

/// One block query within a router's batch.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct BlockQuery {
    /// Unique request ID, assigned by the router.
    pub id: RequestId,

    /// Requested logical block.
    pub block: String,

    /// ORAM tree path hint.
    pub path: PathId,

    /// Storage shard hint.
    pub storage_id: StorageId,

    /// Operation kind.
    pub op: OpKind,

    /// New value for writes; ignored for reads.
    pub value: String,
}

/// Batch query received from a router. Results go back per request, each
/// as its own `ApiReply`, as they resolve.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiRequest {
    /// Queries batched by the router.
    pub queries: Vec<BlockQuery>,
}

/// Reply back to a router. `value` is `None` when the wait was cut short
/// (deadline passed or node shutting down) rather than answered.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct ApiReply {
    /// Request ID corresponding to this reply.
    pub id: RequestId,

    /// Delivered block value, if the request was answered in time.
    pub value: Option<String>,
}

/// The external router-facing API module.
pub struct ExternalApi {
    /// My replica ID.
    me: ReplicaId,

    /// Receiver side of the req channel.
    rx_req: Option<mpsc::Receiver<(RouterId, BlockQuery)>>,

    /// Map from router ID -> sender side of its reply channel, shared with
    /// the router acceptor thread.
    tx_replies: Option<flashmap::ReadHandle<RouterId, mpsc::Sender<ApiReply>>>,

    /// TCP listener for router connections, shared with the acceptor
    /// thread.
    router_listener: Arc<OnceCell<TcpListener>>,

    /// Notify used as batch dumping signal, shared with the batch ticker
    /// thread.
    batch_notify: Arc<Notify>,

    /// Join handle of the router acceptor thread.
    router_acceptor_handle: Option<JoinHandle<()>>,

    /// Join handle of the batch ticker thread.
    batch_ticker_handle: Option<JoinHandle<()>>,
}

// ExternalApi public API implementation
impl ExternalApi {
    /// Creates a new external API module.
    pub fn new(me: ReplicaId) -> Self {
        ExternalApi {
            me,
            rx_req: None,
            tx_replies: None,
            router_listener: Arc::new(OnceCell::new()),
            batch_notify: Arc::new(Notify::new()),
            router_acceptor_handle: None,
            batch_ticker_handle: None,
        }
    }

    /// Spawns the router acceptor thread and the batch ticker thread.
    /// Creates a req channel for buffering incoming queries (capacity is
    /// the hard cap on queries buffered for batching). Queries admitted
    /// here have their response channel registered in `waiters` with
    /// `wait_timeout` as the per-request deadline; the finished replies go
    /// out through `tx_done` for the caller to route back via
    /// `send_reply`.
    #[allow(clippy::too_many_arguments)]
    pub async fn setup(
        &mut self,
        api_addr: SocketAddr,
        batch_interval: Duration,
        wait_timeout: Duration,
        chan_req_cap: usize,
        chan_reply_cap: usize,
        tx_done: mpsc::Sender<(RouterId, ApiReply)>,
        waiters: Arc<ResponseWaiters>,
    ) -> Result<(), OramShardError> {
        if self.router_acceptor_handle.is_some() {
            return logged_err!(self.me; "setup already done");
        }
        if chan_req_cap == 0 {
            return logged_err!(self.me; "invalid chan_req_cap {}", chan_req_cap);
        }
        if chan_reply_cap == 0 {
            return logged_err!(
                self.me;
                "invalid chan_reply_cap {}",
                chan_reply_cap
            );
        }
        if batch_interval < Duration::from_micros(1) {
            return logged_err!(
                self.me;
                "batch_interval {:?} too small",
                batch_interval
            );
        }

        let (tx_req, rx_req) = mpsc::channel(chan_req_cap);
        self.rx_req = Some(rx_req);

        let (tx_replies_write, tx_replies_read) =
            flashmap::new::<RouterId, mpsc::Sender<ApiReply>>();
        self.tx_replies = Some(tx_replies_read);

        let router_listener = TcpListener::bind(api_addr).await?;
        self.router_listener.set(router_listener)?;

        let router_acceptor_handle =
            tokio::spawn(Self::router_acceptor_thread(
                self.me,
                tx_req,
                tx_done,
                chan_reply_cap,
                self.router_listener.clone(),
                tx_replies_write,
                waiters,
                wait_timeout,
            ));
        self.router_acceptor_handle = Some(router_acceptor_handle);

        let batch_ticker_handle = tokio::spawn(Self::batch_ticker_thread(
            self.me,
            batch_interval,
            self.batch_notify.clone(),
        ));
        self.batch_ticker_handle = Some(batch_ticker_handle);

        Ok(())
    }

    /// Address the router listener actually bound to.
    pub fn local_addr(&self) -> Result<SocketAddr, OramShardError> {
        match self.router_listener.get() {
            Some(listener) => Ok(listener.local_addr()?),
            None => logged_err!(self.me; "local_addr called before setup"),
        }
    }

    /// Waits for the next batch dumping signal and collects all queries
    /// currently in the req channel.
    pub async fn get_req_batch(
        &mut self,
    ) -> Result<Vec<(RouterId, BlockQuery)>, OramShardError> {
        if self.router_acceptor_handle.is_none() {
            return logged_err!(self.me; "get_req_batch called before setup");
        }

        self.batch_notify.notified().await;
        let mut batch = vec![];

        match self.rx_req {
            Some(ref mut rx_req) => loop {
                match rx_req.try_recv() {
                    Ok((router, query)) => batch.push((router, query)),
                    Err(TryRecvError::Empty) => break,
                    Err(e) => return Err(e.into()),
                }
            },
            None => return logged_err!(self.me; "rx_req not created yet"),
        }

        Ok(batch)
    }

    /// Sends a reply back to given router through its reply channel.
    pub async fn send_reply(
        &mut self,
        reply: ApiReply,
        router: RouterId,
    ) -> Result<(), OramShardError> {
        let tx_reply = match self.tx_replies {
            Some(ref tx_replies) => tx_replies.guard().get(&router).cloned(),
            None => return logged_err!(self.me; "tx_replies not created yet"),
        };
        match tx_reply {
            Some(tx_reply) => {
                tx_reply.send(reply).await?;
                Ok(())
            }
            None => {
                logged_err!(
                    self.me;
                    "router ID {} not found among active routers",
                    router
                )
            }
        }
    }
}

// ExternalApi router_acceptor thread implementation
impl ExternalApi {
    /// Router acceptor thread function.
    #[allow(clippy::too_many_arguments)]
    async fn router_acceptor_thread(
        me: ReplicaId,
        tx_req: mpsc::Sender<(RouterId, BlockQuery)>,
        tx_done: mpsc::Sender<(RouterId, ApiReply)>,
        chan_reply_cap: usize,
        router_listener: Arc<OnceCell<TcpListener>>,
        mut tx_replies: flashmap::WriteHandle<RouterId, mpsc::Sender<ApiReply>>,
        waiters: Arc<ResponseWaiters>,
        wait_timeout: Duration,
    ) {
        pf_debug!(me; "router_acceptor thread spawned");

        loop {
            let accepted = router_listener.get().unwrap().accept().await;
            let mut stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    pf_warn!(me; "error accepting router connection: {}", e);
                    continue;
                }
            };

            let id = match stream.read_u64().await {
                Ok(id) => id,
                Err(e) => {
                    pf_error!(me; "error receiving new router ID: {}", e);
                    continue;
                }
            };

            let mut tx_replies_guard = tx_replies.guard();
            if tx_replies_guard.contains_key(&id) {
                pf_error!(me; "duplicate router ID listened: {}", id);
                continue;
            }
            pf_info!(me; "accepted new router {}", id);

            let (tx_reply, rx_reply) = mpsc::channel(chan_reply_cap);
            tx_replies_guard.insert(id, tx_reply);
            tx_replies_guard.publish();

            tokio::spawn(Self::router_servant_thread(
                me,
                id,
                stream,
                tx_req.clone(),
                tx_done.clone(),
                rx_reply,
                waiters.clone(),
                wait_timeout,
            ));
        }
    }
}

// ExternalApi router_servant thread implementation
impl ExternalApi {
    /// Reads a router request from given TcpStream.
    async fn read_req(
        conn_read: &mut ReadHalf<'_>,
    ) -> Result<ApiRequest, OramShardError> {
        let req_len = conn_read.read_u64().await?; // receive length first
        let mut req_buf: Vec<u8> = vec![0; req_len as usize];
        conn_read.read_exact(&mut req_buf[..]).await?;
        let req = decode_from_slice(&req_buf)?;
        Ok(req)
    }

    /// Writes a reply through given TcpStream.
    async fn write_reply(
        reply: &ApiReply,
        conn_write: &mut WriteHalf<'_>,
    ) -> Result<(), OramShardError> {
        let reply_bytes = encode_to_vec(reply)?;
        conn_write.write_u64(reply_bytes.len() as u64).await?; // send length first
        conn_write.write_all(&reply_bytes[..]).await?;
        Ok(())
    }

    /// Per-request waiter task function: awaits the one-shot response
    /// channel under the deadline, then readies the reply for sending.
    /// An expired deadline sweeps this request's registration so orphaned
    /// channels do not accumulate.
    async fn request_waiter_task(
        me: ReplicaId,
        router: RouterId,
        request_id: RequestId,
        rx: tokio::sync::oneshot::Receiver<String>,
        tx_done: mpsc::Sender<(RouterId, ApiReply)>,
        waiters: Arc<ResponseWaiters>,
        wait_timeout: Duration,
    ) {
        let value = match time::timeout(wait_timeout, rx).await {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => None, // registry dropped: node tearing down
            Err(_) => {
                pf_warn!(me; "wait for request {} timed out", request_id);
                waiters.forget(&request_id);
                None
            }
        };

        let reply = ApiReply {
            id: request_id,
            value,
        };
        if let Err(e) = tx_done.send((router, reply)).await {
            pf_error!(me; "error sending to tx_done: {}", e);
        }
    }

    /// Router request listener and reply sender thread function.
    #[allow(clippy::too_many_arguments)]
    async fn router_servant_thread(
        me: ReplicaId,
        id: RouterId,
        mut conn: TcpStream,
        tx_req: mpsc::Sender<(RouterId, BlockQuery)>,
        tx_done: mpsc::Sender<(RouterId, ApiReply)>,
        mut rx_reply: mpsc::Receiver<ApiReply>,
        waiters: Arc<ResponseWaiters>,
        wait_timeout: Duration,
    ) {
        pf_debug!(me; "router_servant thread for {} spawned", id);

        let (mut conn_read, mut conn_write) = conn.split();

        loop {
            tokio::select! {
                // select between getting a new reply to send back and
                // receiving a new router request, prioritizing the former
                biased;

                // gets a reply to send back
                reply = rx_reply.recv() => {
                    match reply {
                        Some(reply) => {
                            if let Err(e) = Self::write_reply(&reply, &mut conn_write).await {
                                pf_error!(me; "error replying to {}: {}", id, e);
                            } else {
                                pf_trace!(me; "replied to {} reply {:?}", id, reply);
                            }
                        },
                        None => break, // channel gets closed and no messages remain
                    }
                },

                // receives a router batch query
                req = Self::read_req(&mut conn_read) => {
                    match req {
                        Ok(req) => {
                            pf_trace!(me; "request from {} req {:?}", id, req);
                            for query in req.queries {
                                // register the response channel before the
                                // query can reach the batcher, then park a
                                // waiter on it
                                let rx = waiters.register(query.id.clone());
                                tokio::spawn(Self::request_waiter_task(
                                    me,
                                    id,
                                    query.id.clone(),
                                    rx,
                                    tx_done.clone(),
                                    waiters.clone(),
                                    wait_timeout,
                                ));
                                if let Err(e) = tx_req.send((id, query)).await {
                                    pf_error!(me; "error sending to tx_req for {}: {}", id, e);
                                }
                            }
                        },
                        Err(e) => {
                            pf_debug!(me; "error reading request from {}: {}", id, e);
                            break; // connection likely closed by router
                        }
                    }
                },
            }
        }

        pf_debug!(me; "router_servant thread for {} exitted", id);
    }
}

// ExternalApi batch_ticker thread implementation
impl ExternalApi {
    /// Batch ticker thread function.
    async fn batch_ticker_thread(
        me: ReplicaId,
        batch_interval: Duration,
        batch_notify: Arc<Notify>,
    ) {
        let mut interval = time::interval(batch_interval);

        loop {
            interval.tick().await;
            batch_notify.notify_one();
            pf_trace!(me; "batch interval ticked");
        }
    }
}
