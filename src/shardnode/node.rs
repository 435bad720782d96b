//! Shard-node replica: module wiring and the main event loop.
//!
//! The loop ties the seams together: router batches become enqueue-batch
//! proposals; applied entries flow into the applier; enqueue results on the
//! proposing replica fan out downstream accesses for the first request per
//! block; completed accesses become response proposals; and replies readied
//! by waiter tasks are written back to their routers. Each downstream
//! access runs in its own task, so a slow ORAM node never stalls the loop.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::shardnode::external::{ApiReply, ExternalApi};
use crate::shardnode::oramstub::{AccessRequest, OramNodeStub};
use crate::shardnode::replicate::ReplicatedLog;
use crate::shardnode::statemach::StateMachine;
use crate::shardnode::waiters::ResponseWaiters;
use crate::shardnode::{
    ApplyResult, BlockQuery, EntryId, LogEntry, OpKind, ReplicaId, RequestId,
    RouterId, StorageId,
};
use crate::utils::OramShardError;

use serde::Deserialize;

use tokio::sync::mpsc;
use tokio::time::Duration;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfig {
    /// Router request batching interval in millisecs.
    pub batch_interval_ms: u64,

    /// Maximum number of requests proposed in one enqueue-batch entry.
    pub max_batch_size: usize,

    /// Deadline for a request's response-channel wait in millisecs.
    pub wait_timeout_ms: u64,

    /// Capacity of the router request channel.
    pub chan_req_cap: usize,

    /// Capacity of the reply channels.
    pub chan_reply_cap: usize,

    /// Capacity of the applier's apply/ack channels.
    pub chan_apply_cap: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            batch_interval_ms: 5,
            max_batch_size: 5000,
            wait_timeout_ms: 3000,
            chan_req_cap: 10000,
            chan_reply_cap: 10000,
            chan_apply_cap: 10000,
        }
    }
}

/// Outcome of one downstream access, fed back to the event loop by its
/// dispatch task.
#[derive(Debug)]
struct AccessDone {
    block: String,
    request_id: RequestId,
    response: String,
    new_value: String,
    op: OpKind,
}

/// Shard-node replica module.
pub struct ShardNodeReplica {
    /// Replica ID in the shard group.
    id: ReplicaId,

    /// Configuration parameters struct.
    config: NodeConfig,

    /// ExternalApi module.
    external_api: ExternalApi,

    /// StateMachine (applier) module.
    state_machine: StateMachine,

    /// Replicated log transport.
    replicated_log: Box<dyn ReplicatedLog>,

    /// Response-channel registry shared with the RPC entry tasks. Held so
    /// that dropping the replica cancels every outstanding wait.
    _waiters: Arc<ResponseWaiters>,

    /// Map from storage shard ID -> responsible ORAM node address.
    oram_addrs: HashMap<StorageId, SocketAddr>,

    /// Monotonic proposal ID counter.
    next_entry_id: EntryId,

    /// Batches proposed by me, awaiting their first-request verdicts.
    outstanding: HashMap<EntryId, Vec<(RouterId, BlockQuery)>>,

    /// Sender side of the access-done channel, cloned into dispatch tasks.
    tx_access: mpsc::Sender<AccessDone>,

    /// Receiver side of the access-done channel.
    rx_access: mpsc::Receiver<AccessDone>,

    /// Receiver side of the done channel carrying replies readied by the
    /// waiter tasks.
    rx_done: mpsc::Receiver<(RouterId, ApiReply)>,
}

// ShardNodeReplica public API implementation
impl ShardNodeReplica {
    /// Creates a new shard-node replica and sets up its modules. The
    /// replicated-log transport is injected; single-replica deployments
    /// hand in a `LocalLog`.
    pub async fn new_and_setup(
        id: ReplicaId,
        api_addr: SocketAddr,
        oram_addrs: HashMap<StorageId, SocketAddr>,
        replicated_log: Box<dyn ReplicatedLog>,
        config_str: Option<&str>,
    ) -> Result<Self, OramShardError> {
        let config = parsed_config!(config_str => NodeConfig;
                                    batch_interval_ms, max_batch_size,
                                    wait_timeout_ms, chan_req_cap,
                                    chan_reply_cap, chan_apply_cap)?;
        if config.batch_interval_ms == 0 {
            return logged_err!(
                id;
                "invalid config.batch_interval_ms '{}'",
                config.batch_interval_ms
            );
        }
        if config.max_batch_size == 0 {
            return logged_err!(
                id;
                "invalid config.max_batch_size '{}'",
                config.max_batch_size
            );
        }

        let waiters = Arc::new(ResponseWaiters::new(id));

        let mut state_machine = StateMachine::new(id);
        state_machine
            .setup(waiters.clone(), config.chan_apply_cap, config.chan_apply_cap)
            .await?;

        let (tx_done, rx_done) = mpsc::channel(config.chan_reply_cap);

        let mut external_api = ExternalApi::new(id);
        external_api
            .setup(
                api_addr,
                Duration::from_millis(config.batch_interval_ms),
                Duration::from_millis(config.wait_timeout_ms),
                config.chan_req_cap,
                config.chan_reply_cap,
                tx_done,
                waiters.clone(),
            )
            .await?;

        let (tx_access, rx_access) = mpsc::channel(config.chan_reply_cap);

        Ok(ShardNodeReplica {
            id,
            config,
            external_api,
            state_machine,
            replicated_log,
            _waiters: waiters,
            oram_addrs,
            next_entry_id: 0,
            outstanding: HashMap::new(),
            tx_access,
            rx_access,
            rx_done,
        })
    }

    /// Address the router-facing listener actually bound to.
    pub fn api_addr(&self) -> Result<SocketAddr, OramShardError> {
        self.external_api.local_addr()
    }

    /// Main event loop logic of running this replica.
    pub async fn run(&mut self) {
        loop {
            tokio::select! {
                // router request batch ready
                batch = self.external_api.get_req_batch() => {
                    match batch {
                        Ok(batch) => {
                            if let Err(e) = self.handle_req_batch(batch).await {
                                pf_error!(self.id; "error handling req batch: {}", e);
                            }
                        },
                        Err(e) => pf_error!(self.id; "error getting req batch: {}", e),
                    }
                },

                // applied entry from the replicated log
                applied = self.replicated_log.next_applied() => {
                    match applied {
                        Ok((id, bytes)) => {
                            if let Err(e) = self.state_machine.submit_entry(id, bytes).await {
                                pf_error!(self.id; "error submitting entry {}: {}", id, e);
                            }
                        },
                        Err(e) => pf_error!(self.id; "error getting applied entry: {}", e),
                    }
                },

                // apply result from the state machine
                result = self.state_machine.get_result() => {
                    match result {
                        Ok((id, result)) => {
                            if let Err(e) = self.handle_apply_result(id, result) {
                                pf_error!(self.id; "error handling apply result {}: {}", id, e);
                            }
                        },
                        Err(e) => pf_error!(self.id; "error getting apply result: {}", e),
                    }
                },

                // downstream access completed
                done = self.rx_access.recv() => {
                    match done {
                        Some(done) => {
                            if let Err(e) = self.handle_access_done(done).await {
                                pf_error!(self.id; "error handling access done: {}", e);
                            }
                        },
                        None => pf_error!(self.id; "access channel has been closed"),
                    }
                },

                // reply readied by a waiter task
                done = self.rx_done.recv() => {
                    match done {
                        Some((router, reply)) => {
                            if let Err(e) = self.external_api.send_reply(reply, router).await {
                                // router may have disconnected meanwhile
                                pf_debug!(self.id; "error sending reply: {}", e);
                            }
                        },
                        None => pf_error!(self.id; "done channel has been closed"),
                    }
                },
            }
        }
    }
}

// ShardNodeReplica event handlers
impl ShardNodeReplica {
    /// Proposes a collected router batch as one or more enqueue-batch
    /// entries, each capped at `max_batch_size` requests, and remembers
    /// which requests ride in which proposal.
    async fn handle_req_batch(
        &mut self,
        batch: Vec<(RouterId, BlockQuery)>,
    ) -> Result<(), OramShardError> {
        if batch.is_empty() {
            return Ok(());
        }

        for chunk in batch.chunks(self.config.max_batch_size) {
            let entry_id = self.next_entry_id;
            self.next_entry_id += 1;

            let requests = chunk
                .iter()
                .map(|(_, query)| query.to_pending_request())
                .collect();
            let entry = LogEntry::EnqueueBatch {
                requests,
                leader: self.id,
            };

            self.outstanding.insert(entry_id, chunk.to_vec());
            self.replicated_log
                .propose(entry_id, entry.to_bytes()?)
                .await?;
            pf_debug!(self.id; "proposed batch {} of {} requests", entry_id, chunk.len());
        }

        Ok(())
    }

    /// Acts on one apply result. An enqueue result carrying first-request
    /// verdicts can only stem from an entry this replica proposed; each
    /// first request gets a downstream access dispatched in its own task.
    fn handle_apply_result(
        &mut self,
        entry_id: EntryId,
        result: ApplyResult,
    ) -> Result<(), OramShardError> {
        let firsts = match result {
            ApplyResult::EnqueueBatch { firsts } => firsts,
            ApplyResult::BlockResponse => return Ok(()),
        };
        if firsts.is_empty() {
            // an entry some other replica proposed; nothing to dispatch
            return Ok(());
        }

        if let Some(batch) = self.outstanding.remove(&entry_id) {
            for (_, query) in batch {
                if !firsts.get(&query.id).copied().unwrap_or(false) {
                    continue;
                }
                match self.oram_addrs.get(&query.storage_id) {
                    Some(&addr) => {
                        tokio::spawn(Self::access_dispatch_task(
                            self.id,
                            addr,
                            query,
                            self.tx_access.clone(),
                        ));
                    }
                    None => {
                        // the waiters on this block will run into their
                        // deadline; nothing else to salvage here
                        pf_error!(
                            self.id;
                            "no oram node known for storage shard {}",
                            query.storage_id
                        );
                    }
                }
            }
        } else {
            pf_warn!(self.id; "apply result for unknown batch {}", entry_id);
        }

        Ok(())
    }

    /// Proposes the response entry for one completed downstream access.
    async fn handle_access_done(
        &mut self,
        done: AccessDone,
    ) -> Result<(), OramShardError> {
        let entry_id = self.next_entry_id;
        self.next_entry_id += 1;

        let entry = LogEntry::BlockResponse {
            block: done.block,
            request_id: done.request_id,
            response: done.response,
            new_value: done.new_value,
            op: done.op,
            leader: self.id,
        };
        self.replicated_log
            .propose(entry_id, entry.to_bytes()?)
            .await
    }

    /// Downstream access dispatch task function: one access round-trip
    /// against the responsible ORAM node, outcome fed back to the loop.
    async fn access_dispatch_task(
        me: ReplicaId,
        addr: SocketAddr,
        query: BlockQuery,
        tx_access: mpsc::Sender<AccessDone>,
    ) {
        let access = AccessRequest {
            block: query.block.clone(),
            path: query.path,
            storage_id: query.storage_id,
            op: query.op,
            new_value: query.value.clone(),
        };

        let reply = match OramNodeStub::new_by_connect(me, addr).await {
            Ok(mut stub) => match stub.access(&access).await {
                Ok(reply) => reply,
                Err(e) => {
                    pf_error!(me; "access on '{}' failed: {}", query.block, e);
                    return;
                }
            },
            Err(e) => {
                pf_error!(me; "error connecting to oram node '{}': {}", addr, e);
                return;
            }
        };

        let done = AccessDone {
            block: query.block,
            request_id: query.id,
            response: reply.value,
            new_value: query.value,
            op: query.op,
        };
        if let Err(e) = tx_access.send(done).await {
            pf_error!(me; "error sending to tx_access: {}", e);
        }
    }
}

impl BlockQuery {
    /// The query as recorded in an enqueue-batch log entry.
    fn to_pending_request(&self) -> crate::shardnode::PendingRequest {
        crate::shardnode::PendingRequest {
            request_id: self.id.clone(),
            block: self.block.clone(),
            path: self.path,
            storage_id: self.storage_id,
        }
    }
}

#[cfg(test)]
mod node_tests {
    use super::*;

    use crate::shardnode::external::{ApiReply, ApiRequest};
    use crate::shardnode::oramstub::AccessReply;
    use crate::shardnode::replicate::LocalLog;

    use rmp_serde::decode::from_slice as decode_from_slice;
    use rmp_serde::encode::to_vec as encode_to_vec;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Stand-in ORAM node: serves one access per connection, answering
    /// reads with a value derived from the block name.
    async fn fake_oram_node(listener: TcpListener) {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let req_len = conn.read_u64().await.unwrap();
                let mut req_buf: Vec<u8> = vec![0; req_len as usize];
                conn.read_exact(&mut req_buf[..]).await.unwrap();
                let req: AccessRequest = decode_from_slice(&req_buf).unwrap();

                let reply = AccessReply {
                    value: format!("stored_{}", req.block),
                };
                let reply_bytes = encode_to_vec(&reply).unwrap();
                conn.write_u64(reply_bytes.len() as u64).await.unwrap();
                conn.write_all(&reply_bytes[..]).await.unwrap();
            });
        }
    }

    async fn send_request(
        stream: &mut TcpStream,
        req: &ApiRequest,
    ) -> Result<(), OramShardError> {
        let req_bytes = encode_to_vec(req)?;
        stream.write_u64(req_bytes.len() as u64).await?;
        stream.write_all(&req_bytes[..]).await?;
        Ok(())
    }

    async fn recv_reply(
        stream: &mut TcpStream,
    ) -> Result<ApiReply, OramShardError> {
        let reply_len = stream.read_u64().await?;
        let mut reply_buf: Vec<u8> = vec![0; reply_len as usize];
        stream.read_exact(&mut reply_buf[..]).await?;
        Ok(decode_from_slice(&reply_buf)?)
    }

    fn block_query(
        id: &str,
        block: &str,
        op: OpKind,
        value: &str,
    ) -> BlockQuery {
        BlockQuery {
            id: id.into(),
            block: block.into(),
            path: 1,
            storage_id: 0,
            op,
            value: value.into(),
        }
    }

    fn batch_of(queries: Vec<BlockQuery>) -> ApiRequest {
        ApiRequest { queries }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn single_replica_read_write_read() -> Result<(), OramShardError> {
        let oram_listener = TcpListener::bind("127.0.0.1:0").await?;
        let mut oram_addrs = HashMap::new();
        oram_addrs.insert(0, oram_listener.local_addr()?);
        tokio::spawn(fake_oram_node(oram_listener));

        let node = ShardNodeReplica::new_and_setup(
            0,
            "127.0.0.1:0".parse()?,
            oram_addrs,
            Box::new(LocalLog::new(64)),
            Some("batch_interval_ms = 1"),
        )
        .await?;
        let api_addr = node.api_addr()?;
        tokio::spawn(async move {
            let mut node = node;
            node.run().await;
        });

        let mut stream = TcpStream::connect(api_addr).await?;
        stream.write_u64(1).await?; // announce router ID

        // a fresh read goes downstream and lands in the stash
        send_request(
            &mut stream,
            &batch_of(vec![block_query("request1", "block1", OpKind::Read, "")]),
        )
        .await?;
        let reply = recv_reply(&mut stream).await?;
        assert_eq!(reply.id, "request1");
        assert_eq!(reply.value, Some("stored_block1".into()));

        // a write is confirmed with the value it wrote
        send_request(
            &mut stream,
            &batch_of(vec![block_query(
                "request2",
                "block1",
                OpKind::Write,
                "fresh_value",
            )]),
        )
        .await?;
        let reply = recv_reply(&mut stream).await?;
        assert_eq!(reply.value, Some("fresh_value".into()));

        // a later read observes the cached write, not the downstream copy
        send_request(
            &mut stream,
            &batch_of(vec![block_query("request3", "block1", OpKind::Read, "")]),
        )
        .await?;
        let reply = recv_reply(&mut stream).await?;
        assert_eq!(reply.value, Some("fresh_value".into()));

        // two concurrent reads of one block ride on a single downstream
        // access and observe the same value
        send_request(
            &mut stream,
            &batch_of(vec![
                block_query("request4", "block1", OpKind::Read, ""),
                block_query("request5", "block1", OpKind::Read, ""),
            ]),
        )
        .await?;
        for _ in 0..2 {
            let reply = recv_reply(&mut stream).await?;
            assert!(reply.id == "request4" || reply.id == "request5");
            assert_eq!(reply.value, Some("fresh_value".into()));
        }

        Ok(())
    }
}
