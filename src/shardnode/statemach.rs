//! Single-threaded applier wrapping the shard-node FSM.
//!
//! Applied log entries are submitted as raw payload bytes and handed to one
//! applier thread that owns the FSM, so the two entry handlers are mutually
//! exclusive by construction and never interleave. A payload that fails to
//! decode stops the applier where it stands: skipping a malformed entry
//! would let replicas diverge, which is strictly worse than a stall.

use std::collections::HashMap;
use std::sync::Arc;

use crate::shardnode::fsm::ShardNodeFsm;
use crate::shardnode::waiters::ResponseWaiters;
use crate::shardnode::{LogEntry, ReplicaId, RequestId};
use crate::utils::OramShardError;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Entry ID type, assigned by the proposing side to match results back.
pub type EntryId = u64;

/// Result of applying one log entry.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ApplyResult {
    /// Which requests of the batch were first on their block. Empty on a
    /// replica that did not propose the entry.
    EnqueueBatch { firsts: HashMap<RequestId, bool> },

    /// A block response was applied; it carries no data back.
    BlockResponse,
}

/// The applier module holding the FSM behind an apply/ack channel pair.
pub struct StateMachine {
    /// My replica ID.
    me: ReplicaId,

    /// Sender side of the apply channel.
    tx_apply: Option<mpsc::Sender<(EntryId, Vec<u8>)>>,

    /// Receiver side of the ack channel.
    rx_ack: Option<mpsc::Receiver<(EntryId, ApplyResult)>>,

    /// Join handle of the applier thread. The FSM is owned by this thread.
    applier_handle: Option<JoinHandle<()>>,
}

// StateMachine public API implementation
impl StateMachine {
    /// Creates a new state machine module with one applier thread.
    pub fn new(me: ReplicaId) -> Self {
        StateMachine {
            me,
            tx_apply: None,
            rx_ack: None,
            applier_handle: None,
        }
    }

    /// Spawns the applier thread owning a fresh FSM that signals through
    /// `waiters`. Creates an apply channel for submitting entry payloads
    /// and an ack channel for collecting apply results.
    pub async fn setup(
        &mut self,
        waiters: Arc<ResponseWaiters>,
        chan_apply_cap: usize,
        chan_ack_cap: usize,
    ) -> Result<(), OramShardError> {
        if self.applier_handle.is_some() {
            return logged_err!(self.me; "setup already done");
        }
        if chan_apply_cap == 0 {
            return logged_err!(
                self.me;
                "invalid chan_apply_cap {}",
                chan_apply_cap
            );
        }
        if chan_ack_cap == 0 {
            return logged_err!(self.me; "invalid chan_ack_cap {}", chan_ack_cap);
        }

        let (tx_apply, rx_apply) = mpsc::channel(chan_apply_cap);
        let (tx_ack, rx_ack) = mpsc::channel(chan_ack_cap);
        self.tx_apply = Some(tx_apply);
        self.rx_ack = Some(rx_ack);

        let fsm = ShardNodeFsm::new(self.me, waiters);
        let applier_handle =
            tokio::spawn(Self::applier_thread(self.me, fsm, rx_apply, tx_ack));
        self.applier_handle = Some(applier_handle);

        Ok(())
    }

    /// Submits an applied entry's payload bytes to the applier thread.
    pub async fn submit_entry(
        &mut self,
        id: EntryId,
        entry: Vec<u8>,
    ) -> Result<(), OramShardError> {
        match self.tx_apply {
            Some(ref tx_apply) => {
                tx_apply.send((id, entry)).await?;
                Ok(())
            }
            None => logged_err!(self.me; "submit_entry called before setup"),
        }
    }

    /// Waits for the next apply result from the ack channel.
    pub async fn get_result(
        &mut self,
    ) -> Result<(EntryId, ApplyResult), OramShardError> {
        match self.rx_ack {
            Some(ref mut rx_ack) => match rx_ack.recv().await {
                Some((id, result)) => Ok((id, result)),
                None => logged_err!(self.me; "ack channel has been closed"),
            },
            None => logged_err!(self.me; "get_result called before setup"),
        }
    }
}

// StateMachine applier thread implementation
impl StateMachine {
    /// Applies one decoded entry to the FSM.
    fn apply(fsm: &mut ShardNodeFsm, entry: LogEntry) -> ApplyResult {
        match entry {
            LogEntry::EnqueueBatch { requests, leader } => {
                ApplyResult::EnqueueBatch {
                    firsts: fsm.handle_enqueue_batch(requests, leader),
                }
            }
            LogEntry::BlockResponse {
                block,
                request_id,
                response,
                new_value,
                op,
                leader,
            } => {
                fsm.handle_block_response(
                    block, request_id, response, new_value, op, leader,
                );
                ApplyResult::BlockResponse
            }
        }
    }

    /// Applier thread function.
    async fn applier_thread(
        me: ReplicaId,
        mut fsm: ShardNodeFsm,
        mut rx_apply: mpsc::Receiver<(EntryId, Vec<u8>)>,
        tx_ack: mpsc::Sender<(EntryId, ApplyResult)>,
    ) {
        pf_debug!(me; "applier thread spawned");

        while let Some((id, bytes)) = rx_apply.recv().await {
            let entry = match LogEntry::from_bytes(&bytes) {
                Ok(entry) => entry,
                Err(e) => {
                    // refusing to advance past a malformed entry keeps this
                    // replica stalled instead of diverged
                    pf_error!(me; "malformed entry {}, applier halting: {}", id, e);
                    break;
                }
            };

            let result = Self::apply(&mut fsm, entry);
            pf_trace!(me; "applied entry {} at index {}", id, fsm.applied_index());

            if let Err(e) = tx_ack.send((id, result)).await {
                pf_error!(me; "error sending to tx_ack: {}", e);
            }
        }

        // channel gets closed and no messages remain
        pf_debug!(me; "applier thread exitted");
    }
}
