//! Concurrent registry of per-request response channels.
//!
//! Router servant tasks register a one-shot channel for their request ID
//! before the request is proposed to the replicated log; the FSM applier
//! signals it when the matching response entry is applied on the proposing
//! replica. The registry is the single structure shared between the applier
//! and the RPC entry tasks, hence the sharded concurrent map underneath.

use dashmap::DashMap;

use tokio::sync::oneshot;

use crate::shardnode::{ReplicaId, RequestId};

/// Registry of waiting response channels, keyed by request ID.
///
/// One-shot senders make the at-most-once delivery rule structural: a
/// signal consumes the sender, and a second signal for the same request
/// simply finds no entry. Dropping the whole registry drops all senders,
/// which every pending waiter observes as a cancellation.
pub struct ResponseWaiters {
    /// My replica ID.
    me: ReplicaId,

    /// Map from request ID -> sender side of its one-shot channel.
    chans: DashMap<RequestId, oneshot::Sender<String>>,
}

impl ResponseWaiters {
    /// Creates a new empty registry.
    pub fn new(me: ReplicaId) -> Self {
        ResponseWaiters {
            me,
            chans: DashMap::new(),
        }
    }

    /// Registers a fresh channel for given request ID, returning the
    /// receiver half to await on. A stale entry under the same ID (e.g.
    /// from an abandoned earlier attempt) is replaced; its receiver sees a
    /// cancellation.
    pub fn register(&self, request_id: RequestId) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        if self.chans.insert(request_id, tx).is_some() {
            pf_warn!(self.me; "replaced a stale response channel entry");
        }
        rx
    }

    /// Signals the channel registered for given request ID, if any, handing
    /// it the delivered value. Returns true if a waiter was signalled.
    /// Missing entries are permitted; an abandoned receiver just discards
    /// the value. Neither case blocks the caller.
    pub fn notify(&self, request_id: &RequestId, value: String) -> bool {
        match self.chans.remove(request_id) {
            Some((_, tx)) => tx.send(value).is_ok(),
            None => false,
        }
    }

    /// Drops the channel registered for given request ID, if any. Used by
    /// RPC entry tasks that give up on their deadline, so orphaned
    /// registrations do not pile up.
    pub fn forget(&self, request_id: &RequestId) {
        self.chans.remove(request_id);
    }

    /// Number of currently registered channels.
    pub fn outstanding(&self) -> usize {
        self.chans.len()
    }

    /// Checks whether a channel is registered for given request ID.
    pub fn contains(&self, request_id: &RequestId) -> bool {
        self.chans.contains_key(request_id)
    }
}
