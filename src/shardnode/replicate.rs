//! Consensus seam: the replicated-log interface the node builds on, plus a
//! replication-free implementation for single-replica deployments and tests.
//!
//! The FSM only ever consumes entries that come out of `next_applied()`;
//! how they got ordered and replicated is the transport's business. A real
//! consensus transport (log replication, leader election, snapshotting)
//! lives outside this crate and implements the same trait.

use crate::shardnode::EntryId;
use crate::utils::OramShardError;

use async_trait::async_trait;

use tokio::sync::mpsc;

/// Interface to the replicated log that every transport must provide.
#[async_trait]
pub trait ReplicatedLog: Send {
    /// Hands an entry payload to the log for replication. The entry ID is
    /// chosen by the caller and carried through to the applied side so the
    /// proposer can match results back; it is not a log position.
    async fn propose(
        &mut self,
        id: EntryId,
        entry: Vec<u8>,
    ) -> Result<(), OramShardError>;

    /// Waits for the next applied entry, in log order. Every replica sees
    /// the same payload sequence here.
    async fn next_applied(
        &mut self,
    ) -> Result<(EntryId, Vec<u8>), OramShardError>;
}

/// Replication-free log: every proposal is applied immediately, in
/// proposal order, on this replica alone.
pub struct LocalLog {
    /// Sender side of the applied channel.
    tx_applied: mpsc::Sender<(EntryId, Vec<u8>)>,

    /// Receiver side of the applied channel.
    rx_applied: mpsc::Receiver<(EntryId, Vec<u8>)>,
}

impl LocalLog {
    /// Creates a new local log with given applied-channel capacity.
    pub fn new(chan_applied_cap: usize) -> Self {
        let (tx_applied, rx_applied) = mpsc::channel(chan_applied_cap);
        LocalLog {
            tx_applied,
            rx_applied,
        }
    }
}

#[async_trait]
impl ReplicatedLog for LocalLog {
    async fn propose(
        &mut self,
        id: EntryId,
        entry: Vec<u8>,
    ) -> Result<(), OramShardError> {
        self.tx_applied.send((id, entry)).await?;
        Ok(())
    }

    async fn next_applied(
        &mut self,
    ) -> Result<(EntryId, Vec<u8>), OramShardError> {
        match self.rx_applied.recv().await {
            Some(applied) => Ok(applied),
            None => Err(OramShardError("applied channel has been closed".into())),
        }
    }
}
