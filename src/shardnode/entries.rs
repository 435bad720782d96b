//! Replicated log-entry payload types and their wire codec.
//!
//! Exactly two payload kinds ever reach the shard-node FSM: a batch of
//! freshly admitted client requests, and the outcome of one downstream
//! access. Both carry the ID of the replica that proposed them; every
//! replica applies the state mutation, but only the proposer performs the
//! externally visible side effects.

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use crate::utils::OramShardError;

/// Server replica ID type.
pub type ReplicaId = u8;

/// Per-request unique ID type (assigned by the requesting router).
pub type RequestId = String;

/// ORAM tree path index type.
pub type PathId = u32;

/// Storage shard ID type, selecting the responsible ORAM node.
pub type StorageId = u32;

/// Kind of a client operation on a logical block.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum OpKind {
    /// Read the block's current value.
    Read,

    /// Overwrite the block with a new value.
    Write,
}

/// One admitted client request, as recorded in an enqueue-batch entry.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct PendingRequest {
    /// Unique request ID.
    pub request_id: RequestId,

    /// Requested logical block.
    pub block: String,

    /// ORAM tree path hint supplied with the request.
    pub path: PathId,

    /// Storage shard hint supplied with the request.
    pub storage_id: StorageId,
}

/// Log entry payload applied to the shard-node FSM by the consensus layer.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub enum LogEntry {
    /// One or more client requests proposed atomically by `leader`.
    EnqueueBatch {
        requests: Vec<PendingRequest>,
        leader: ReplicaId,
    },

    /// Outcome for one block. `request_id` names the first request on that
    /// block, i.e. the one whose downstream access produced this response.
    BlockResponse {
        block: String,
        request_id: RequestId,
        response: String,
        new_value: String,
        op: OpKind,
        leader: ReplicaId,
    },
}

impl LogEntry {
    /// Serializes the entry into consensus payload bytes. The format must
    /// be identical across replicas; MessagePack through serde gives that
    /// for free.
    pub fn to_bytes(&self) -> Result<Vec<u8>, OramShardError> {
        Ok(encode_to_vec(self)?)
    }

    /// Deserializes an entry from consensus payload bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<LogEntry, OramShardError> {
        Ok(decode_from_slice(bytes)?)
    }
}
