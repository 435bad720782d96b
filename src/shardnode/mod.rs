//! Shard-node functionality modules.

mod entries;
mod external;
mod fsm;
mod node;
mod oramstub;
mod replicate;
mod statemach;
mod waiters;

pub use entries::{
    LogEntry, OpKind, PathId, PendingRequest, ReplicaId, RequestId, StorageId,
};
pub use external::{ApiReply, ApiRequest, BlockQuery, ExternalApi, RouterId};
pub use fsm::{ShardNodeFsm, StashEntry};
pub use node::{NodeConfig, ShardNodeReplica};
pub use oramstub::{AccessReply, AccessRequest, OramNodeStub};
pub use replicate::{LocalLog, ReplicatedLog};
pub use statemach::{ApplyResult, EntryId, StateMachine};
pub use waiters::ResponseWaiters;
