//! Downstream ORAM-node access stub.
//!
//! The proposing replica contacts the ORAM node responsible for a request's
//! storage shard, once per *first* request on a block. Requests that found
//! their block's queue busy never reach here; they ride on the first
//! request's response through the stash.

use std::net::SocketAddr;

use crate::shardnode::{OpKind, PathId, ReplicaId, StorageId};
use crate::utils::OramShardError;

use serde::{Deserialize, Serialize};

use rmp_serde::decode::from_slice as decode_from_slice;
use rmp_serde::encode::to_vec as encode_to_vec;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Access request sent to an ORAM node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct AccessRequest {
    /// Requested logical block.
    pub block: String,

    /// ORAM tree path to read along.
    pub path: PathId,

    /// Storage shard to operate on.
    pub storage_id: StorageId,

    /// Operation kind.
    pub op: OpKind,

    /// New value for writes; ignored for reads.
    pub new_value: String,
}

/// Access reply received from an ORAM node.
#[derive(Debug, PartialEq, Eq, Clone, Serialize, Deserialize)]
pub struct AccessReply {
    /// The value the ORAM node read for the block.
    pub value: String,
}

/// ORAM-node access connection stub.
pub struct OramNodeStub {
    /// My replica ID.
    me: ReplicaId,

    /// TCP connection to the ORAM node.
    conn: TcpStream,
}

impl OramNodeStub {
    /// Connects to the ORAM node at given address.
    pub async fn new_by_connect(
        me: ReplicaId,
        addr: SocketAddr,
    ) -> Result<Self, OramShardError> {
        pf_debug!(me; "connecting to oram node '{}'...", addr);
        let conn = TcpStream::connect(addr).await?;
        Ok(OramNodeStub { me, conn })
    }

    /// Performs one access round-trip: sends the request, waits for the
    /// reply. Each dispatch runs in its own task, so blocking on the reply
    /// here never stalls the node's event loop.
    pub async fn access(
        &mut self,
        req: &AccessRequest,
    ) -> Result<AccessReply, OramShardError> {
        let req_bytes = encode_to_vec(req)?;
        self.conn.write_u64(req_bytes.len() as u64).await?; // send length first
        self.conn.write_all(&req_bytes[..]).await?;

        let reply_len = self.conn.read_u64().await?; // receive length first
        let mut reply_buf: Vec<u8> = vec![0; reply_len as usize];
        self.conn.read_exact(&mut reply_buf[..]).await?;
        let reply = decode_from_slice(&reply_buf)?;

        pf_trace!(self.me; "access on '{}' replied", req.block);
        Ok(reply)
    }
}

#[cfg(test)]
mod oramstub_tests {
    use super::*;

    use tokio::net::TcpListener;

    /// Minimal stand-in ORAM node that answers every access with a value
    /// derived from the requested block.
    async fn serve_one_access(listener: TcpListener) {
        let (mut conn, _) = listener.accept().await.unwrap();
        let req_len = conn.read_u64().await.unwrap();
        let mut req_buf: Vec<u8> = vec![0; req_len as usize];
        conn.read_exact(&mut req_buf[..]).await.unwrap();
        let req: AccessRequest = decode_from_slice(&req_buf).unwrap();

        let reply = AccessReply {
            value: format!("value_of_{}", req.block),
        };
        let reply_bytes = encode_to_vec(&reply).unwrap();
        conn.write_u64(reply_bytes.len() as u64).await.unwrap();
        conn.write_all(&reply_bytes[..]).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn access_roundtrip() -> Result<(), OramShardError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        tokio::spawn(serve_one_access(listener));

        let mut stub = OramNodeStub::new_by_connect(0, addr).await?;
        let reply = stub
            .access(&AccessRequest {
                block: "block1".into(),
                path: 4,
                storage_id: 0,
                op: OpKind::Read,
                new_value: "".into(),
            })
            .await?;
        assert_eq!(reply.value, "value_of_block1");
        Ok(())
    }
}
