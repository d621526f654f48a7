//! Gateway client seam: the streaming upload of one shard's pieces to a
//! secondary SP and the `(integrity_hash, signature)` receipt it returns.

use async_trait::async_trait;
use thiserror::Error;

use crate::approval::ApprovalResponse;
use crate::model::ObjectId;
use crate::pipe::PipeReader;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("failed to dial gateway {endpoint}: {reason}")]
    Dial { endpoint: String, reason: String },

    #[error("gateway transport error: {0}")]
    Transport(String),

    #[error("gateway rejected replication: {0}")]
    Rejected(String),
}

/// Metadata sent ahead of the piece stream.
#[derive(Debug, Clone)]
pub struct ReplicatePieceRequest {
    pub object_id: ObjectId,
    /// Byte size of every piece in the stream (post-encoding shard size).
    pub piece_size: u32,
    pub redundancy_index: u32,
    pub approval: ApprovalResponse,
}

/// Receipt a secondary returns after persisting a shard stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceReceipt {
    pub integrity_hash: Vec<u8>,
    pub signature: Vec<u8>,
}

/// One open connection to a secondary SP's gateway.
#[async_trait]
pub trait SecondaryGateway: Send + Sync {
    /// Stream every piece from `stream` to the secondary and wait for its
    /// receipt. Consumes the reader; a failed stream leaves the shard slot
    /// unsatisfied.
    async fn replicate_object_piece_stream(
        &self,
        request: ReplicatePieceRequest,
        stream: PipeReader,
    ) -> Result<PieceReceipt, GatewayError>;
}

/// Connection factory over SP gateway endpoints.
#[async_trait]
pub trait GatewayDialer: Send + Sync {
    async fn dial(&self, endpoint: &str) -> Result<Box<dyn SecondaryGateway>, GatewayError>;
}
