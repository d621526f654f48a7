//! Chain-side collaborators: the signer that submits the seal transaction
//! and the listener that waits for the seal event to land.

use async_trait::async_trait;
use thiserror::Error;

use crate::model::MsgSealObject;

/// Blocks the seal listener waits before giving up on an object.
pub const SEAL_LISTEN_TIMEOUT_BLOCKS: u64 = 10;

#[derive(Error, Debug)]
pub enum ChainError {
    #[error("signer rejected seal message: {0}")]
    SignRejected(String),

    #[error("object seal not observed within {blocks} blocks")]
    SealTimeout { blocks: u64 },

    #[error("chain rpc error: {0}")]
    Rpc(String),
}

/// Submits the assembled seal transaction, returning its hash.
#[async_trait]
pub trait SealSigner: Send + Sync {
    async fn seal_object_on_chain(&self, msg: &MsgSealObject) -> Result<String, ChainError>;
}

/// Watches the chain for the seal event of one object.
#[async_trait]
pub trait ChainListener: Send + Sync {
    async fn listen_object_seal(
        &self,
        bucket_name: &str,
        object_name: &str,
        timeout_blocks: u64,
    ) -> Result<(), ChainError>;
}
