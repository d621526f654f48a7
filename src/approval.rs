//! Approval layer seam: soliciting signed replication permissions from
//! candidate secondary SPs over the P2P network.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{ObjectId, ObjectInfo, StorageProvider};

/// Signed permission from a candidate secondary to accept one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalResponse {
    pub object_id: ObjectId,
    pub sp_operator_address: String,
    pub expired_height: u64,
    pub signature: Vec<u8>,
}

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("timed out gathering approvals after {0:?}")]
    Timeout(Duration),

    #[error("not enough approvals: want {want}, got {got}")]
    NotEnough { want: usize, got: usize },

    #[error("approval layer error: {0}")]
    Provider(String),
}

/// P2P approval collaborator.
///
/// `expect` is the minimum number of approvals required; `ask` is the number
/// actually solicited (oversubscription for spares). Implementations return
/// both maps keyed by SP endpoint; the two key sets are identical.
#[async_trait]
pub trait ApprovalProvider: Send + Sync {
    async fn get_approval(
        &self,
        object: &ObjectInfo,
        expect: usize,
        ask: usize,
        timeout: Duration,
    ) -> Result<
        (
            HashMap<String, StorageProvider>,
            HashMap<String, ApprovalResponse>,
        ),
        ApprovalError,
    >;
}
