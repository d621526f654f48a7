//! Core data model for the replication pipeline: object metadata, storage
//! parameters, job lifecycle states, and the seal payload assembled from
//! secondary confirmations.

use serde::{Deserialize, Serialize};

/// On-chain object identifier. Encoded as a uint256 in sign documents.
pub type ObjectId = u64;

/// How an object's payload is spread over secondaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RedundancyType {
    /// Every secondary stores a full copy of each segment.
    Replica,
    /// Segments are Reed-Solomon encoded; each secondary stores one shard.
    Ec,
}

/// Metadata of the object being replicated.
///
/// `checksums` has `redundancy_number + 1` entries: index 0 is the
/// whole-object checksum, indices `1..=redundancy_number` are the expected
/// per-shard integrity hashes. `secondary_sp_addresses` starts empty and is
/// filled slot-by-slot as shards land on secondaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub id: ObjectId,
    pub bucket_name: String,
    pub object_name: String,
    pub payload_size: u64,
    pub redundancy_type: RedundancyType,
    pub checksums: Vec<Vec<u8>>,
    pub secondary_sp_addresses: Vec<String>,
}

/// Read-only storage parameter snapshot taken at task init.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageParams {
    pub max_segment_size: u64,
    pub redundant_data_chunk_num: u32,
    pub redundant_parity_chunk_num: u32,
}

impl StorageParams {
    /// K + M.
    pub fn redundancy_number(&self) -> u32 {
        self.redundant_data_chunk_num + self.redundant_parity_chunk_num
    }
}

/// Persisted job lifecycle state.
///
/// The states form a DAG with one start, one success terminal and three
/// failure terminals; there is no rollback edge out of an error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    ReplicateDoing,
    ReplicateError,
    SignDoing,
    SignError,
    SealDoing,
    SealError,
    SealDone,
}

impl JobState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Created, ReplicateDoing)
                | (ReplicateDoing, SignDoing)
                | (ReplicateDoing, ReplicateError)
                | (SignDoing, SealDoing)
                | (SignDoing, SignError)
                | (SealDoing, SealDone)
                | (SealDoing, SealError)
        )
    }

    /// Terminal states have no outgoing transitions.
    pub fn is_terminal(self) -> bool {
        use JobState::*;
        matches!(self, ReplicateError | SignError | SealError | SealDone)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            JobState::Created => "created",
            JobState::ReplicateDoing => "replicate_doing",
            JobState::ReplicateError => "replicate_error",
            JobState::SignDoing => "sign_doing",
            JobState::SignError => "sign_error",
            JobState::SealDoing => "seal_doing",
            JobState::SealError => "seal_error",
            JobState::SealDone => "seal_done",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(JobState::Created),
            "replicate_doing" => Ok(JobState::ReplicateDoing),
            "replicate_error" => Ok(JobState::ReplicateError),
            "sign_doing" => Ok(JobState::SignDoing),
            "sign_error" => Ok(JobState::SignError),
            "seal_doing" => Ok(JobState::SealDoing),
            "seal_error" => Ok(JobState::SealError),
            "seal_done" => Ok(JobState::SealDone),
            other => Err(format!("unknown job state {other:?}")),
        }
    }
}

/// Descriptor of a candidate secondary storage provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProvider {
    /// Hex address the SP operates (and signs seal slots) under.
    pub operator_address: String,
    /// Hex address whose key signs replication approvals and receipts.
    pub approval_address: String,
    /// Gateway endpoint shards are streamed to.
    pub endpoint: String,
}

/// Seal transaction payload: one address and one signature per shard index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MsgSealObject {
    pub operator: String,
    pub bucket_name: String,
    pub object_name: String,
    pub secondary_sp_addresses: Vec<String>,
    pub secondary_sp_signatures: Vec<Vec<u8>>,
}

impl MsgSealObject {
    pub fn new(operator: String, object: &ObjectInfo, redundancy_number: usize) -> Self {
        Self {
            operator,
            bucket_name: object.bucket_name.clone(),
            object_name: object.object_name.clone(),
            secondary_sp_addresses: vec![String::new(); redundancy_number],
            secondary_sp_signatures: vec![Vec::new(); redundancy_number],
        }
    }
}

/// Confirmation record for one replicated shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PieceInfo {
    pub object_info: ObjectInfo,
    pub integrity_hash: Vec<u8>,
    pub signature: Vec<u8>,
}

/// Per-object replication progress snapshot, slot per shard index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicatePieceInfo {
    pub piece_infos: Vec<Option<PieceInfo>>,
}

impl ReplicatePieceInfo {
    pub fn new(redundancy_number: usize) -> Self {
        Self {
            piece_infos: vec![None; redundancy_number],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_state_transitions() {
        use JobState::*;

        assert!(Created.can_transition_to(ReplicateDoing));
        assert!(ReplicateDoing.can_transition_to(SignDoing));
        assert!(ReplicateDoing.can_transition_to(ReplicateError));
        assert!(SignDoing.can_transition_to(SealDoing));
        assert!(SignDoing.can_transition_to(SignError));
        assert!(SealDoing.can_transition_to(SealDone));
        assert!(SealDoing.can_transition_to(SealError));

        // no rollback out of errors, no skipping forward
        assert!(!ReplicateError.can_transition_to(ReplicateDoing));
        assert!(!SealDone.can_transition_to(ReplicateDoing));
        assert!(!Created.can_transition_to(SealDone));
        assert!(!ReplicateDoing.can_transition_to(SealDoing));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobState::SealDone.is_terminal());
        assert!(JobState::ReplicateError.is_terminal());
        assert!(JobState::SignError.is_terminal());
        assert!(JobState::SealError.is_terminal());
        assert!(!JobState::ReplicateDoing.is_terminal());
        assert!(!JobState::Created.is_terminal());
    }

    #[test]
    fn test_seal_message_slots() {
        let object = ObjectInfo {
            id: 7,
            bucket_name: "bucket".to_string(),
            object_name: "object".to_string(),
            payload_size: 64,
            redundancy_type: RedundancyType::Ec,
            checksums: Vec::new(),
            secondary_sp_addresses: Vec::new(),
        };
        let msg = MsgSealObject::new("operator".to_string(), &object, 6);
        assert_eq!(msg.secondary_sp_addresses.len(), 6);
        assert_eq!(msg.secondary_sp_signatures.len(), 6);
        assert!(msg.secondary_sp_addresses.iter().all(|a| a.is_empty()));
    }

    #[test]
    fn test_storage_params_redundancy_number() {
        let params = StorageParams {
            max_segment_size: 1 << 20,
            redundant_data_chunk_num: 4,
            redundant_parity_chunk_num: 2,
        };
        assert_eq!(params.redundancy_number(), 6);
    }
}
