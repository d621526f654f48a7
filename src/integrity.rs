//! Integrity hash computation shared by the upload path, the replication
//! verifier, and test fixtures.
//!
//! A shard's integrity hash is SHA-256 over the concatenation of the SHA-256
//! digests of its pieces in segment order. The whole-object checksum
//! (`checksums[0]`) is the same fold over the raw payload segments.

use fastcrypto::hash::{HashFunction, Sha256};

use crate::erasure_coding::{encode_raw_segment, ErasureError};
use crate::model::{RedundancyType, StorageParams};

/// SHA-256 digest of a single piece.
pub fn piece_hash(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).digest.to_vec()
}

/// Fold piece digests into the integrity hash secondaries report back.
pub fn integrity_hash(piece_hashes: &[Vec<u8>]) -> Vec<u8> {
    let mut concatenated = Vec::with_capacity(piece_hashes.len() * 32);
    for hash in piece_hashes {
        concatenated.extend_from_slice(hash);
    }
    Sha256::digest(&concatenated).digest.to_vec()
}

/// Incremental integrity accumulator for a single shard stream.
#[derive(Debug, Default, Clone)]
pub struct IntegrityAccumulator {
    piece_hashes: Vec<Vec<u8>>,
}

impl IntegrityAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn absorb_piece(&mut self, data: &[u8]) {
        self.piece_hashes.push(piece_hash(data));
    }

    pub fn finalize(&self) -> Vec<u8> {
        integrity_hash(&self.piece_hashes)
    }
}

/// Compute the full checksum list for an object: index 0 covers the payload
/// segments, indices `1..=redundancy_number` are the expected per-shard
/// integrity hashes the secondaries must reproduce.
pub fn generate_checksum_set(
    payload: &[u8],
    params: &StorageParams,
    redundancy_type: RedundancyType,
) -> Result<Vec<Vec<u8>>, ErasureError> {
    let redundancy_number = params.redundancy_number() as usize;
    let segments: Vec<&[u8]> = payload.chunks(params.max_segment_size as usize).collect();

    let mut shard_accumulators = vec![IntegrityAccumulator::new(); redundancy_number];
    let mut payload_accumulator = IntegrityAccumulator::new();

    for segment in &segments {
        payload_accumulator.absorb_piece(segment);
        match redundancy_type {
            RedundancyType::Ec => {
                let shards = encode_raw_segment(
                    segment,
                    params.redundant_data_chunk_num as usize,
                    params.redundant_parity_chunk_num as usize,
                )?;
                for (idx, shard) in shards.iter().enumerate() {
                    shard_accumulators[idx].absorb_piece(shard);
                }
            }
            RedundancyType::Replica => {
                for accumulator in &mut shard_accumulators {
                    accumulator.absorb_piece(segment);
                }
            }
        }
    }

    let mut checksums = Vec::with_capacity(redundancy_number + 1);
    checksums.push(payload_accumulator.finalize());
    for accumulator in &shard_accumulators {
        checksums.push(accumulator.finalize());
    }
    Ok(checksums)
}
