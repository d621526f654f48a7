//! Erasure Coding Module
//!
//! Segment-level Reed-Solomon encoding for replication fan-out. Each payload
//! segment is encoded independently into `k` data shards followed by `m`
//! parity shards; every secondary receives one shard per segment.

use reed_solomon_erasure::galois_8::ReedSolomon;
use reed_solomon_erasure::Error as ReedSolomonError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Redundancy parameters for segment encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErasureConfig {
    /// Number of data shards (k)
    pub data_shards: usize,
    /// Number of parity shards (m)
    pub parity_shards: usize,
}

impl ErasureConfig {
    pub fn new(data_shards: usize, parity_shards: usize) -> Result<Self, ErasureError> {
        if data_shards == 0 {
            return Err(ErasureError::InvalidConfiguration {
                reason: "data_shards must be greater than 0".to_string(),
            });
        }
        if parity_shards == 0 {
            return Err(ErasureError::InvalidConfiguration {
                reason: "parity_shards must be greater than 0".to_string(),
            });
        }
        if data_shards + parity_shards > 255 {
            return Err(ErasureError::InvalidConfiguration {
                reason: format!(
                    "total shards ({}) cannot exceed 255",
                    data_shards + parity_shards
                ),
            });
        }
        Ok(ErasureConfig {
            data_shards,
            parity_shards,
        })
    }

    /// Total number of shards (data + parity), i.e. the redundancy number.
    pub fn total_shards(&self) -> usize {
        self.data_shards + self.parity_shards
    }

    /// Size of each shard for a segment of `segment_len` bytes.
    pub fn shard_size(&self, segment_len: usize) -> usize {
        segment_len.div_ceil(self.data_shards)
    }
}

/// Errors that can occur during erasure coding operations
#[derive(Error, Debug)]
pub enum ErasureError {
    #[error("Invalid configuration: {reason}")]
    InvalidConfiguration { reason: String },

    #[error("Insufficient shards for reconstruction: need {needed}, have {available}")]
    InsufficientShards { needed: usize, available: usize },

    #[error("Shard size mismatch: expected {expected}, got {actual}")]
    ShardSizeMismatch { expected: usize, actual: usize },

    #[error("Reed-Solomon error: {0}")]
    ReedSolomon(#[from] ReedSolomonError),

    #[error("Segment corruption detected during reconstruction")]
    SegmentCorruption,

    #[error("Invalid segment data: {reason}")]
    InvalidData { reason: String },
}

/// Encode one raw segment into `k + m` equally sized shards.
///
/// The returned vector holds the data shards at indices `0..k` and the parity
/// shards at `k..k + m`. The segment is zero-padded up to a multiple of the
/// shard size; all shards of one segment have identical length, so
/// `result[0].len()` is the piece size every secondary is told to expect.
pub fn encode_raw_segment(
    segment: &[u8],
    data_shards: usize,
    parity_shards: usize,
) -> Result<Vec<Vec<u8>>, ErasureError> {
    let config = ErasureConfig::new(data_shards, parity_shards)?;
    if segment.is_empty() {
        return Err(ErasureError::InvalidData {
            reason: "segment cannot be empty".to_string(),
        });
    }

    let shard_size = config.shard_size(segment.len());
    let rs = ReedSolomon::new(config.data_shards, config.parity_shards)?;

    let mut padded = segment.to_vec();
    padded.resize(shard_size * config.data_shards, 0);

    let mut shards: Vec<Vec<u8>> = Vec::with_capacity(config.total_shards());
    for i in 0..config.data_shards {
        let start = i * shard_size;
        shards.push(padded[start..start + shard_size].to_vec());
    }
    for _ in 0..config.parity_shards {
        shards.push(vec![0u8; shard_size]);
    }

    rs.encode(&mut shards)?;
    Ok(shards)
}

/// Reconstruct a segment from a partial shard set.
///
/// `shards` must have `k + m` slots, with `None` marking missing shards; at
/// least `k` must be present. The result is trimmed to `segment_len`.
pub fn decode_raw_segment(
    shards: &[Option<Vec<u8>>],
    segment_len: usize,
    config: &ErasureConfig,
) -> Result<Vec<u8>, ErasureError> {
    if shards.len() != config.total_shards() {
        return Err(ErasureError::InvalidData {
            reason: format!(
                "shard slot count ({}) doesn't match total shards ({})",
                shards.len(),
                config.total_shards()
            ),
        });
    }

    let available = shards.iter().filter(|s| s.is_some()).count();
    if available < config.data_shards {
        return Err(ErasureError::InsufficientShards {
            needed: config.data_shards,
            available,
        });
    }

    let shard_size = config.shard_size(segment_len);
    for shard in shards.iter().flatten() {
        if shard.len() != shard_size {
            return Err(ErasureError::ShardSizeMismatch {
                expected: shard_size,
                actual: shard.len(),
            });
        }
    }

    let rs = ReedSolomon::new(config.data_shards, config.parity_shards)?;
    let mut slots: Vec<Option<Vec<u8>>> = shards.to_vec();
    rs.reconstruct(&mut slots)?;

    let mut segment = Vec::with_capacity(shard_size * config.data_shards);
    for slot in slots.iter().take(config.data_shards) {
        match slot {
            Some(shard) => segment.extend_from_slice(shard),
            None => return Err(ErasureError::SegmentCorruption),
        }
    }

    if segment_len > segment.len() {
        return Err(ErasureError::InvalidData {
            reason: format!(
                "segment_len ({}) exceeds reconstructed length ({})",
                segment_len,
                segment.len()
            ),
        });
    }
    segment.truncate(segment_len);
    Ok(segment)
}
