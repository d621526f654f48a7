//! Piece Store Module
//!
//! Seam to the object storage backend holding uploaded segment pieces, plus
//! the segment key encoding and segment count math shared by the upload and
//! replication paths.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use thiserror::Error;

use crate::model::ObjectId;

/// Key of one stored segment piece: `(object_id, segment_index)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PieceKey {
    pub object_id: ObjectId,
    pub segment_index: u32,
}

impl PieceKey {
    pub fn segment(object_id: ObjectId, segment_index: u32) -> Self {
        Self {
            object_id,
            segment_index,
        }
    }

    /// Canonical backend key string, `"{object_id}_s{segment_index}"`.
    pub fn encode(&self) -> String {
        format!("{}_s{}", self.object_id, self.segment_index)
    }
}

impl std::fmt::Display for PieceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Number of segments a payload of `payload_size` bytes occupies.
pub fn compute_segment_count(payload_size: u64, max_segment_size: u64) -> u32 {
    if max_segment_size == 0 {
        return 0;
    }
    payload_size.div_ceil(max_segment_size) as u32
}

#[derive(Error, Debug)]
pub enum PieceStoreError {
    #[error("piece not found: {key}")]
    PieceNotFound { key: String },

    #[error("piece store backend error: {0}")]
    Backend(String),
}

/// Object storage backend for segment pieces.
///
/// `offset == 0 && length == 0` reads the whole piece.
#[async_trait]
pub trait PieceStore: Send + Sync {
    async fn get_piece(
        &self,
        key: PieceKey,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, PieceStoreError>;

    async fn put_piece(&self, key: PieceKey, data: Vec<u8>) -> Result<(), PieceStoreError>;
}

/// In-memory piece store used by tests and local single-node setups.
#[derive(Default)]
pub struct MemoryPieceStore {
    pieces: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryPieceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a whole payload segment-by-segment under its object id.
    pub fn put_payload(&self, object_id: ObjectId, payload: &[u8], max_segment_size: u64) {
        let mut pieces = self.pieces.write().expect("piece store lock poisoned");
        for (idx, segment) in payload.chunks(max_segment_size as usize).enumerate() {
            let key = PieceKey::segment(object_id, idx as u32);
            pieces.insert(key.encode(), segment.to_vec());
        }
    }
}

#[async_trait]
impl PieceStore for MemoryPieceStore {
    async fn get_piece(
        &self,
        key: PieceKey,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, PieceStoreError> {
        let pieces = self.pieces.read().expect("piece store lock poisoned");
        let data = pieces
            .get(&key.encode())
            .ok_or_else(|| PieceStoreError::PieceNotFound { key: key.encode() })?;
        if offset == 0 && length == 0 {
            return Ok(data.clone());
        }
        let start = offset as usize;
        let end = (offset + length) as usize;
        if end > data.len() || start > end {
            return Err(PieceStoreError::Backend(format!(
                "range {}..{} out of bounds for piece of {} bytes",
                start,
                end,
                data.len()
            )));
        }
        Ok(data[start..end].to_vec())
    }

    async fn put_piece(&self, key: PieceKey, data: Vec<u8>) -> Result<(), PieceStoreError> {
        let mut pieces = self.pieces.write().expect("piece store lock poisoned");
        pieces.insert(key.encode(), data);
        Ok(())
    }
}
