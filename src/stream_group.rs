//! Stream Reader Group Module
//!
//! One-source, many-sink piece pipeline. A single producer walks the
//! object's segments in order, erasure-encodes each one (or replicates it),
//! and writes shard `i` of every segment into pipe `i`. Consumers stream
//! their pipe to one secondary each; back-pressure from the slowest consumer
//! throttles the whole group because shards advance in lock-step.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::erasure_coding::encode_raw_segment;
use crate::model::{ObjectInfo, RedundancyType, StorageParams};
use crate::piece_store::{PieceKey, PieceStore};
use crate::pipe::{piece_pipe, PipeError, PipeReader, PipeWriter};
use crate::replicate_task::ReplicationError;

/// Everything the producer needs to walk one object's segments.
pub struct StreamSource {
    pub object_info: ObjectInfo,
    pub storage_params: StorageParams,
    pub segment_piece_number: u32,
    pub piece_store: Arc<dyn PieceStore>,
    pub cancel: CancellationToken,
}

/// A group of per-shard piece streams fed by one producer.
pub struct StreamReaderGroup {
    source: Arc<StreamSource>,
    piece_size: usize,
    readers: HashMap<u32, PipeReader>,
    writers: Option<HashMap<u32, PipeWriter>>,
}

impl StreamReaderGroup {
    /// Build pipes for every redundancy index not in `exclude_indices`.
    pub fn new(
        source: Arc<StreamSource>,
        exclude_indices: &HashSet<u32>,
    ) -> Result<Self, ReplicationError> {
        let redundancy_number = source.storage_params.redundancy_number();
        let mut readers = HashMap::new();
        let mut writers = HashMap::new();
        for idx in 0..redundancy_number {
            if exclude_indices.contains(&idx) {
                continue;
            }
            let (writer, reader) = piece_pipe();
            writers.insert(idx, writer);
            readers.insert(idx, reader);
        }
        if readers.is_empty() {
            return Err(ReplicationError::InvalidParams(
                "stream reader group has no active redundancy index".to_string(),
            ));
        }
        Ok(Self {
            source,
            piece_size: 0,
            readers,
            writers: Some(writers),
        })
    }

    pub fn active_count(&self) -> usize {
        self.readers.len()
    }

    pub fn active_indices(&self) -> Vec<u32> {
        let mut indices: Vec<u32> = self.readers.keys().copied().collect();
        indices.sort_unstable();
        indices
    }

    /// Post-encoding shard size, valid after [`Self::produce`] returns.
    pub fn piece_size(&self) -> usize {
        self.piece_size
    }

    /// Hand the consumer its pipe end for `redundancy_index`.
    pub fn take_reader(&mut self, redundancy_index: u32) -> Option<PipeReader> {
        self.readers.remove(&redundancy_index)
    }

    /// Spawn the producer and block until it publishes the piece size.
    ///
    /// The size arrives exactly once per group, at the first segment
    /// boundary. A producer that dies before that boundary drops the sender;
    /// the group then reports size 0 and the pipes carry the error.
    pub async fn produce(&mut self) -> usize {
        if let Some(writers) = self.writers.take() {
            let (size_tx, size_rx) = oneshot::channel();
            let source = Arc::clone(&self.source);
            tokio::spawn(produce_stream_piece_data(source, writers, size_tx));
            self.piece_size = size_rx.await.unwrap_or(0);
        }
        self.piece_size
    }
}

/// Producer body: fetch, encode, fan out, close.
async fn produce_stream_piece_data(
    source: Arc<StreamSource>,
    mut writers: HashMap<u32, PipeWriter>,
    size_tx: oneshot::Sender<usize>,
) {
    let object_id = source.object_info.id;
    let mut size_tx = Some(size_tx);

    for segment_idx in 0..source.segment_piece_number {
        if source.cancel.is_cancelled() {
            close_all_with_error(writers, "task cancelled".to_string()).await;
            return;
        }
        let key = PieceKey::segment(object_id, segment_idx);
        let segment = match source.piece_store.get_piece(key, 0, 0).await {
            Ok(data) => data,
            Err(e) => {
                error!(piece_key = %key, error = %e, "failed to get piece data");
                close_all_with_error(writers, e.to_string()).await;
                return;
            }
        };

        let piece_size;
        match source.object_info.redundancy_type {
            RedundancyType::Ec => {
                let shards = match encode_raw_segment(
                    &segment,
                    source.storage_params.redundant_data_chunk_num as usize,
                    source.storage_params.redundant_parity_chunk_num as usize,
                ) {
                    Ok(shards) => shards,
                    Err(e) => {
                        error!(piece_key = %key, error = %e, "failed to encode ec piece data");
                        close_all_with_error(writers, e.to_string()).await;
                        return;
                    }
                };
                piece_size = shards[0].len();
                publish_once(&mut size_tx, piece_size);
                for (idx, writer) in writers.iter() {
                    if writer.write(shards[*idx as usize].clone()).await.is_err() {
                        debug!(redundancy_index = idx, "piece stream consumer went away");
                    }
                }
            }
            RedundancyType::Replica => {
                piece_size = segment.len();
                publish_once(&mut size_tx, piece_size);
                for (idx, writer) in writers.iter() {
                    if writer.write(segment.clone()).await.is_err() {
                        debug!(redundancy_index = idx, "piece stream consumer went away");
                    }
                }
            }
        }
        debug!(
            segment_idx,
            piece_size, "succeed to produce a segment's piece data"
        );
    }

    // zero-segment objects still publish a size so the consumer never hangs
    publish_once(&mut size_tx, 0);
    for (idx, writer) in writers.drain() {
        writer.close();
        debug!(redundancy_index = idx, "succeed to finish a piece stream");
    }
}

fn publish_once(size_tx: &mut Option<oneshot::Sender<usize>>, size: usize) {
    if let Some(tx) = size_tx.take() {
        // the consumer may have given up waiting; nothing to do then
        let _ = tx.send(size);
    }
}

async fn close_all_with_error(mut writers: HashMap<u32, PipeWriter>, reason: String) {
    for (_, writer) in writers.drain() {
        writer.close_with_error(PipeError::new(reason.clone())).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ObjectId;
    use crate::piece_store::MemoryPieceStore;

    fn test_params() -> StorageParams {
        StorageParams {
            max_segment_size: 1024,
            redundant_data_chunk_num: 4,
            redundant_parity_chunk_num: 2,
        }
    }

    fn test_source(
        object_id: ObjectId,
        payload: &[u8],
        redundancy_type: RedundancyType,
    ) -> Arc<StreamSource> {
        let params = test_params();
        let store = MemoryPieceStore::new();
        store.put_payload(object_id, payload, params.max_segment_size);
        Arc::new(StreamSource {
            object_info: ObjectInfo {
                id: object_id,
                bucket_name: "bucket".to_string(),
                object_name: "object".to_string(),
                payload_size: payload.len() as u64,
                redundancy_type,
                checksums: Vec::new(),
                secondary_sp_addresses: Vec::new(),
            },
            storage_params: params,
            segment_piece_number: crate::piece_store::compute_segment_count(
                payload.len() as u64,
                params.max_segment_size,
            ),
            piece_store: Arc::new(store),
            cancel: CancellationToken::new(),
        })
    }

    #[tokio::test]
    async fn test_empty_active_set_rejected() {
        let source = test_source(1, &[0u8; 100], RedundancyType::Ec);
        let exclude: HashSet<u32> = (0..6).collect();
        let result = StreamReaderGroup::new(source, &exclude);
        assert!(matches!(
            result.err().unwrap(),
            ReplicationError::InvalidParams(_)
        ));
    }

    #[tokio::test]
    async fn test_ec_streams_match_encoder_output() {
        let payload: Vec<u8> = (0..3072).map(|i| (i % 256) as u8).collect();
        let source = test_source(2, &payload, RedundancyType::Ec);
        let mut group = StreamReaderGroup::new(Arc::clone(&source), &HashSet::new()).unwrap();
        assert_eq!(group.active_count(), 6);

        // consumers drain concurrently; the lock-step producer would stall
        // on a full pipe otherwise
        let mut consumers = Vec::new();
        for idx in group.active_indices() {
            let mut reader = group.take_reader(idx).unwrap();
            consumers.push((
                idx,
                tokio::spawn(async move {
                    let mut bytes = Vec::new();
                    let mut piece_count = 0usize;
                    while let Some(piece) = reader.next_piece().await.unwrap() {
                        piece_count += 1;
                        bytes.extend_from_slice(&piece);
                    }
                    (piece_count, bytes)
                }),
            ));
        }

        let piece_size = group.produce().await;
        // 3 full segments of 1024 bytes; shard size = 1024 / 4
        assert_eq!(piece_size, 256);

        // every shard stream equals the per-segment encoder output
        let mut expected: HashMap<u32, Vec<u8>> = (0..6).map(|i| (i, Vec::new())).collect();
        for segment in payload.chunks(1024) {
            let shards = encode_raw_segment(segment, 4, 2).unwrap();
            for (idx, shard) in shards.iter().enumerate() {
                expected.get_mut(&(idx as u32)).unwrap().extend_from_slice(shard);
            }
        }
        for (idx, consumer) in consumers {
            let (piece_count, bytes) = consumer.await.unwrap();
            // one write per segment, cumulative bytes = segments * piece size
            assert_eq!(piece_count, 3);
            assert_eq!(bytes.len(), 3 * piece_size);
            assert_eq!(&bytes, expected.get(&idx).unwrap());
        }
    }

    #[tokio::test]
    async fn test_replica_streams_carry_raw_segments() {
        let payload = vec![0x42u8; 1500];
        let source = test_source(3, &payload, RedundancyType::Replica);
        let exclude: HashSet<u32> = [0, 1, 2, 4].into_iter().collect();
        let mut group = StreamReaderGroup::new(source, &exclude).unwrap();
        assert_eq!(group.active_indices(), vec![3, 5]);

        let mut reader_3 = group.take_reader(3).unwrap();
        let mut reader_5 = group.take_reader(5).unwrap();
        let consumer_3 = tokio::spawn(async move { reader_3.read_to_end().await.unwrap() });
        let consumer_5 = tokio::spawn(async move { reader_5.read_to_end().await.unwrap() });

        let piece_size = group.produce().await;
        assert_eq!(piece_size, 1024);

        assert_eq!(consumer_3.await.unwrap(), payload);
        assert_eq!(consumer_5.await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_missing_piece_closes_pipes_with_error() {
        let params = test_params();
        let source = Arc::new(StreamSource {
            object_info: ObjectInfo {
                id: 77,
                bucket_name: "bucket".to_string(),
                object_name: "object".to_string(),
                payload_size: 4096,
                redundancy_type: RedundancyType::Ec,
                checksums: Vec::new(),
                secondary_sp_addresses: Vec::new(),
            },
            storage_params: params,
            // claims 4 segments but the store holds none
            segment_piece_number: 4,
            piece_store: Arc::new(MemoryPieceStore::new()),
            cancel: CancellationToken::new(),
        });

        let mut group = StreamReaderGroup::new(source, &HashSet::new()).unwrap();
        let mut reader = group.take_reader(0).unwrap();
        let piece_size = group.produce().await;
        assert_eq!(piece_size, 0);

        let error = reader.next_piece().await.unwrap_err();
        assert!(error.reason.contains("piece not found"));
    }

    #[tokio::test]
    async fn test_cancellation_aborts_producer() {
        let payload = vec![1u8; 512];
        let source = test_source(4, &payload, RedundancyType::Ec);
        source.cancel.cancel();

        let mut group = StreamReaderGroup::new(Arc::clone(&source), &HashSet::new()).unwrap();
        let mut reader = group.take_reader(0).unwrap();
        group.produce().await;

        let error = reader.next_piece().await.unwrap_err();
        assert_eq!(error.reason, "task cancelled");
    }

    #[tokio::test]
    async fn test_identical_inputs_produce_identical_streams() {
        // single segment so the untaken pipes never block the producer
        let payload: Vec<u8> = (0..1000).map(|i| (i * 13 % 256) as u8).collect();
        let mut streams = Vec::new();
        for _ in 0..2 {
            let source = test_source(5, &payload, RedundancyType::Ec);
            let mut group = StreamReaderGroup::new(source, &HashSet::new()).unwrap();
            let mut reader = group.take_reader(2).unwrap();
            group.produce().await;
            streams.push(reader.read_to_end().await.unwrap());
        }
        assert!(!streams[0].is_empty());
        assert_eq!(streams[0], streams[1]);
    }
}
