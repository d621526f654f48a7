//! Replicate Object Task Module
//!
//! The orchestrator that drives one object from uploaded to sealed: it
//! solicits approvals from candidate secondaries, reserves memory, fans the
//! payload out shard-by-shard through a stream reader group, verifies each
//! secondary's integrity hash and receipt signature, retries unfilled shard
//! slots against fresh candidates, and finally assembles and submits the
//! seal transaction.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::approval::{ApprovalError, ApprovalProvider, ApprovalResponse};
use crate::chain::{ChainError, ChainListener, SealSigner, SEAL_LISTEN_TIMEOUT_BLOCKS};
use crate::erasure_coding::ErasureError;
use crate::gateway::{GatewayDialer, GatewayError, PieceReceipt, ReplicatePieceRequest};
use crate::model::{
    JobState, MsgSealObject, ObjectId, ObjectInfo, PieceInfo, ReplicatePieceInfo, StorageParams,
    StorageProvider,
};
use crate::piece_store::{compute_segment_count, PieceStore, PieceStoreError};
use crate::pipe::PipeReader;
use crate::progress_cache::ProgressCache;
use crate::resource_manager::{
    MemoryReservation, ReservationPriority, ResourceError, ResourceManager,
};
use crate::signing::{verify_secondary_signature, SecondarySpSignDoc, SigningError};
use crate::sp_db::{SpDb, SpDbError};
use crate::stream_group::{StreamReaderGroup, StreamSource};
use crate::task_queue::{Limit, QueuedTask, TaskKey};

/// Oversubscription factor when soliciting secondary approvals.
pub const REPLICATE_FACTOR: usize = 1;

/// Deadline for gathering secondary approvals.
pub const GET_APPROVAL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum ReplicationError {
    #[error("invalid params: {0}")]
    InvalidParams(String),

    #[error("redundancy count mismatch: expected {expected} checksums, got {actual}")]
    RedundancyCountMismatch { expected: usize, actual: usize },

    #[error("backup storage providers exhausted")]
    ExhaustedSp,

    #[error(
        "integrity hash mismatch at redundancy index {redundancy_index}: \
         expected {expected}, got {actual}"
    )]
    MismatchIntegrityHash {
        redundancy_index: u32,
        expected: String,
        actual: String,
    },

    #[error("task cancelled")]
    Cancelled,

    #[error("signature error: {0}")]
    Signature(#[from] SigningError),

    #[error("approval error: {0}")]
    Approval(#[from] ApprovalError),

    #[error("gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("resource error: {0}")]
    Resource(#[from] ResourceError),

    #[error("piece store error: {0}")]
    PieceStore(#[from] PieceStoreError),

    #[error("erasure coding error: {0}")]
    Erasure(#[from] ErasureError),

    #[error("sp db error: {0}")]
    Db(#[from] SpDbError),

    #[error("task queue error: {0}")]
    Queue(#[from] crate::task_queue::QueueError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Collaborators and knobs shared by every replicate task of a node.
pub struct ReplicateContext {
    pub piece_store: Arc<dyn PieceStore>,
    pub sp_db: Arc<dyn SpDb>,
    pub approver: Arc<dyn ApprovalProvider>,
    pub dialer: Arc<dyn GatewayDialer>,
    pub signer: Arc<dyn SealSigner>,
    pub chain: Arc<dyn ChainListener>,
    pub resource_manager: ResourceManager,
    pub progress_cache: Arc<ProgressCache>,
    pub sp_operator_address: String,
    pub replicate_factor: usize,
    pub approval_timeout: Duration,
}

/// Thread-safe destructive consumer of the ordered candidate-SP pool.
pub struct SpPicker {
    inner: std::sync::Mutex<PickerInner>,
}

struct PickerInner {
    sp_map: HashMap<String, StorageProvider>,
    approval_map: HashMap<String, ApprovalResponse>,
    sorted_endpoints: VecDeque<String>,
}

impl SpPicker {
    /// Order candidates deterministically by endpoint (the map-key sort).
    pub fn new(
        sp_map: HashMap<String, StorageProvider>,
        approval_map: HashMap<String, ApprovalResponse>,
    ) -> Self {
        let mut endpoints: Vec<String> = approval_map.keys().cloned().collect();
        endpoints.sort();
        Self {
            inner: std::sync::Mutex::new(PickerInner {
                sp_map,
                approval_map,
                sorted_endpoints: endpoints.into(),
            }),
        }
    }

    pub fn remaining(&self) -> usize {
        self.lock().sorted_endpoints.len()
    }

    /// Consume the head of the pool. Picked candidates are never replayed.
    pub fn pick(&self) -> Result<(StorageProvider, ApprovalResponse), ReplicationError> {
        let mut inner = self.lock();
        let endpoint = inner
            .sorted_endpoints
            .pop_front()
            .ok_or(ReplicationError::ExhaustedSp)?;
        let sp = inner.sp_map.remove(&endpoint);
        let approval = inner.approval_map.remove(&endpoint);
        match (sp, approval) {
            (Some(sp), Some(approval)) => Ok((sp, approval)),
            _ => {
                error!(%endpoint, "[BUG] endpoint missing from candidate maps");
                Err(ReplicationError::ExhaustedSp)
            }
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PickerInner> {
        self.inner.lock().expect("sp picker lock poisoned")
    }
}

/// Per-shard uploader: streams one pipe to one secondary and validates the
/// receipt it sends back.
pub struct PieceStreamReplicator {
    pub object_id: ObjectId,
    pub piece_size: u32,
    pub redundancy_index: u32,
    pub expected_integrity_hash: Vec<u8>,
    pub stream: PipeReader,
    pub sp: StorageProvider,
    pub approval: ApprovalResponse,
    pub dialer: Arc<dyn GatewayDialer>,
}

impl PieceStreamReplicator {
    /// Stream the shard and verify `(integrity_hash, signature)` against the
    /// expected checksum and the SP's approval address.
    pub async fn replicate(self) -> Result<PieceReceipt, ReplicationError> {
        let gateway = self.dialer.dial(&self.sp.endpoint).await?;
        let receipt = gateway
            .replicate_object_piece_stream(
                ReplicatePieceRequest {
                    object_id: self.object_id,
                    piece_size: self.piece_size,
                    redundancy_index: self.redundancy_index,
                    approval: self.approval,
                },
                self.stream,
            )
            .await?;

        if receipt.integrity_hash != self.expected_integrity_hash {
            return Err(ReplicationError::MismatchIntegrityHash {
                redundancy_index: self.redundancy_index,
                expected: hex::encode(&self.expected_integrity_hash),
                actual: hex::encode(&receipt.integrity_hash),
            });
        }

        let sign_doc = SecondarySpSignDoc::new(
            &self.sp.operator_address,
            self.object_id,
            &receipt.integrity_hash,
        );
        verify_secondary_signature(
            &self.sp.approval_address,
            &sign_doc.sign_bytes()?,
            &receipt.signature,
        )?;

        Ok(receipt)
    }
}

/// Mutable replication progress, mutated only under its mutex by the fan-out
/// tasks. Indices are disjoint per round; the success set only grows.
struct ReplicationProgress {
    succeeded: HashSet<u32>,
    object_info: ObjectInfo,
    seal: MsgSealObject,
    pieces: ReplicatePieceInfo,
}

impl ReplicationProgress {
    fn new(operator: String, object_info: ObjectInfo, redundancy_number: usize) -> Self {
        let seal = MsgSealObject::new(operator, &object_info, redundancy_number);
        let mut object_info = object_info;
        object_info.secondary_sp_addresses = vec![String::new(); redundancy_number];
        Self {
            succeeded: HashSet::new(),
            object_info,
            seal,
            pieces: ReplicatePieceInfo::new(redundancy_number),
        }
    }

    fn record(&mut self, redundancy_index: u32, sp: &StorageProvider, receipt: &PieceReceipt) {
        let slot = redundancy_index as usize;
        self.succeeded.insert(redundancy_index);
        self.seal.secondary_sp_addresses[slot] = sp.operator_address.clone();
        self.seal.secondary_sp_signatures[slot] = receipt.signature.clone();
        self.object_info.secondary_sp_addresses[slot] = sp.operator_address.clone();
        self.pieces.piece_infos[slot] = Some(PieceInfo {
            object_info: self.object_info.clone(),
            integrity_hash: receipt.integrity_hash.clone(),
            signature: receipt.signature.clone(),
        });
    }
}

struct TaskState {
    object_info: ObjectInfo,
    storage_params: Option<StorageParams>,
    segment_piece_number: u32,
    redundancy_number: u32,
    sp_map: HashMap<String, StorageProvider>,
    approval_map: HashMap<String, ApprovalResponse>,
    reservation: Option<MemoryReservation>,
}

/// Background task replicating one object to its secondaries.
pub struct ReplicateObjectTask {
    ctx: Arc<ReplicateContext>,
    cancel: CancellationToken,
    object_id: ObjectId,
    approximate_mem_size: AtomicU64,
    state: tokio::sync::Mutex<TaskState>,
}

/// Memory footprint estimate: one segment held in memory, expanded by the
/// parity overhead, plus the raw segment itself. Small objects scale by
/// payload size instead of segment size.
pub fn approximate_task_memory(payload_size: u64, params: &StorageParams) -> u64 {
    let base = payload_size.min(params.max_segment_size);
    let expansion =
        params.redundancy_number() as f64 / params.redundant_data_chunk_num as f64 + 1.0;
    (base as f64 * expansion) as u64
}

impl ReplicateObjectTask {
    pub fn new(
        ctx: Arc<ReplicateContext>,
        cancel: CancellationToken,
        object_info: ObjectInfo,
    ) -> Result<Self, ReplicationError> {
        if object_info.bucket_name.is_empty() || object_info.object_name.is_empty() {
            return Err(ReplicationError::InvalidParams(
                "object info is missing bucket or object name".to_string(),
            ));
        }
        let object_id = object_info.id;
        let payload_size = object_info.payload_size;
        Ok(Self {
            ctx,
            cancel,
            object_id,
            approximate_mem_size: AtomicU64::new(payload_size),
            state: tokio::sync::Mutex::new(TaskState {
                object_info,
                storage_params: None,
                segment_piece_number: 0,
                redundancy_number: 0,
                sp_map: HashMap::new(),
                approval_map: HashMap::new(),
                reservation: None,
            }),
        })
    }

    pub fn object_id(&self) -> ObjectId {
        self.object_id
    }

    /// Synchronize the resources the task needs: storage params, derived
    /// counts, candidate approvals, and the memory reservation. Runs once;
    /// any failure aborts before wire traffic.
    pub async fn init(&self) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().await;
        if state.storage_params.is_some() {
            return Err(ReplicationError::InvalidParams(
                "task already initialized".to_string(),
            ));
        }

        let params = self.ctx.sp_db.get_storage_params().await?;
        let segment_piece_number =
            compute_segment_count(state.object_info.payload_size, params.max_segment_size);
        let redundancy_number = params.redundancy_number();

        let expected_checksums = redundancy_number as usize + 1;
        if state.object_info.checksums.len() != expected_checksums {
            error!(
                object_id = self.object_id,
                expected = expected_checksums,
                actual = state.object_info.checksums.len(),
                "failed to init due to redundancy number is not equal to checksums"
            );
            return Err(ReplicationError::RedundancyCountMismatch {
                expected: expected_checksums,
                actual: state.object_info.checksums.len(),
            });
        }

        let (sp_map, approval_map) = self
            .ctx
            .approver
            .get_approval(
                &state.object_info,
                redundancy_number as usize,
                redundancy_number as usize * self.ctx.replicate_factor,
                self.ctx.approval_timeout,
            )
            .await?;

        let mem_size = approximate_task_memory(state.object_info.payload_size, &params);
        let reservation = self
            .ctx
            .resource_manager
            .reserve_memory(mem_size, ReservationPriority::Always)?;
        self.approximate_mem_size.store(mem_size, Ordering::Release);
        debug!(
            object_id = self.object_id,
            reserve_size = mem_size,
            state = %self.ctx.resource_manager.state(),
            "reserve memory from resource manager"
        );

        state.storage_params = Some(params);
        state.segment_piece_number = segment_piece_number;
        state.redundancy_number = redundancy_number;
        state.sp_map = sp_map;
        state.approval_map = approval_map;
        state.reservation = Some(reservation);
        Ok(())
    }

    /// Init then execute.
    pub async fn run(&self) -> Result<(), ReplicationError> {
        self.init().await?;
        self.execute().await
    }

    /// Drive the outer retry loop until every redundancy index is satisfied,
    /// then sign and seal. The memory reservation is released on every exit
    /// path.
    pub async fn execute(&self) -> Result<(), ReplicationError> {
        let mut state = self.state.lock().await;
        // dropping this guard releases the reservation no matter how we leave
        let _reservation = state.reservation.take();
        let params = state.storage_params.ok_or_else(|| {
            ReplicationError::InvalidParams("task executed before init".to_string())
        })?;
        let redundancy_number = state.redundancy_number;

        // replication is idempotent over job state: a sealed object stays sealed
        match self.ctx.sp_db.get_job_state(self.object_id).await {
            Ok(Some(JobState::SealDone)) => {
                info!(object_id = self.object_id, "object already sealed");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => warn!(object_id = self.object_id, error = %e, "failed to read job state"),
        }

        self.update_task_state(JobState::ReplicateDoing).await;

        let picker = Arc::new(SpPicker::new(
            std::mem::take(&mut state.sp_map),
            std::mem::take(&mut state.approval_map),
        ));
        let progress = Arc::new(std::sync::Mutex::new(ReplicationProgress::new(
            self.ctx.sp_operator_address.clone(),
            state.object_info.clone(),
            redundancy_number as usize,
        )));

        loop {
            if self.cancel.is_cancelled() {
                warn!(object_id = self.object_id, "replicate task cancelled");
                self.update_task_state(JobState::ReplicateError).await;
                return Err(ReplicationError::Cancelled);
            }

            let succeeded = {
                let progress = progress.lock().expect("progress lock poisoned");
                progress.succeeded.clone()
            };
            if succeeded.len() == redundancy_number as usize {
                info!(object_id = self.object_id, "succeed to replicate object data");
                break;
            }

            let source = Arc::new(StreamSource {
                object_info: state.object_info.clone(),
                storage_params: params,
                segment_piece_number: state.segment_piece_number,
                piece_store: Arc::clone(&self.ctx.piece_store),
                cancel: self.cancel.clone(),
            });
            let mut group = match StreamReaderGroup::new(source, &succeeded) {
                Ok(group) => group,
                Err(e) => {
                    error!(object_id = self.object_id, error = %e, "failed to new stream reader group");
                    self.update_task_state(JobState::ReplicateError).await;
                    return Err(e);
                }
            };
            if group.active_count() > picker.remaining() {
                error!(
                    object_id = self.object_id,
                    unfilled = group.active_count(),
                    remaining_sp = picker.remaining(),
                    "failed to replicate due to sp is not enough"
                );
                self.update_task_state(JobState::ReplicateError).await;
                return Err(ReplicationError::ExhaustedSp);
            }

            let piece_size = group.produce().await as u32;

            let mut fan_out = JoinSet::new();
            for redundancy_index in group.active_indices() {
                let Some(stream) = group.take_reader(redundancy_index) else {
                    continue;
                };
                let expected_integrity_hash =
                    state.object_info.checksums[redundancy_index as usize + 1].clone();
                let ctx = Arc::clone(&self.ctx);
                let picker = Arc::clone(&picker);
                let progress = Arc::clone(&progress);
                let object_id = self.object_id;

                fan_out.spawn(async move {
                    let (sp, approval) = match picker.pick() {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(redundancy_index, error = %e, "failed to pick a secondary sp");
                            return;
                        }
                    };
                    let endpoint = sp.endpoint.clone();
                    let replicator = PieceStreamReplicator {
                        object_id,
                        piece_size,
                        redundancy_index,
                        expected_integrity_hash,
                        stream,
                        sp: sp.clone(),
                        approval,
                        dialer: Arc::clone(&ctx.dialer),
                    };
                    match replicator.replicate().await {
                        Ok(receipt) => {
                            let (object_snapshot, piece_snapshot) = {
                                let mut progress =
                                    progress.lock().expect("progress lock poisoned");
                                progress.record(redundancy_index, &sp, &receipt);
                                (progress.object_info.clone(), progress.pieces.clone())
                            };
                            // best-effort persistence; the fan-out never stalls on it
                            if let Err(e) =
                                ctx.sp_db.set_object_info(object_id, &object_snapshot).await
                            {
                                warn!(object_id, error = %e, "failed to persist object info");
                            }
                            if let Err(e) = ctx
                                .sp_db
                                .set_replicate_piece_info(object_id, &piece_snapshot)
                                .await
                            {
                                warn!(object_id, error = %e, "failed to persist piece progress");
                            }
                            ctx.progress_cache.add(object_id, piece_snapshot);
                            info!(
                                sp = %sp.operator_address,
                                endpoint = %endpoint,
                                redundancy_index,
                                "succeed to replicate object piece stream to the target sp"
                            );
                        }
                        Err(e) => {
                            warn!(
                                redundancy_index,
                                endpoint = %endpoint,
                                error = %e,
                                "failed to replicate piece stream"
                            );
                        }
                    }
                });
            }
            while let Some(joined) = fan_out.join_next().await {
                if let Err(e) = joined {
                    error!(object_id = self.object_id, error = %e, "replicator task panicked");
                }
            }
        }

        let (seal_msg, final_object_info, final_pieces) = {
            let progress = progress.lock().expect("progress lock poisoned");
            (
                progress.seal.clone(),
                progress.object_info.clone(),
                progress.pieces.clone(),
            )
        };
        state.object_info = final_object_info;
        // concurrent per-shard writes may have landed out of order; the
        // complete snapshot wins
        if let Err(e) = self
            .ctx
            .sp_db
            .set_object_info(self.object_id, &state.object_info)
            .await
        {
            warn!(object_id = self.object_id, error = %e, "failed to persist object info");
        }
        if let Err(e) = self
            .ctx
            .sp_db
            .set_replicate_piece_info(self.object_id, &final_pieces)
            .await
        {
            warn!(object_id = self.object_id, error = %e, "failed to persist piece progress");
        }
        self.ctx.progress_cache.add(self.object_id, final_pieces);

        self.update_task_state(JobState::SignDoing).await;
        match self.ctx.signer.seal_object_on_chain(&seal_msg).await {
            Ok(tx_hash) => {
                debug!(object_id = self.object_id, tx_hash = %tx_hash, "seal transaction submitted");
            }
            Err(e) => {
                error!(object_id = self.object_id, error = %e, "failed to sign object by signer");
                self.update_task_state(JobState::SignError).await;
                return Err(e.into());
            }
        }

        self.update_task_state(JobState::SealDoing).await;
        if let Err(e) = self
            .ctx
            .chain
            .listen_object_seal(
                &state.object_info.bucket_name,
                &state.object_info.object_name,
                SEAL_LISTEN_TIMEOUT_BLOCKS,
            )
            .await
        {
            error!(object_id = self.object_id, error = %e, "failed to seal object on chain");
            self.update_task_state(JobState::SealError).await;
            return Err(e.into());
        }

        self.update_task_state(JobState::SealDone).await;
        info!(object_id = self.object_id, "succeed to seal object on chain");
        Ok(())
    }

    async fn update_task_state(&self, next: JobState) {
        match self.ctx.sp_db.update_job_state(self.object_id, next).await {
            Ok(()) => info!(object_id = self.object_id, state = %next, "job state updated"),
            Err(e) => {
                error!(object_id = self.object_id, state = %next, error = %e, "failed to update job state")
            }
        }
    }
}

impl QueuedTask for ReplicateObjectTask {
    fn key(&self) -> TaskKey {
        TaskKey(format!("replicate-object-{}", self.object_id))
    }

    fn estimate_limit(&self) -> Limit {
        Limit::with_memory(self.approximate_mem_size.load(Ordering::Acquire))
    }
}
