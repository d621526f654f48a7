//! Shared fixtures for replication integration tests: an in-process fleet of
//! mock secondary SPs that hash and sign what they receive, plus mock
//! approval, signer, and chain collaborators with scripted failure knobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use fastcrypto::secp256k1::Secp256k1KeyPair;
use fastcrypto::traits::KeyPair;
use rand::rngs::StdRng;
use rand::SeedableRng;

use shardcast::approval::{ApprovalError, ApprovalProvider, ApprovalResponse};
use shardcast::chain::{ChainError, ChainListener, SealSigner};
use shardcast::gateway::{
    GatewayDialer, GatewayError, PieceReceipt, ReplicatePieceRequest, SecondaryGateway,
};
use shardcast::integrity::{generate_checksum_set, IntegrityAccumulator};
use shardcast::model::{
    MsgSealObject, ObjectId, ObjectInfo, RedundancyType, StorageParams, StorageProvider,
};
use shardcast::piece_store::MemoryPieceStore;
use shardcast::pipe::PipeReader;
use shardcast::signing::{address_from_public_key, sign_secondary_receipt, SecondarySpSignDoc};
use shardcast::sp_db::MemorySpDb;
use shardcast::{TaskNode, TaskNodeConfig, TaskNodeDeps};

pub fn test_storage_params() -> StorageParams {
    StorageParams {
        max_segment_size: 1 << 20,
        redundant_data_chunk_num: 4,
        redundant_parity_chunk_num: 2,
    }
}

/// One shard stream as a mock secondary observed it.
pub struct ReceivedStream {
    pub redundancy_index: u32,
    pub piece_size: u32,
    pub piece_count: usize,
    pub bytes: Vec<u8>,
}

/// A mock secondary SP: stores nothing, but hashes and signs faithfully.
pub struct SecondaryNode {
    pub keypair: Secp256k1KeyPair,
    pub sp: StorageProvider,
    /// Corrupt the next reported integrity hash (fires once).
    pub corrupt_next_hash: AtomicBool,
    /// Refuse dial attempts.
    pub unreachable: AtomicBool,
    pub replicate_calls: AtomicUsize,
    pub received: Mutex<Vec<ReceivedStream>>,
}

impl SecondaryNode {
    pub fn new(index: usize) -> Arc<Self> {
        let keypair = Secp256k1KeyPair::generate(&mut StdRng::from_seed([index as u8 + 1; 32]));
        let approval_address = address_from_public_key(keypair.public());
        let sp = StorageProvider {
            operator_address: hex::encode([index as u8 + 1; 20]),
            approval_address,
            endpoint: format!("sp-{index:03}.example"),
        };
        Arc::new(Self {
            keypair,
            sp,
            corrupt_next_hash: AtomicBool::new(false),
            unreachable: AtomicBool::new(false),
            replicate_calls: AtomicUsize::new(0),
            received: Mutex::new(Vec::new()),
        })
    }
}

/// The reachable fleet of mock secondaries, keyed by endpoint.
pub struct SecondaryNet {
    nodes: Vec<Arc<SecondaryNode>>,
}

impl SecondaryNet {
    pub fn new(count: usize) -> Arc<Self> {
        Arc::new(Self {
            nodes: (0..count).map(SecondaryNode::new).collect(),
        })
    }

    pub fn node(&self, index: usize) -> &Arc<SecondaryNode> {
        &self.nodes[index]
    }

    pub fn lookup(&self, endpoint: &str) -> Option<Arc<SecondaryNode>> {
        self.nodes
            .iter()
            .find(|node| node.sp.endpoint == endpoint)
            .cloned()
    }

    pub fn total_replicate_calls(&self) -> usize {
        self.nodes
            .iter()
            .map(|node| node.replicate_calls.load(Ordering::SeqCst))
            .sum()
    }
}

struct MockGateway {
    node: Arc<SecondaryNode>,
}

#[async_trait]
impl SecondaryGateway for MockGateway {
    async fn replicate_object_piece_stream(
        &self,
        request: ReplicatePieceRequest,
        mut stream: PipeReader,
    ) -> Result<PieceReceipt, GatewayError> {
        self.node.replicate_calls.fetch_add(1, Ordering::SeqCst);

        let mut accumulator = IntegrityAccumulator::new();
        let mut bytes = Vec::new();
        let mut piece_count = 0usize;
        loop {
            match stream.next_piece().await {
                Ok(Some(piece)) => {
                    accumulator.absorb_piece(&piece);
                    bytes.extend_from_slice(&piece);
                    piece_count += 1;
                }
                Ok(None) => break,
                Err(e) => return Err(GatewayError::Transport(e.to_string())),
            }
        }

        let mut integrity_hash = accumulator.finalize();
        if self.node.corrupt_next_hash.swap(false, Ordering::SeqCst) {
            integrity_hash[0] ^= 0xFF;
        }

        let sign_doc = SecondarySpSignDoc::new(
            &self.node.sp.operator_address,
            request.object_id,
            &integrity_hash,
        );
        let sign_bytes = sign_doc
            .sign_bytes()
            .map_err(|e| GatewayError::Rejected(e.to_string()))?;
        let signature = sign_secondary_receipt(&self.node.keypair, &sign_bytes);

        self.node
            .received
            .lock()
            .expect("received lock poisoned")
            .push(ReceivedStream {
                redundancy_index: request.redundancy_index,
                piece_size: request.piece_size,
                piece_count,
                bytes,
            });

        Ok(PieceReceipt {
            integrity_hash,
            signature,
        })
    }
}

pub struct MockDialer {
    net: Arc<SecondaryNet>,
}

#[async_trait]
impl GatewayDialer for MockDialer {
    async fn dial(&self, endpoint: &str) -> Result<Box<dyn SecondaryGateway>, GatewayError> {
        let node = self
            .net
            .lookup(endpoint)
            .ok_or_else(|| GatewayError::Dial {
                endpoint: endpoint.to_string(),
                reason: "unknown endpoint".to_string(),
            })?;
        if node.unreachable.load(Ordering::SeqCst) {
            return Err(GatewayError::Dial {
                endpoint: endpoint.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(Box::new(MockGateway { node }))
    }
}

/// Approval layer backed by the mock fleet: hands out every reachable
/// candidate (the ask is a soft minimum, spares included).
pub struct MockApprover {
    net: Arc<SecondaryNet>,
    pub calls: AtomicUsize,
}

#[async_trait]
impl ApprovalProvider for MockApprover {
    async fn get_approval(
        &self,
        object: &ObjectInfo,
        _expect: usize,
        _ask: usize,
        _timeout: Duration,
    ) -> Result<
        (
            HashMap<String, StorageProvider>,
            HashMap<String, ApprovalResponse>,
        ),
        ApprovalError,
    > {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut sp_map = HashMap::new();
        let mut approval_map = HashMap::new();
        for node in &self.net.nodes {
            let approval = ApprovalResponse {
                object_id: object.id,
                sp_operator_address: node.sp.operator_address.clone(),
                expired_height: 10_000,
                signature: sign_secondary_receipt(&node.keypair, &object.id.to_be_bytes()),
            };
            sp_map.insert(node.sp.endpoint.clone(), node.sp.clone());
            approval_map.insert(node.sp.endpoint.clone(), approval);
        }
        Ok((sp_map, approval_map))
    }
}

#[derive(Default)]
pub struct MockSigner {
    pub fail: AtomicBool,
    pub sealed: Mutex<Vec<MsgSealObject>>,
}

#[async_trait]
impl SealSigner for MockSigner {
    async fn seal_object_on_chain(&self, msg: &MsgSealObject) -> Result<String, ChainError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChainError::SignRejected("scripted failure".to_string()));
        }
        self.sealed
            .lock()
            .expect("sealed lock poisoned")
            .push(msg.clone());
        Ok(format!("0x{}", hex::encode([0xFEu8; 8])))
    }
}

#[derive(Default)]
pub struct MockChain {
    pub fail: AtomicBool,
    pub listened: AtomicUsize,
}

#[async_trait]
impl ChainListener for MockChain {
    async fn listen_object_seal(
        &self,
        _bucket_name: &str,
        _object_name: &str,
        timeout_blocks: u64,
    ) -> Result<(), ChainError> {
        self.listened.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(ChainError::SealTimeout {
                blocks: timeout_blocks,
            });
        }
        Ok(())
    }
}

/// Operator address of the primary SP under test.
pub fn primary_operator_address() -> String {
    hex::encode([0xEEu8; 20])
}

pub struct TestCluster {
    pub node: TaskNode,
    pub net: Arc<SecondaryNet>,
    pub params: StorageParams,
    pub piece_store: Arc<MemoryPieceStore>,
    pub sp_db: Arc<MemorySpDb>,
    pub approver: Arc<MockApprover>,
    pub signer: Arc<MockSigner>,
    pub chain: Arc<MockChain>,
}

/// Wire up a task node against `secondary_count` mock secondaries.
pub fn build_cluster(secondary_count: usize, params: StorageParams) -> TestCluster {
    let net = SecondaryNet::new(secondary_count);
    let piece_store = Arc::new(MemoryPieceStore::new());
    let sp_db = Arc::new(MemorySpDb::with_storage_params(params));
    let approver = Arc::new(MockApprover {
        net: Arc::clone(&net),
        calls: AtomicUsize::new(0),
    });
    let signer = Arc::new(MockSigner::default());
    let chain = Arc::new(MockChain::default());

    let node = TaskNode::new(
        TaskNodeConfig::new(primary_operator_address()),
        TaskNodeDeps {
            piece_store: Arc::clone(&piece_store) as _,
            sp_db: Arc::clone(&sp_db) as _,
            approver: Arc::clone(&approver) as _,
            dialer: Arc::new(MockDialer {
                net: Arc::clone(&net),
            }),
            signer: Arc::clone(&signer) as _,
            chain: Arc::clone(&chain) as _,
        },
    )
    .expect("task node config is valid");

    TestCluster {
        node,
        net,
        params,
        piece_store,
        sp_db,
        approver,
        signer,
        chain,
    }
}

impl TestCluster {
    /// Seed the piece store with `payload` and return its object info with a
    /// consistent checksum set.
    pub fn put_object(
        &self,
        object_id: ObjectId,
        payload: &[u8],
        redundancy_type: RedundancyType,
    ) -> ObjectInfo {
        self.piece_store
            .put_payload(object_id, payload, self.params.max_segment_size);
        let checksums = generate_checksum_set(payload, &self.params, redundancy_type)
            .expect("checksum generation succeeds");
        ObjectInfo {
            id: object_id,
            bucket_name: "test-bucket".to_string(),
            object_name: format!("object-{object_id}"),
            payload_size: payload.len() as u64,
            redundancy_type,
            checksums,
            secondary_sp_addresses: Vec::new(),
        }
    }
}
