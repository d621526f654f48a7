//! Object replication core of a decentralized storage provider.
//!
//! After a primary SP lands an upload in its piece store, this crate fans
//! the payload out to secondary SPs with erasure-coded or replicated
//! redundancy, verifies per-shard integrity hashes and receipt signatures,
//! aggregates the signatures into a seal message, and drives the job to its
//! on-chain sealed state.

pub mod approval;
pub mod chain;
pub mod erasure_coding;
pub mod gateway;
pub mod integrity;
pub mod model;
pub mod piece_store;
pub mod pipe;
pub mod progress_cache;
pub mod replicate_task;
pub mod resource_manager;
pub mod signing;
pub mod sp_db;
pub mod stream_group;
pub mod task_node;
pub mod task_queue;

pub use model::{JobState, ObjectId, ObjectInfo, RedundancyType, StorageParams};
pub use replicate_task::{ReplicateObjectTask, ReplicationError};
pub use task_node::{TaskNode, TaskNodeConfig, TaskNodeDeps};
