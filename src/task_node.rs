//! Task Node Module
//!
//! Service wrapper owning the replication collaborators, the bounded task
//! queue, the process-wide resource manager, and the progress cache. The
//! gateway hands finished uploads to [`TaskNode::replicate_object`], which
//! admits a task to the queue, drives it to completion, and retires it.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::approval::ApprovalProvider;
use crate::chain::{ChainListener, SealSigner};
use crate::gateway::GatewayDialer;
use crate::model::{ObjectId, ObjectInfo};
use crate::piece_store::PieceStore;
use crate::progress_cache::ProgressCache;
use crate::replicate_task::{
    ReplicateContext, ReplicateObjectTask, ReplicationError, GET_APPROVAL_TIMEOUT,
    REPLICATE_FACTOR,
};
use crate::resource_manager::ResourceManager;
use crate::signing::decode_address;
use crate::sp_db::{SpDb, SpDbConfig};
use crate::task_queue::{QueuedTask, TaskKey, TaskQueue};

/// Registry name of the task node's resource manager.
pub const TASK_NODE_SERVICE: &str = "task-node";

fn default_replicate_factor() -> usize {
    REPLICATE_FACTOR
}

fn default_approval_timeout_secs() -> u64 {
    GET_APPROVAL_TIMEOUT.as_secs()
}

fn default_task_queue_cap() -> usize {
    64
}

fn default_progress_cache_cap() -> usize {
    1024
}

fn default_memory_limit_bytes() -> u64 {
    8 * 1024 * 1024 * 1024
}

fn default_sp_db() -> SpDbConfig {
    SpDbConfig::Memory
}

/// Task node configuration, loadable from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskNodeConfig {
    /// Node identifier
    pub node_id: Uuid,
    /// Hex operator address this primary SP seals under
    pub sp_operator_address: String,
    /// Oversubscription factor when soliciting approvals
    #[serde(default = "default_replicate_factor")]
    pub replicate_factor: usize,
    /// Deadline for gathering approvals (seconds)
    #[serde(default = "default_approval_timeout_secs")]
    pub approval_timeout_secs: u64,
    /// Replicate task queue capacity
    #[serde(default = "default_task_queue_cap")]
    pub task_queue_cap: usize,
    /// Progress cache capacity (objects)
    #[serde(default = "default_progress_cache_cap")]
    pub progress_cache_cap: usize,
    /// Memory budget for concurrent replication (bytes)
    #[serde(default = "default_memory_limit_bytes")]
    pub memory_limit_bytes: u64,
    /// SP database backend
    #[serde(default = "default_sp_db")]
    pub sp_db: SpDbConfig,
}

impl TaskNodeConfig {
    pub fn new(sp_operator_address: impl Into<String>) -> Self {
        Self {
            node_id: Uuid::new_v4(),
            sp_operator_address: sp_operator_address.into(),
            replicate_factor: default_replicate_factor(),
            approval_timeout_secs: default_approval_timeout_secs(),
            task_queue_cap: default_task_queue_cap(),
            progress_cache_cap: default_progress_cache_cap(),
            memory_limit_bytes: default_memory_limit_bytes(),
            sp_db: default_sp_db(),
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ReplicationError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ReplicationError::InvalidParams(format!("failed to read config: {e}")))?;
        let config: Self = serde_yaml::from_str(&content)
            .map_err(|e| ReplicationError::InvalidParams(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ReplicationError> {
        let content = serde_yaml::to_string(self)
            .map_err(|e| ReplicationError::InvalidParams(format!("failed to render config: {e}")))?;
        std::fs::write(path, content)
            .map_err(|e| ReplicationError::InvalidParams(format!("failed to write config: {e}")))?;
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ReplicationError> {
        decode_address(&self.sp_operator_address)
            .map_err(|e| ReplicationError::InvalidParams(e.to_string()))?;
        if self.replicate_factor == 0 {
            return Err(ReplicationError::InvalidParams(
                "replicate_factor must be greater than 0".to_string(),
            ));
        }
        if self.task_queue_cap == 0 {
            return Err(ReplicationError::InvalidParams(
                "task_queue_cap must be greater than 0".to_string(),
            ));
        }
        if self.memory_limit_bytes == 0 {
            return Err(ReplicationError::InvalidParams(
                "memory_limit_bytes must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// External collaborators a task node is wired to.
pub struct TaskNodeDeps {
    pub piece_store: Arc<dyn PieceStore>,
    pub sp_db: Arc<dyn SpDb>,
    pub approver: Arc<dyn ApprovalProvider>,
    pub dialer: Arc<dyn GatewayDialer>,
    pub signer: Arc<dyn SealSigner>,
    pub chain: Arc<dyn ChainListener>,
}

/// The replication service of a primary SP.
pub struct TaskNode {
    config: TaskNodeConfig,
    ctx: Arc<ReplicateContext>,
    queue: TaskQueue<ReplicateObjectTask>,
}

impl TaskNode {
    pub fn new(config: TaskNodeConfig, deps: TaskNodeDeps) -> Result<Self, ReplicationError> {
        config.validate()?;
        let resource_manager = ResourceManager::new(TASK_NODE_SERVICE, config.memory_limit_bytes);
        let progress_cache = Arc::new(ProgressCache::new(config.progress_cache_cap));
        let ctx = Arc::new(ReplicateContext {
            piece_store: deps.piece_store,
            sp_db: deps.sp_db,
            approver: deps.approver,
            dialer: deps.dialer,
            signer: deps.signer,
            chain: deps.chain,
            resource_manager,
            progress_cache,
            sp_operator_address: config.sp_operator_address.clone(),
            replicate_factor: config.replicate_factor,
            approval_timeout: Duration::from_secs(config.approval_timeout_secs),
        });
        let queue = TaskQueue::new("replicate-object", config.task_queue_cap);
        info!(node_id = %config.node_id, "task node initialized");
        Ok(Self { config, ctx, queue })
    }

    pub fn config(&self) -> &TaskNodeConfig {
        &self.config
    }

    pub fn progress_cache(&self) -> &ProgressCache {
        &self.ctx.progress_cache
    }

    /// Accounting snapshot of this node's resource manager.
    pub fn resource_state(&self) -> crate::resource_manager::ResourceState {
        self.ctx.resource_manager.state()
    }

    pub fn queued_task_count(&self) -> usize {
        self.queue.len()
    }

    pub fn has_replicate_task(&self, object_id: ObjectId) -> bool {
        self.queue
            .has(&TaskKey(format!("replicate-object-{object_id}")))
    }

    /// Replicate one object end to end: admit, init, execute, retire.
    pub async fn replicate_object(
        &self,
        object_info: ObjectInfo,
        cancel: CancellationToken,
    ) -> Result<(), ReplicationError> {
        let task = Arc::new(ReplicateObjectTask::new(
            Arc::clone(&self.ctx),
            cancel,
            object_info,
        )?);
        let key = task.key();
        self.queue.push(Arc::clone(&task))?;

        let result = task.run().await;
        if self.queue.pop_by_key(&key).is_none() {
            warn!(%key, "replicate task vanished from queue before retirement");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TaskNodeConfig {
        TaskNodeConfig::new(hex::encode([0x11u8; 20]))
    }

    #[test]
    fn test_config_defaults() {
        let config = test_config();
        assert_eq!(config.replicate_factor, 1);
        assert_eq!(config.approval_timeout_secs, 10);
        assert_eq!(config.sp_db, SpDbConfig::Memory);
        config.validate().unwrap();
    }

    #[test]
    fn test_config_validation() {
        let mut config = test_config();
        config.sp_operator_address = "zz".to_string();
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.replicate_factor = 0;
        assert!(config.validate().is_err());

        let mut config = test_config();
        config.memory_limit_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_yaml_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("task_node.yaml");

        let mut config = test_config();
        config.sp_db = SpDbConfig::Sqlite {
            path: dir.path().join("sp.db"),
        };
        config.save_to_file(&path).unwrap();

        let loaded = TaskNodeConfig::from_file(&path).unwrap();
        assert_eq!(loaded.node_id, config.node_id);
        assert_eq!(loaded.sp_operator_address, config.sp_operator_address);
        assert_eq!(loaded.sp_db, config.sp_db);
    }
}
