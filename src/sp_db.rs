//! SP Database Module
//!
//! Persisted replication state: storage parameters, per-object job state,
//! object metadata, and the per-shard receipt records that together form the
//! seal payload. Ships an in-memory backend and a SQLite backend selected by
//! config.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::model::{JobState, ObjectId, ObjectInfo, ReplicatePieceInfo, StorageParams};

#[derive(Error, Debug)]
pub enum SpDbError {
    #[error("storage params not configured")]
    MissingStorageParams,

    #[error("invalid job state transition: {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt row: {0}")]
    CorruptRow(String),
}

/// SP database collaborator.
#[async_trait]
pub trait SpDb: Send + Sync {
    async fn get_storage_params(&self) -> Result<StorageParams, SpDbError>;
    async fn set_storage_params(&self, params: StorageParams) -> Result<(), SpDbError>;

    async fn get_job_state(&self, object_id: ObjectId) -> Result<Option<JobState>, SpDbError>;
    async fn update_job_state(&self, object_id: ObjectId, state: JobState)
        -> Result<(), SpDbError>;

    async fn get_object_info(&self, object_id: ObjectId) -> Result<Option<ObjectInfo>, SpDbError>;
    async fn set_object_info(
        &self,
        object_id: ObjectId,
        info: &ObjectInfo,
    ) -> Result<(), SpDbError>;

    async fn get_replicate_piece_info(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<ReplicatePieceInfo>, SpDbError>;
    async fn set_replicate_piece_info(
        &self,
        object_id: ObjectId,
        info: &ReplicatePieceInfo,
    ) -> Result<(), SpDbError>;
}

/// Reject writes the lifecycle DAG forbids; same-state rewrites are allowed
/// so retried tasks stay idempotent.
fn check_transition(
    current: Option<JobState>,
    next: JobState,
    object_id: ObjectId,
) -> Result<(), SpDbError> {
    if let Some(from) = current {
        if from != next && !from.can_transition_to(next) {
            warn!(object_id, %from, %next, "rejected job state transition");
            return Err(SpDbError::InvalidTransition { from, to: next });
        }
    }
    Ok(())
}

/// Backend selection, deserialized from node config.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "backend")]
pub enum SpDbConfig {
    Memory,
    Sqlite { path: PathBuf },
}

/// Build an SP database for the configured backend.
pub fn new_sp_db(config: &SpDbConfig) -> Result<Arc<dyn SpDb>, SpDbError> {
    match config {
        SpDbConfig::Memory => Ok(Arc::new(MemorySpDb::new())),
        SpDbConfig::Sqlite { path } => Ok(Arc::new(SqliteSpDb::open(path)?)),
    }
}

/// In-memory backend for tests and single-process deployments.
#[derive(Default)]
pub struct MemorySpDb {
    params: RwLock<Option<StorageParams>>,
    jobs: RwLock<HashMap<ObjectId, JobState>>,
    objects: RwLock<HashMap<ObjectId, ObjectInfo>>,
    progress: RwLock<HashMap<ObjectId, ReplicatePieceInfo>>,
}

impl MemorySpDb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_storage_params(params: StorageParams) -> Self {
        let db = Self::default();
        *db.params.write().expect("sp db lock poisoned") = Some(params);
        db
    }
}

#[async_trait]
impl SpDb for MemorySpDb {
    async fn get_storage_params(&self) -> Result<StorageParams, SpDbError> {
        let params = *self.params.read().expect("sp db lock poisoned");
        params.ok_or(SpDbError::MissingStorageParams)
    }

    async fn set_storage_params(&self, params: StorageParams) -> Result<(), SpDbError> {
        *self.params.write().expect("sp db lock poisoned") = Some(params);
        Ok(())
    }

    async fn get_job_state(&self, object_id: ObjectId) -> Result<Option<JobState>, SpDbError> {
        Ok(self
            .jobs
            .read()
            .expect("sp db lock poisoned")
            .get(&object_id)
            .copied())
    }

    async fn update_job_state(
        &self,
        object_id: ObjectId,
        state: JobState,
    ) -> Result<(), SpDbError> {
        let mut jobs = self.jobs.write().expect("sp db lock poisoned");
        check_transition(jobs.get(&object_id).copied(), state, object_id)?;
        jobs.insert(object_id, state);
        Ok(())
    }

    async fn get_object_info(&self, object_id: ObjectId) -> Result<Option<ObjectInfo>, SpDbError> {
        Ok(self
            .objects
            .read()
            .expect("sp db lock poisoned")
            .get(&object_id)
            .cloned())
    }

    async fn set_object_info(
        &self,
        object_id: ObjectId,
        info: &ObjectInfo,
    ) -> Result<(), SpDbError> {
        self.objects
            .write()
            .expect("sp db lock poisoned")
            .insert(object_id, info.clone());
        Ok(())
    }

    async fn get_replicate_piece_info(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<ReplicatePieceInfo>, SpDbError> {
        Ok(self
            .progress
            .read()
            .expect("sp db lock poisoned")
            .get(&object_id)
            .cloned())
    }

    async fn set_replicate_piece_info(
        &self,
        object_id: ObjectId,
        info: &ReplicatePieceInfo,
    ) -> Result<(), SpDbError> {
        self.progress
            .write()
            .expect("sp db lock poisoned")
            .insert(object_id, info.clone());
        Ok(())
    }
}

/// SQLite backend. Object metadata and progress snapshots are stored as JSON
/// payloads; job state is a plain column so dashboards can query it.
pub struct SqliteSpDb {
    conn: Mutex<Connection>,
}

impl SqliteSpDb {
    pub fn open(path: &PathBuf) -> Result<Self, SpDbError> {
        let conn = Connection::open(path)?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn open_in_memory() -> Result<Self, SpDbError> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<(), SpDbError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS storage_params (
                 id INTEGER PRIMARY KEY CHECK (id = 1),
                 payload TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS jobs (
                 object_id INTEGER PRIMARY KEY,
                 state TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS objects (
                 object_id INTEGER PRIMARY KEY,
                 payload TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS replicate_progress (
                 object_id INTEGER PRIMARY KEY,
                 payload TEXT NOT NULL
             );",
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().expect("sqlite connection lock poisoned")
    }
}

#[async_trait]
impl SpDb for SqliteSpDb {
    async fn get_storage_params(&self) -> Result<StorageParams, SpDbError> {
        let conn = self.lock();
        let payload: Option<String> = conn
            .query_row("SELECT payload FROM storage_params WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        match payload {
            Some(json) => Ok(serde_json::from_str(&json)?),
            None => Err(SpDbError::MissingStorageParams),
        }
    }

    async fn set_storage_params(&self, params: StorageParams) -> Result<(), SpDbError> {
        let payload = serde_json::to_string(&params)?;
        self.lock().execute(
            "INSERT INTO storage_params (id, payload) VALUES (1, ?1)
             ON CONFLICT (id) DO UPDATE SET payload = ?1",
            params![payload],
        )?;
        Ok(())
    }

    async fn get_job_state(&self, object_id: ObjectId) -> Result<Option<JobState>, SpDbError> {
        let conn = self.lock();
        let state: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE object_id = ?1",
                params![object_id],
                |row| row.get(0),
            )
            .optional()?;
        state
            .map(|s| JobState::from_str(&s).map_err(SpDbError::CorruptRow))
            .transpose()
    }

    async fn update_job_state(
        &self,
        object_id: ObjectId,
        state: JobState,
    ) -> Result<(), SpDbError> {
        let conn = self.lock();
        let current: Option<String> = conn
            .query_row(
                "SELECT state FROM jobs WHERE object_id = ?1",
                params![object_id],
                |row| row.get(0),
            )
            .optional()?;
        let current = current
            .map(|s| JobState::from_str(&s).map_err(SpDbError::CorruptRow))
            .transpose()?;
        check_transition(current, state, object_id)?;
        conn.execute(
            "INSERT INTO jobs (object_id, state) VALUES (?1, ?2)
             ON CONFLICT (object_id) DO UPDATE SET state = ?2",
            params![object_id, state.to_string()],
        )?;
        Ok(())
    }

    async fn get_object_info(&self, object_id: ObjectId) -> Result<Option<ObjectInfo>, SpDbError> {
        let conn = self.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM objects WHERE object_id = ?1",
                params![object_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|json| serde_json::from_str(&json).map_err(SpDbError::from))
            .transpose()
    }

    async fn set_object_info(
        &self,
        object_id: ObjectId,
        info: &ObjectInfo,
    ) -> Result<(), SpDbError> {
        let payload = serde_json::to_string(info)?;
        self.lock().execute(
            "INSERT INTO objects (object_id, payload) VALUES (?1, ?2)
             ON CONFLICT (object_id) DO UPDATE SET payload = ?2",
            params![object_id, payload],
        )?;
        Ok(())
    }

    async fn get_replicate_piece_info(
        &self,
        object_id: ObjectId,
    ) -> Result<Option<ReplicatePieceInfo>, SpDbError> {
        let conn = self.lock();
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM replicate_progress WHERE object_id = ?1",
                params![object_id],
                |row| row.get(0),
            )
            .optional()?;
        payload
            .map(|json| serde_json::from_str(&json).map_err(SpDbError::from))
            .transpose()
    }

    async fn set_replicate_piece_info(
        &self,
        object_id: ObjectId,
        info: &ReplicatePieceInfo,
    ) -> Result<(), SpDbError> {
        let payload = serde_json::to_string(info)?;
        self.lock().execute(
            "INSERT INTO replicate_progress (object_id, payload) VALUES (?1, ?2)
             ON CONFLICT (object_id) DO UPDATE SET payload = ?2",
            params![object_id, payload],
        )?;
        Ok(())
    }
}
