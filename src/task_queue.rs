//! Task Queue Module
//!
//! Capacity-bounded, keyed, limit-aware task container. Tasks are held in a
//! dense slice indexed by a key map; selection by resource limit scans
//! newest-first so warm tasks win. Admission-time overflow consults a
//! pluggable retire strategy, and a filter strategy gates pop/top
//! eligibility. All failures are non-fatal typed errors; the queue never
//! panics on index desync, it logs the bug and returns nothing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{error, warn};

/// Stable identity of a queued task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskKey(pub String);

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskKey {
    fn from(key: &str) -> Self {
        TaskKey(key.to_string())
    }
}

impl From<String> for TaskKey {
    fn from(key: String) -> Self {
        TaskKey(key)
    }
}

/// Resource cost descriptor used for limit-gated dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Limit {
    pub memory_bytes: u64,
    pub tasks: u32,
}

impl Limit {
    pub fn with_memory(memory_bytes: u64) -> Self {
        Self {
            memory_bytes,
            tasks: 1,
        }
    }

    /// Whether this limit covers `other` in every dimension.
    pub fn not_less(&self, other: &Limit) -> bool {
        self.memory_bytes >= other.memory_bytes && self.tasks >= other.tasks
    }
}

/// Anything admissible to a [`TaskQueue`].
pub trait QueuedTask: Send + Sync {
    fn key(&self) -> TaskKey;
    fn estimate_limit(&self) -> Limit;
}

#[derive(Error, Debug)]
pub enum QueueError {
    #[error("task {key} already queued in {queue}")]
    DuplicateTask { queue: String, key: TaskKey },

    #[error("queue {queue} is full (cap {cap})")]
    QueueFull { queue: String, cap: usize },
}

type Strategy<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

struct QueueInner<T> {
    tasks: Vec<Arc<T>>,
    indexer: HashMap<TaskKey, usize>,
    filter: Option<Strategy<T>>,
    retire: Option<Strategy<T>>,
}

impl<T: QueuedTask> QueueInner<T> {
    /// Remove the entry under `key`, keeping slice and index map in sync.
    fn remove_by_key(&mut self, key: &TaskKey, queue: &str) -> Option<Arc<T>> {
        let idx = *self.indexer.get(key)?;
        if idx >= self.tasks.len() {
            error!(
                queue,
                %key,
                idx,
                len = self.tasks.len(),
                "[BUG] index out of bounds"
            );
            return None;
        }
        let task = self.tasks.remove(idx);
        self.indexer.remove(key);
        for (i, moved) in self.tasks.iter().enumerate().skip(idx) {
            self.indexer.insert(moved.key(), i);
        }
        Some(task)
    }

    fn passes_filter(&self, task: &T) -> bool {
        match &self.filter {
            Some(filter) => filter(task),
            None => true,
        }
    }

    /// Newest task within `limit` that passes the filter.
    fn select_by_limit(&self, limit: &Limit) -> Option<Arc<T>> {
        self.tasks
            .iter()
            .rev()
            .find(|task| limit.not_less(&task.estimate_limit()) && self.passes_filter(task.as_ref()))
            .cloned()
    }
}

/// Bounded keyed task queue with limit-based dispatch.
pub struct TaskQueue<T: QueuedTask> {
    name: String,
    cap: usize,
    inner: RwLock<QueueInner<T>>,
}

impl<T: QueuedTask> TaskQueue<T> {
    pub fn new(name: impl Into<String>, cap: usize) -> Self {
        Self {
            name: name.into(),
            cap,
            inner: RwLock::new(QueueInner {
                tasks: Vec::new(),
                indexer: HashMap::new(),
                filter: None,
                retire: None,
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.read().tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cap(&self) -> usize {
        self.cap
    }

    pub fn has(&self, key: &TaskKey) -> bool {
        self.read().indexer.contains_key(key)
    }

    /// Admit a task at the tail.
    ///
    /// A full queue first runs the retire strategy over the tasks already
    /// present and removes the ones it selects; if no room was made the push
    /// fails with [`QueueError::QueueFull`].
    pub fn push(&self, task: Arc<T>) -> Result<(), QueueError> {
        let mut inner = self.write();
        let key = task.key();
        if inner.indexer.contains_key(&key) {
            warn!(queue = %self.name, %key, "push repeated task");
            return Err(QueueError::DuplicateTask {
                queue: self.name.clone(),
                key,
            });
        }
        if inner.tasks.len() >= self.cap {
            if let Some(retire) = inner.retire.take() {
                let retired: Vec<TaskKey> = inner
                    .tasks
                    .iter()
                    .filter(|backup| retire(backup.as_ref()))
                    .map(|backup| backup.key())
                    .collect();
                for retired_key in &retired {
                    inner.remove_by_key(retired_key, &self.name);
                }
                inner.retire = Some(retire);
            }
            if inner.tasks.len() >= self.cap {
                warn!(queue = %self.name, cap = self.cap, "queue exceed");
                return Err(QueueError::QueueFull {
                    queue: self.name.clone(),
                    cap: self.cap,
                });
            }
        }
        let idx = inner.tasks.len();
        inner.tasks.push(task);
        inner.indexer.insert(key, idx);
        Ok(())
    }

    /// Newest task within `limit`, without removal.
    pub fn top_by_limit(&self, limit: &Limit) -> Option<Arc<T>> {
        self.read().select_by_limit(limit)
    }

    /// Newest task within `limit`, removed from the queue.
    pub fn pop_by_limit(&self, limit: &Limit) -> Option<Arc<T>> {
        let mut inner = self.write();
        let task = inner.select_by_limit(limit)?;
        inner.remove_by_key(&task.key(), &self.name)
    }

    /// Remove and return the task under `key`, if present.
    pub fn pop_by_key(&self, key: &TaskKey) -> Option<Arc<T>> {
        self.write().remove_by_key(key, &self.name)
    }

    /// Invoke `scan` on every task under the read lock. The callback must
    /// not reenter the queue.
    pub fn scan_task(&self, mut scan: impl FnMut(&T)) {
        for task in self.read().tasks.iter() {
            scan(task.as_ref());
        }
    }

    /// Install the eligibility filter consulted by pop/top.
    pub fn set_filter_task_strategy(&self, filter: impl Fn(&T) -> bool + Send + Sync + 'static) {
        self.write().filter = Some(Box::new(filter));
    }

    /// Install the retire predicate consulted on admission-time overflow.
    pub fn set_retire_task_strategy(&self, retire: impl Fn(&T) -> bool + Send + Sync + 'static) {
        self.write().retire = Some(Box::new(retire));
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, QueueInner<T>> {
        self.inner.read().expect("task queue lock poisoned")
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, QueueInner<T>> {
        self.inner.write().expect("task queue lock poisoned")
    }
}
