//! Bounded LRU cache of per-object replication progress, read by the admin
//! query surface. Writes are best-effort; eviction drops the least recently
//! touched object.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use tracing::debug;

use crate::model::{ObjectId, ReplicatePieceInfo};

pub struct ProgressCache {
    inner: Mutex<CacheInner>,
}

struct CacheInner {
    capacity: usize,
    entries: HashMap<ObjectId, ReplicatePieceInfo>,
    order: VecDeque<ObjectId>,
}

impl ProgressCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                capacity: capacity.max(1),
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
        }
    }

    /// Insert or refresh the progress snapshot for `object_id`.
    pub fn add(&self, object_id: ObjectId, progress: ReplicatePieceInfo) {
        let mut inner = self.inner.lock().expect("progress cache lock poisoned");
        if inner.entries.insert(object_id, progress).is_some() {
            inner.order.retain(|id| *id != object_id);
        }
        inner.order.push_back(object_id);
        if inner.entries.len() > inner.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.entries.remove(&evicted);
                debug!(object_id = evicted, "evicted replication progress entry");
            }
        }
    }

    pub fn get(&self, object_id: ObjectId) -> Option<ReplicatePieceInfo> {
        let mut inner = self.inner.lock().expect("progress cache lock poisoned");
        if inner.entries.contains_key(&object_id) {
            inner.order.retain(|id| *id != object_id);
            inner.order.push_back(object_id);
        }
        inner.entries.get(&object_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("progress cache lock poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(slots: usize) -> ReplicatePieceInfo {
        ReplicatePieceInfo::new(slots)
    }

    #[test]
    fn test_add_and_get() {
        let cache = ProgressCache::new(4);
        cache.add(1, snapshot(6));
        assert_eq!(cache.get(1).unwrap().piece_infos.len(), 6);
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_refresh_replaces_entry() {
        let cache = ProgressCache::new(4);
        cache.add(1, snapshot(6));
        cache.add(1, snapshot(3));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(1).unwrap().piece_infos.len(), 3);
    }

    #[test]
    fn test_lru_eviction() {
        let cache = ProgressCache::new(2);
        cache.add(1, snapshot(1));
        cache.add(2, snapshot(1));
        // touch 1 so that 2 becomes the eviction candidate
        cache.get(1);
        cache.add(3, snapshot(1));

        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
    }
}
