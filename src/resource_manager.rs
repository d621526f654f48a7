//! Resource Manager Module
//!
//! Process-wide memory accounting for replication tasks. Each service
//! registers a named manager; reservations are admitted against the
//! configured limit scaled by priority, and release happens when the RAII
//! guard drops, so every exit path of a task returns what it took.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use once_cell::sync::Lazy;
use thiserror::Error;
use tracing::debug;

static REGISTRY: Lazy<RwLock<HashMap<String, Weak<ManagerInner>>>> =
    Lazy::new(|| RwLock::new(HashMap::new()));

/// Admission priority. Lower priorities are refused once a fraction of the
/// limit is in use; `Always` is admitted up to the full limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationPriority {
    Low,
    Medium,
    High,
    Always,
}

impl ReservationPriority {
    fn admission_fraction(self) -> f64 {
        match self {
            ReservationPriority::Low => 0.4,
            ReservationPriority::Medium => 0.6,
            ReservationPriority::High => 0.8,
            ReservationPriority::Always => 1.0,
        }
    }
}

#[derive(Error, Debug)]
pub enum ResourceError {
    #[error(
        "memory reservation failed: requested {requested} bytes at {priority:?}, \
         {reserved} of {limit} in use"
    )]
    ReservationFailed {
        requested: u64,
        reserved: u64,
        limit: u64,
        priority: ReservationPriority,
    },
}

/// Point-in-time accounting snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceState {
    pub limit: u64,
    pub reserved: u64,
}

impl std::fmt::Display for ResourceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{} bytes reserved", self.reserved, self.limit)
    }
}

#[derive(Debug)]
struct ManagerInner {
    name: String,
    limit: u64,
    reserved: AtomicU64,
}

/// Named memory manager, registered process-wide on creation.
#[derive(Debug, Clone)]
pub struct ResourceManager {
    inner: Arc<ManagerInner>,
}

impl ResourceManager {
    pub fn new(name: impl Into<String>, limit: u64) -> Self {
        let inner = Arc::new(ManagerInner {
            name: name.into(),
            limit,
            reserved: AtomicU64::new(0),
        });
        REGISTRY
            .write()
            .expect("resource registry lock poisoned")
            .insert(inner.name.clone(), Arc::downgrade(&inner));
        Self { inner }
    }

    /// Reserve `bytes` at the given priority. The returned guard releases
    /// the reservation when dropped.
    pub fn reserve_memory(
        &self,
        bytes: u64,
        priority: ReservationPriority,
    ) -> Result<MemoryReservation, ResourceError> {
        let ceiling = (self.inner.limit as f64 * priority.admission_fraction()) as u64;
        let mut current = self.inner.reserved.load(Ordering::Acquire);
        loop {
            let proposed = current.saturating_add(bytes);
            if proposed > ceiling {
                return Err(ResourceError::ReservationFailed {
                    requested: bytes,
                    reserved: current,
                    limit: self.inner.limit,
                    priority,
                });
            }
            match self.inner.reserved.compare_exchange_weak(
                current,
                proposed,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
        debug!(
            service = %self.inner.name,
            bytes,
            state = %self.state(),
            "reserved memory"
        );
        Ok(MemoryReservation {
            manager: Arc::clone(&self.inner),
            bytes,
        })
    }

    pub fn state(&self) -> ResourceState {
        ResourceState {
            limit: self.inner.limit,
            reserved: self.inner.reserved.load(Ordering::Acquire),
        }
    }

    /// Snapshot of a registered service's accounting, if it is still alive.
    pub fn get_service_state(name: &str) -> Option<ResourceState> {
        let registry = REGISTRY.read().expect("resource registry lock poisoned");
        registry.get(name).and_then(Weak::upgrade).map(|inner| {
            ResourceState {
                limit: inner.limit,
                reserved: inner.reserved.load(Ordering::Acquire),
            }
        })
    }
}

/// Live reservation; dropping it returns the bytes to the manager.
#[derive(Debug)]
pub struct MemoryReservation {
    manager: Arc<ManagerInner>,
    bytes: u64,
}

impl MemoryReservation {
    pub fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        self.manager.reserved.fetch_sub(self.bytes, Ordering::AcqRel);
        debug!(
            service = %self.manager.name,
            bytes = self.bytes,
            "released memory"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_release() {
        let manager = ResourceManager::new("test-reserve-release", 1000);

        let reservation = manager
            .reserve_memory(640, ReservationPriority::Always)
            .unwrap();
        assert_eq!(manager.state().reserved, 640);
        assert_eq!(reservation.bytes(), 640);

        drop(reservation);
        assert_eq!(manager.state().reserved, 0);
    }

    #[test]
    fn test_limit_enforced() {
        let manager = ResourceManager::new("test-limit", 1000);

        let _held = manager
            .reserve_memory(900, ReservationPriority::Always)
            .unwrap();
        let result = manager.reserve_memory(200, ReservationPriority::Always);
        assert!(matches!(
            result.unwrap_err(),
            ResourceError::ReservationFailed { requested: 200, .. }
        ));
    }

    #[test]
    fn test_priority_ceilings() {
        let manager = ResourceManager::new("test-priority", 1000);

        let _held = manager
            .reserve_memory(500, ReservationPriority::Always)
            .unwrap();
        // low priority is capped at 40% of the limit, already exceeded
        assert!(manager
            .reserve_memory(1, ReservationPriority::Low)
            .is_err());
        // high priority still has headroom up to 80%
        assert!(manager
            .reserve_memory(300, ReservationPriority::High)
            .is_ok());
    }

    #[test]
    fn test_service_state_registry() {
        let manager = ResourceManager::new("test-registry", 2048);
        let _reservation = manager
            .reserve_memory(1024, ReservationPriority::Always)
            .unwrap();

        let state = ResourceManager::get_service_state("test-registry").unwrap();
        assert_eq!(state.limit, 2048);
        assert_eq!(state.reserved, 1024);

        assert!(ResourceManager::get_service_state("never-registered").is_none());
    }

    #[test]
    fn test_guard_releases_on_panic_path() {
        let manager = ResourceManager::new("test-unwind", 100);
        let result = std::panic::catch_unwind(|| {
            let _reservation = manager
                .reserve_memory(80, ReservationPriority::Always)
                .unwrap();
            panic!("boom");
        });
        assert!(result.is_err());
        assert_eq!(manager.state().reserved, 0);
    }
}
