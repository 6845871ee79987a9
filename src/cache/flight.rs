//! Per-key single-flight registry.
//!
//! At most one holder per key at a time. Later callers wait for the holder to
//! finish and are expected to re-check the cache before fetching again.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Clone, Default)]
pub struct SingleFlight {
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no one else holds `key`, then hold it until the guard drops.
    pub async fn acquire(&self, key: &str) -> FlightGuard {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let guard = lock.lock_owned().await;
        FlightGuard {
            key: key.to_string(),
            guard: Some(guard),
            locks: Arc::clone(&self.locks),
        }
    }

    /// Hold `key` only if nobody else does.
    pub fn try_acquire(&self, key: &str) -> Option<FlightGuard> {
        let lock = self
            .locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        match lock.try_lock_owned() {
            Ok(guard) => Some(FlightGuard {
                key: key.to_string(),
                guard: Some(guard),
                locks: Arc::clone(&self.locks),
            }),
            Err(_) => None,
        }
    }

    /// Keys currently held or awaited.
    pub fn in_flight(&self) -> usize {
        self.locks.len()
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.locks.contains_key(key)
    }
}

pub struct FlightGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl FlightGuard {
    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the registry's own handle left means nobody is waiting.
        self.locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}
