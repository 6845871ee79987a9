//! In-process cache backend.
//!
//! Used when no database is configured and throughout the test suite. Counts
//! backend round trips so batching behaviour can be asserted.

use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use time::{Date, OffsetDateTime};

use super::backend::{CacheBackend, CacheError, WriteOutcome};
use super::entry::CacheEntry;
use super::keys::CacheKey;
use super::lock::{rw_read, rw_write};

const SOURCE: &str = "cache::memory";

#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<CacheKey, CacheEntry>>,
    round_trips: AtomicUsize,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of backend calls served so far.
    pub fn round_trips(&self) -> usize {
        self.round_trips.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        rw_read(&self.entries, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one stored entry, bypassing the round-trip counter.
    pub fn peek(&self, key: &CacheKey) -> Option<CacheEntry> {
        rw_read(&self.entries, SOURCE, "peek").get(key).cloned()
    }

    /// Insert an entry unconditionally. Test fixtures only.
    pub fn seed(&self, entry: CacheEntry) {
        rw_write(&self.entries, SOURCE, "seed").insert(entry.key.clone(), entry);
    }

    fn tick(&self) {
        self.round_trips.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl CacheBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.tick();
        Ok(rw_read(&self.entries, SOURCE, "load").get(key).cloned())
    }

    async fn load_many(&self, keys: &[CacheKey]) -> Result<Vec<CacheEntry>, CacheError> {
        self.tick();
        let entries = rw_read(&self.entries, SOURCE, "load_many");
        Ok(keys
            .iter()
            .filter_map(|key| entries.get(key).cloned())
            .collect())
    }

    async fn store(&self, entry: CacheEntry) -> Result<WriteOutcome, CacheError> {
        self.tick();
        let mut entries = rw_write(&self.entries, SOURCE, "store");
        if entries
            .get(&entry.key)
            .is_some_and(|existing| existing.immutable)
        {
            return Ok(WriteOutcome::Rejected);
        }
        entries.insert(entry.key.clone(), entry);
        Ok(WriteOutcome::Written)
    }

    async fn prune_superseded_before(&self, cutoff: OffsetDateTime) -> Result<u64, CacheError> {
        self.tick();
        let mut entries = rw_write(&self.entries, SOURCE, "prune_superseded_before");

        let mut latest_end: HashMap<(String, Date), Date> = HashMap::new();
        for key in entries.keys() {
            if let CacheKey::Series { subject, from, to, .. } = key {
                latest_end
                    .entry((subject.clone(), *from))
                    .and_modify(|end| *end = (*end).max(*to))
                    .or_insert(*to);
            }
        }

        let before = entries.len();
        entries.retain(|key, entry| {
            let CacheKey::Series { subject, from, to, .. } = key else {
                return true;
            };
            let expired = entry.expires_at.is_some_and(|expires_at| expires_at < cutoff);
            let superseded = latest_end
                .get(&(subject.clone(), *from))
                .is_some_and(|end| end > to);
            entry.immutable || !expired || !superseded
        });
        Ok((before - entries.len()) as u64)
    }
}
