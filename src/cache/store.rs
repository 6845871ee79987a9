//! Typed access to cache entries with TTLs and write-once semantics.
//!
//! Immutable entries are memoized in an in-process LRU after their first
//! load or write; mutable entries always go to the backend so that every
//! replica observes the latest refresh.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use lru::LruCache;
use metrics::counter;
use serde::Serialize;
use serde::de::DeserializeOwned;
use time::{Date, OffsetDateTime};
use tracing::debug;

use super::backend::{CacheBackend, CacheError, WriteOutcome};
use super::clock::Clock;
use super::config::CacheConfig;
use super::entry::CacheEntry;
use super::keys::CacheKey;
use super::lock::rw_write;

const SOURCE: &str = "cache::store";

const METRIC_CACHE_HIT: &str = "libstats_cache_hit_total";
const METRIC_CACHE_MISS: &str = "libstats_cache_miss_total";
const METRIC_CACHE_WRITE_REJECTED: &str = "libstats_cache_write_rejected_total";

/// A decoded payload and where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct Cached<T> {
    pub value: T,
    pub fetched_at: OffsetDateTime,
    /// The entry's TTL had elapsed when it was read.
    pub stale: bool,
}

pub struct CacheStore {
    backend: Arc<dyn CacheBackend>,
    clock: Arc<dyn Clock>,
    config: CacheConfig,
    memo: RwLock<LruCache<CacheKey, CacheEntry>>,
}

impl CacheStore {
    pub fn new(backend: Arc<dyn CacheBackend>, clock: Arc<dyn Clock>, config: CacheConfig) -> Self {
        let memo = RwLock::new(LruCache::new(config.memo_limit_non_zero()));
        Self {
            backend,
            clock,
            config,
            memo,
        }
    }

    pub fn now(&self) -> OffsetDateTime {
        self.clock.now()
    }

    pub fn today(&self) -> Date {
        self.clock.today()
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// Non-expired entry for `key`, if any.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        let now = self.now();
        Ok(self.lookup(key).await?.filter(|entry| entry.is_fresh(now)))
    }

    /// Last known entry for `key` regardless of TTL.
    pub async fn get_expired(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        self.lookup(key).await
    }

    /// Non-expired entries among `keys`, fetched in one backend round trip.
    pub async fn get_batch(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheEntry>, CacheError> {
        let now = self.now();
        let mut entries = self.lookup_many(keys).await?;
        entries.retain(|_, entry| entry.is_fresh(now));
        Ok(entries)
    }

    /// Every existing entry among `keys`, expired or not.
    pub async fn get_batch_expired(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheEntry>, CacheError> {
        self.lookup_many(keys).await
    }

    /// Decode the fresh entry for `key`, falling back to an expired one.
    ///
    /// `Ok(None)` is a cache miss: nothing has ever been stored for `key`.
    pub async fn resolve<T: DeserializeOwned>(
        &self,
        key: &CacheKey,
    ) -> Result<Option<Cached<T>>, CacheError> {
        let now = self.now();
        let Some(entry) = self.lookup(key).await? else {
            return Ok(None);
        };
        let stale = !entry.is_fresh(now);
        Ok(Some(Cached {
            value: entry.decode()?,
            fetched_at: entry.fetched_at,
            stale,
        }))
    }

    /// Write `payload` under `key`.
    ///
    /// Immutable entries never expire. A key that already holds an immutable
    /// entry rejects every further write.
    pub async fn set<T: Serialize>(
        &self,
        key: &CacheKey,
        payload: &T,
        immutable: bool,
    ) -> Result<WriteOutcome, CacheError> {
        let payload = serde_json::to_value(payload).map_err(|source| CacheError::Encode {
            key: key.render(),
            source,
        })?;

        let now = self.now();
        let entry = CacheEntry {
            key: key.clone(),
            payload,
            fetched_at: now,
            expires_at: (!immutable).then(|| now.saturating_add(self.config.mutable_ttl())),
            immutable,
        };

        let memo_copy = immutable.then(|| entry.clone());
        let outcome = self.backend.store(entry).await?;
        match outcome {
            WriteOutcome::Written => {
                if let Some(entry) = memo_copy {
                    rw_write(&self.memo, SOURCE, "set").put(key.clone(), entry);
                }
            }
            WriteOutcome::Rejected => {
                counter!(METRIC_CACHE_WRITE_REJECTED).increment(1);
                debug!(
                    target = "libstats::cache",
                    key = %key,
                    "write rejected; key already holds an immutable entry"
                );
            }
        }
        Ok(outcome)
    }

    /// Delete old live-chunk heads that a longer chunk with the same start
    /// has replaced, once they expired longer than the retention window ago.
    pub async fn prune_superseded(&self) -> Result<u64, CacheError> {
        let cutoff = self.now().saturating_sub(self.config.retention());
        let removed = self.backend.prune_superseded_before(cutoff).await?;
        if removed > 0 {
            debug!(target = "libstats::cache", removed, "pruned superseded entries");
        }
        Ok(removed)
    }

    fn memo_get(&self, key: &CacheKey) -> Option<CacheEntry> {
        rw_write(&self.memo, SOURCE, "memo_get").get(key).cloned()
    }

    fn memo_put(&self, entry: &CacheEntry) {
        if entry.immutable {
            rw_write(&self.memo, SOURCE, "memo_put").put(entry.key.clone(), entry.clone());
        }
    }

    async fn lookup(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError> {
        if let Some(entry) = self.memo_get(key) {
            counter!(METRIC_CACHE_HIT, "tier" => "memo").increment(1);
            return Ok(Some(entry));
        }

        let entry = self.backend.load(key).await?;
        match &entry {
            Some(entry) => {
                counter!(METRIC_CACHE_HIT, "tier" => "backend").increment(1);
                self.memo_put(entry);
            }
            None => counter!(METRIC_CACHE_MISS).increment(1),
        }
        Ok(entry)
    }

    async fn lookup_many(
        &self,
        keys: &[CacheKey],
    ) -> Result<HashMap<CacheKey, CacheEntry>, CacheError> {
        let mut found = HashMap::with_capacity(keys.len());
        let mut remaining = Vec::new();

        for key in keys {
            match self.memo_get(key) {
                Some(entry) => {
                    found.insert(key.clone(), entry);
                }
                None => remaining.push(key.clone()),
            }
        }
        if !found.is_empty() {
            counter!(METRIC_CACHE_HIT, "tier" => "memo").increment(found.len() as u64);
        }

        if !remaining.is_empty() {
            let loaded = self.backend.load_many(&remaining).await?;
            let misses = remaining.len().saturating_sub(loaded.len());
            if misses > 0 {
                counter!(METRIC_CACHE_MISS).increment(misses as u64);
            }
            if !loaded.is_empty() {
                counter!(METRIC_CACHE_HIT, "tier" => "backend").increment(loaded.len() as u64);
            }
            for entry in loaded {
                self.memo_put(&entry);
                found.insert(entry.key.clone(), entry);
            }
        }

        Ok(found)
    }
}
