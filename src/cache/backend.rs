use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use super::entry::CacheEntry;
use super::keys::CacheKey;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache backend `{backend}` failed: {source}")]
    Backend {
        backend: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    #[error("failed to encode payload for `{key}`: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to decode payload for `{key}`: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    pub fn backend(
        backend: &'static str,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Backend {
            backend,
            source: Box::new(source),
        }
    }
}

/// Result of a conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The key already holds an immutable entry.
    Rejected,
}

/// Durable storage for cache entries.
///
/// Implementations must make `store` atomic per key: a write is rejected if
/// and only if the currently stored entry is immutable.
#[async_trait]
pub trait CacheBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Load an entry regardless of its expiry.
    async fn load(&self, key: &CacheKey) -> Result<Option<CacheEntry>, CacheError>;

    /// Load every existing entry among `keys` in a single round trip.
    async fn load_many(&self, keys: &[CacheKey]) -> Result<Vec<CacheEntry>, CacheError>;

    async fn store(&self, entry: CacheEntry) -> Result<WriteOutcome, CacheError>;

    /// Delete mutable series entries that expired before `cutoff` and have a
    /// longer entry for the same subject and start day.
    ///
    /// Point entries are never pruned: they hold the last known value.
    async fn prune_superseded_before(&self, cutoff: OffsetDateTime) -> Result<u64, CacheError>;
}
