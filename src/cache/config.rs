//! Cache configuration.
//!
//! Controls entry lifetimes and the in-process memo via `libstats.toml`.

use std::num::NonZeroUsize;

use serde::Deserialize;
use time::Duration;

const DEFAULT_MUTABLE_TTL_SECS: u64 = 6 * 60 * 60;
const DEFAULT_MEMO_LIMIT: usize = 2048;
const DEFAULT_RETENTION_SECS: u64 = 7 * 24 * 60 * 60;

/// Cache configuration from `libstats.toml`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of mutable entries (the live chunk and every rollup).
    pub mutable_ttl_secs: u64,
    /// Maximum immutable entries memoized in process.
    pub memo_limit: usize,
    /// How long an expired mutable entry is kept before pruning.
    pub retention_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            mutable_ttl_secs: DEFAULT_MUTABLE_TTL_SECS,
            memo_limit: DEFAULT_MEMO_LIMIT,
            retention_secs: DEFAULT_RETENTION_SECS,
        }
    }
}

impl From<&crate::config::CacheSettings> for CacheConfig {
    fn from(settings: &crate::config::CacheSettings) -> Self {
        Self {
            mutable_ttl_secs: settings.mutable_ttl_secs,
            memo_limit: settings.memo_limit,
            retention_secs: settings.retention_secs,
        }
    }
}

impl CacheConfig {
    pub fn mutable_ttl(&self) -> Duration {
        Duration::seconds(i64::try_from(self.mutable_ttl_secs).unwrap_or(i64::MAX))
    }

    pub fn retention(&self) -> Duration {
        Duration::seconds(i64::try_from(self.retention_secs).unwrap_or(i64::MAX))
    }

    /// Returns the memo limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memo_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memo_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
