//! Statistics cache.
//!
//! Every fetched payload lands here before anything reads it:
//!
//! - **Series entries** hold one chunk of a package's daily downloads and are
//!   immutable once the chunk has closed.
//! - **Point entries** hold rollups and GitHub snapshots; they are always
//!   mutable and expire after `mutable_ttl_secs`.
//!
//! ## Configuration
//!
//! ```toml
//! [cache]
//! mutable_ttl_secs = 21600
//! memo_limit = 2048
//! retention_secs = 604800
//! ```

mod backend;
mod clock;
mod config;
mod entry;
mod flight;
mod keys;
mod lock;
mod memory;
mod store;

pub use backend::{CacheBackend, CacheError, WriteOutcome};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::CacheConfig;
pub use entry::CacheEntry;
pub use flight::{FlightGuard, SingleFlight};
pub use keys::{CacheKey, LIBRARY_PREFIX, NPM_PREFIX, ORG_PREFIX, OWNER_PREFIX, REPO_PREFIX};
pub use memory::MemoryBackend;
pub use store::{CacheStore, Cached};
