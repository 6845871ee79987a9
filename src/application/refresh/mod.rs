//! Refresh orchestration: decides what to fetch, fetches it in bounded
//! batches, persists every result, and recomputes the rollups.
//!
//! Runs are triggered by the cron schedule, the authenticated HTTP triggers
//! and the `refresh` CLI command. Each [`RefreshScope`] admits one run at a
//! time; overlapping scopes still share the per-key single-flight and the
//! upstream permit pool.

mod guard;
mod orchestrator;
mod report;

use std::fmt;
use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use guard::{ActiveRuns, RunGuard};
pub use orchestrator::RefreshOrchestrator;
pub use report::{RefreshFailure, RefreshReport};

use crate::config::{RefreshScopeArg, RefreshSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshScope {
    /// Every package, every repository and the owner profile.
    All,
    /// Download history of the org's packages plus the owner profile.
    Org,
    /// GitHub metrics of every library repository.
    Libraries,
    /// An explicit package list.
    Packages,
}

impl RefreshScope {
    pub fn as_str(self) -> &'static str {
        match self {
            RefreshScope::All => "all",
            RefreshScope::Org => "org",
            RefreshScope::Libraries => "libraries",
            RefreshScope::Packages => "packages",
        }
    }
}

impl fmt::Display for RefreshScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<RefreshScopeArg> for RefreshScope {
    fn from(arg: RefreshScopeArg) -> Self {
        match arg {
            RefreshScopeArg::All => RefreshScope::All,
            RefreshScopeArg::Org => RefreshScope::Org,
            RefreshScopeArg::Libraries => RefreshScope::Libraries,
            RefreshScopeArg::Packages => RefreshScope::Packages,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RefreshOptions {
    /// Refetch mutable entries even when they are still fresh.
    pub force: bool,
    /// Package list for [`RefreshScope::Packages`].
    pub packages: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RefreshConfig {
    pub concurrency: NonZeroUsize,
    pub batch_delay: Duration,
    pub budget: Duration,
    pub chunk_size_days: u32,
}

impl Default for RefreshConfig {
    fn default() -> Self {
        Self {
            concurrency: NonZeroUsize::new(8).unwrap_or(NonZeroUsize::MIN),
            batch_delay: Duration::from_millis(500),
            budget: Duration::from_secs(15 * 60),
            chunk_size_days: crate::domain::chunks::DEFAULT_CHUNK_SIZE_DAYS,
        }
    }
}

impl From<&RefreshSettings> for RefreshConfig {
    fn from(settings: &RefreshSettings) -> Self {
        Self {
            concurrency: NonZeroUsize::new(settings.concurrency.get() as usize)
                .unwrap_or(NonZeroUsize::MIN),
            batch_delay: settings.batch_delay,
            budget: settings.budget,
            chunk_size_days: settings.chunk_size_days.get(),
        }
    }
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("a `{scope}` refresh is already running")]
    AlreadyRunning { scope: RefreshScope },
    #[error("org `{org}` is not the catalog org")]
    UnknownOrg { org: String },
    #[error("no packages were given to refresh")]
    NoPackages,
}
