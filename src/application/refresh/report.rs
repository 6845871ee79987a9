use serde::Serialize;
use time::OffsetDateTime;

use super::RefreshScope;

/// A subject that could not be refreshed during a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RefreshFailure {
    pub subject: String,
    pub error: String,
    pub retryable: bool,
}

/// Outcome of one refresh run.
#[derive(Debug, Clone, Serialize)]
pub struct RefreshReport {
    pub scope: RefreshScope,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub finished_at: OffsetDateTime,
    /// Subjects whose every cache entry is now current.
    pub successes: Vec<String>,
    pub failures: Vec<RefreshFailure>,
    /// Upstream fetches avoided because the cache already held the entry.
    pub skipped: usize,
    /// Upstream fetches performed and written.
    pub fetched: usize,
    /// The run budget elapsed before every subject finished.
    pub timed_out: bool,
    /// Superseded entries removed by post-run housekeeping.
    pub pruned: u64,
}

impl RefreshReport {
    pub(super) fn new(scope: RefreshScope, started_at: OffsetDateTime) -> Self {
        Self {
            scope,
            started_at,
            finished_at: started_at,
            successes: Vec::new(),
            failures: Vec::new(),
            skipped: 0,
            fetched: 0,
            timed_out: false,
            pruned: 0,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && !self.timed_out
    }

    pub(super) fn fail(&mut self, subject: impl Into<String>, error: impl Into<String>, retryable: bool) {
        self.failures.push(RefreshFailure {
            subject: subject.into(),
            error: error.into(),
            retryable,
        });
    }
}
