//! Contract for fetching raw statistics from upstream services.
//!
//! Implementations perform network I/O only. They never cache and never
//! touch the store; the refresh orchestrator owns both.

use async_trait::async_trait;
use thiserror::Error;
use time::Date;

use crate::domain::series::DailySeries;
use crate::domain::stats::{OwnerStats, RepoStats};

pub const NPM: &str = "npm";
pub const GITHUB: &str = "github";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("{upstream} rate limit persisted after {attempts} attempts")]
    RateLimited { upstream: &'static str, attempts: u32 },
    #[error("{upstream} request timed out")]
    Timeout { upstream: &'static str },
    #[error("{upstream} network error: {message}")]
    Network {
        upstream: &'static str,
        message: String,
    },
    #[error("{upstream} responded with HTTP {status}")]
    Status { upstream: &'static str, status: u16 },
    #[error("{upstream} returned an undecodable body: {message}")]
    Decode {
        upstream: &'static str,
        message: String,
    },
    #[error("invalid {upstream} request: {message}")]
    InvalidRequest {
        upstream: &'static str,
        message: String,
    },
}

impl FetchError {
    /// Whether a later attempt could plausibly succeed.
    pub fn retryable(&self) -> bool {
        match self {
            FetchError::RateLimited { .. }
            | FetchError::Timeout { .. }
            | FetchError::Network { .. } => true,
            FetchError::Status { status, .. } => *status >= 500,
            FetchError::Decode { .. } | FetchError::InvalidRequest { .. } => false,
        }
    }

    pub fn upstream(&self) -> &'static str {
        match self {
            FetchError::RateLimited { upstream, .. }
            | FetchError::Timeout { upstream }
            | FetchError::Network { upstream, .. }
            | FetchError::Status { upstream, .. }
            | FetchError::Decode { upstream, .. }
            | FetchError::InvalidRequest { upstream, .. } => upstream,
        }
    }
}

/// Outcome of a successful upstream exchange.
///
/// A missing package or repository is an answer, not a failure.
#[derive(Debug, Clone, PartialEq)]
pub enum Fetched<T> {
    Found(T),
    NotFound,
}

impl<T> Fetched<T> {
    pub fn is_found(&self) -> bool {
        matches!(self, Fetched::Found(_))
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Fetched<U> {
        match self {
            Fetched::Found(value) => Fetched::Found(f(value)),
            Fetched::NotFound => Fetched::NotFound,
        }
    }

    /// The found value, or `fallback()` for a missing subject.
    pub fn or_else_empty(self, fallback: impl FnOnce() -> T) -> T {
        match self {
            Fetched::Found(value) => value,
            Fetched::NotFound => fallback(),
        }
    }
}

#[async_trait]
pub trait UpstreamClient: Send + Sync {
    /// Daily downloads of `package` for every day in `[from, to]` the
    /// registry has data for, ascending.
    async fn fetch_npm_downloads(
        &self,
        package: &str,
        from: Date,
        to: Date,
    ) -> Result<Fetched<DailySeries>, FetchError>;

    async fn fetch_github_repo_stats(
        &self,
        repository: &str,
    ) -> Result<Fetched<RepoStats>, FetchError>;

    async fn fetch_github_owner_stats(&self, org: &str) -> Result<Fetched<OwnerStats>, FetchError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_classification() {
        assert!(FetchError::RateLimited { upstream: NPM, attempts: 4 }.retryable());
        assert!(FetchError::Timeout { upstream: NPM }.retryable());
        assert!(FetchError::Status { upstream: GITHUB, status: 502 }.retryable());
        assert!(!FetchError::Status { upstream: GITHUB, status: 400 }.retryable());
        assert!(
            !FetchError::Decode {
                upstream: NPM,
                message: "eof".into()
            }
            .retryable()
        );
    }

    #[test]
    fn not_found_falls_back_to_empty() {
        let fetched: Fetched<DailySeries> = Fetched::NotFound;
        assert!(fetched.or_else_empty(DailySeries::default).is_empty());
    }
}
