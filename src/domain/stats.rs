//! Cached payloads and the rollups derived from them.

use serde::{Deserialize, Serialize};
use time::{Date, OffsetDateTime};

use super::types::iso_date;

/// Per-package download rollup stored under `npm:<package>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageTotals {
    pub package: String,
    pub library_id: Option<String>,
    pub total_downloads: u64,
    pub rate_per_day: Option<f64>,
    #[serde(with = "iso_date")]
    pub as_of: Date,
    #[serde(with = "iso_date::option")]
    pub first_day: Option<Date>,
    pub chunks_cached: usize,
    pub chunks_planned: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

impl PackageTotals {
    /// True when every planned chunk contributed to the total.
    pub fn is_complete(&self) -> bool {
        self.chunks_cached == self.chunks_planned
    }
}

/// GitHub metrics for one repository, stored under `repo:<owner/name>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoStats {
    pub repository: String,
    pub star_count: u64,
    pub contributor_count: u64,
    pub dependent_count: u64,
}

impl RepoStats {
    pub fn empty(repository: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            ..Self::default()
        }
    }
}

/// GitHub metrics for an organisation, stored under `owner:<org>`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerStats {
    pub owner: String,
    pub star_count: u64,
    pub repository_count: u64,
    pub follower_count: u64,
}

impl OwnerStats {
    pub fn empty(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PackageSummary {
    pub package: String,
    pub total_downloads: u64,
    pub rate_per_day: Option<f64>,
}

/// Library rollup stored under `library:<id>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LibraryStats {
    pub library_id: String,
    pub name: String,
    pub repository: Option<String>,
    pub total_downloads: u64,
    pub rate_per_day: Option<f64>,
    pub packages: Vec<PackageSummary>,
    pub missing_packages: Vec<String>,
    pub repo: Option<RepoStats>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

/// Org-wide rollup stored under `org:<org>`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrgStats {
    pub org: String,
    pub total_downloads: u64,
    pub rate_per_day: Option<f64>,
    pub library_count: usize,
    pub package_count: usize,
    pub legacy_downloads: u64,
    pub star_count: u64,
    pub contributor_count: u64,
    pub dependent_count: u64,
    pub missing_packages: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub computed_at: OffsetDateTime,
}

/// Sum optional rates, yielding `None` only when no input had a rate.
pub fn sum_rates(rates: impl IntoIterator<Item = Option<f64>>) -> Option<f64> {
    rates
        .into_iter()
        .flatten()
        .fold(None, |acc, rate| Some(acc.unwrap_or(0.0) + rate))
}
