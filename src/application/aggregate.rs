//! Rollups derived from cached entries.
//!
//! Every rollup is recomputed from its inputs and written as a mutable
//! point entry; nothing is patched incrementally. Inputs are read with stale
//! fallback so a partially refreshed org still produces a rollup.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use thiserror::Error;
use time::Date;
use tracing::{debug, warn};

use crate::cache::{CacheEntry, CacheError, CacheKey, CacheStore};
use crate::domain::catalog::{Catalog, Library};
use crate::domain::chunks::generate_chunks;
use crate::domain::series::DailySeries;
use crate::domain::stats::{
    LibraryStats, OrgStats, OwnerStats, PackageSummary, PackageTotals, RepoStats, sum_rates,
};

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("library `{0}` is not in the catalog")]
    UnknownLibrary(String),
}

pub struct Aggregator {
    store: Arc<CacheStore>,
    catalog: Arc<Catalog>,
    chunk_size_days: u32,
}

impl Aggregator {
    pub fn new(store: Arc<CacheStore>, catalog: Arc<Catalog>, chunk_size_days: u32) -> Self {
        Self {
            store,
            catalog,
            chunk_size_days,
        }
    }

    /// Sum every cached chunk of `package` up to `as_of` and store the totals.
    pub async fn compute_package_totals(
        &self,
        package: &str,
        as_of: Date,
    ) -> Result<PackageTotals, AggregateError> {
        let start = self.catalog.package_start(package);
        let chunks = generate_chunks(start, as_of, self.chunk_size_days);
        let keys: Vec<CacheKey> = chunks
            .iter()
            .map(|chunk| CacheKey::chunk(package, chunk))
            .collect();
        let entries = self.store.get_batch_expired(&keys).await?;

        let mut series = DailySeries::default();
        let mut chunks_cached = 0usize;
        for key in &keys {
            let Some(chunk_series) = decode_or_skip::<DailySeries>(entries.get(key)) else {
                continue;
            };
            chunks_cached += 1;
            series.splice(chunk_series.points().iter().copied());
        }

        let totals = PackageTotals {
            package: package.to_string(),
            library_id: self
                .catalog
                .library_of(package)
                .map(|library| library.id.clone()),
            total_downloads: series.total(),
            rate_per_day: series.rate_per_day(as_of),
            as_of,
            first_day: series.first_day(),
            chunks_cached,
            chunks_planned: chunks.len(),
            computed_at: self.store.now(),
        };

        self.store
            .set(&CacheKey::package_totals(package), &totals, false)
            .await?;
        debug!(
            target = "libstats::aggregate",
            package,
            total = totals.total_downloads,
            chunks_cached,
            chunks_planned = totals.chunks_planned,
            "package totals recomputed"
        );
        Ok(totals)
    }

    /// Sum cached package totals of one library and attach its repo stats.
    pub async fn compute_library_stats(
        &self,
        library_id: &str,
    ) -> Result<LibraryStats, AggregateError> {
        let library = self
            .catalog
            .library(library_id)
            .ok_or_else(|| AggregateError::UnknownLibrary(library_id.to_string()))?;
        let stats = self.library_rollup(library).await?;
        self.store
            .set(&CacheKey::library(&library.id), &stats, false)
            .await?;
        Ok(stats)
    }

    /// Sum all library rollups plus legacy packages into the org rollup.
    pub async fn compute_org_stats(&self) -> Result<OrgStats, AggregateError> {
        let catalog = &self.catalog;

        let library_keys: Vec<CacheKey> = catalog
            .libraries
            .iter()
            .map(|library| CacheKey::library(&library.id))
            .collect();
        let library_entries = self.store.get_batch_expired(&library_keys).await?;

        let legacy_keys: Vec<CacheKey> = catalog
            .legacy_packages
            .iter()
            .map(|package| CacheKey::package_totals(&package.name))
            .collect();
        let legacy_entries = self.store.get_batch_expired(&legacy_keys).await?;

        let owner: Option<OwnerStats> = decode_or_skip(
            self.store
                .get_expired(&CacheKey::owner(&catalog.org))
                .await?
                .as_ref(),
        );

        let mut missing = BTreeSet::new();
        let mut total_downloads = 0u64;
        let mut rates = Vec::new();
        let mut repo_stars = 0u64;
        let mut contributor_count = 0u64;
        let mut dependent_count = 0u64;

        for (library, key) in catalog.libraries.iter().zip(&library_keys) {
            match decode_or_skip::<LibraryStats>(library_entries.get(key)) {
                Some(stats) => {
                    total_downloads = total_downloads.saturating_add(stats.total_downloads);
                    rates.push(stats.rate_per_day);
                    missing.extend(stats.missing_packages.iter().cloned());
                    if let Some(repo) = &stats.repo {
                        repo_stars = repo_stars.saturating_add(repo.star_count);
                        contributor_count = contributor_count.saturating_add(repo.contributor_count);
                        dependent_count = dependent_count.saturating_add(repo.dependent_count);
                    }
                }
                None => missing.extend(library.package_names().map(str::to_string)),
            }
        }

        let mut legacy_downloads = 0u64;
        for (package, key) in catalog.legacy_packages.iter().zip(&legacy_keys) {
            match decode_or_skip::<PackageTotals>(legacy_entries.get(key)) {
                Some(totals) => {
                    legacy_downloads = legacy_downloads.saturating_add(totals.total_downloads);
                    rates.push(totals.rate_per_day);
                }
                None => {
                    missing.insert(package.name.clone());
                }
            }
        }

        let stats = OrgStats {
            org: catalog.org.clone(),
            total_downloads: total_downloads.saturating_add(legacy_downloads),
            rate_per_day: sum_rates(rates),
            library_count: catalog.libraries.len(),
            package_count: catalog.all_packages().len(),
            legacy_downloads,
            star_count: owner.map_or(repo_stars, |owner| owner.star_count),
            contributor_count,
            dependent_count,
            missing_packages: missing.into_iter().collect(),
            computed_at: self.store.now(),
        };

        self.store
            .set(&CacheKey::org(&catalog.org), &stats, false)
            .await?;
        Ok(stats)
    }

    /// Recompute `packages`, every library and the org, in that order.
    ///
    /// A failing input is logged and skipped so one bad entry cannot block
    /// the remaining rollups.
    pub async fn rollup(&self, packages: &[String], as_of: Date) -> Result<OrgStats, AggregateError> {
        for package in packages {
            if let Err(err) = self.compute_package_totals(package, as_of).await {
                warn!(
                    target = "libstats::aggregate",
                    package = %package,
                    error = %err,
                    "failed to recompute package totals"
                );
            }
        }

        for library in &self.catalog.libraries {
            if let Err(err) = self.compute_library_stats(&library.id).await {
                warn!(
                    target = "libstats::aggregate",
                    library = %library.id,
                    error = %err,
                    "failed to recompute library stats"
                );
            }
        }

        self.compute_org_stats().await
    }

    async fn library_rollup(&self, library: &Library) -> Result<LibraryStats, AggregateError> {
        let keys: Vec<CacheKey> = library
            .package_names()
            .map(CacheKey::package_totals)
            .collect();
        let entries: HashMap<CacheKey, CacheEntry> = self.store.get_batch_expired(&keys).await?;

        let mut packages = Vec::new();
        let mut missing_packages = Vec::new();
        for (name, key) in library.package_names().zip(&keys) {
            match decode_or_skip::<PackageTotals>(entries.get(key)) {
                Some(totals) if totals.chunks_cached > 0 => packages.push(PackageSummary {
                    package: name.to_string(),
                    total_downloads: totals.total_downloads,
                    rate_per_day: totals.rate_per_day,
                }),
                _ => missing_packages.push(name.to_string()),
            }
        }

        let repo = match library.repository.as_deref() {
            Some(repository) => decode_or_skip::<RepoStats>(
                self.store
                    .get_expired(&CacheKey::repo(repository))
                    .await?
                    .as_ref(),
            ),
            None => None,
        };

        Ok(LibraryStats {
            library_id: library.id.clone(),
            name: library.name.clone(),
            repository: library.repository.clone(),
            total_downloads: packages
                .iter()
                .fold(0u64, |acc, package| acc.saturating_add(package.total_downloads)),
            rate_per_day: sum_rates(packages.iter().map(|package| package.rate_per_day)),
            packages,
            missing_packages,
            repo,
            computed_at: self.store.now(),
        })
    }
}

fn decode_or_skip<T: serde::de::DeserializeOwned>(entry: Option<&CacheEntry>) -> Option<T> {
    let entry = entry?;
    match entry.decode() {
        Ok(value) => Some(value),
        Err(err) => {
            warn!(
                target = "libstats::aggregate",
                key = %entry.key,
                error = %err,
                "skipping undecodable cache entry"
            );
            None
        }
    }
}
