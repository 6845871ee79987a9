//! Read side of the statistics cache.
//!
//! Every answer comes from the cache: a fresh entry when there is one, an
//! expired one flagged `stale` otherwise. Nothing here talks to upstream.

use std::collections::HashSet;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use time::{Date, OffsetDateTime};
use tracing::{debug, warn};

use crate::cache::{CacheError, CacheKey, CacheStore, Cached};
use crate::domain::catalog::{Catalog, Preset};
use crate::domain::chunks::generate_chunks;
use crate::domain::error::DomainError;
use crate::domain::series::{BinnedPoint, DailySeries};
use crate::domain::stats::{LibraryStats, OrgStats, PackageTotals};
use crate::domain::types::{Bin, TimeRange, iso_date};

#[derive(Debug, Error)]
pub enum StatsError {
    #[error("no statistics are cached for `{subject}` yet")]
    StatsUnavailable { subject: String },
    #[error("library `{0}` is not in the catalog")]
    UnknownLibrary(String),
    #[error(transparent)]
    Invalid(#[from] DomainError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl StatsError {
    fn unavailable(subject: impl Into<String>) -> Self {
        Self::StatsUnavailable {
            subject: subject.into(),
        }
    }
}

/// A cached payload with its provenance.
#[derive(Debug, Clone, Serialize)]
pub struct StatsView<T> {
    pub data: T,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    pub stale: bool,
}

impl<T> From<Cached<T>> for StatsView<T> {
    fn from(cached: Cached<T>) -> Self {
        Self {
            data: cached.value,
            fetched_at: cached.fetched_at,
            stale: cached.stale,
        }
    }
}

/// Catalog entry joined with whatever rollup is cached for it.
#[derive(Debug, Clone, Serialize)]
pub struct LibraryListing {
    pub id: String,
    pub name: String,
    pub repository: Option<String>,
    pub packages: Vec<String>,
    pub total_downloads: Option<u64>,
    pub rate_per_day: Option<f64>,
    pub star_count: Option<u64>,
    pub stale: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompareRequest {
    pub packages: Vec<String>,
    pub range: TimeRange,
    pub bin: Bin,
}

impl CompareRequest {
    pub fn from_preset(preset: &Preset) -> Result<Self, DomainError> {
        Ok(Self {
            packages: preset.packages.clone(),
            range: preset.time_range()?,
            bin: preset.bin,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PackageSeries {
    pub package: String,
    /// Downloads inside the requested range.
    pub total: u64,
    pub points: Vec<BinnedPoint>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    #[serde(with = "iso_date")]
    pub from: Date,
    #[serde(with = "iso_date")]
    pub to: Date,
    pub bin: Bin,
    pub series: Vec<PackageSeries>,
    /// Requested packages with no cached history.
    pub missing: Vec<String>,
}

pub struct StatsService {
    store: Arc<CacheStore>,
    catalog: Arc<Catalog>,
    chunk_size_days: u32,
}

impl StatsService {
    pub fn new(store: Arc<CacheStore>, catalog: Arc<Catalog>, chunk_size_days: u32) -> Self {
        Self {
            store,
            catalog,
            chunk_size_days,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub async fn get_org_stats(&self) -> Result<StatsView<OrgStats>, StatsError> {
        let key = CacheKey::org(&self.catalog.org);
        self.store
            .resolve::<OrgStats>(&key)
            .await?
            .map(StatsView::from)
            .ok_or_else(|| StatsError::unavailable(key.render()))
    }

    pub async fn get_library_stats(
        &self,
        library_id: &str,
    ) -> Result<StatsView<LibraryStats>, StatsError> {
        let library = self
            .catalog
            .library(library_id)
            .ok_or_else(|| StatsError::UnknownLibrary(library_id.to_string()))?;
        let key = CacheKey::library(&library.id);
        self.store
            .resolve::<LibraryStats>(&key)
            .await?
            .map(StatsView::from)
            .ok_or_else(|| StatsError::unavailable(key.render()))
    }

    /// Every catalog library, with rollup figures where one is cached.
    pub async fn list_libraries(&self) -> Result<Vec<LibraryListing>, StatsError> {
        let keys: Vec<CacheKey> = self
            .catalog
            .libraries
            .iter()
            .map(|library| CacheKey::library(&library.id))
            .collect();
        let entries = self.store.get_batch_expired(&keys).await?;
        let now = self.store.now();

        Ok(self
            .catalog
            .libraries
            .iter()
            .zip(&keys)
            .map(|(library, key)| {
                let cached = entries.get(key);
                let stats = cached.and_then(|entry| match entry.decode::<LibraryStats>() {
                    Ok(stats) => Some(stats),
                    Err(err) => {
                        warn!(target = "libstats::stats", key = %key, error = %err, "ignoring undecodable library rollup");
                        None
                    }
                });
                LibraryListing {
                    id: library.id.clone(),
                    name: library.name.clone(),
                    repository: library.repository.clone(),
                    packages: library.package_names().map(str::to_string).collect(),
                    total_downloads: stats.as_ref().map(|stats| stats.total_downloads),
                    rate_per_day: stats.as_ref().and_then(|stats| stats.rate_per_day),
                    star_count: stats
                        .as_ref()
                        .and_then(|stats| stats.repo.as_ref())
                        .map(|repo| repo.star_count),
                    stale: cached.is_some_and(|entry| !entry.is_fresh(now)),
                }
            })
            .collect())
    }

    pub fn list_presets(&self) -> Vec<Preset> {
        self.catalog.presets.clone()
    }

    pub fn preset(&self, id: &str) -> Result<&Preset, StatsError> {
        self.catalog
            .preset(id)
            .ok_or_else(|| StatsError::Invalid(DomainError::not_found("preset", id)))
    }

    /// Daily history of each package, filtered to `range` and binned.
    pub async fn compare_packages(
        &self,
        request: &CompareRequest,
    ) -> Result<StatsView<Comparison>, StatsError> {
        let mut seen = HashSet::new();
        let packages: Vec<&str> = request
            .packages
            .iter()
            .map(|name| name.trim())
            .filter(|name| !name.is_empty() && seen.insert(*name))
            .collect();
        if packages.is_empty() {
            return Err(DomainError::validation("compare needs at least one package").into());
        }

        let today = self.store.today();

        let totals_keys: Vec<CacheKey> = packages
            .iter()
            .map(|name| CacheKey::package_totals(name))
            .collect();
        let totals = self.store.get_batch_expired(&totals_keys).await?;

        // The live chunk's key ends at the as-of date of the last refresh.
        let plans: Vec<Vec<CacheKey>> = packages
            .iter()
            .zip(&totals_keys)
            .map(|(name, key)| {
                let as_of = totals
                    .get(key)
                    .and_then(|entry| entry.decode::<PackageTotals>().ok())
                    .map_or(today, |totals| totals.as_of);
                generate_chunks(self.catalog.package_start(name), as_of, self.chunk_size_days)
                    .iter()
                    .map(|chunk| CacheKey::chunk(name, chunk))
                    .collect()
            })
            .collect();
        let chunk_keys: Vec<CacheKey> = plans.iter().flatten().cloned().collect();
        let entries = self.store.get_batch_expired(&chunk_keys).await?;

        let now = self.store.now();
        let mut fetched_at: Option<OffsetDateTime> = None;
        let mut stale = false;
        let mut found = Vec::new();
        let mut missing = Vec::new();

        for (name, plan) in packages.iter().zip(&plans) {
            let mut series = DailySeries::default();
            let mut any = false;
            for key in plan {
                let Some(entry) = entries.get(key) else {
                    continue;
                };
                match entry.decode::<DailySeries>() {
                    Ok(chunk) => {
                        any = true;
                        stale |= !entry.is_fresh(now);
                        fetched_at = Some(fetched_at.map_or(entry.fetched_at, |at| at.min(entry.fetched_at)));
                        series.splice(chunk.points().iter().copied());
                    }
                    Err(err) => warn!(
                        target = "libstats::stats",
                        key = %key,
                        error = %err,
                        "ignoring undecodable chunk"
                    ),
                }
            }
            if any {
                found.push((name.to_string(), series));
            } else {
                missing.push(name.to_string());
            }
        }

        let Some(fetched_at) = fetched_at else {
            return Err(StatsError::unavailable(packages.join(",")));
        };

        let earliest = found
            .iter()
            .filter_map(|(_, series)| series.first_day())
            .min()
            .unwrap_or(today);
        let (from, to) = request.range.resolve(today, earliest);

        let series = found
            .into_iter()
            .map(|(package, series)| {
                let window = series.filter_range(from, to);
                PackageSeries {
                    package,
                    total: window.total(),
                    points: window.bin(request.bin),
                }
            })
            .collect();

        debug!(
            target = "libstats::stats",
            packages = packages.len(),
            missing = missing.len(),
            %from,
            %to,
            bin = request.bin.as_str(),
            "comparison assembled"
        );

        Ok(StatsView {
            data: Comparison {
                from,
                to,
                bin: request.bin,
                series,
                missing,
            },
            fetched_at,
            stale,
        })
    }
}
