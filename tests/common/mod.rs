#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use time::macros::{date, datetime};
use time::{Date, OffsetDateTime};

use libstats::application::refresh::{RefreshConfig, RefreshOrchestrator};
use libstats::application::upstream::{FetchError, Fetched, GITHUB, NPM, UpstreamClient};
use libstats::cache::{CacheConfig, CacheStore, ManualClock, MemoryBackend};
use libstats::domain::catalog::{Catalog, Library, PackageSpec, Preset};
use libstats::domain::series::{DailyDownloads, DailySeries};
use libstats::domain::stats::{OwnerStats, RepoStats};
use libstats::domain::types::Bin;

/// 08:00 leaves room to expire the live chunk's TTL without changing day.
pub const NOW: OffsetDateTime = datetime!(2025-12-06 08:00 UTC);
pub const HISTORY_START: Date = date!(2024 - 01 - 01);

/// Upstream double that serves synthetic data and records every call.
#[derive(Default)]
pub struct MockUpstream {
    pub downloads_per_day: u64,
    pub delay: Duration,
    /// Subjects answering with HTTP 503.
    failing: Mutex<HashSet<String>>,
    /// Subjects answering with 404.
    pub missing: HashSet<String>,
    npm_calls: AtomicUsize,
    repo_calls: AtomicUsize,
    owner_calls: AtomicUsize,
    active: AtomicUsize,
    max_active: AtomicUsize,
    per_request: Mutex<HashMap<String, usize>>,
    started: Mutex<Vec<tokio::time::Instant>>,
}

impl MockUpstream {
    pub fn new(downloads_per_day: u64) -> Self {
        Self {
            downloads_per_day,
            ..Self::default()
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(self, subject: &str) -> Self {
        self.fail(subject);
        self
    }

    /// Make `subject` answer with 503 from now on.
    pub fn fail(&self, subject: &str) {
        self.failing
            .lock()
            .expect("failing set")
            .insert(subject.to_string());
    }

    pub fn missing(mut self, subject: &str) -> Self {
        self.missing.insert(subject.to_string());
        self
    }

    pub fn npm_calls(&self) -> usize {
        self.npm_calls.load(Ordering::SeqCst)
    }

    pub fn repo_calls(&self) -> usize {
        self.repo_calls.load(Ordering::SeqCst)
    }

    pub fn owner_calls(&self) -> usize {
        self.owner_calls.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    /// When each request started, in call order.
    pub fn request_starts(&self) -> Vec<tokio::time::Instant> {
        self.started.lock().expect("start log").clone()
    }

    /// How often each distinct request was made.
    pub fn request_counts(&self) -> HashMap<String, usize> {
        self.per_request.lock().expect("request log").clone()
    }

    async fn enter(&self, request: String) {
        *self
            .per_request
            .lock()
            .expect("request log")
            .entry(request)
            .or_default() += 1;
        self.started
            .lock()
            .expect("start log")
            .push(tokio::time::Instant::now());
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
    }

    fn leave(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    fn outcome(&self, upstream: &'static str, subject: &str) -> Result<bool, FetchError> {
        if self.failing.lock().expect("failing set").contains(subject) {
            return Err(FetchError::Status {
                upstream,
                status: 503,
            });
        }
        Ok(!self.missing.contains(subject))
    }
}

#[async_trait]
impl UpstreamClient for MockUpstream {
    async fn fetch_npm_downloads(
        &self,
        package: &str,
        from: Date,
        to: Date,
    ) -> Result<Fetched<DailySeries>, FetchError> {
        self.npm_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(format!("{package}|{from}|{to}")).await;
        let result = self.outcome(NPM, package).map(|found| {
            if !found {
                return Fetched::NotFound;
            }
            let mut points = Vec::new();
            let mut day = from;
            while day <= to {
                points.push(DailyDownloads {
                    day,
                    downloads: self.downloads_per_day,
                });
                match day.next_day() {
                    Some(next) => day = next,
                    None => break,
                }
            }
            Fetched::Found(DailySeries::new(points))
        });
        self.leave();
        result
    }

    async fn fetch_github_repo_stats(
        &self,
        repository: &str,
    ) -> Result<Fetched<RepoStats>, FetchError> {
        self.repo_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(format!("repo|{repository}")).await;
        let result = self.outcome(GITHUB, repository).map(|found| {
            if !found {
                return Fetched::NotFound;
            }
            Fetched::Found(RepoStats {
                repository: repository.to_string(),
                star_count: 100,
                contributor_count: 10,
                dependent_count: 1000,
            })
        });
        self.leave();
        result
    }

    async fn fetch_github_owner_stats(&self, org: &str) -> Result<Fetched<OwnerStats>, FetchError> {
        self.owner_calls.fetch_add(1, Ordering::SeqCst);
        self.enter(format!("owner|{org}")).await;
        let result = self.outcome(GITHUB, org).map(|found| {
            if !found {
                return Fetched::NotFound;
            }
            Fetched::Found(OwnerStats {
                owner: org.to_string(),
                star_count: 5000,
                repository_count: 30,
                follower_count: 700,
            })
        });
        self.leave();
        result
    }
}

fn spec(name: &str) -> PackageSpec {
    PackageSpec {
        name: name.to_string(),
        created: None,
    }
}

/// Two libraries of two packages each plus one legacy package.
pub fn test_catalog() -> Catalog {
    Catalog {
        org: "tanstack".into(),
        default_history_start: HISTORY_START,
        libraries: vec![
            Library {
                id: "query".into(),
                name: "TanStack Query".into(),
                repository: Some("TanStack/query".into()),
                packages: vec![spec("@tanstack/react-query"), spec("@tanstack/vue-query")],
            },
            Library {
                id: "table".into(),
                name: "TanStack Table".into(),
                repository: Some("TanStack/table".into()),
                packages: vec![spec("@tanstack/react-table"), spec("@tanstack/table-core")],
            },
        ],
        legacy_packages: vec![spec("react-query")],
        presets: vec![Preset {
            id: "query-adapters".into(),
            title: "Query adapters".into(),
            packages: vec!["@tanstack/react-query".into(), "@tanstack/vue-query".into()],
            range: "30d".into(),
            bin: Bin::Weekly,
        }],
    }
}

pub fn fast_config(concurrency: usize) -> RefreshConfig {
    RefreshConfig {
        concurrency: NonZeroUsize::new(concurrency).expect("non-zero concurrency"),
        batch_delay: Duration::ZERO,
        budget: Duration::from_secs(60),
        chunk_size_days: 500,
    }
}

pub struct Harness {
    pub backend: Arc<MemoryBackend>,
    pub clock: Arc<ManualClock>,
    pub store: Arc<CacheStore>,
    pub catalog: Arc<Catalog>,
    pub upstream: Arc<MockUpstream>,
    pub orchestrator: Arc<RefreshOrchestrator>,
}

pub fn harness(upstream: MockUpstream, config: RefreshConfig) -> Harness {
    harness_with_catalog(upstream, config, test_catalog())
}

pub fn harness_with_catalog(
    upstream: MockUpstream,
    config: RefreshConfig,
    catalog: Catalog,
) -> Harness {
    let backend = Arc::new(MemoryBackend::new());
    let clock = Arc::new(ManualClock::new(NOW));
    let store = Arc::new(CacheStore::new(
        backend.clone(),
        clock.clone(),
        CacheConfig::default(),
    ));
    let catalog = Arc::new(catalog);
    let upstream = Arc::new(upstream);
    let orchestrator = Arc::new(RefreshOrchestrator::new(
        store.clone(),
        upstream.clone(),
        catalog.clone(),
        config,
    ));
    Harness {
        backend,
        clock,
        store,
        catalog,
        upstream,
        orchestrator,
    }
}
