use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, gauge, histogram};
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::time::{Instant, sleep, timeout_at};
use tracing::{debug, info, warn};

use crate::application::aggregate::Aggregator;
use crate::application::upstream::{FetchError, Fetched, UpstreamClient};
use crate::cache::{CacheError, CacheKey, CacheStore, SingleFlight, WriteOutcome};
use crate::domain::catalog::Catalog;
use crate::domain::chunks::generate_chunks;
use crate::domain::series::DailySeries;
use crate::domain::stats::{OwnerStats, RepoStats};

use super::{ActiveRuns, RefreshConfig, RefreshError, RefreshOptions, RefreshReport, RefreshScope};

const METRIC_REFRESH_DURATION: &str = "libstats_refresh_duration_ms";
const METRIC_REFRESH_FAILURES: &str = "libstats_refresh_failures_total";
const METRIC_REFRESH_IN_FLIGHT: &str = "libstats_refresh_in_flight";

const BUDGET_EXHAUSTED: &str = "budget exhausted";

/// Unit of work dispatched inside a batch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum Subject {
    Package(String),
    Repo(String),
    Owner(String),
}

impl Subject {
    fn label(&self) -> String {
        match self {
            Subject::Package(name) => CacheKey::package_totals(name).render(),
            Subject::Repo(repository) => CacheKey::repo(repository).render(),
            Subject::Owner(org) => CacheKey::owner(org).render(),
        }
    }
}

#[derive(Debug, Error)]
enum SubjectError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error("upstream permits are closed")]
    Cancelled,
}

impl SubjectError {
    fn retryable(&self) -> bool {
        match self {
            SubjectError::Fetch(err) => err.retryable(),
            SubjectError::Cache(_) => true,
            SubjectError::Cancelled => false,
        }
    }
}

enum Step {
    Fetched,
    Skipped,
}

#[derive(Debug, Default, Clone, Copy)]
struct Tally {
    fetched: usize,
    skipped: usize,
}

impl Tally {
    fn record(&mut self, step: Step) {
        match step {
            Step::Fetched => self.fetched += 1,
            Step::Skipped => self.skipped += 1,
        }
    }
}

/// Keeps the in-flight gauge balanced even when a fetch is cancelled.
struct InFlight;

impl InFlight {
    fn enter() -> Self {
        gauge!(METRIC_REFRESH_IN_FLIGHT).increment(1.0);
        Self
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        gauge!(METRIC_REFRESH_IN_FLIGHT).decrement(1.0);
    }
}

pub struct RefreshOrchestrator {
    store: Arc<CacheStore>,
    upstream: Arc<dyn UpstreamClient>,
    catalog: Arc<Catalog>,
    aggregator: Aggregator,
    config: RefreshConfig,
    flights: SingleFlight,
    permits: Arc<Semaphore>,
    runs: ActiveRuns,
}

impl RefreshOrchestrator {
    pub fn new(
        store: Arc<CacheStore>,
        upstream: Arc<dyn UpstreamClient>,
        catalog: Arc<Catalog>,
        config: RefreshConfig,
    ) -> Self {
        let aggregator = Aggregator::new(store.clone(), catalog.clone(), config.chunk_size_days);
        let permits = Arc::new(Semaphore::new(config.concurrency.get()));
        Self {
            store,
            upstream,
            catalog,
            aggregator,
            config,
            flights: SingleFlight::new(),
            permits,
            runs: ActiveRuns::new(),
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn config(&self) -> &RefreshConfig {
        &self.config
    }

    pub fn active_runs(&self) -> &ActiveRuns {
        &self.runs
    }

    /// Dispatch a run of `scope`.
    pub async fn refresh(
        &self,
        scope: RefreshScope,
        options: &RefreshOptions,
    ) -> Result<RefreshReport, RefreshError> {
        match scope {
            RefreshScope::All => self.refresh_all(options).await,
            RefreshScope::Org => self.refresh_org_stats(&self.catalog.org, options).await,
            RefreshScope::Libraries => self.refresh_all_libraries(options).await,
            RefreshScope::Packages => self.refresh_packages(&options.packages, options).await,
        }
    }

    /// Download history of every org package plus the owner profile.
    pub async fn refresh_org_stats(
        &self,
        org: &str,
        options: &RefreshOptions,
    ) -> Result<RefreshReport, RefreshError> {
        if !org.eq_ignore_ascii_case(&self.catalog.org) {
            return Err(RefreshError::UnknownOrg {
                org: org.to_string(),
            });
        }

        let packages = self.catalog_packages();
        let mut subjects: Vec<Subject> = packages.iter().cloned().map(Subject::Package).collect();
        subjects.push(Subject::Owner(self.catalog.org.clone()));
        self.run(RefreshScope::Org, subjects, packages, options).await
    }

    /// GitHub metrics of every library repository.
    pub async fn refresh_all_libraries(
        &self,
        options: &RefreshOptions,
    ) -> Result<RefreshReport, RefreshError> {
        let subjects = self.repository_subjects();
        self.run(RefreshScope::Libraries, subjects, Vec::new(), options)
            .await
    }

    pub async fn refresh_packages(
        &self,
        names: &[String],
        options: &RefreshOptions,
    ) -> Result<RefreshReport, RefreshError> {
        let packages = dedup(
            names
                .iter()
                .map(|name| name.trim())
                .filter(|name| !name.is_empty())
                .map(str::to_string),
        );
        if packages.is_empty() {
            return Err(RefreshError::NoPackages);
        }

        let subjects = packages.iter().cloned().map(Subject::Package).collect();
        self.run(RefreshScope::Packages, subjects, packages, options)
            .await
    }

    /// Packages, repositories and the owner profile in one run.
    pub async fn refresh_all(&self, options: &RefreshOptions) -> Result<RefreshReport, RefreshError> {
        let packages = self.catalog_packages();
        let mut subjects: Vec<Subject> = packages.iter().cloned().map(Subject::Package).collect();
        subjects.extend(self.repository_subjects());
        subjects.push(Subject::Owner(self.catalog.org.clone()));
        self.run(RefreshScope::All, subjects, packages, options).await
    }

    fn catalog_packages(&self) -> Vec<String> {
        dedup(
            self.catalog
                .all_packages()
                .into_iter()
                .map(|package| package.name.clone()),
        )
    }

    fn repository_subjects(&self) -> Vec<Subject> {
        dedup(
            self.catalog
                .repositories()
                .map(|(_, repository)| repository.to_string()),
        )
        .into_iter()
        .map(Subject::Repo)
        .collect()
    }

    async fn run(
        &self,
        scope: RefreshScope,
        subjects: Vec<Subject>,
        rollup_packages: Vec<String>,
        options: &RefreshOptions,
    ) -> Result<RefreshReport, RefreshError> {
        let _guard = self.runs.acquire(scope)?;
        let started = Instant::now();
        let requested_at = self.store.now();
        let mut report = RefreshReport::new(scope, requested_at);

        info!(
            target = "libstats::refresh",
            scope = %scope,
            subjects = subjects.len(),
            force = options.force,
            "refresh started"
        );

        self.run_batched(&subjects, options.force, requested_at, &mut report)
            .await;

        // Packages that did not refresh keep their last-known totals.
        let refreshed: HashSet<&str> = report.successes.iter().map(String::as_str).collect();
        let (recompute, kept): (Vec<String>, Vec<String>) = rollup_packages
            .into_iter()
            .partition(|package| {
                refreshed.contains(Subject::Package(package.clone()).label().as_str())
            });
        if !kept.is_empty() {
            debug!(
                target = "libstats::refresh",
                scope = %scope,
                packages = ?kept,
                "keeping last-known totals for packages that did not refresh"
            );
        }

        if let Err(err) = self
            .aggregator
            .rollup(&recompute, self.store.today())
            .await
        {
            warn!(
                target = "libstats::refresh",
                scope = %scope,
                error = %err,
                "rollup failed; previous rollups remain in place"
            );
            report.fail(CacheKey::org(&self.catalog.org).render(), err.to_string(), true);
        }

        match self.store.prune_superseded().await {
            Ok(pruned) => report.pruned = pruned,
            Err(err) => warn!(
                target = "libstats::refresh",
                scope = %scope,
                error = %err,
                "failed to prune superseded entries"
            ),
        }

        report.finished_at = self.store.now();
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
        histogram!(METRIC_REFRESH_DURATION, "scope" => scope.as_str()).record(elapsed_ms);
        if !report.failures.is_empty() {
            counter!(METRIC_REFRESH_FAILURES, "scope" => scope.as_str())
                .increment(report.failures.len() as u64);
        }

        info!(
            target = "libstats::refresh",
            scope = %scope,
            successes = report.successes.len(),
            failures = report.failures.len(),
            fetched = report.fetched,
            skipped = report.skipped,
            timed_out = report.timed_out,
            pruned = report.pruned,
            elapsed_ms,
            "refresh finished"
        );
        Ok(report)
    }

    /// Refresh `subjects` in batches of `concurrency` until done or out of budget.
    ///
    /// Work completed before the budget elapses stays persisted; everything
    /// unfinished is reported as a retryable failure.
    async fn run_batched(
        &self,
        subjects: &[Subject],
        force: bool,
        requested_at: OffsetDateTime,
        report: &mut RefreshReport,
    ) {
        let deadline = Instant::now() + self.config.budget;
        let batch_size = self.config.concurrency.get();
        let mut finished = vec![false; subjects.len()];

        'batches: for (batch_index, batch) in subjects.chunks(batch_size).enumerate() {
            let offset = batch_index * batch_size;
            if batch_index > 0
                && !self.config.batch_delay.is_zero()
                && timeout_at(deadline, sleep(self.config.batch_delay))
                    .await
                    .is_err()
            {
                report.timed_out = true;
                break;
            }
            if Instant::now() >= deadline {
                report.timed_out = true;
                break;
            }

            let mut pending: FuturesUnordered<_> = batch
                .iter()
                .enumerate()
                .map(|(position, subject)| async move {
                    let outcome = self.refresh_subject(subject, force, requested_at).await;
                    (offset + position, outcome)
                })
                .collect();

            loop {
                match timeout_at(deadline, pending.next()).await {
                    Ok(Some((index, outcome))) => {
                        finished[index] = true;
                        let label = subjects[index].label();
                        match outcome {
                            Ok(tally) => {
                                report.fetched += tally.fetched;
                                report.skipped += tally.skipped;
                                report.successes.push(label);
                            }
                            Err(err) => {
                                warn!(
                                    target = "libstats::refresh",
                                    subject = %label,
                                    error = %err,
                                    retryable = err.retryable(),
                                    "subject refresh failed"
                                );
                                report.fail(label, err.to_string(), err.retryable());
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(_) => {
                        report.timed_out = true;
                        break 'batches;
                    }
                }
            }
        }

        if report.timed_out {
            let mut unfinished = 0usize;
            for (subject, done) in subjects.iter().zip(&finished) {
                if !done {
                    unfinished += 1;
                    report.fail(subject.label(), BUDGET_EXHAUSTED, true);
                }
            }
            warn!(
                target = "libstats::refresh",
                scope = %report.scope,
                unfinished,
                budget_secs = self.config.budget.as_secs(),
                "refresh budget exhausted"
            );
        }
    }

    async fn refresh_subject(
        &self,
        subject: &Subject,
        force: bool,
        requested_at: OffsetDateTime,
    ) -> Result<Tally, SubjectError> {
        let mut tally = Tally::default();
        match subject {
            Subject::Package(name) => {
                let today = self.store.today();
                let start = self.catalog.package_start(name);
                for chunk in generate_chunks(start, today, self.config.chunk_size_days) {
                    let step = self
                        .refresh_entry(
                            &CacheKey::chunk(name, &chunk),
                            chunk.is_immutable(today),
                            force,
                            requested_at,
                            || self.upstream.fetch_npm_downloads(name, chunk.from, chunk.to),
                            DailySeries::default,
                        )
                        .await?;
                    tally.record(step);
                }
            }
            Subject::Repo(repository) => {
                let step = self
                    .refresh_entry(
                        &CacheKey::repo(repository),
                        false,
                        force,
                        requested_at,
                        || self.upstream.fetch_github_repo_stats(repository),
                        || RepoStats::empty(repository.as_str()),
                    )
                    .await?;
                tally.record(step);
            }
            Subject::Owner(org) => {
                let step = self
                    .refresh_entry(
                        &CacheKey::owner(org),
                        false,
                        force,
                        requested_at,
                        || self.upstream.fetch_github_owner_stats(org),
                        || OwnerStats::empty(org.as_str()),
                    )
                    .await?;
                tally.record(step);
            }
        }
        Ok(tally)
    }

    /// Fetch and store one entry unless the cache already has it.
    ///
    /// A missing upstream subject is stored as `empty()` so it is not
    /// refetched until its TTL elapses.
    async fn refresh_entry<T, F, Fut>(
        &self,
        key: &CacheKey,
        immutable: bool,
        force: bool,
        requested_at: OffsetDateTime,
        fetch: F,
        empty: impl FnOnce() -> T,
    ) -> Result<Step, SubjectError>
    where
        T: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Fetched<T>, FetchError>>,
    {
        if self.is_current(key, immutable, force, None).await? {
            return Ok(Step::Skipped);
        }

        let _flight = self.flights.acquire(&key.render()).await;
        if self
            .is_current(key, immutable, force, Some(requested_at))
            .await?
        {
            debug!(
                target = "libstats::refresh",
                key = %key,
                "entry refreshed by a concurrent run"
            );
            return Ok(Step::Skipped);
        }

        let fetched = {
            let _permit = self
                .permits
                .acquire()
                .await
                .map_err(|_| SubjectError::Cancelled)?;
            let _in_flight = InFlight::enter();
            fetch().await?
        };

        let payload = fetched.or_else_empty(empty);
        match self.store.set(key, &payload, immutable).await? {
            WriteOutcome::Written => Ok(Step::Fetched),
            WriteOutcome::Rejected => Ok(Step::Skipped),
        }
    }

    /// Whether the stored entry for `key` makes a fetch unnecessary.
    ///
    /// `written_since` additionally accepts any entry written at or after the
    /// given instant, which is how single-flight waiters detect that the
    /// holder already did the work.
    async fn is_current(
        &self,
        key: &CacheKey,
        immutable: bool,
        force: bool,
        written_since: Option<OffsetDateTime>,
    ) -> Result<bool, CacheError> {
        let Some(entry) = self.store.get_expired(key).await? else {
            return Ok(false);
        };
        if entry.immutable {
            return Ok(true);
        }
        if written_since.is_some_and(|since| entry.fetched_at >= since) {
            return Ok(true);
        }
        Ok(!force && !immutable && entry.is_fresh(self.store.now()))
    }
}

fn dedup<T: Clone + Eq + std::hash::Hash>(items: impl IntoIterator<Item = T>) -> Vec<T> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.clone()))
        .collect()
}
