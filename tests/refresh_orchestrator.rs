mod common;

use std::sync::Arc;
use std::time::Duration;

use libstats::application::refresh::{
    RefreshConfig, RefreshError, RefreshOptions, RefreshScope,
};
use libstats::application::stats::StatsService;
use libstats::cache::CacheKey;
use libstats::domain::chunks::DateChunk;
use libstats::domain::series::DailySeries;
use libstats::domain::stats::PackageTotals;
use time::macros::date;

use common::{MockUpstream, fast_config, harness};

const PER_DAY: u64 = 10;
/// 2024-01-01 through 2025-12-06, both ends included.
const HISTORY_DAYS: u64 = 706;
const PACKAGE_TOTAL: u64 = PER_DAY * HISTORY_DAYS;

const CLOSED: DateChunk = DateChunk {
    from: date!(2024 - 01 - 01),
    to: date!(2025 - 05 - 15),
};
const LIVE: DateChunk = DateChunk {
    from: date!(2025 - 05 - 16),
    to: date!(2025 - 12 - 06),
};

fn stats_for(h: &common::Harness) -> StatsService {
    StatsService::new(h.store.clone(), h.catalog.clone(), 500)
}

fn packages(names: &[&str]) -> Vec<String> {
    names.iter().map(|name| name.to_string()).collect()
}

#[tokio::test]
async fn full_refresh_populates_chunks_and_rollups() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));

    let report = h
        .orchestrator
        .refresh_all(&RefreshOptions::default())
        .await
        .expect("refresh");

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.scope, RefreshScope::All);
    // five packages, two repositories, one owner profile
    assert_eq!(report.successes.len(), 8);
    assert_eq!(report.fetched, 5 * 2 + 2 + 1);
    assert_eq!(report.skipped, 0);
    assert_eq!(h.upstream.npm_calls(), 10);
    assert_eq!(h.upstream.repo_calls(), 2);
    assert_eq!(h.upstream.owner_calls(), 1);

    let closed = h
        .backend
        .peek(&CacheKey::chunk("@tanstack/react-query", &CLOSED))
        .expect("closed chunk stored");
    assert!(closed.immutable);
    assert!(closed.expires_at.is_none());

    let live = h
        .backend
        .peek(&CacheKey::chunk("@tanstack/react-query", &LIVE))
        .expect("live chunk stored");
    assert!(!live.immutable);
    assert!(live.expires_at.is_some());
    let series: DailySeries = live.decode().expect("series payload");
    assert_eq!(series.last_day(), Some(date!(2025 - 12 - 06)));

    let org = stats_for(&h).get_org_stats().await.expect("org stats");
    assert!(!org.stale);
    assert_eq!(org.data.total_downloads, PACKAGE_TOTAL * 5);
    assert_eq!(org.data.legacy_downloads, PACKAGE_TOTAL);
    assert_eq!(org.data.star_count, 5000);
    assert_eq!(org.data.contributor_count, 20);
    assert_eq!(org.data.dependent_count, 2000);
    assert!(org.data.missing_packages.is_empty());

    let query = stats_for(&h)
        .get_library_stats("query")
        .await
        .expect("library stats");
    assert_eq!(query.data.total_downloads, PACKAGE_TOTAL * 2);
    assert_eq!(query.data.rate_per_day, Some(20.0));
    assert_eq!(
        query.data.repo.as_ref().map(|repo| repo.star_count),
        Some(100)
    );
}

#[tokio::test]
async fn rerun_skips_current_entries_and_refetches_expired_live_chunks() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));
    let options = RefreshOptions::default();

    h.orchestrator.refresh_all(&options).await.expect("first run");
    let again = h.orchestrator.refresh_all(&options).await.expect("second run");
    assert_eq!(again.fetched, 0);
    assert_eq!(again.skipped, 13);
    assert_eq!(h.upstream.npm_calls(), 10);

    h.clock.advance(time::Duration::hours(7));
    let later = h.orchestrator.refresh_all(&options).await.expect("third run");
    assert!(later.is_clean());
    // closed chunks never expire; live chunks and GitHub snapshots do
    assert_eq!(later.skipped, 5);
    assert_eq!(later.fetched, 5 + 2 + 1);
    assert_eq!(h.upstream.npm_calls(), 15);

    let counts = h.upstream.request_counts();
    assert_eq!(counts.get("@tanstack/react-query|2024-01-01|2025-05-15"), Some(&1));
    assert_eq!(counts.get("@tanstack/react-query|2025-05-16|2025-12-06"), Some(&2));
}

#[tokio::test]
async fn force_refetches_mutable_entries_only() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));
    h.orchestrator
        .refresh_all(&RefreshOptions::default())
        .await
        .expect("first run");

    h.clock.advance(time::Duration::minutes(1));
    let forced = h
        .orchestrator
        .refresh_all(&RefreshOptions {
            force: true,
            packages: Vec::new(),
        })
        .await
        .expect("forced run");

    assert!(forced.is_clean());
    assert_eq!(forced.fetched, 5 + 2 + 1);
    assert_eq!(forced.skipped, 5);
    assert_eq!(h.upstream.npm_calls(), 15);
}

#[tokio::test]
async fn failing_package_is_reported_and_listed_as_missing() {
    let upstream = MockUpstream::new(PER_DAY).failing("@tanstack/vue-query");
    let h = harness(upstream, fast_config(4));

    let report = h
        .orchestrator
        .refresh_all(&RefreshOptions::default())
        .await
        .expect("refresh");

    assert!(!report.is_clean());
    assert!(!report.timed_out);
    assert_eq!(report.failures.len(), 1);
    let failure = &report.failures[0];
    assert_eq!(failure.subject, "npm:@tanstack/vue-query");
    assert!(failure.retryable);
    assert_eq!(report.successes.len(), 7);

    let org = stats_for(&h).get_org_stats().await.expect("org stats");
    assert_eq!(org.data.missing_packages, vec!["@tanstack/vue-query".to_string()]);
    assert_eq!(org.data.total_downloads, PACKAGE_TOTAL * 4);

    let query = stats_for(&h)
        .get_library_stats("query")
        .await
        .expect("library stats");
    assert_eq!(query.data.missing_packages, vec!["@tanstack/vue-query".to_string()]);
    assert_eq!(query.data.packages.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn upstream_concurrency_is_bounded() {
    let upstream = MockUpstream::new(PER_DAY).with_delay(Duration::from_millis(10));
    let h = harness(upstream, fast_config(2));

    let report = h
        .orchestrator
        .refresh_all(&RefreshOptions::default())
        .await
        .expect("refresh");

    assert!(report.is_clean());
    assert_eq!(h.upstream.max_active(), 2);
}

#[tokio::test(start_paused = true)]
async fn exhausted_budget_keeps_completed_work() {
    let upstream = MockUpstream::new(PER_DAY).with_delay(Duration::from_millis(15));
    let mut config = fast_config(1);
    config.budget = Duration::from_millis(50);
    let h = harness(upstream, config);

    let names = packages(&[
        "@tanstack/react-query",
        "@tanstack/vue-query",
        "@tanstack/react-table",
        "@tanstack/table-core",
    ]);
    let report = h
        .orchestrator
        .refresh_packages(&names, &RefreshOptions::default())
        .await
        .expect("refresh");

    assert!(report.timed_out);
    assert_eq!(report.successes, vec!["npm:@tanstack/react-query".to_string()]);
    assert_eq!(report.failures.len(), 3);
    assert!(
        report
            .failures
            .iter()
            .all(|failure| failure.error == "budget exhausted" && failure.retryable)
    );

    // the interrupted package keeps the chunk it finished before the deadline
    assert!(
        h.backend
            .peek(&CacheKey::chunk("@tanstack/vue-query", &CLOSED))
            .is_some()
    );
    assert!(
        h.backend
            .peek(&CacheKey::chunk("@tanstack/vue-query", &LIVE))
            .is_none()
    );
}

#[tokio::test]
async fn overlapping_run_of_the_same_scope_is_rejected() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));

    let _running = h
        .orchestrator
        .active_runs()
        .acquire(RefreshScope::All)
        .expect("first guard");
    let err = h
        .orchestrator
        .refresh_all(&RefreshOptions::default())
        .await
        .expect_err("second run rejected");
    assert!(matches!(
        err,
        RefreshError::AlreadyRunning {
            scope: RefreshScope::All
        }
    ));
    assert_eq!(h.upstream.npm_calls(), 0);

    let other = h
        .orchestrator
        .refresh_packages(&packages(&["react-query"]), &RefreshOptions::default())
        .await
        .expect("different scope runs");
    assert!(other.is_clean());
}

#[tokio::test(start_paused = true)]
async fn concurrent_runs_fetch_each_entry_once() {
    let upstream = MockUpstream::new(PER_DAY).with_delay(Duration::from_millis(10));
    let h = harness(upstream, fast_config(8));
    let orchestrator = Arc::clone(&h.orchestrator);
    let options = RefreshOptions::default();
    let names = packages(&["@tanstack/react-query", "@tanstack/vue-query"]);

    let (org, subset) = tokio::join!(
        orchestrator.refresh_org_stats("TanStack", &options),
        orchestrator.refresh_packages(&names, &options),
    );

    assert!(org.expect("org run").is_clean());
    assert!(subset.expect("packages run").is_clean());
    let counts = h.upstream.request_counts();
    assert!(!counts.is_empty());
    for (request, count) in &counts {
        assert_eq!(*count, 1, "{request} fetched {count} times");
    }
}

#[tokio::test]
async fn missing_package_is_cached_as_empty_history() {
    let upstream = MockUpstream::new(PER_DAY).missing("@tanstack/vue-query");
    let h = harness(upstream, fast_config(4));

    let report = h
        .orchestrator
        .refresh_all(&RefreshOptions::default())
        .await
        .expect("refresh");

    assert!(report.is_clean());
    assert!(
        report
            .successes
            .contains(&"npm:@tanstack/vue-query".to_string())
    );

    let query = stats_for(&h)
        .get_library_stats("query")
        .await
        .expect("library stats");
    assert!(query.data.missing_packages.is_empty());
    assert_eq!(query.data.total_downloads, PACKAGE_TOTAL);
    let vue = query
        .data
        .packages
        .iter()
        .find(|summary| summary.package == "@tanstack/vue-query")
        .expect("vue-query summary");
    assert_eq!(vue.total_downloads, 0);

    // a second run does not ask again while the empty entries are current
    h.orchestrator
        .refresh_packages(&packages(&["@tanstack/vue-query"]), &RefreshOptions::default())
        .await
        .expect("rerun");
    assert_eq!(
        h.upstream
            .request_counts()
            .get("@tanstack/vue-query|2025-05-16|2025-12-06"),
        Some(&1)
    );
}

#[tokio::test]
async fn rejects_unknown_org_and_empty_package_lists() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));
    let options = RefreshOptions::default();

    let err = h
        .orchestrator
        .refresh_org_stats("vercel", &options)
        .await
        .expect_err("unknown org");
    assert!(matches!(err, RefreshError::UnknownOrg { ref org } if org == "vercel"));

    let err = h
        .orchestrator
        .refresh_packages(&packages(&["", "  "]), &options)
        .await
        .expect_err("no packages");
    assert!(matches!(err, RefreshError::NoPackages));
    assert_eq!(h.upstream.npm_calls(), 0);
}

#[tokio::test]
async fn libraries_scope_touches_only_repositories() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));

    let report = h
        .orchestrator
        .refresh(RefreshScope::Libraries, &RefreshOptions::default())
        .await
        .expect("refresh");

    assert!(report.is_clean());
    let mut successes = report.successes.clone();
    successes.sort();
    assert_eq!(
        successes,
        vec![
            "repo:TanStack/query".to_string(),
            "repo:TanStack/table".to_string()
        ]
    );
    assert_eq!(h.upstream.npm_calls(), 0);
    assert_eq!(h.upstream.owner_calls(), 0);
}

#[tokio::test]
async fn failed_package_keeps_its_last_known_totals() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));
    let options = RefreshOptions::default();

    h.orchestrator
        .refresh_org_stats("tanstack", &options)
        .await
        .expect("day one");
    let before = stats_for(&h).get_org_stats().await.expect("org stats");
    assert_eq!(before.data.total_downloads, PACKAGE_TOTAL * 5);

    h.clock.advance(time::Duration::days(1));
    h.upstream.fail("@tanstack/react-query");
    let report = h
        .orchestrator
        .refresh_org_stats("tanstack", &options)
        .await
        .expect("day two");
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].subject, "npm:@tanstack/react-query");

    let totals: PackageTotals = h
        .store
        .get_expired(&CacheKey::package_totals("@tanstack/react-query"))
        .await
        .expect("cache read")
        .expect("totals kept")
        .decode()
        .expect("totals payload");
    assert_eq!(totals.total_downloads, PACKAGE_TOTAL);
    assert_eq!(totals.rate_per_day, Some(10.0));
    assert_eq!(totals.as_of, date!(2025 - 12 - 06));

    // the other four packages gained the new day
    let after = stats_for(&h).get_org_stats().await.expect("org stats");
    assert_eq!(
        after.data.total_downloads,
        PACKAGE_TOTAL + 4 * (PACKAGE_TOTAL + PER_DAY)
    );
    assert!(after.data.missing_packages.is_empty());

    let query = stats_for(&h)
        .get_library_stats("query")
        .await
        .expect("library stats");
    assert_eq!(query.data.total_downloads, 2 * PACKAGE_TOTAL + PER_DAY);
    assert_eq!(query.data.rate_per_day, Some(20.0));
}

#[tokio::test]
async fn repo_stats_survive_a_week_of_failures() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));
    let options = RefreshOptions::default();
    let repo = CacheKey::repo("TanStack/query");

    h.orchestrator
        .refresh_all_libraries(&options)
        .await
        .expect("first run");
    assert!(h.backend.peek(&repo).is_some());

    h.clock.advance(time::Duration::days(8));
    h.upstream.fail("TanStack/query");
    for _ in 0..2 {
        let report = h
            .orchestrator
            .refresh_all_libraries(&options)
            .await
            .expect("failing run");
        assert_eq!(report.failures.len(), 1);
    }

    assert!(h.backend.peek(&repo).is_some(), "last-known repo stats pruned");
    let query = stats_for(&h)
        .get_library_stats("query")
        .await
        .expect("library stats");
    assert_eq!(
        query.data.repo.as_ref().map(|repo| repo.star_count),
        Some(100)
    );
    let org = stats_for(&h).get_org_stats().await.expect("org stats");
    assert_eq!(org.data.contributor_count, 20);
}

#[tokio::test]
async fn superseded_live_chunk_is_pruned_after_retention() {
    let h = harness(MockUpstream::new(PER_DAY), fast_config(4));
    let options = RefreshOptions::default();
    let names = packages(&["@tanstack/react-query"]);

    h.orchestrator
        .refresh_packages(&names, &options)
        .await
        .expect("first run");
    let old_head = CacheKey::chunk("@tanstack/react-query", &LIVE);
    assert!(h.backend.peek(&old_head).is_some());

    h.clock.advance(time::Duration::days(8));
    let report = h
        .orchestrator
        .refresh_packages(&names, &options)
        .await
        .expect("second run");
    assert!(report.is_clean());
    assert_eq!(report.pruned, 1);
    assert!(h.backend.peek(&old_head).is_none());
    assert!(
        h.backend
            .peek(&CacheKey::package_totals("@tanstack/react-query"))
            .is_some()
    );
}

#[tokio::test(start_paused = true)]
async fn default_config_runs_batches_of_eight_with_a_pause_between() {
    let upstream = MockUpstream::new(PER_DAY).with_delay(Duration::from_millis(10));
    let config = RefreshConfig::default();
    assert_eq!(config.concurrency.get(), 8);
    assert_eq!(config.batch_delay, Duration::from_millis(500));
    let h = harness(upstream, config);

    let names: Vec<String> = (0..10).map(|n| format!("pkg-{n}")).collect();
    let report = h
        .orchestrator
        .refresh_packages(&names, &RefreshOptions::default())
        .await
        .expect("refresh");

    assert!(report.is_clean());
    assert_eq!(report.successes.len(), 10);
    assert_eq!(h.upstream.npm_calls(), 20);
    assert_eq!(h.upstream.max_active(), 8);

    // batch one: eight packages, two chunks each, done after 20ms
    let starts = h.upstream.request_starts();
    let first = *starts.iter().min().expect("requests made");
    let offsets: Vec<Duration> = starts.iter().map(|start| *start - first).collect();
    let first_batch = offsets
        .iter()
        .filter(|offset| **offset < Duration::from_millis(500))
        .count();
    assert_eq!(first_batch, 16);
    assert!(
        offsets
            .iter()
            .filter(|offset| **offset >= Duration::from_millis(500))
            .all(|offset| *offset >= Duration::from_millis(520)),
        "{offsets:?}"
    );
}
