use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Dependencies that are chatty at `info` and below.
const QUIET_TARGETS: &[&str] = &["sqlx=warn", "hyper_util=warn", "reqwest=warn", "apalis=info"];

/// Install the global subscriber and describe the exported metrics.
///
/// `RUST_LOG` overrides both the configured level and the quiet targets.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder().with_default_directive(logging.level.into());
    if std::env::var_os(EnvFilter::DEFAULT_ENV).is_none() {
        let quiet = QUIET_TARGETS.join(",");
        let filter = env_filter
            .parse(quiet)
            .map_err(|err| InfraError::telemetry(format!("invalid log directives: {err}")))?;
        return install(filter, logging.format);
    }
    install(env_filter.from_env_lossy(), logging.format)
}

fn install(filter: EnvFilter, format: LogFormat) -> Result<(), InfraError> {
    let fmt_layer = match format {
        LogFormat::Json => fmt::layer()
            .json()
            .flatten_event(true)
            .with_current_span(true)
            .with_span_list(false)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "libstats_cache_hit_total",
            Unit::Count,
            "Cache lookups answered by the memo or the backend, by tier."
        );
        describe_counter!(
            "libstats_cache_miss_total",
            Unit::Count,
            "Cache lookups that found no entry at all."
        );
        describe_counter!(
            "libstats_cache_write_rejected_total",
            Unit::Count,
            "Writes refused because the key already holds an immutable entry."
        );
        describe_counter!(
            "libstats_upstream_requests_total",
            Unit::Count,
            "Upstream HTTP exchanges by upstream and outcome."
        );
        describe_histogram!(
            "libstats_refresh_duration_ms",
            Unit::Milliseconds,
            "Wall-clock duration of refresh runs by scope."
        );
        describe_counter!(
            "libstats_refresh_failures_total",
            Unit::Count,
            "Subjects that failed to refresh, by scope."
        );
        describe_gauge!(
            "libstats_refresh_in_flight",
            Unit::Count,
            "Upstream fetches currently holding a refresh permit."
        );
    });
}
