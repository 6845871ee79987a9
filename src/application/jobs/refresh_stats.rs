//! Cron job refreshing every package, repository and the owner profile.

use std::str::FromStr;

use apalis::prelude::*;
use apalis_cron::Schedule;
use thiserror::Error;

use crate::application::refresh::{RefreshError, RefreshOptions};

use super::context::{JobWorkerContext, job_failed};

/// Marker struct for the cron-triggered refresh.
/// Must implement `From<chrono::DateTime<chrono::Utc>>` for apalis-cron compatibility.
#[derive(Default, Debug, Clone)]
pub struct RefreshStatsJob;

impl From<chrono::DateTime<chrono::Utc>> for RefreshStatsJob {
    fn from(_: chrono::DateTime<chrono::Utc>) -> Self {
        Self
    }
}

#[derive(Debug, Error)]
#[error("invalid refresh schedule `{expression}`: {message}")]
pub struct ScheduleError {
    pub expression: String,
    pub message: String,
}

/// Run a full refresh. A run already in progress is not an error.
pub async fn process_refresh_stats_job(
    _job: RefreshStatsJob,
    ctx: Data<JobWorkerContext>,
) -> Result<(), apalis::prelude::Error> {
    match ctx.orchestrator.refresh_all(&RefreshOptions::default()).await {
        Ok(report) => {
            tracing::info!(
                target = "libstats::jobs",
                successes = report.successes.len(),
                failures = report.failures.len(),
                timed_out = report.timed_out,
                "Scheduled refresh completed"
            );
            Ok(())
        }
        Err(RefreshError::AlreadyRunning { scope }) => {
            tracing::info!(
                target = "libstats::jobs",
                scope = %scope,
                "Scheduled refresh skipped; a run is already in progress"
            );
            Ok(())
        }
        Err(err) => {
            tracing::warn!(target = "libstats::jobs", error = %err, "Scheduled refresh failed");
            Err(job_failed(err))
        }
    }
}

/// Parse the configured six-field cron expression.
pub fn refresh_stats_schedule(expression: &str) -> Result<Schedule, ScheduleError> {
    Schedule::from_str(expression).map_err(|err| ScheduleError {
        expression: expression.to_string(),
        message: err.to_string(),
    })
}
