mod context;
mod refresh_stats;
mod supervisor;

pub use context::{JobWorkerContext, job_failed};
pub use refresh_stats::{
    RefreshStatsJob, ScheduleError, process_refresh_stats_job, refresh_stats_schedule,
};
pub use supervisor::{RefreshSupervisor, RunRecord, RunStatus, SupervisorError};
