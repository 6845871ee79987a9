//! Background refresh runs submitted over HTTP.
//!
//! Submissions go onto a bounded queue drained by a fixed set of worker
//! tasks. Each run executes on its own task so a panic is contained and
//! recorded. Run state is kept in memory and can be polled by id.

use std::num::NonZeroUsize;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::{Mutex, mpsc};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::refresh::{
    RefreshError, RefreshOptions, RefreshOrchestrator, RefreshReport, RefreshScope,
};

const MAX_FINISHED_RECORDS: usize = 256;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    Completed { report: RefreshReport },
    Failed { error: String },
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, RunStatus::Completed { .. } | RunStatus::Failed { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub scope: RefreshScope,
    #[serde(with = "time::serde::rfc3339")]
    pub submitted_at: OffsetDateTime,
    #[serde(flatten)]
    pub status: RunStatus,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("the background refresh queue is full")]
    QueueFull,
    #[error("the background refresh workers have stopped")]
    Closed,
}

struct QueuedRun {
    id: Uuid,
    scope: RefreshScope,
    options: RefreshOptions,
}

#[derive(Clone)]
pub struct RefreshSupervisor {
    sender: mpsc::Sender<QueuedRun>,
    runs: Arc<DashMap<Uuid, RunRecord>>,
}

impl RefreshSupervisor {
    /// Spawn `workers` tasks draining a queue of `capacity` submissions.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(
        orchestrator: Arc<RefreshOrchestrator>,
        workers: NonZeroUsize,
        capacity: NonZeroUsize,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.get());
        let receiver = Arc::new(Mutex::new(receiver));
        let runs = Arc::new(DashMap::new());

        for worker in 0..workers.get() {
            tokio::spawn(worker_loop(
                worker,
                Arc::clone(&receiver),
                Arc::clone(&orchestrator),
                Arc::clone(&runs),
            ));
        }

        Self { sender, runs }
    }

    /// Queue a run and return its id without waiting for it to start.
    pub fn submit(
        &self,
        scope: RefreshScope,
        options: RefreshOptions,
    ) -> Result<Uuid, SupervisorError> {
        self.evict_finished();

        let id = Uuid::new_v4();
        self.runs.insert(
            id,
            RunRecord {
                id,
                scope,
                submitted_at: OffsetDateTime::now_utc(),
                status: RunStatus::Queued,
            },
        );

        match self.sender.try_send(QueuedRun { id, scope, options }) {
            Ok(()) => {
                info!(target = "libstats::jobs", run_id = %id, scope = %scope, "background refresh queued");
                Ok(id)
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.runs.remove(&id);
                Err(SupervisorError::QueueFull)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.runs.remove(&id);
                Err(SupervisorError::Closed)
            }
        }
    }

    pub fn status(&self, id: Uuid) -> Option<RunRecord> {
        self.runs.get(&id).map(|record| record.value().clone())
    }

    fn evict_finished(&self) {
        let mut finished: Vec<(Uuid, OffsetDateTime)> = self
            .runs
            .iter()
            .filter(|record| record.status.is_finished())
            .map(|record| (record.id, record.submitted_at))
            .collect();
        if finished.len() < MAX_FINISHED_RECORDS {
            return;
        }
        finished.sort_by_key(|(_, submitted_at)| *submitted_at);
        let excess = finished.len() + 1 - MAX_FINISHED_RECORDS;
        for (id, _) in finished.into_iter().take(excess) {
            self.runs.remove(&id);
        }
    }
}

async fn worker_loop(
    worker: usize,
    receiver: Arc<Mutex<mpsc::Receiver<QueuedRun>>>,
    orchestrator: Arc<RefreshOrchestrator>,
    runs: Arc<DashMap<Uuid, RunRecord>>,
) {
    loop {
        let next = receiver.lock().await.recv().await;
        let Some(QueuedRun { id, scope, options }) = next else {
            break;
        };

        set_status(&runs, id, RunStatus::Running);
        info!(target = "libstats::jobs", worker, run_id = %id, scope = %scope, "background refresh started");

        let task = {
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move { orchestrator.refresh(scope, &options).await })
        };

        let status = match task.await {
            Ok(Ok(report)) => {
                info!(
                    target = "libstats::jobs",
                    run_id = %id,
                    scope = %scope,
                    successes = report.successes.len(),
                    failures = report.failures.len(),
                    timed_out = report.timed_out,
                    "background refresh completed"
                );
                RunStatus::Completed { report }
            }
            Ok(Err(err @ RefreshError::AlreadyRunning { .. })) => {
                info!(target = "libstats::jobs", run_id = %id, error = %err, "background refresh skipped");
                RunStatus::Failed {
                    error: err.to_string(),
                }
            }
            Ok(Err(err)) => {
                warn!(target = "libstats::jobs", run_id = %id, error = %err, "background refresh failed");
                RunStatus::Failed {
                    error: err.to_string(),
                }
            }
            Err(err) => {
                error!(target = "libstats::jobs", run_id = %id, error = %err, "background refresh task aborted");
                RunStatus::Failed {
                    error: format!("refresh task aborted: {err}"),
                }
            }
        };
        set_status(&runs, id, status);
    }

    info!(target = "libstats::jobs", worker, "background refresh worker stopped");
}

fn set_status(runs: &DashMap<Uuid, RunRecord>, id: Uuid, status: RunStatus) {
    if let Some(mut record) = runs.get_mut(&id) {
        record.status = status;
    }
}
