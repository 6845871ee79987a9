use std::sync::Arc;

use crate::application::jobs::RefreshSupervisor;
use crate::application::refresh::RefreshOrchestrator;
use crate::application::stats::StatsService;
use crate::infra::db::PostgresStore;

#[derive(Clone)]
pub struct HttpState {
    pub stats: Arc<StatsService>,
    pub orchestrator: Arc<RefreshOrchestrator>,
    pub supervisor: RefreshSupervisor,
    /// Bearer secret guarding the refresh triggers.
    pub refresh_secret: Option<Arc<str>>,
    /// Absent when the cache lives in process memory.
    pub db: Option<PostgresStore>,
}
