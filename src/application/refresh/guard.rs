use std::sync::Arc;

use dashmap::DashMap;

use super::{RefreshError, RefreshScope};

/// Tracks which refresh scopes currently have a run in progress.
#[derive(Clone, Default)]
pub struct ActiveRuns {
    scopes: Arc<DashMap<RefreshScope, ()>>,
}

impl ActiveRuns {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self, scope: RefreshScope) -> Result<RunGuard, RefreshError> {
        use dashmap::mapref::entry::Entry;

        match self.scopes.entry(scope) {
            Entry::Vacant(vacant) => {
                vacant.insert(());
                Ok(RunGuard {
                    scope,
                    scopes: Arc::clone(&self.scopes),
                })
            }
            Entry::Occupied(_) => Err(RefreshError::AlreadyRunning { scope }),
        }
    }

    pub fn is_running(&self, scope: RefreshScope) -> bool {
        self.scopes.contains_key(&scope)
    }
}

pub struct RunGuard {
    scope: RefreshScope,
    scopes: Arc<DashMap<RefreshScope, ()>>,
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.scopes.remove(&self.scope);
    }
}
