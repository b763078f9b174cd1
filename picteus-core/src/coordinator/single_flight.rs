use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use picteus_model::RepositoryID;

/// In-process set of repositories with an exclusive operation in flight.
#[derive(Debug, Default)]
pub struct SingleFlight {
    active: Mutex<HashSet<RepositoryID>>,
}

impl SingleFlight {
    pub fn new() -> Self {
        Self::default()
    }

    /// `None` when another operation already holds the repository.
    pub fn try_acquire(self: &Arc<Self>, repository_id: RepositoryID) -> Option<FlightGuard> {
        if !self.lock().insert(repository_id) {
            return None;
        }
        Some(FlightGuard {
            owner: Arc::clone(self),
            repository_id,
        })
    }

    pub fn is_active(&self, repository_id: RepositoryID) -> bool {
        self.lock().contains(&repository_id)
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<RepositoryID>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Releases the repository on drop, whatever path the operation took.
pub struct FlightGuard {
    owner: Arc<SingleFlight>,
    repository_id: RepositoryID,
}

impl fmt::Debug for FlightGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlightGuard")
            .field("repository_id", &self.repository_id)
            .finish()
    }
}

impl Drop for FlightGuard {
    fn drop(&mut self) {
        self.owner.lock().remove(&self.repository_id);
    }
}
