//! Suppression of watcher echoes for filesystem changes the engine makes
//! itself.
//!
//! Two kinds of registrations exist. An ignore entry covers a file being
//! written by `store_image`: while its guard lives, add and change
//! notifications for the path are swallowed. A pending rename covers a file
//! being moved by `rename_image`: removal of the source is swallowed and the
//! appearance of the target relocates the existing image instead of declaring
//! a new one.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use picteus_model::{ImageID, RepositoryID};

type PathKey = (RepositoryID, PathBuf);

#[derive(Debug)]
struct IgnoreEntry {
    token: u64,
    consumed: bool,
}

/// A rename initiated by the engine and awaiting watcher confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRename {
    pub image_id: ImageID,
    pub from: PathBuf,
    pub to: PathBuf,
    completed: bool,
}

#[derive(Debug, Default)]
struct EchoState {
    next_token: u64,
    ignored: HashMap<PathKey, IgnoreEntry>,
    // Keyed by target path.
    renames: HashMap<PathKey, PendingRename>,
}

#[derive(Debug, Default)]
pub struct EchoSuppressor {
    state: Mutex<EchoState>,
}

impl EchoSuppressor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Swallow add/change notifications for `path` until the guard drops.
    pub fn ignore(self: &Arc<Self>, repository_id: RepositoryID, path: &Path) -> IgnoreGuard {
        let key = (repository_id, path.to_path_buf());
        let mut state = self.lock();
        state.next_token += 1;
        let token = state.next_token;
        state.ignored.insert(
            key.clone(),
            IgnoreEntry {
                token,
                consumed: false,
            },
        );
        IgnoreGuard {
            suppressor: Arc::clone(self),
            key,
            token,
        }
    }

    /// Whether an add/change notification for `path` must be dropped. The
    /// first suppressed notification marks the entry consumed.
    pub fn suppress(&self, repository_id: RepositoryID, path: &Path) -> bool {
        let mut state = self.lock();
        match state.ignored.get_mut(&(repository_id, path.to_path_buf())) {
            Some(entry) => {
                entry.consumed = true;
                true
            }
            None => false,
        }
    }

    /// Whether the ignore entry for `path` already swallowed a notification.
    pub fn is_consumed(&self, repository_id: RepositoryID, path: &Path) -> Option<bool> {
        self.lock()
            .ignored
            .get(&(repository_id, path.to_path_buf()))
            .map(|entry| entry.consumed)
    }

    pub fn expect_rename(
        self: &Arc<Self>,
        repository_id: RepositoryID,
        image_id: ImageID,
        from: &Path,
        to: &Path,
    ) -> RenameGuard {
        let key = (repository_id, to.to_path_buf());
        self.lock().renames.insert(
            key.clone(),
            PendingRename {
                image_id,
                from: from.to_path_buf(),
                to: to.to_path_buf(),
                completed: false,
            },
        );
        RenameGuard {
            suppressor: Arc::clone(self),
            key,
        }
    }

    /// Claim the pending rename whose target is `path`. Each rename is
    /// handed out once.
    pub fn claim_rename_target(
        &self,
        repository_id: RepositoryID,
        path: &Path,
    ) -> Option<PendingRename> {
        let mut state = self.lock();
        let rename = state.renames.get_mut(&(repository_id, path.to_path_buf()))?;
        if rename.completed {
            return None;
        }
        rename.completed = true;
        Some(rename.clone())
    }

    pub fn is_rename_source(&self, repository_id: RepositoryID, path: &Path) -> bool {
        self.lock()
            .renames
            .iter()
            .any(|((owner, _), rename)| *owner == repository_id && rename.from == path)
    }

    /// Drop every registration of a repository.
    pub fn forget_repository(&self, repository_id: RepositoryID) {
        let mut state = self.lock();
        state.ignored.retain(|(owner, _), _| *owner != repository_id);
        state.renames.retain(|(owner, _), _| *owner != repository_id);
    }

    pub fn is_empty(&self) -> bool {
        let state = self.lock();
        state.ignored.is_empty() && state.renames.is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, EchoState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Keeps an ignore entry registered; removes it on drop, consumed or not.
pub struct IgnoreGuard {
    suppressor: Arc<EchoSuppressor>,
    key: PathKey,
    token: u64,
}

impl fmt::Debug for IgnoreGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IgnoreGuard")
            .field("path", &self.key.1)
            .finish()
    }
}

impl Drop for IgnoreGuard {
    fn drop(&mut self) {
        let mut state = self.suppressor.lock();
        // A later registration for the same path owns the slot now.
        if state
            .ignored
            .get(&self.key)
            .is_some_and(|entry| entry.token == self.token)
        {
            state.ignored.remove(&self.key);
        }
    }
}

/// Keeps a pending rename registered until dropped.
pub struct RenameGuard {
    suppressor: Arc<EchoSuppressor>,
    key: PathKey,
}

impl fmt::Debug for RenameGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenameGuard")
            .field("to", &self.key.1)
            .finish()
    }
}

impl Drop for RenameGuard {
    fn drop(&mut self) {
        self.suppressor.lock().renames.remove(&self.key);
    }
}
