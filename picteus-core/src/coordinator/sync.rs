use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use futures::{StreamExt, stream};
use picteus_model::{CatalogEvent, ImageID, Repository, RepositoryID, RepositoryStatus, SyncAction};
use tracing::{error, info, instrument, warn};

use super::{RepositoryCoordinator, root_exists};
use crate::error::{PicteusError, Result};

/// A file the batch could not reconcile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub error: String,
}

/// Outcome of one synchronization run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SynchronizationSummary {
    pub created: Vec<ImageID>,
    pub updated: Vec<ImageID>,
    pub unchanged: Vec<ImageID>,
    pub deleted: Vec<ImageID>,
    pub failures: Vec<FileFailure>,
}

impl RepositoryCoordinator {
    /// Reconcile the catalog of a repository with its directory tree.
    pub async fn synchronize(&self, id: RepositoryID) -> Result<SynchronizationSummary> {
        self.run_synchronization(id, false, false).await
    }

    /// `resume` skips the persisted INDEXING check, never the in-process one.
    #[instrument(skip(self))]
    pub(super) async fn run_synchronization(
        &self,
        id: RepositoryID,
        resume: bool,
        watch_requested: bool,
    ) -> Result<SynchronizationSummary> {
        let Some(_flight) = self.in_flight.try_acquire(id) else {
            return Err(PicteusError::IllegalState(format!(
                "repository {id} is already being synchronized"
            )));
        };

        let repository = self.ctx.repository(id).await?;
        if !resume && repository.status.is_indexing() {
            return Err(PicteusError::IllegalState(format!(
                "repository {id} has a pending synchronization ({})",
                repository.status
            )));
        }

        let was_watching = self.watches.unregister(id).await;
        if !root_exists(&repository).await {
            self.ctx
                .set_status(id, RepositoryStatus::UnavailableIndexing)
                .await?;
            return Err(PicteusError::NotFound(format!(
                "root directory of repository {id} ({})",
                repository.url
            )));
        }

        let repository = match self.ctx.set_status(id, RepositoryStatus::Indexing).await {
            Ok(repository) => repository,
            Err(err) => {
                if was_watching {
                    self.restore_watch(&repository).await;
                }
                return Err(err);
            }
        };
        self.ctx
            .emit(CatalogEvent::RepositorySynchronizeStarted { repository_id: id });
        info!(repository_id = %id, url = %repository.url, "synchronization started");

        let outcome = self.synchronize_files(&repository).await;
        let finalized = self
            .finalize(&repository, was_watching || watch_requested, outcome.is_ok())
            .await;

        match (outcome, finalized) {
            (Ok(summary), Ok(())) => {
                info!(
                    repository_id = %id,
                    created = summary.created.len(),
                    updated = summary.updated.len(),
                    unchanged = summary.unchanged.len(),
                    deleted = summary.deleted.len(),
                    failed = summary.failures.len(),
                    "synchronization finished"
                );
                Ok(summary)
            }
            (Err(err), _) | (Ok(_), Err(err)) => {
                error!(repository_id = %id, error = %err, "synchronization failed");
                Err(err)
            }
        }
    }

    async fn synchronize_files(&self, repository: &Repository) -> Result<SynchronizationSummary> {
        let id = repository.id;
        let files = self
            .ctx
            .pool
            .list_files(repository.location_type, repository.url.clone())
            .await?;

        let pool = Arc::clone(&self.ctx.pool);
        let mut results = stream::iter(files.iter().cloned())
            .map(|path| {
                let pool = Arc::clone(&pool);
                async move {
                    let outcome = pool.synchronize_image(id, path.clone()).await;
                    (path, outcome)
                }
            })
            .buffer_unordered(pool.size());

        let mut summary = SynchronizationSummary::default();
        while let Some((path, outcome)) = results.next().await {
            match outcome {
                Ok((image, SyncAction::Created)) => {
                    summary.created.push(image.id);
                    self.ctx.emit(CatalogEvent::ImageCreated {
                        image_id: image.id,
                        repository_id: id,
                    });
                }
                Ok((image, SyncAction::Updated)) => {
                    summary.updated.push(image.id);
                    self.ctx.emit(CatalogEvent::ImageUpdated {
                        image_id: image.id,
                        repository_id: id,
                    });
                }
                Ok((image, SyncAction::None)) => summary.unchanged.push(image.id),
                Err(err) => {
                    warn!(repository_id = %id, path = %path.display(), error = %err, "could not synchronize file");
                    summary.failures.push(FileFailure {
                        path,
                        error: err.to_string(),
                    });
                }
            }
        }

        let listed: HashSet<&PathBuf> = files.iter().collect();
        let orphans: Vec<ImageID> = self
            .ctx
            .catalog
            .list_images(id)
            .await?
            .into_iter()
            .filter(|image| !listed.contains(&image.path))
            .map(|image| image.id)
            .collect();
        self.ctx.remove_images(id, &orphans).await?;
        summary.deleted = orphans;
        Ok(summary)
    }

    /// Runs once per started synchronization, whatever the batch outcome.
    async fn finalize(&self, repository: &Repository, watch: bool, succeeded: bool) -> Result<()> {
        let id = repository.id;
        let status = if root_exists(repository).await {
            RepositoryStatus::Ready
        } else {
            RepositoryStatus::UnavailableIndexing
        };
        let persisted = self.ctx.set_status(id, status).await;

        if watch && status == RepositoryStatus::Ready {
            self.restore_watch(repository).await;
        }

        self.ctx.emit(CatalogEvent::RepositorySynchronizeStopped {
            repository_id: id,
            succeeded,
        });
        persisted.map(|_| ())
    }

    async fn restore_watch(&self, repository: &Repository) {
        if let Err(err) = self.start_watch(repository).await {
            warn!(repository_id = %repository.id, error = %err, "could not restart watching");
        }
    }
}
