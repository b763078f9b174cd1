use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use picteus_model::{
    CatalogEvent, Image, ImageID, Repository, RepositoryID, RepositoryStatus,
};
use tracing::{debug, info};

use crate::catalog::{CatalogStore, ExtensionRegistry, VectorIndex};
use crate::config::SynchronizerConfig;
use crate::error::{PicteusError, Result};
use crate::events::EventBus;
use crate::metadata::MetadataExtractor;
use crate::watch::echo::EchoSuppressor;
use crate::worker::{WorkerPool, WorkerServices};

/// Shared handles used by the coordinator and the watcher loops.
///
/// Catalog mutations that must stay consistent with the event stream
/// (removals, relocations, status changes) live here so both sides perform
/// them identically.
#[derive(Clone)]
pub struct SyncContext {
    pub catalog: Arc<dyn CatalogStore>,
    pub vectors: Arc<dyn VectorIndex>,
    pub extensions: Arc<dyn ExtensionRegistry>,
    pub pool: Arc<WorkerPool>,
    pub bus: EventBus,
    pub echo: Arc<EchoSuppressor>,
    pub config: Arc<SynchronizerConfig>,
}

impl fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncContext")
            .field("catalog_ptr", &Arc::as_ptr(&self.catalog))
            .field("pool", &self.pool)
            .field("bus", &self.bus)
            .finish()
    }
}

impl SyncContext {
    /// Wire the stores together and start the worker pool.
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        vectors: Arc<dyn VectorIndex>,
        extensions: Arc<dyn ExtensionRegistry>,
        extractor: Arc<dyn MetadataExtractor>,
        config: SynchronizerConfig,
    ) -> Self {
        let pool = WorkerPool::new(
            &config.worker_pool,
            WorkerServices {
                catalog: Arc::clone(&catalog),
                extractor,
            },
        );
        Self {
            catalog,
            vectors,
            extensions,
            pool: Arc::new(pool),
            bus: EventBus::new(),
            echo: Arc::new(EchoSuppressor::new()),
            config: Arc::new(config),
        }
    }

    pub fn emit(&self, event: CatalogEvent) {
        self.bus.emit(event, None);
    }

    pub async fn repository(&self, id: RepositoryID) -> Result<Repository> {
        self.catalog
            .get_repository(id)
            .await?
            .ok_or_else(|| PicteusError::NotFound(format!("repository {id}")))
    }

    pub async fn image(&self, id: ImageID) -> Result<Image> {
        self.catalog
            .get_image(id)
            .await?
            .ok_or_else(|| PicteusError::NotFound(format!("image {id}")))
    }

    /// Persist a status change; a no-op when the status is unchanged.
    pub async fn set_status(
        &self,
        id: RepositoryID,
        status: RepositoryStatus,
    ) -> Result<Repository> {
        let mut repository = self.repository(id).await?;
        if repository.status != status {
            debug!(repository_id = %id, from = %repository.status, to = %status, "repository status change");
            repository.set_status(status);
            self.catalog.update_repository(repository.clone()).await?;
        }
        Ok(repository)
    }

    /// Delete images with their embeddings, embeddings first, and announce
    /// each removal.
    pub async fn remove_images(
        &self,
        repository_id: RepositoryID,
        ids: &[ImageID],
    ) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        self.vectors.delete_embeddings(ids).await?;
        self.catalog.delete_images(ids).await?;
        for &image_id in ids {
            self.emit(CatalogEvent::ImageDeleted {
                image_id,
                repository_id,
            });
        }
        info!(repository_id = %repository_id, count = ids.len(), "removed images");
        Ok(ids.len())
    }

    /// Point an existing image at its new location, keeping its identity.
    pub async fn relocate_image(&self, image_id: ImageID, path: PathBuf) -> Result<Image> {
        let mut image = self.image(image_id).await?;
        let previous_path = image.path.clone();
        image.relocate(path);
        self.catalog.update_image(image.clone()).await?;
        self.emit(CatalogEvent::ImageRenamed {
            image_id,
            repository_id: image.repository_id,
            previous_path,
        });
        Ok(image)
    }
}
