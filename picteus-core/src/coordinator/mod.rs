//! Repository lifecycle and the entry points of the synchronization engine.
//!
//! The coordinator owns the single-flight set, the watch registry and the
//! echo-suppression registry. Validation happens before any side effect;
//! every catalog mutation goes through the [`CatalogStore`] port held by the
//! shared [`SyncContext`].

use std::path::{Path, PathBuf};
use std::sync::Arc;

use picteus_model::{
    CatalogEvent, Image, ImageID, Repository, RepositoryID, RepositoryStatus,
};
use tracing::{info, instrument, warn};
use url::Url;

use crate::catalog::{CatalogStore, ExtensionRegistry, VectorIndex};
use crate::config::SynchronizerConfig;
use crate::context::SyncContext;
use crate::error::{PicteusError, Result};
use crate::events::EventBus;
use crate::metadata::MetadataExtractor;
use crate::watch::{NoopWatchObserver, RepositoryWatchService, WatchObserver};

mod images;
pub mod single_flight;
mod sync;
pub mod validation;

pub use images::StoreImageRequest;
pub use single_flight::{FlightGuard, SingleFlight};
pub use sync::{FileFailure, SynchronizationSummary};

/// Parameters of a repository declaration.
#[derive(Debug, Clone, Default)]
pub struct CreateRepository {
    /// `file://` URL or absolute path of an existing directory.
    pub location: String,
    pub name: String,
    pub technical_id: Option<String>,
    pub comment: Option<String>,
    /// Start watching once the initial synchronization succeeded.
    pub watch: bool,
}

pub struct RepositoryCoordinator {
    ctx: SyncContext,
    watches: RepositoryWatchService,
    in_flight: Arc<SingleFlight>,
}

impl std::fmt::Debug for RepositoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RepositoryCoordinator")
            .field("ctx", &self.ctx)
            .field("watches", &self.watches)
            .finish()
    }
}

impl RepositoryCoordinator {
    pub fn new(
        catalog: Arc<dyn CatalogStore>,
        vectors: Arc<dyn VectorIndex>,
        extensions: Arc<dyn ExtensionRegistry>,
        extractor: Arc<dyn MetadataExtractor>,
        config: SynchronizerConfig,
    ) -> Self {
        let ctx = SyncContext::new(catalog, vectors, extensions, extractor, config);
        Self::from_context(ctx, Arc::new(NoopWatchObserver))
    }

    /// Like [`RepositoryCoordinator::new`], with the configuration read by
    /// [`SynchronizerConfig::load_from_env`].
    pub fn from_env(
        catalog: Arc<dyn CatalogStore>,
        vectors: Arc<dyn VectorIndex>,
        extensions: Arc<dyn ExtensionRegistry>,
        extractor: Arc<dyn MetadataExtractor>,
    ) -> anyhow::Result<Self> {
        let (config, _source) = SynchronizerConfig::load_from_env()?;
        Ok(Self::new(catalog, vectors, extensions, extractor, config))
    }

    pub fn from_context(ctx: SyncContext, observer: Arc<dyn WatchObserver>) -> Self {
        let watches = RepositoryWatchService::new(ctx.config.watch.clone(), observer);
        Self {
            ctx,
            watches,
            in_flight: Arc::new(SingleFlight::new()),
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.ctx.bus
    }

    pub fn context(&self) -> &SyncContext {
        &self.ctx
    }

    /// Declare a repository, synchronize it, and watch it when asked to.
    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create(&self, request: CreateRepository) -> Result<Repository> {
        let config = &self.ctx.config;
        let root = validation::repository_root(&request.location).await?;
        let name = validation::name(&request.name, config.max_name_length)?;
        let technical_id = request
            .technical_id
            .as_deref()
            .map(validation::technical_id)
            .transpose()?;
        let comment = request
            .comment
            .as_deref()
            .map(|comment| validation::comment(comment, config.max_comment_length))
            .transpose()?;
        let url = Url::from_directory_path(&root).map_err(|_| {
            PicteusError::invalid_parameter("url", &request.location, "not a local directory")
        })?;

        for other in self.ctx.catalog.list_repositories().await? {
            if other.name == name {
                return Err(PicteusError::invalid_parameter(
                    "name",
                    &name,
                    "a repository with this name already exists",
                ));
            }
            if other.url == url {
                return Err(PicteusError::invalid_parameter(
                    "url",
                    &url,
                    "a repository is already declared at this location",
                ));
            }
            if let Some(other_root) = other.root_path()
                && (root.starts_with(&other_root) || other_root.starts_with(&root))
            {
                return Err(PicteusError::invalid_parameter(
                    "url",
                    &url,
                    format!("overlaps the repository '{}'", other.name),
                ));
            }
            if technical_id.is_some() && other.technical_id == technical_id {
                return Err(PicteusError::invalid_parameter(
                    "technicalId",
                    technical_id.as_deref().unwrap_or_default(),
                    "a repository with this technical id already exists",
                ));
            }
        }

        let mut repository = Repository::new(name, url);
        repository.technical_id = technical_id;
        repository.comment = comment;
        let repository_id = repository.id;
        self.ctx.catalog.create_repository(repository).await?;
        self.ctx.emit(CatalogEvent::RepositoryCreated { repository_id });
        info!(repository_id = %repository_id, root = %root.display(), "repository created");

        // Freshly created repositories are INDEXING: the first run resumes.
        self.run_synchronization(repository_id, true, request.watch)
            .await?;
        self.ctx.repository(repository_id).await
    }

    /// Return the repository carrying `technical_id`, creating it otherwise.
    pub async fn ensure(
        &self,
        technical_id: &str,
        location: &str,
        name: &str,
        watch: bool,
    ) -> Result<Repository> {
        let technical_id = validation::technical_id(technical_id)?;
        if let Some(existing) = self
            .ctx
            .catalog
            .find_repository_by_technical_id(&technical_id)
            .await?
        {
            return Ok(existing);
        }
        self.create(CreateRepository {
            location: location.to_string(),
            name: name.to_string(),
            technical_id: Some(technical_id),
            comment: None,
            watch,
        })
        .await
    }

    pub async fn list(&self) -> Result<Vec<Repository>> {
        self.ctx.catalog.list_repositories().await
    }

    pub async fn get(&self, id: RepositoryID) -> Result<Repository> {
        self.ctx.repository(id).await
    }

    pub async fn get_image(&self, id: ImageID) -> Result<Image> {
        self.ctx.image(id).await
    }

    pub async fn is_watching(&self, id: RepositoryID) -> bool {
        self.watches.is_watching(id).await
    }

    /// Start or stop the watcher of a READY repository. Asking for the
    /// current state is a no-op unless `force_check` is set, in which case
    /// the watch is re-established (start) or torn down (stop) regardless.
    pub async fn watch(&self, id: RepositoryID, is_start: bool, force_check: bool) -> Result<()> {
        let repository = self.ctx.repository(id).await?;
        if repository.status != RepositoryStatus::Ready || self.in_flight.is_active(id) {
            return Err(PicteusError::IllegalState(format!(
                "cannot change the watch of repository {id} while it is {}",
                repository.status
            )));
        }

        let watching = self.watches.is_watching(id).await;
        if is_start {
            if watching && !force_check {
                return Ok(());
            }
            if watching {
                self.watches.unregister(id).await;
            }
            self.start_watch(&repository).await
        } else {
            if !self.watches.unregister(id).await && force_check {
                info!(repository_id = %id, "forced stop of an inactive watch");
            }
            Ok(())
        }
    }

    /// Boot/shutdown transition of one repository.
    #[instrument(skip(self))]
    pub async fn start_or_stop(&self, id: RepositoryID, is_start: bool) -> Result<()> {
        let repository = self.ctx.repository(id).await?;
        if !is_start {
            self.watches.unregister(id).await;
            return Ok(());
        }

        if !root_exists(&repository).await {
            let status = repository.status.to_unavailable();
            warn!(repository_id = %id, url = %repository.url, %status, "repository root is missing");
            self.ctx.set_status(id, status).await?;
            return Ok(());
        }

        match repository.status {
            RepositoryStatus::Unavailable => {
                let repository = self.ctx.set_status(id, RepositoryStatus::Ready).await?;
                self.start_watch(&repository).await
            }
            RepositoryStatus::Indexing | RepositoryStatus::UnavailableIndexing => {
                info!(repository_id = %id, "resuming interrupted synchronization");
                self.run_synchronization(id, true, true).await.map(|_| ())
            }
            RepositoryStatus::Ready => self.start_watch(&repository).await,
        }
    }

    /// Apply `start_or_stop` to every repository, logging and skipping
    /// individual failures.
    pub async fn start_or_stop_all(&self, is_start: bool) -> Result<()> {
        for repository in self.ctx.catalog.list_repositories().await? {
            if let Err(err) = self.start_or_stop(repository.id, is_start).await {
                warn!(repository_id = %repository.id, error = %err, is_start, "failed to transition repository");
            }
        }
        Ok(())
    }

    /// Delete a repository with all its images and embeddings.
    #[instrument(skip(self))]
    pub async fn delete(&self, id: RepositoryID) -> Result<()> {
        let Some(_flight) = self.in_flight.try_acquire(id) else {
            return Err(PicteusError::IllegalState(format!(
                "repository {id} is being synchronized"
            )));
        };
        self.ctx.repository(id).await?;
        self.watches.unregister(id).await;

        let image_ids: Vec<ImageID> = self
            .ctx
            .catalog
            .list_images(id)
            .await?
            .into_iter()
            .map(|image| image.id)
            .collect();
        self.ctx.vectors.delete_embeddings(&image_ids).await?;
        self.ctx.catalog.delete_repository(id).await?;
        self.ctx.echo.forget_repository(id);

        for &image_id in &image_ids {
            self.ctx.emit(CatalogEvent::ImageDeleted {
                image_id,
                repository_id: id,
            });
        }
        self.ctx.emit(CatalogEvent::RepositoryDeleted { repository_id: id });
        info!(repository_id = %id, images = image_ids.len(), "repository deleted");
        Ok(())
    }

    /// Status of the repository whose root contains `path`.
    pub async fn status_for_path(&self, path: &Path) -> Result<Option<RepositoryStatus>> {
        Ok(self
            .ctx
            .catalog
            .list_repositories()
            .await?
            .into_iter()
            .find(|repository| repository.contains(path))
            .map(|repository| repository.status))
    }

    /// Stop every watcher and drain the worker pool.
    pub async fn shutdown(&self) {
        self.watches.shutdown().await;
        self.ctx.pool.shutdown().await;
        info!("synchronization engine stopped");
    }

    async fn start_watch(&self, repository: &Repository) -> Result<()> {
        let root = repository_root(repository)?;
        self.watches
            .register(repository.id, root, self.ctx.clone())
            .await
            .map(|_| ())
    }
}

fn repository_root(repository: &Repository) -> Result<PathBuf> {
    repository.root_path().ok_or_else(|| {
        PicteusError::Internal(format!(
            "repository {} has a non-local url {}",
            repository.id, repository.url
        ))
    })
}

async fn root_exists(repository: &Repository) -> bool {
    match repository.root_path() {
        Some(root) => tokio::fs::metadata(root)
            .await
            .map(|metadata| metadata.is_dir())
            .unwrap_or(false),
        None => false,
    }
}
