//! Ports onto the stores the engine does not own.
//!
//! Implementations live in adapters (a relational catalog, a vector index,
//! the extension host) and must not leak their types into the engine. The
//! in-memory adapters in [`memory`] back tests and embedded setups.

use std::path::Path;

use async_trait::async_trait;
use picteus_model::{Image, ImageID, Repository, RepositoryID};

use crate::error::Result;

pub mod memory;

pub use memory::{InMemoryCatalog, InMemoryExtensionRegistry, InMemoryVectorIndex};

/// Storage accessor for repositories and their images. Every catalog
/// mutation performed by the engine goes through this trait.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Persist a new repository.
    async fn create_repository(&self, repository: Repository) -> Result<()>;

    async fn get_repository(&self, id: RepositoryID) -> Result<Option<Repository>>;

    async fn list_repositories(&self) -> Result<Vec<Repository>>;

    async fn find_repository_by_technical_id(
        &self,
        technical_id: &str,
    ) -> Result<Option<Repository>> {
        Ok(self
            .list_repositories()
            .await?
            .into_iter()
            .find(|repository| repository.technical_id.as_deref() == Some(technical_id)))
    }

    /// Replace the stored record; fails when the repository is unknown.
    async fn update_repository(&self, repository: Repository) -> Result<()>;

    /// Delete a repository and every image it owns.
    async fn delete_repository(&self, id: RepositoryID) -> Result<()>;

    /// Persist a new image. A second image at the same path within one
    /// repository is rejected.
    async fn create_image(&self, image: Image) -> Result<()>;

    async fn get_image(&self, id: ImageID) -> Result<Option<Image>>;

    async fn find_image_by_path(
        &self,
        repository_id: RepositoryID,
        path: &Path,
    ) -> Result<Option<Image>>;

    async fn list_images(&self, repository_id: RepositoryID) -> Result<Vec<Image>>;

    /// Replace the stored record; fails when the image is unknown or the new
    /// path collides with another image of the repository.
    async fn update_image(&self, image: Image) -> Result<()>;

    async fn delete_images(&self, ids: &[ImageID]) -> Result<()>;
}

/// Accessor for the embeddings attached to images.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    async fn delete_embeddings(&self, ids: &[ImageID]) -> Result<()>;
}

/// Lookup of installed extensions, used to validate application metadata.
#[async_trait]
pub trait ExtensionRegistry: Send + Sync {
    async fn exists(&self, extension_id: &str) -> Result<bool>;
}
