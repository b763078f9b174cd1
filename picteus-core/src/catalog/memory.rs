use std::collections::{HashMap, HashSet};
use std::path::Path;

use async_trait::async_trait;
use picteus_model::{Image, ImageID, Repository, RepositoryID};
use tokio::sync::RwLock;

use super::{CatalogStore, ExtensionRegistry, VectorIndex};
use crate::error::{PicteusError, Result};

#[derive(Debug, Default)]
struct CatalogState {
    repositories: HashMap<RepositoryID, Repository>,
    images: HashMap<ImageID, Image>,
}

impl CatalogState {
    fn path_taken(&self, image: &Image) -> bool {
        self.images.values().any(|other| {
            other.id != image.id
                && other.repository_id == image.repository_id
                && other.path == image.path
        })
    }
}

/// Process-local catalog keeping repositories and images in hash maps.
#[derive(Debug, Default)]
pub struct InMemoryCatalog {
    state: RwLock<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn image_count(&self) -> usize {
        self.state.read().await.images.len()
    }
}

#[async_trait]
impl CatalogStore for InMemoryCatalog {
    async fn create_repository(&self, repository: Repository) -> Result<()> {
        let mut state = self.state.write().await;
        if state.repositories.contains_key(&repository.id) {
            return Err(PicteusError::IllegalState(format!(
                "repository {} already exists",
                repository.id
            )));
        }
        state.repositories.insert(repository.id, repository);
        Ok(())
    }

    async fn get_repository(&self, id: RepositoryID) -> Result<Option<Repository>> {
        Ok(self.state.read().await.repositories.get(&id).cloned())
    }

    async fn list_repositories(&self) -> Result<Vec<Repository>> {
        let state = self.state.read().await;
        let mut repositories: Vec<_> = state.repositories.values().cloned().collect();
        repositories.sort_by_key(|repository| repository.created_at);
        Ok(repositories)
    }

    async fn update_repository(&self, repository: Repository) -> Result<()> {
        let mut state = self.state.write().await;
        match state.repositories.get_mut(&repository.id) {
            Some(slot) => {
                *slot = repository;
                Ok(())
            }
            None => Err(PicteusError::NotFound(format!(
                "repository {}",
                repository.id
            ))),
        }
    }

    async fn delete_repository(&self, id: RepositoryID) -> Result<()> {
        let mut state = self.state.write().await;
        if state.repositories.remove(&id).is_none() {
            return Err(PicteusError::NotFound(format!("repository {id}")));
        }
        state.images.retain(|_, image| image.repository_id != id);
        Ok(())
    }

    async fn create_image(&self, image: Image) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.repositories.contains_key(&image.repository_id) {
            return Err(PicteusError::NotFound(format!(
                "repository {}",
                image.repository_id
            )));
        }
        if state.images.contains_key(&image.id) || state.path_taken(&image) {
            return Err(PicteusError::IllegalState(format!(
                "an image is already declared at {}",
                image.path.display()
            )));
        }
        state.images.insert(image.id, image);
        Ok(())
    }

    async fn get_image(&self, id: ImageID) -> Result<Option<Image>> {
        Ok(self.state.read().await.images.get(&id).cloned())
    }

    async fn find_image_by_path(
        &self,
        repository_id: RepositoryID,
        path: &Path,
    ) -> Result<Option<Image>> {
        let state = self.state.read().await;
        Ok(state
            .images
            .values()
            .find(|image| image.repository_id == repository_id && image.path == path)
            .cloned())
    }

    async fn list_images(&self, repository_id: RepositoryID) -> Result<Vec<Image>> {
        let state = self.state.read().await;
        let mut images: Vec<_> = state
            .images
            .values()
            .filter(|image| image.repository_id == repository_id)
            .cloned()
            .collect();
        images.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(images)
    }

    async fn update_image(&self, image: Image) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.images.contains_key(&image.id) {
            return Err(PicteusError::NotFound(format!("image {}", image.id)));
        }
        if state.path_taken(&image) {
            return Err(PicteusError::IllegalState(format!(
                "an image is already declared at {}",
                image.path.display()
            )));
        }
        state.images.insert(image.id, image);
        Ok(())
    }

    async fn delete_images(&self, ids: &[ImageID]) -> Result<()> {
        let mut state = self.state.write().await;
        for id in ids {
            state.images.remove(id);
        }
        Ok(())
    }
}

/// Embedding store keyed by image id.
#[derive(Debug, Default)]
pub struct InMemoryVectorIndex {
    embeddings: RwLock<HashMap<ImageID, Vec<f32>>>,
}

impl InMemoryVectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_embedding(&self, id: ImageID, embedding: Vec<f32>) {
        self.embeddings.write().await.insert(id, embedding);
    }

    pub async fn has_embedding(&self, id: ImageID) -> bool {
        self.embeddings.read().await.contains_key(&id)
    }

    pub async fn len(&self) -> usize {
        self.embeddings.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.embeddings.read().await.is_empty()
    }
}

#[async_trait]
impl VectorIndex for InMemoryVectorIndex {
    async fn delete_embeddings(&self, ids: &[ImageID]) -> Result<()> {
        let mut embeddings = self.embeddings.write().await;
        for id in ids {
            embeddings.remove(id);
        }
        Ok(())
    }
}

/// Fixed set of installed extension ids.
#[derive(Debug, Default)]
pub struct InMemoryExtensionRegistry {
    extensions: RwLock<HashSet<String>>,
}

impl InMemoryExtensionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extensions<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            extensions: RwLock::new(ids.into_iter().map(Into::into).collect()),
        }
    }

    pub async fn register(&self, extension_id: impl Into<String>) {
        self.extensions.write().await.insert(extension_id.into());
    }
}

#[async_trait]
impl ExtensionRegistry for InMemoryExtensionRegistry {
    async fn exists(&self, extension_id: &str) -> Result<bool> {
        Ok(self.extensions.read().await.contains(extension_id))
    }
}
