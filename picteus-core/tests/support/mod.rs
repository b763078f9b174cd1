//! Shared harness for the synchronization integration tests.
#![allow(dead_code)]

use std::fs;
use std::future::Future;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use picteus_core::catalog::{
    CatalogStore, InMemoryCatalog, InMemoryExtensionRegistry, InMemoryVectorIndex,
};
use picteus_core::config::SynchronizerConfig;
use picteus_core::metadata::{FsMetadataExtractor, ImageDetails, MetadataExtractor};
use picteus_core::{CreateRepository, PicteusError, RepositoryCoordinator};
use picteus_model::{CatalogEvent, Image, ImageID, Repository, RepositoryID, Topic};
use tempfile::TempDir;
use tokio::sync::{Notify, Semaphore};

pub const KNOWN_EXTENSION: &str = "tagger";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn image_bytes(width: u32, height: u32, format: image::ImageFormat) -> Vec<u8> {
    let mut bytes = Cursor::new(Vec::new());
    image::RgbImage::new(width, height)
        .write_to(&mut bytes, format)
        .expect("encode test image");
    bytes.into_inner()
}

pub fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    image_bytes(width, height, image::ImageFormat::Png)
}

/// Every event seen on the bus, in emission order.
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<CatalogEvent>>>,
}

impl EventLog {
    pub fn count(&self, topic: Topic) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.topic() == topic)
            .count()
    }

    pub fn all(&self) -> Vec<CatalogEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

/// Extractor blocking every call until released, to hold a batch in flight.
pub struct GatedExtractor {
    gate: Semaphore,
    calls: AtomicUsize,
    pub entered: Notify,
}

impl GatedExtractor {
    pub fn new() -> Self {
        Self {
            gate: Semaphore::new(0),
            calls: AtomicUsize::new(0),
            entered: Notify::new(),
        }
    }

    pub fn release(&self) {
        self.gate.add_permits(1024);
    }

    /// Close the gate again for calls made from now on.
    pub fn hold(&self) {
        self.gate.forget_permits(usize::MAX);
    }

    /// Calls that reached the gate so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetadataExtractor for GatedExtractor {
    async fn compute_image_details(
        &self,
        path: &Path,
        source_url: Option<&str>,
    ) -> picteus_core::Result<ImageDetails> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.entered.notify_one();
        let _permit = self.gate.acquire().await.expect("gate closed");
        FsMetadataExtractor
            .compute_image_details(path, source_url)
            .await
    }
}

pub struct Harness {
    _dir: TempDir,
    /// Canonical repository root, below the temporary directory so it can be
    /// removed and recreated.
    pub root: PathBuf,
    pub catalog: Arc<InMemoryCatalog>,
    pub vectors: Arc<InMemoryVectorIndex>,
    pub coordinator: Arc<RepositoryCoordinator>,
    pub events: EventLog,
}

pub fn test_config() -> SynchronizerConfig {
    let mut config = SynchronizerConfig::default();
    config.worker_pool.size = Some(2);
    config
}

impl Harness {
    pub fn new() -> Self {
        Self::with_extractor(Arc::new(FsMetadataExtractor))
    }

    pub fn with_extractor(extractor: Arc<dyn MetadataExtractor>) -> Self {
        Self::with_parts(extractor, test_config(), |catalog| {
            catalog as Arc<dyn CatalogStore>
        })
    }

    /// `store` decides what the coordinator writes through; `catalog` stays
    /// the underlying in-memory store.
    pub fn with_parts(
        extractor: Arc<dyn MetadataExtractor>,
        config: SynchronizerConfig,
        store: impl FnOnce(Arc<InMemoryCatalog>) -> Arc<dyn CatalogStore>,
    ) -> Self {
        init_tracing();
        let dir = tempfile::tempdir().expect("tempdir");
        let root = fs::canonicalize(dir.path()).expect("canonical tempdir").join("library");
        fs::create_dir_all(&root).expect("create root");

        let catalog = Arc::new(InMemoryCatalog::new());
        let vectors = Arc::new(InMemoryVectorIndex::new());
        let coordinator = Arc::new(RepositoryCoordinator::new(
            store(catalog.clone()),
            vectors.clone(),
            Arc::new(InMemoryExtensionRegistry::with_extensions([KNOWN_EXTENSION])),
            extractor,
            config,
        ));

        let events = EventLog::default();
        let sink = Arc::clone(&events.events);
        coordinator.events().on_all(move |event| {
            sink.lock().unwrap().push(event.payload.clone());
        });

        Self {
            _dir: dir,
            root,
            catalog,
            vectors,
            coordinator,
            events,
        }
    }

    pub async fn create_repository(&self, watch: bool) -> Repository {
        self.coordinator
            .create(CreateRepository {
                location: self.root.to_string_lossy().into_owned(),
                name: "Library".to_string(),
                watch,
                ..Default::default()
            })
            .await
            .expect("create repository")
    }

    /// Write a PNG below the root, creating intermediate folders.
    pub fn write_png(&self, relative: &str, width: u32) -> PathBuf {
        let path = self.root.join(relative);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent");
        }
        fs::write(&path, png_bytes(width, 1)).expect("write png");
        path
    }
}

/// Poll `condition` until it holds or `timeout` elapses.
pub async fn eventually<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}

/// Catalog failing chosen operations on demand.
pub struct FlakyCatalog {
    inner: Arc<InMemoryCatalog>,
    pub fail_listing: AtomicBool,
    pub fail_updates: AtomicBool,
}

impl FlakyCatalog {
    pub fn new(inner: Arc<InMemoryCatalog>) -> Self {
        Self {
            inner,
            fail_listing: AtomicBool::new(false),
            fail_updates: AtomicBool::new(false),
        }
    }

    fn check(flag: &AtomicBool, operation: &str) -> picteus_core::Result<()> {
        if flag.load(Ordering::SeqCst) {
            return Err(PicteusError::Internal(format!("{operation} unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for FlakyCatalog {
    async fn create_repository(&self, repository: Repository) -> picteus_core::Result<()> {
        self.inner.create_repository(repository).await
    }

    async fn get_repository(&self, id: RepositoryID) -> picteus_core::Result<Option<Repository>> {
        self.inner.get_repository(id).await
    }

    async fn list_repositories(&self) -> picteus_core::Result<Vec<Repository>> {
        self.inner.list_repositories().await
    }

    async fn update_repository(&self, repository: Repository) -> picteus_core::Result<()> {
        Self::check(&self.fail_updates, "update_repository")?;
        self.inner.update_repository(repository).await
    }

    async fn delete_repository(&self, id: RepositoryID) -> picteus_core::Result<()> {
        self.inner.delete_repository(id).await
    }

    async fn create_image(&self, image: Image) -> picteus_core::Result<()> {
        self.inner.create_image(image).await
    }

    async fn get_image(&self, id: ImageID) -> picteus_core::Result<Option<Image>> {
        self.inner.get_image(id).await
    }

    async fn find_image_by_path(
        &self,
        repository_id: RepositoryID,
        path: &Path,
    ) -> picteus_core::Result<Option<Image>> {
        self.inner.find_image_by_path(repository_id, path).await
    }

    async fn list_images(&self, repository_id: RepositoryID) -> picteus_core::Result<Vec<Image>> {
        Self::check(&self.fail_listing, "list_images")?;
        self.inner.list_images(repository_id).await
    }

    async fn update_image(&self, image: Image) -> picteus_core::Result<()> {
        self.inner.update_image(image).await
    }

    async fn delete_images(&self, ids: &[ImageID]) -> picteus_core::Result<()> {
        self.inner.delete_images(ids).await
    }
}
