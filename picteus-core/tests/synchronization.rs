mod support;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use picteus_core::catalog::{
    CatalogStore, InMemoryCatalog, InMemoryExtensionRegistry, InMemoryVectorIndex,
};
use picteus_core::metadata::FsMetadataExtractor;
use picteus_core::{
    CreateRepository, PicteusError, RepositoryCoordinator, StoreImageRequest, SynchronizerConfig,
};
use picteus_model::{CatalogEvent, ImageFormat, RepositoryStatus, Topic};

use support::{
    FlakyCatalog, GatedExtractor, Harness, KNOWN_EXTENSION, image_bytes, png_bytes, test_config,
};

fn flaky_harness() -> (Harness, Arc<FlakyCatalog>) {
    let mut flaky = None;
    let harness = Harness::with_parts(Arc::new(FsMetadataExtractor), test_config(), |catalog| {
        let store = Arc::new(FlakyCatalog::new(catalog));
        flaky = Some(Arc::clone(&store));
        store as Arc<dyn CatalogStore>
    });
    (harness, flaky.expect("store built"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn creation_catalogs_existing_files() {
    let harness = Harness::new();
    harness.write_png("a.png", 1);
    harness.write_png("nested/b.png", 2);
    fs::write(harness.root.join("readme.txt"), b"not an image").unwrap();

    let repository = harness.create_repository(false).await;

    assert_eq!(repository.status, RepositoryStatus::Ready);
    assert_eq!(harness.catalog.image_count().await, 2);
    assert_eq!(harness.events.count(Topic::REPOSITORY_CREATED), 1);
    assert_eq!(harness.events.count(Topic::REPOSITORY_SYNCHRONIZE_STARTED), 1);
    assert_eq!(harness.events.count(Topic::REPOSITORY_SYNCHRONIZE_STOPPED), 1);
    assert_eq!(harness.events.count(Topic::IMAGE_CREATED), 2);
    assert!(!harness.coordinator.is_watching(repository.id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn second_synchronization_in_flight_is_rejected() {
    let extractor = Arc::new(GatedExtractor::new());
    let harness = Harness::with_extractor(extractor.clone());
    let repository = harness.create_repository(false).await;
    harness.write_png("a.png", 1);

    let coordinator = Arc::clone(&harness.coordinator);
    let id = repository.id;
    let first = tokio::spawn(async move { coordinator.synchronize(id).await });
    extractor.entered.notified().await;

    let second = harness.coordinator.synchronize(repository.id).await;
    assert!(matches!(second, Err(PicteusError::IllegalState(_))));
    let deletion = harness.coordinator.delete(repository.id).await;
    assert!(matches!(deletion, Err(PicteusError::IllegalState(_))));

    extractor.release();
    let summary = first.await.unwrap().unwrap();
    assert_eq!(summary.created.len(), 1);
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Ready
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn resynchronizing_an_unchanged_tree_updates_nothing() {
    let harness = Harness::new();
    harness.write_png("a.png", 1);
    harness.write_png("b.png", 2);
    let repository = harness.create_repository(false).await;
    harness.events.clear();

    let summary = harness.coordinator.synchronize(repository.id).await.unwrap();

    assert_eq!(summary.unchanged.len(), 2);
    assert!(summary.created.is_empty() && summary.updated.is_empty() && summary.deleted.is_empty());
    assert_eq!(harness.events.count(Topic::IMAGE_UPDATED), 0);
    assert_eq!(harness.events.count(Topic::IMAGE_CREATED), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn added_and_removed_files_are_reconciled() {
    let harness = Harness::new();
    harness.write_png("a.png", 1);
    harness.write_png("b.png", 2);
    let removed = harness.write_png("c.png", 3);
    let repository = harness.create_repository(false).await;
    assert_eq!(harness.catalog.image_count().await, 3);
    harness.events.clear();

    harness.write_png("d.png", 4);
    fs::remove_file(&removed).unwrap();
    let summary = harness.coordinator.synchronize(repository.id).await.unwrap();

    assert_eq!(harness.events.count(Topic::IMAGE_CREATED), 1);
    assert_eq!(harness.events.count(Topic::IMAGE_UPDATED), 0);
    assert_eq!(harness.events.count(Topic::IMAGE_DELETED), 1);
    assert_eq!(summary.deleted.len(), 1);
    assert_eq!(harness.catalog.image_count().await, 3);
    assert!(
        harness
            .catalog
            .find_image_by_path(repository.id, &removed)
            .await
            .unwrap()
            .is_none()
    );
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Ready
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_removed_between_syncs_is_deleted_once() {
    let harness = Harness::new();
    let path = harness.write_png("a.png", 1);
    let repository = harness.create_repository(false).await;
    let image = harness
        .catalog
        .find_image_by_path(repository.id, &path)
        .await
        .unwrap()
        .unwrap();
    harness.vectors.insert_embedding(image.id, vec![0.5; 4]).await;
    harness.events.clear();

    fs::remove_file(&path).unwrap();
    harness.coordinator.synchronize(repository.id).await.unwrap();
    harness.coordinator.synchronize(repository.id).await.unwrap();

    assert_eq!(harness.events.count(Topic::IMAGE_DELETED), 1);
    assert!(!harness.vectors.has_embedding(image.id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unreadable_files_are_reported_without_failing_the_batch() {
    let harness = Harness::new();
    harness.write_png("good.png", 1);
    fs::write(harness.root.join("broken.png"), b"garbage").unwrap();

    let repository = harness.create_repository(false).await;
    let summary = harness.coordinator.synchronize(repository.id).await.unwrap();

    assert_eq!(summary.failures.len(), 1);
    assert!(summary.failures[0].path.ends_with("broken.png"));
    assert_eq!(harness.catalog.image_count().await, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_image_matches_its_signature() {
    let harness = Harness::new();
    let repository = harness.create_repository(false).await;

    let stored = harness
        .coordinator
        .store_image(
            repository.id,
            &image_bytes(4, 3, image::ImageFormat::Jpeg),
            StoreImageRequest {
                name_without_extension: Some("photo".into()),
                relative_directory: Some("2024/summer".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let fetched = harness.coordinator.get_image(stored.id).await.unwrap();
    assert_eq!(fetched.format, ImageFormat::Jpeg);
    assert_eq!(fetched.dimensions.width, 4);
    assert_eq!(fetched.path, harness.root.join("2024/summer/photo.jpg"));
    assert!(fetched.path.exists());
    assert_eq!(harness.events.count(Topic::IMAGE_CREATED), 1);

    // The stored file is already in sync.
    let summary = harness.coordinator.synchronize(repository.id).await.unwrap();
    assert_eq!(summary.unchanged, vec![stored.id]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn stored_image_keeps_its_attributes() {
    let harness = Harness::new();
    let repository = harness.create_repository(false).await;
    let parent = harness
        .coordinator
        .store_image(repository.id, &png_bytes(2, 2), StoreImageRequest::default())
        .await
        .unwrap();

    let metadata = format!(r#"{{"items":[{{"extensionId":"{KNOWN_EXTENSION}","value":"cat"}}]}}"#);
    let child = harness
        .coordinator
        .store_image(
            repository.id,
            &png_bytes(1, 1),
            StoreImageRequest {
                parent_id: Some(parent.id),
                source_url: Some("https://example.org/cat.png".into()),
                application_metadata: Some(metadata.clone()),
                name_without_extension: Some("child".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(child.parent_id, Some(parent.id));
    assert_eq!(child.source_url.as_deref(), Some("https://example.org/cat.png"));
    assert_eq!(child.application_metadata, Some(metadata));
    assert_eq!(child.name, "child.png");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn invalid_parameters_name_their_field() {
    let harness = Harness::new();
    let repository = harness.create_repository(false).await;
    let coordinator = &harness.coordinator;

    let relative = coordinator
        .create(CreateRepository {
            location: "relative/path".into(),
            name: "Other".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(relative.field(), Some("url"));

    let duplicate = coordinator
        .create(CreateRepository {
            location: harness.root.to_string_lossy().into_owned(),
            name: "Library".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(duplicate.field(), Some("name"));

    fs::create_dir_all(harness.root.join("inner")).unwrap();
    let nested = coordinator
        .create(CreateRepository {
            location: harness.root.join("inner").to_string_lossy().into_owned(),
            name: "Inner".into(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert_eq!(nested.field(), Some("url"));

    let garbage = coordinator
        .store_image(repository.id, b"definitely not an image", StoreImageRequest::default())
        .await
        .unwrap_err();
    assert_eq!(garbage.field(), Some("body"));

    let orphan = coordinator
        .store_image(
            repository.id,
            &png_bytes(1, 1),
            StoreImageRequest {
                parent_id: Some(picteus_model::ImageID::new()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(orphan.field(), Some("parentId"));

    let unknown_extension = coordinator
        .store_image(
            repository.id,
            &png_bytes(1, 1),
            StoreImageRequest {
                application_metadata: Some(r#"{"items":[{"extensionId":"ghost","value":1}]}"#.into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(unknown_extension.field(), Some("applicationMetadata"));

    let escaping = coordinator
        .store_image(
            repository.id,
            &png_bytes(1, 1),
            StoreImageRequest {
                relative_directory: Some("../outside".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_eq!(escaping.field(), Some("relativeDirectoryPath"));

    // Nothing was written or declared by the rejected calls.
    assert_eq!(harness.catalog.image_count().await, 0);
    assert_eq!(coordinator.list().await.unwrap().len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn deleting_a_repository_removes_images_and_embeddings() {
    let harness = Harness::new();
    harness.write_png("a.png", 1);
    harness.write_png("b.png", 2);
    let repository = harness.create_repository(true).await;
    for image in harness.catalog.list_images(repository.id).await.unwrap() {
        harness.vectors.insert_embedding(image.id, vec![1.0]).await;
    }
    harness.events.clear();

    harness.coordinator.delete(repository.id).await.unwrap();

    assert_eq!(harness.catalog.image_count().await, 0);
    assert!(harness.vectors.is_empty().await);
    assert_eq!(harness.events.count(Topic::IMAGE_DELETED), 2);
    assert_eq!(harness.events.count(Topic::REPOSITORY_DELETED), 1);
    assert!(!harness.coordinator.is_watching(repository.id).await);
    assert!(matches!(
        harness.coordinator.get(repository.id).await,
        Err(PicteusError::NotFound(_))
    ));
    // Files on disk are left alone.
    assert!(harness.root.join("a.png").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_root_is_tracked_through_boot() {
    let harness = Harness::new();
    harness.write_png("a.png", 1);
    let repository = harness.create_repository(false).await;
    let parked = harness.root.with_file_name("parked");
    fs::rename(&harness.root, &parked).unwrap();

    let failed = harness.coordinator.synchronize(repository.id).await;
    assert!(matches!(failed, Err(PicteusError::NotFound(_))));
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::UnavailableIndexing
    );

    harness.coordinator.start_or_stop(repository.id, true).await.unwrap();
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::UnavailableIndexing
    );

    // The root comes back: the pending synchronization resumes and watching starts.
    fs::rename(&parked, &harness.root).unwrap();
    harness.coordinator.start_or_stop(repository.id, true).await.unwrap();
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Ready
    );
    assert!(harness.coordinator.is_watching(repository.id).await);
    assert_eq!(harness.catalog.image_count().await, 1);

    harness.coordinator.start_or_stop_all(false).await.unwrap();
    assert!(!harness.coordinator.is_watching(repository.id).await);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unavailable_repository_becomes_ready_when_its_root_returns() {
    let harness = Harness::new();
    let repository = harness.create_repository(false).await;
    let parked = harness.root.with_file_name("parked");
    fs::rename(&harness.root, &parked).unwrap();

    harness.coordinator.start_or_stop(repository.id, true).await.unwrap();
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Unavailable
    );
    assert!(harness.coordinator.watch(repository.id, true, false).await.is_err());

    fs::rename(&parked, &harness.root).unwrap();
    harness.coordinator.start_or_stop_all(true).await.unwrap();
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Ready
    );
    assert!(harness.coordinator.is_watching(repository.id).await);
    harness.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn interrupted_synchronization_only_runs_as_a_resume() {
    let harness = Harness::new();
    harness.write_png("a.png", 1);
    let mut repository = harness.create_repository(false).await;

    // Simulate a crash in the middle of a run.
    repository.set_status(RepositoryStatus::Indexing);
    harness.catalog.update_repository(repository.clone()).await.unwrap();

    let rejected = harness.coordinator.synchronize(repository.id).await;
    assert!(matches!(rejected, Err(PicteusError::IllegalState(_))));

    harness.coordinator.start_or_stop(repository.id, true).await.unwrap();
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Ready
    );
    assert!(harness.coordinator.is_watching(repository.id).await);
    harness.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rename_without_watcher_relocates_the_record() {
    let harness = Harness::new();
    let original = harness.write_png("a.png", 1);
    let repository = harness.create_repository(false).await;
    let image = harness
        .catalog
        .find_image_by_path(repository.id, &original)
        .await
        .unwrap()
        .unwrap();

    let renamed = harness
        .coordinator
        .rename_image(repository.id, image.id, "b", Some("moved"))
        .await
        .unwrap();

    assert_eq!(renamed.id, image.id);
    assert_eq!(renamed.path, harness.root.join("moved/b.png"));
    assert!(renamed.path.exists() && !original.exists());
    assert_eq!(harness.events.count(Topic::IMAGE_RENAMED), 1);

    let summary = harness.coordinator.synchronize(repository.id).await.unwrap();
    assert_eq!(summary.unchanged, vec![image.id]);

    harness.write_png("moved/c.png", 2);
    let clash = harness
        .coordinator
        .rename_image(repository.id, image.id, "c", None)
        .await
        .unwrap_err();
    assert_eq!(clash.field(), Some("nameWithoutExtension"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn lookups_by_path_and_technical_id() {
    let harness = Harness::new();
    let location = harness.root.to_string_lossy().into_owned();
    let first = harness
        .coordinator
        .ensure("photos", &location, "Library", false)
        .await
        .unwrap();
    let second = harness
        .coordinator
        .ensure("photos", &location, "Ignored", false)
        .await
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(first.technical_id.as_deref(), Some("photos"));

    assert_eq!(
        harness
            .coordinator
            .status_for_path(&harness.root.join("any/file.png"))
            .await
            .unwrap(),
        Some(RepositoryStatus::Ready)
    );
    assert_eq!(
        harness
            .coordinator
            .status_for_path(std::path::Path::new("/definitely/elsewhere"))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn batch_failure_still_ends_the_run() {
    let (harness, flaky) = flaky_harness();
    harness.write_png("a.png", 1);
    let repository = harness.create_repository(true).await;
    harness.events.clear();

    flaky.fail_listing.store(true, Ordering::SeqCst);
    let outcome = harness.coordinator.synchronize(repository.id).await;
    flaky.fail_listing.store(false, Ordering::SeqCst);

    assert!(matches!(outcome, Err(PicteusError::Internal(_))));
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Ready
    );
    assert_eq!(harness.events.count(Topic::REPOSITORY_SYNCHRONIZE_STARTED), 1);
    assert!(harness.events.all().contains(&CatalogEvent::RepositorySynchronizeStopped {
        repository_id: repository.id,
        succeeded: false,
    }));
    assert!(harness.coordinator.is_watching(repository.id).await);

    // The next run is accepted.
    harness.coordinator.synchronize(repository.id).await.unwrap();
    harness.coordinator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_indexing_transition_keeps_the_watch() {
    let (harness, flaky) = flaky_harness();
    let repository = harness.create_repository(true).await;
    harness.events.clear();

    flaky.fail_updates.store(true, Ordering::SeqCst);
    let outcome = harness.coordinator.synchronize(repository.id).await;
    flaky.fail_updates.store(false, Ordering::SeqCst);

    assert!(matches!(outcome, Err(PicteusError::Internal(_))));
    assert!(harness.coordinator.is_watching(repository.id).await);
    assert_eq!(
        harness.coordinator.get(repository.id).await.unwrap().status,
        RepositoryStatus::Ready
    );
    assert_eq!(harness.events.count(Topic::REPOSITORY_SYNCHRONIZE_STARTED), 0);
    harness.coordinator.shutdown().await;
}

#[tokio::test]
async fn coordinator_reads_its_configuration_from_the_environment() {
    let (expected, _) = SynchronizerConfig::load_from_env().unwrap();
    let coordinator = RepositoryCoordinator::from_env(
        Arc::new(InMemoryCatalog::new()),
        Arc::new(InMemoryVectorIndex::new()),
        Arc::new(InMemoryExtensionRegistry::new()),
        Arc::new(FsMetadataExtractor),
    )
    .unwrap();

    let config = &coordinator.context().config;
    assert_eq!(config.rename_timeout_ms, expected.rename_timeout_ms);
    assert_eq!(
        coordinator.context().pool.size(),
        expected.worker_pool.resolved_size()
    );
    coordinator.shutdown().await;
}
