//! The named functions a worker call can run.

use std::path::{Path, PathBuf};

use chrono::Utc;
use picteus_model::{
    Image, ImageID, ImageSummary, LocationType, RepositoryID, SyncAction,
};
use tokio::task::spawn_blocking;
use tracing::{debug, warn};
use url::Url;
use walkdir::{DirEntry, WalkDir};

use super::{WorkerError, WorkerPort, WorkerServices};
use crate::error::{PicteusError, Result};
use crate::metadata::{detect_file_format, file_modified_at, is_supported_file};

/// Entries between two progress reports while listing.
const PROGRESS_STRIDE: usize = 256;

/// Every supported image below `root`, hidden entries skipped, sorted.
pub async fn list_files(
    location_type: LocationType,
    root: &Url,
    mut port: WorkerPort,
) -> Result<Vec<PathBuf>> {
    let root_path = match location_type {
        LocationType::File => root.to_file_path().map_err(|_| {
            PicteusError::invalid_parameter("url", root, "not a local directory URL")
        })?,
    };
    if !root_path.is_dir() {
        return Err(PicteusError::NotFound(format!(
            "repository root {}",
            root_path.display()
        )));
    }

    spawn_blocking(move || walk(&root_path, &mut port))
        .await
        .map_err(|err| PicteusError::Internal(format!("listing task failed: {err}")))?
}

fn walk(root: &Path, port: &mut WorkerPort) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| entry.depth() == 0 || !is_hidden(entry));

    for (visited, entry) in walker.enumerate() {
        if port.cancellation_requested() {
            return Err(WorkerError::Cancelled.into());
        }
        match entry {
            Ok(entry) => {
                if entry.file_type().is_file() && is_supported_file(entry.path()) {
                    files.push(entry.into_path());
                }
            }
            Err(err) => {
                warn!(root = %root.display(), error = %err, "skipping unreadable entry");
            }
        }
        if visited % PROGRESS_STRIDE == 0 {
            port.report_progress(files.len() as u64, 0);
        }
    }

    files.sort();
    port.report_progress(files.len() as u64, files.len() as u64);
    debug!(root = %root.display(), count = files.len(), "listed repository files");
    Ok(files)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry
        .file_name()
        .to_str()
        .is_some_and(|name| name.starts_with('.'))
}

/// Analyze a new file and persist it as an image.
pub async fn declare_image(
    services: &WorkerServices,
    repository_id: RepositoryID,
    path: PathBuf,
    parent_id: Option<ImageID>,
    source_url: Option<String>,
    application_metadata: Option<String>,
) -> Result<ImageSummary> {
    let format = detect_file_format(&path).await?;
    let details = services
        .extractor
        .compute_image_details(&path, source_url.as_deref())
        .await?;

    let now = Utc::now();
    let image = Image {
        id: ImageID::new(),
        repository_id,
        parent_id,
        name: file_name(&path),
        path,
        source_url,
        format,
        dimensions: details.dimensions,
        file_dates: details.file_dates,
        size_in_bytes: details.size_in_bytes,
        metadata: details.metadata,
        application_metadata: application_metadata.or(details.application_metadata),
        features: Vec::new(),
        created_at: now,
        modified_at: now,
    };
    let summary = image.summary();
    services.catalog.create_image(image).await?;
    Ok(summary)
}

/// Re-analyze a catalogued file, keeping its identity.
pub async fn update_image(
    services: &WorkerServices,
    repository_id: RepositoryID,
    path: PathBuf,
    parent_id: Option<ImageID>,
    source_url: Option<String>,
) -> Result<ImageSummary> {
    let Some(mut image) = services
        .catalog
        .find_image_by_path(repository_id, &path)
        .await?
    else {
        return Err(PicteusError::NotFound(format!(
            "image at {}",
            path.display()
        )));
    };

    let source_url = source_url.or(image.source_url.take());
    image.format = detect_file_format(&path).await?;
    let details = services
        .extractor
        .compute_image_details(&path, source_url.as_deref())
        .await?;

    image.parent_id = parent_id.or(image.parent_id);
    image.source_url = source_url;
    image.dimensions = details.dimensions;
    image.file_dates = details.file_dates;
    image.size_in_bytes = details.size_in_bytes;
    image.metadata = details.metadata;
    if details.application_metadata.is_some() {
        image.application_metadata = details.application_metadata;
    }
    image.modified_at = Utc::now();

    let summary = image.summary();
    services.catalog.update_image(image).await?;
    Ok(summary)
}

/// Bring the record of one file in line with the filesystem.
pub async fn synchronize_image(
    services: &WorkerServices,
    repository_id: RepositoryID,
    path: PathBuf,
) -> Result<(ImageSummary, SyncAction)> {
    let existing = services
        .catalog
        .find_image_by_path(repository_id, &path)
        .await?;

    match existing {
        None => {
            let summary =
                declare_image(services, repository_id, path, None, None, None).await?;
            Ok((summary, SyncAction::Created))
        }
        Some(image) => {
            if file_modified_at(&path).await? == image.file_dates.modified_at {
                return Ok((image.summary(), SyncAction::None));
            }
            let summary = update_image(services, repository_id, path, None, None).await?;
            Ok((summary, SyncAction::Updated))
        }
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}
