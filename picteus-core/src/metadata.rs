//! Per-file analysis: binary signature detection and the metadata extraction
//! port.

use std::fs;
use std::io::Read;
use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use image::{ImageError, ImageReader};
use picteus_model::{FileDates, ImageDimensions, ImageFormat, ImageMetadata};
use tokio::task::spawn_blocking;
use tracing::debug;

use crate::error::{PicteusError, Result};

/// Bytes read from the head of a file to recognize its format.
const SIGNATURE_LENGTH: usize = 64;

/// Everything the extractor learns about a file, minus its format.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageDetails {
    pub dimensions: ImageDimensions,
    pub file_dates: FileDates,
    pub size_in_bytes: u64,
    pub metadata: Option<ImageMetadata>,
    pub application_metadata: Option<String>,
}

/// Metadata extraction service.
#[async_trait]
pub trait MetadataExtractor: Send + Sync {
    async fn compute_image_details(
        &self,
        path: &Path,
        source_url: Option<&str>,
    ) -> Result<ImageDetails>;
}

/// Extractor reading the filesystem and probing image headers. Embedded
/// metadata is left to richer extractors.
#[derive(Debug, Default, Clone, Copy)]
pub struct FsMetadataExtractor;

#[async_trait]
impl MetadataExtractor for FsMetadataExtractor {
    async fn compute_image_details(
        &self,
        path: &Path,
        _source_url: Option<&str>,
    ) -> Result<ImageDetails> {
        let path = path.to_path_buf();
        spawn_blocking(move || probe_file(&path))
            .await
            .map_err(|err| {
                PicteusError::Internal(format!("metadata probe panicked: {err}"))
            })?
    }
}

fn probe_file(path: &Path) -> Result<ImageDetails> {
    let metadata = fs::metadata(path)?;
    let dimensions = match ImageReader::open(path)?
        .with_guessed_format()?
        .into_dimensions()
    {
        Ok((width, height)) => ImageDimensions { width, height },
        // Recognized signature without a compiled-in decoder (AVIF).
        Err(ImageError::Unsupported(err)) => {
            debug!(path = %path.display(), error = %err, "dimensions unavailable");
            ImageDimensions::default()
        }
        Err(err) => {
            return Err(PicteusError::InvalidImage(format!(
                "{}: {}",
                path.display(),
                err
            )));
        }
    };

    Ok(ImageDetails {
        dimensions,
        file_dates: file_dates(&metadata)?,
        size_in_bytes: metadata.len(),
        metadata: None,
        application_metadata: None,
    })
}

fn file_dates(metadata: &fs::Metadata) -> Result<FileDates> {
    let modified = metadata.modified()?;
    let created = metadata.created().unwrap_or(modified);
    Ok(FileDates {
        created_at: DateTime::<Utc>::from(created),
        modified_at: DateTime::<Utc>::from(modified),
    })
}

/// Recognize the image format from the leading bytes of a file.
pub fn detect_format(bytes: &[u8]) -> Option<ImageFormat> {
    match image::guess_format(bytes).ok()? {
        image::ImageFormat::Png => Some(ImageFormat::Png),
        image::ImageFormat::Jpeg => Some(ImageFormat::Jpeg),
        image::ImageFormat::WebP => Some(ImageFormat::Webp),
        image::ImageFormat::Gif => Some(ImageFormat::Gif),
        image::ImageFormat::Avif => Some(ImageFormat::Avif),
        image::ImageFormat::Tiff => Some(ImageFormat::Tiff),
        image::ImageFormat::Bmp => Some(ImageFormat::Bmp),
        _ => None,
    }
}

/// Read the head of `path` and recognize its format.
pub async fn detect_file_format(path: &Path) -> Result<ImageFormat> {
    let path = path.to_path_buf();
    spawn_blocking(move || {
        let mut head = Vec::with_capacity(SIGNATURE_LENGTH);
        fs::File::open(&path)?
            .take(SIGNATURE_LENGTH as u64)
            .read_to_end(&mut head)?;
        detect_format(&head).ok_or_else(|| {
            PicteusError::InvalidImage(format!(
                "{}: unrecognized image signature",
                path.display()
            ))
        })
    })
    .await
    .map_err(|err| PicteusError::Internal(format!("signature probe panicked: {err}")))?
}

/// Current modification time of a file, as stored in [`FileDates`].
pub async fn file_modified_at(path: &Path) -> Result<DateTime<Utc>> {
    let metadata = tokio::fs::metadata(path).await?;
    Ok(DateTime::<Utc>::from(metadata.modified()?))
}

/// Whether the path names a file the catalog tracks, judging by extension.
pub fn is_supported_file(path: &Path) -> bool {
    ImageFormat::from_path(path).is_some()
}
