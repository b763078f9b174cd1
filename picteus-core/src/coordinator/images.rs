use std::path::PathBuf;

use picteus_model::{CatalogEvent, Image, ImageID, Repository, RepositoryID, RepositoryStatus, Topic};
use tracing::{debug, info, instrument, warn};

use super::{RepositoryCoordinator, repository_root, validation};
use crate::error::{PicteusError, Result};
use crate::metadata::detect_format;

/// Optional attributes of an image handed to `store_image`.
#[derive(Debug, Clone, Default)]
pub struct StoreImageRequest {
    pub parent_id: Option<ImageID>,
    pub source_url: Option<String>,
    /// JSON document `{"items": [{"extensionId": ..., "value": ...}]}`.
    pub application_metadata: Option<String>,
    /// Defaults to a generated name.
    pub name_without_extension: Option<String>,
    /// Directory below the repository root; defaults to the root.
    pub relative_directory: Option<String>,
}

impl RepositoryCoordinator {
    /// Write `bytes` into the repository and declare the resulting image.
    #[instrument(skip(self, bytes, request), fields(size = bytes.len()))]
    pub async fn store_image(
        &self,
        repository_id: RepositoryID,
        bytes: &[u8],
        request: StoreImageRequest,
    ) -> Result<Image> {
        let config = &self.ctx.config;
        let repository = self.ready_repository(repository_id).await?;

        if bytes.is_empty() || bytes.len() > config.max_image_size_bytes {
            return Err(PicteusError::invalid_parameter(
                "body",
                format!("{} bytes", bytes.len()),
                format!(
                    "the image must hold between 1 and {} bytes",
                    config.max_image_size_bytes
                ),
            ));
        }
        let format = detect_format(bytes).ok_or_else(|| {
            PicteusError::invalid_parameter(
                "body",
                format!("{} bytes", bytes.len()),
                "unrecognized image format",
            )
        })?;

        if let Some(parent_id) = request.parent_id {
            let parent = self.ctx.catalog.get_image(parent_id).await?;
            if parent.is_none_or(|parent| parent.repository_id != repository_id) {
                return Err(PicteusError::invalid_parameter(
                    "parentId",
                    parent_id,
                    "no such image in this repository",
                ));
            }
        }
        let application_metadata = match request.application_metadata.as_deref() {
            Some(raw) => Some(
                validation::application_metadata(
                    raw,
                    config.max_application_metadata_bytes,
                    self.ctx.extensions.as_ref(),
                )
                .await?,
            ),
            None => None,
        };

        let root = repository_root(&repository)?;
        let directory = match request.relative_directory.as_deref() {
            Some(raw) => validation::relative_directory(&root, raw)?,
            None => root,
        };
        let stem = match request.name_without_extension.as_deref() {
            Some(raw) => validation::file_stem(raw, "nameWithoutExtension", config.max_name_length)?,
            None => ImageID::new().to_string(),
        };
        let path = directory.join(format!("{stem}.{}", format.extension()));
        if tokio::fs::try_exists(&path).await? {
            return Err(PicteusError::invalid_parameter(
                "nameWithoutExtension",
                stem,
                "a file with this name already exists",
            ));
        }

        let ignore = self.ctx.echo.ignore(repository_id, &path);
        tokio::fs::create_dir_all(&directory).await?;
        tokio::fs::write(&path, bytes).await?;
        let declared = self
            .ctx
            .pool
            .declare_image(
                repository_id,
                path.clone(),
                request.parent_id,
                request.source_url,
                application_metadata,
            )
            .await;
        let summary = match declared {
            Ok(summary) => summary,
            Err(err) => {
                let _ = tokio::fs::remove_file(&path).await;
                return Err(err);
            }
        };
        self.ctx.emit(CatalogEvent::ImageCreated {
            image_id: summary.id,
            repository_id,
        });
        debug!(
            consumed_echo = ?self.ctx.echo.is_consumed(repository_id, &path),
            "releasing ignore entry"
        );
        drop(ignore);

        info!(image_id = %summary.id, path = %path.display(), "image stored");
        self.ctx.image(summary.id).await
    }

    /// Move an image to a new name and, optionally, a new directory of the
    /// same repository. The image keeps its id.
    ///
    /// Under watch, the move is confirmed by the watcher within
    /// `rename_timeout_ms`. Past that bound the call fails with
    /// [`PicteusError::Timeout`], the record already pointing at the new
    /// location.
    #[instrument(skip(self))]
    pub async fn rename_image(
        &self,
        repository_id: RepositoryID,
        image_id: ImageID,
        name_without_extension: &str,
        relative_directory: Option<&str>,
    ) -> Result<Image> {
        let config = &self.ctx.config;
        let repository = self.ready_repository(repository_id).await?;
        let image = self.ctx.image(image_id).await?;
        if image.repository_id != repository_id {
            return Err(PicteusError::NotFound(format!(
                "image {image_id} in repository {repository_id}"
            )));
        }

        let stem = validation::file_stem(
            name_without_extension,
            "nameWithoutExtension",
            config.max_name_length,
        )?;
        let directory = match relative_directory {
            Some(raw) => validation::relative_directory(&repository_root(&repository)?, raw)?,
            None => image
                .path
                .parent()
                .map(PathBuf::from)
                .ok_or_else(|| PicteusError::Internal(format!("image {image_id} has no parent directory")))?,
        };
        let extension = image
            .path
            .extension()
            .map(|extension| extension.to_string_lossy().into_owned())
            .unwrap_or_else(|| image.format.extension().to_string());
        let target = directory.join(format!("{stem}.{extension}"));
        if target == image.path {
            return Ok(image);
        }
        if tokio::fs::try_exists(&target).await? {
            return Err(PicteusError::invalid_parameter(
                "nameWithoutExtension",
                stem,
                "a file already exists at the target location",
            ));
        }
        let new_directory = !tokio::fs::try_exists(&directory).await?;
        tokio::fs::create_dir_all(&directory).await?;

        if !self.watches.is_watching(repository_id).await {
            tokio::fs::rename(&image.path, &target).await?;
            self.ctx.relocate_image(image_id, target).await?;
        } else if new_directory {
            // The watcher may not see inside a folder this young: move the
            // record first so a late notification finds it in place.
            let _pending = self
                .ctx
                .echo
                .expect_rename(repository_id, image_id, &image.path, &target);
            self.ctx.echo.claim_rename_target(repository_id, &target);
            self.ctx.relocate_image(image_id, target.clone()).await?;
            if let Err(err) = tokio::fs::rename(&image.path, &target).await {
                self.ctx.relocate_image(image_id, image.path.clone()).await?;
                return Err(err.into());
            }
        } else {
            let _pending = self
                .ctx
                .echo
                .expect_rename(repository_id, image_id, &image.path, &target);
            let confirmation = self.ctx.bus.once(Topic::IMAGE_RENAMED, move |event| {
                event.payload.image_id() == Some(image_id)
            });
            tokio::fs::rename(&image.path, &target).await?;
            if let Err(err) = confirmation.wait(config.rename_timeout()).await {
                // The file moved; keep the record with it.
                if self
                    .ctx
                    .echo
                    .claim_rename_target(repository_id, &target)
                    .is_some()
                {
                    warn!(image_id = %image_id, target = %target.display(), "rename not confirmed by the watcher");
                    self.ctx.relocate_image(image_id, target).await?;
                }
                return Err(err);
            }
        }

        info!(image_id = %image_id, "image renamed");
        self.ctx.image(image_id).await
    }

    async fn ready_repository(&self, id: RepositoryID) -> Result<Repository> {
        let repository = self.ctx.repository(id).await?;
        if repository.status != RepositoryStatus::Ready || self.in_flight.is_active(id) {
            return Err(PicteusError::IllegalState(format!(
                "repository {id} is {} and cannot accept changes",
                repository.status
            )));
        }
        Ok(repository)
    }
}
