//! Translation of raw notify events into catalog changes.

use std::path::{Component, Path, PathBuf};

use notify::Event;
use notify::event::{CreateKind, EventKind, ModifyKind, RenameMode};
use picteus_model::{CatalogEvent, ImageID, RepositoryID, SyncAction};
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::error::Result;
use crate::metadata::is_supported_file;

/// A filesystem change relevant to one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FsChange {
    Add(PathBuf),
    Change(PathBuf),
    /// A file or a whole folder disappeared.
    Remove(PathBuf),
}

impl FsChange {
    pub fn path(&self) -> &Path {
        match self {
            FsChange::Add(path) | FsChange::Change(path) | FsChange::Remove(path) => path,
        }
    }
}

/// Classify one notify event. Paths outside `root`, hidden entries,
/// directories and unsupported files are dropped; removals are kept as is
/// since a vanished folder can no longer be told apart from a file.
pub fn classify(root: &Path, event: &Event) -> Vec<FsChange> {
    let mut changes = Vec::with_capacity(event.paths.len());
    match event.kind {
        EventKind::Access(_) | EventKind::Create(CreateKind::Folder) => {}
        EventKind::Create(_) => {
            changes.extend(event.paths.iter().cloned().map(FsChange::Add));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) | EventKind::Remove(_) => {
            changes.extend(event.paths.iter().cloned().map(FsChange::Remove));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => {
            changes.extend(event.paths.iter().cloned().map(FsChange::Add));
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            let mut paths = event.paths.iter();
            if let Some(from) = paths.next() {
                changes.push(FsChange::Remove(from.clone()));
            }
            if let Some(to) = paths.next() {
                changes.push(FsChange::Add(to.clone()));
            }
        }
        // Ambiguous halves: the filesystem decides.
        EventKind::Modify(ModifyKind::Name(_)) | EventKind::Any | EventKind::Other => {
            changes.extend(event.paths.iter().map(|path| {
                if path.exists() {
                    FsChange::Add(path.clone())
                } else {
                    FsChange::Remove(path.clone())
                }
            }));
        }
        EventKind::Modify(_) => {
            changes.extend(event.paths.iter().cloned().map(FsChange::Change));
        }
    }

    changes.retain(|change| {
        let path = change.path();
        if !path.starts_with(root) || is_hidden_below(root, path) {
            return false;
        }
        match change {
            FsChange::Remove(_) => true,
            FsChange::Add(path) | FsChange::Change(path) => {
                !path.is_dir() && is_supported_file(path)
            }
        }
    });
    changes
}

fn is_hidden_below(root: &Path, path: &Path) -> bool {
    path.strip_prefix(root)
        .map(|relative| {
            relative.components().any(|component| match component {
                Component::Normal(name) => name
                    .to_str()
                    .is_some_and(|name| name.starts_with('.')),
                _ => false,
            })
        })
        .unwrap_or(false)
}

/// What the watch loop does after a change was applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchFlow {
    Continue,
    /// The root itself is gone; the watch is dead and must stop.
    RootRemoved,
}

/// Apply one change to the catalog.
pub async fn handle_change(
    ctx: &SyncContext,
    repository_id: RepositoryID,
    root: &Path,
    change: FsChange,
) -> Result<WatchFlow> {
    match change {
        FsChange::Add(path) => {
            if ctx.echo.suppress(repository_id, &path) {
                debug!(path = %path.display(), "suppressed echo of a stored image");
                return Ok(WatchFlow::Continue);
            }
            if let Some(rename) = ctx.echo.claim_rename_target(repository_id, &path) {
                ctx.relocate_image(rename.image_id, path).await?;
                return Ok(WatchFlow::Continue);
            }
            reconcile(ctx, repository_id, path).await?;
        }
        FsChange::Change(path) => {
            if ctx.echo.suppress(repository_id, &path) {
                debug!(path = %path.display(), "suppressed echo of a stored image");
                return Ok(WatchFlow::Continue);
            }
            reconcile(ctx, repository_id, path).await?;
        }
        FsChange::Remove(path) => {
            if ctx.echo.is_rename_source(repository_id, &path) {
                return Ok(WatchFlow::Continue);
            }
            if path == root {
                let repository = ctx.repository(repository_id).await?;
                warn!(repository_id = %repository_id, root = %root.display(), "repository root vanished");
                ctx.set_status(repository_id, repository.status.to_unavailable())
                    .await?;
                return Ok(WatchFlow::RootRemoved);
            }
            if path.exists() {
                // Recreated before the notification was handled.
                return Ok(WatchFlow::Continue);
            }
            remove_below(ctx, repository_id, &path).await?;
        }
    }
    Ok(WatchFlow::Continue)
}

/// Unknown files are declared, known ones refreshed when their modification
/// time moved.
async fn reconcile(ctx: &SyncContext, repository_id: RepositoryID, path: PathBuf) -> Result<()> {
    let (summary, action) = ctx.pool.synchronize_image(repository_id, path.clone()).await?;
    match action {
        SyncAction::Created => {
            info!(image_id = %summary.id, path = %path.display(), "image appeared");
            ctx.emit(CatalogEvent::ImageCreated {
                image_id: summary.id,
                repository_id,
            });
        }
        SyncAction::Updated => {
            debug!(image_id = %summary.id, path = %path.display(), "image changed");
            ctx.emit(CatalogEvent::ImageUpdated {
                image_id: summary.id,
                repository_id,
            });
        }
        SyncAction::None => {}
    }
    Ok(())
}

async fn remove_below(ctx: &SyncContext, repository_id: RepositoryID, path: &Path) -> Result<()> {
    let ids: Vec<ImageID> = ctx
        .catalog
        .list_images(repository_id)
        .await?
        .into_iter()
        .filter(|image| image.path.starts_with(path))
        .map(|image| image.id)
        .collect();
    ctx.remove_images(repository_id, &ids).await?;
    Ok(())
}
