//! Catalog change notifications.
//!
//! Every notification is one variant of [`CatalogEvent`]; its [`Topic`] is
//! derived from the variant so publishers cannot pair a payload with the
//! wrong entity or action.

use std::fmt;
use std::path::PathBuf;

use crate::ids::{ImageID, RepositoryID};

/// Separator between topic segments, e.g. `image.updated.renamed`.
pub const TOPIC_DELIMITER: char = '.';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EventEntity {
    Repository,
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EventAction {
    Created,
    Updated,
    Deleted,
    Synchronize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum EventState {
    Started,
    Stopped,
    Renamed,
}

impl EventEntity {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventEntity::Repository => "repository",
            EventEntity::Image => "image",
        }
    }
}

impl EventAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventAction::Created => "created",
            EventAction::Updated => "updated",
            EventAction::Deleted => "deleted",
            EventAction::Synchronize => "synchronize",
        }
    }
}

impl EventState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventState::Started => "started",
            EventState::Stopped => "stopped",
            EventState::Renamed => "renamed",
        }
    }
}

/// `entity.action[.state]` subscription key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Topic {
    pub entity: EventEntity,
    pub action: EventAction,
    pub state: Option<EventState>,
}

impl Topic {
    pub const fn new(
        entity: EventEntity,
        action: EventAction,
        state: Option<EventState>,
    ) -> Self {
        Self {
            entity,
            action,
            state,
        }
    }

    pub const REPOSITORY_CREATED: Topic =
        Topic::new(EventEntity::Repository, EventAction::Created, None);
    pub const REPOSITORY_SYNCHRONIZE_STARTED: Topic = Topic::new(
        EventEntity::Repository,
        EventAction::Synchronize,
        Some(EventState::Started),
    );
    pub const REPOSITORY_SYNCHRONIZE_STOPPED: Topic = Topic::new(
        EventEntity::Repository,
        EventAction::Synchronize,
        Some(EventState::Stopped),
    );
    pub const REPOSITORY_DELETED: Topic =
        Topic::new(EventEntity::Repository, EventAction::Deleted, None);
    pub const IMAGE_CREATED: Topic =
        Topic::new(EventEntity::Image, EventAction::Created, None);
    pub const IMAGE_UPDATED: Topic =
        Topic::new(EventEntity::Image, EventAction::Updated, None);
    pub const IMAGE_RENAMED: Topic = Topic::new(
        EventEntity::Image,
        EventAction::Updated,
        Some(EventState::Renamed),
    );
    pub const IMAGE_DELETED: Topic =
        Topic::new(EventEntity::Image, EventAction::Deleted, None);
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}",
            self.entity.as_str(),
            TOPIC_DELIMITER,
            self.action.as_str()
        )?;
        if let Some(state) = self.state {
            write!(f, "{}{}", TOPIC_DELIMITER, state.as_str())?;
        }
        Ok(())
    }
}

/// Closed set of notifications published by the synchronization engine.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")
)]
pub enum CatalogEvent {
    RepositoryCreated {
        repository_id: RepositoryID,
    },
    RepositorySynchronizeStarted {
        repository_id: RepositoryID,
    },
    RepositorySynchronizeStopped {
        repository_id: RepositoryID,
        succeeded: bool,
    },
    RepositoryDeleted {
        repository_id: RepositoryID,
    },
    ImageCreated {
        image_id: ImageID,
        repository_id: RepositoryID,
    },
    ImageUpdated {
        image_id: ImageID,
        repository_id: RepositoryID,
    },
    ImageRenamed {
        image_id: ImageID,
        repository_id: RepositoryID,
        previous_path: PathBuf,
    },
    ImageDeleted {
        image_id: ImageID,
        repository_id: RepositoryID,
    },
}

impl CatalogEvent {
    pub fn topic(&self) -> Topic {
        match self {
            CatalogEvent::RepositoryCreated { .. } => Topic::REPOSITORY_CREATED,
            CatalogEvent::RepositorySynchronizeStarted { .. } => {
                Topic::REPOSITORY_SYNCHRONIZE_STARTED
            }
            CatalogEvent::RepositorySynchronizeStopped { .. } => {
                Topic::REPOSITORY_SYNCHRONIZE_STOPPED
            }
            CatalogEvent::RepositoryDeleted { .. } => Topic::REPOSITORY_DELETED,
            CatalogEvent::ImageCreated { .. } => Topic::IMAGE_CREATED,
            CatalogEvent::ImageUpdated { .. } => Topic::IMAGE_UPDATED,
            CatalogEvent::ImageRenamed { .. } => Topic::IMAGE_RENAMED,
            CatalogEvent::ImageDeleted { .. } => Topic::IMAGE_DELETED,
        }
    }

    pub fn repository_id(&self) -> RepositoryID {
        match self {
            CatalogEvent::RepositoryCreated { repository_id }
            | CatalogEvent::RepositorySynchronizeStarted { repository_id }
            | CatalogEvent::RepositorySynchronizeStopped {
                repository_id, ..
            }
            | CatalogEvent::RepositoryDeleted { repository_id }
            | CatalogEvent::ImageCreated { repository_id, .. }
            | CatalogEvent::ImageUpdated { repository_id, .. }
            | CatalogEvent::ImageRenamed { repository_id, .. }
            | CatalogEvent::ImageDeleted { repository_id, .. } => *repository_id,
        }
    }

    pub fn image_id(&self) -> Option<ImageID> {
        match self {
            CatalogEvent::ImageCreated { image_id, .. }
            | CatalogEvent::ImageUpdated { image_id, .. }
            | CatalogEvent::ImageRenamed { image_id, .. }
            | CatalogEvent::ImageDeleted { image_id, .. } => Some(*image_id),
            _ => None,
        }
    }
}
