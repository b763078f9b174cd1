//! Core data model definitions shared across Picteus crates.
#![allow(missing_docs)]

pub mod error;
pub mod events;
pub mod ids;
pub mod image;
pub mod repository;

// Intentionally curated re-exports for downstream consumers.
pub use error::{ModelError, Result as ModelResult};
pub use events::{CatalogEvent, EventAction, EventEntity, EventState, Topic};
pub use ids::{ImageID, RepositoryID};
pub use image::{
    FileDates, Image, ImageDimensions, ImageFeature, ImageFormat,
    ImageMetadata, ImageSummary, SyncAction,
};
pub use repository::{LocationType, Repository, RepositoryStatus};
