//! # Picteus Core
//!
//! Repository synchronization engine for Picteus: keeps the image catalog
//! consistent with the directory trees it tracks.
//!
//! ## Overview
//!
//! - **Coordinator**: repository lifecycle (create, synchronize, watch,
//!   delete) plus the image writes that must not echo back through the
//!   watcher
//! - **Worker pool**: bounded, panic-isolated execution of per-file analysis
//! - **Filesystem watch**: one `notify` watcher per repository root,
//!   translating live changes into catalog updates
//! - **Event bus**: synchronous in-process notifications of every catalog
//!   change
//!
//! The catalog, the vector index, metadata extraction and the extension
//! registry are reached through async ports; in-memory adapters ship in
//! [`catalog::memory`].
//!
//! ## Examples
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use picteus_core::catalog::{InMemoryCatalog, InMemoryExtensionRegistry, InMemoryVectorIndex};
//! use picteus_core::coordinator::{CreateRepository, RepositoryCoordinator};
//! use picteus_core::config::SynchronizerConfig;
//! use picteus_core::metadata::FsMetadataExtractor;
//! use picteus_model::Topic;
//!
//! async fn track(root: &str) -> picteus_core::Result<()> {
//!     let coordinator = RepositoryCoordinator::new(
//!         Arc::new(InMemoryCatalog::new()),
//!         Arc::new(InMemoryVectorIndex::new()),
//!         Arc::new(InMemoryExtensionRegistry::new()),
//!         Arc::new(FsMetadataExtractor),
//!         SynchronizerConfig::default(),
//!     );
//!     coordinator.events().on(Topic::IMAGE_CREATED, |event| {
//!         println!("new image: {:?}", event.payload.image_id());
//!     });
//!
//!     let repository = coordinator
//!         .create(CreateRepository {
//!             location: root.to_string(),
//!             name: "Photos".to_string(),
//!             watch: true,
//!             ..Default::default()
//!         })
//!         .await?;
//!     println!("{} is {}", repository.name, repository.status);
//!     coordinator.shutdown().await;
//!     Ok(())
//! }
//! ```

#![allow(missing_docs)]

/// Ports onto the catalog, the vector index and the extension registry
pub mod catalog;

/// Engine configuration and its loaders
pub mod config;

/// Shared handles of the coordinator and the watcher loops
pub mod context;

/// Repository lifecycle and synchronization entry points
pub mod coordinator;

/// Error types and error handling utilities
pub mod error;

/// In-process publish/subscribe of catalog changes
pub mod events;

/// Image signature detection and metadata extraction
pub mod metadata;

/// Filesystem watching of repository roots
pub mod watch;

/// Bounded pool for per-file analysis
pub mod worker;

pub use config::{SynchronizerConfig, SynchronizerConfigSource};
pub use coordinator::{
    CreateRepository, RepositoryCoordinator, StoreImageRequest, SynchronizationSummary,
};
pub use error::{PicteusError, Result};
pub use events::{Event, EventBus, Subscription};
