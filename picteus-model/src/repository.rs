use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use url::Url;

use crate::error::ModelError;
use crate::ids::RepositoryID;

/// Lifecycle status of a repository.
///
/// `Indexing` and `Ready` are the only statuses backed by a reachable root
/// directory. The `Unavailable*` variants are entered when the root goes
/// missing and remember whether a synchronization was still pending.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "SCREAMING_SNAKE_CASE"))]
pub enum RepositoryStatus {
    Indexing,
    Ready,
    Unavailable,
    UnavailableIndexing,
}

impl RepositoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryStatus::Indexing => "INDEXING",
            RepositoryStatus::Ready => "READY",
            RepositoryStatus::Unavailable => "UNAVAILABLE",
            RepositoryStatus::UnavailableIndexing => "UNAVAILABLE_INDEXING",
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, RepositoryStatus::Indexing | RepositoryStatus::Ready)
    }

    /// Whether a synchronization was started and has not finished yet.
    pub fn is_indexing(&self) -> bool {
        matches!(
            self,
            RepositoryStatus::Indexing | RepositoryStatus::UnavailableIndexing
        )
    }

    /// Status to adopt when the root directory disappears.
    pub fn to_unavailable(self) -> Self {
        if self.is_indexing() {
            RepositoryStatus::UnavailableIndexing
        } else {
            RepositoryStatus::Unavailable
        }
    }

    /// Status to adopt when the root directory reappears.
    pub fn to_available(self) -> Self {
        if self.is_indexing() {
            RepositoryStatus::Indexing
        } else {
            RepositoryStatus::Ready
        }
    }
}

impl std::fmt::Display for RepositoryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryStatus {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "INDEXING" => Ok(RepositoryStatus::Indexing),
            "READY" => Ok(RepositoryStatus::Ready),
            "UNAVAILABLE" => Ok(RepositoryStatus::Unavailable),
            "UNAVAILABLE_INDEXING" => Ok(RepositoryStatus::UnavailableIndexing),
            other => Err(ModelError::InvalidStatus(other.to_string())),
        }
    }
}

/// Kind of storage backing a repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum LocationType {
    #[default]
    File,
}

/// A declared root directory tracked for image assets.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "camelCase"))]
pub struct Repository {
    pub id: RepositoryID,
    #[cfg_attr(
        feature = "serde",
        serde(skip_serializing_if = "Option::is_none")
    )]
    pub technical_id: Option<String>,
    pub name: String,
    pub url: Url,
    pub location_type: LocationType,
    pub status: RepositoryStatus,
    #[cfg_attr(
        feature = "serde",
        serde(skip_serializing_if = "Option::is_none")
    )]
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Repository {
    /// Build a freshly declared repository, in the `Indexing` status.
    pub fn new(name: String, url: Url) -> Self {
        let now = Utc::now();
        Self {
            id: RepositoryID::new(),
            technical_id: None,
            name,
            url,
            location_type: LocationType::File,
            status: RepositoryStatus::Indexing,
            comment: None,
            created_at: now,
            modified_at: now,
        }
    }

    /// Local directory behind the repository URL.
    pub fn root_path(&self) -> Option<PathBuf> {
        self.url.to_file_path().ok()
    }

    /// Whether `path` lives under the repository root.
    pub fn contains(&self, path: &Path) -> bool {
        self.root_path()
            .map(|root| path.starts_with(root))
            .unwrap_or(false)
    }

    /// Path of `path` relative to the root, when it lives under it.
    pub fn relative_path(&self, path: &Path) -> Option<PathBuf> {
        let root = self.root_path()?;
        path.strip_prefix(root).ok().map(Path::to_path_buf)
    }

    pub fn set_status(&mut self, status: RepositoryStatus) {
        self.status = status;
        self.modified_at = Utc::now();
    }
}
