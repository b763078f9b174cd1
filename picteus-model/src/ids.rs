use std::str::FromStr;

use uuid::Uuid;

use crate::error::ModelError;

/// Strongly typed ID for repositories
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct RepositoryID(pub Uuid);

impl Default for RepositoryID {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryID {
    pub fn new() -> Self {
        RepositoryID(Uuid::now_v7())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl AsRef<Uuid> for RepositoryID {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for RepositoryID {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw)
            .map(RepositoryID)
            .map_err(|_| ModelError::InvalidId(raw.to_string()))
    }
}

impl std::fmt::Display for RepositoryID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Strongly typed ID for catalogued images
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Copy)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct ImageID(pub Uuid);

impl Default for ImageID {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageID {
    pub fn new() -> Self {
        ImageID(Uuid::now_v7())
    }

    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    pub fn to_uuid(&self) -> Uuid {
        self.0
    }
}

impl AsRef<Uuid> for ImageID {
    fn as_ref(&self) -> &Uuid {
        &self.0
    }
}

impl FromStr for ImageID {
    type Err = ModelError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(raw)
            .map(ImageID)
            .map_err(|_| ModelError::InvalidId(raw.to_string()))
    }
}

impl std::fmt::Display for ImageID {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
