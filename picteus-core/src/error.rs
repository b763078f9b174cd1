use thiserror::Error;

use crate::worker::WorkerError;

#[derive(Error, Debug)]
pub enum PicteusError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A caller-supplied value was rejected before any side effect.
    #[error("Invalid parameter '{field}' with value '{value}': {reason}")]
    InvalidParameter {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Illegal state: {0}")]
    IllegalState(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Watch error: {0}")]
    Watch(#[from] notify::Error),

    #[error("Invalid image file: {0}")]
    InvalidImage(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PicteusError {
    pub fn invalid_parameter(
        field: &'static str,
        value: impl ToString,
        reason: impl Into<String>,
    ) -> Self {
        PicteusError::InvalidParameter {
            field,
            value: value.to_string(),
            reason: reason.into(),
        }
    }

    /// Name of the offending field for parameter errors.
    pub fn field(&self) -> Option<&'static str> {
        match self {
            PicteusError::InvalidParameter { field, .. } => Some(*field),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PicteusError>;
