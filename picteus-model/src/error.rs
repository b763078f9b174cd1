use std::fmt::{self, Display};

/// Errors produced by model constructors and parsing routines.
#[derive(Debug)]
pub enum ModelError {
    InvalidStatus(String),
    InvalidFormat(String),
    InvalidId(String),
}

impl Display for ModelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModelError::InvalidStatus(raw) => {
                write!(f, "invalid repository status: {raw}")
            }
            ModelError::InvalidFormat(raw) => {
                write!(f, "invalid image format: {raw}")
            }
            ModelError::InvalidId(raw) => write!(f, "invalid identifier: {raw}"),
        }
    }
}

impl std::error::Error for ModelError {}

pub type Result<T> = std::result::Result<T, ModelError>;
