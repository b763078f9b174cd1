//! Parameter checks run before any side effect. Failures name the offending
//! field the way callers spell it.

use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use url::Url;

use crate::catalog::ExtensionRegistry;
use crate::error::{PicteusError, Result};

/// Resolve a repository location, given as a `file://` URL or an absolute
/// path, to the canonical path of an existing directory.
pub async fn repository_root(location: &str) -> Result<PathBuf> {
    let location = location.trim();
    let path = if location.starts_with("file:") {
        Url::parse(location)
            .ok()
            .and_then(|url| url.to_file_path().ok())
            .ok_or_else(|| {
                PicteusError::invalid_parameter("url", location, "not a valid file URL")
            })?
    } else {
        PathBuf::from(location)
    };

    if !path.is_absolute() {
        return Err(PicteusError::invalid_parameter(
            "url",
            location,
            "the location must be absolute",
        ));
    }
    match tokio::fs::metadata(&path).await {
        Ok(metadata) if metadata.is_dir() => {}
        Ok(_) => {
            return Err(PicteusError::invalid_parameter(
                "url",
                location,
                "the location is not a directory",
            ));
        }
        Err(_) => {
            return Err(PicteusError::invalid_parameter(
                "url",
                location,
                "the directory does not exist",
            ));
        }
    }
    Ok(tokio::fs::canonicalize(&path).await?)
}

pub fn name(raw: &str, max_length: usize) -> Result<String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err(PicteusError::invalid_parameter("name", raw, "must not be empty"));
    }
    if name.chars().count() > max_length {
        return Err(PicteusError::invalid_parameter(
            "name",
            raw,
            format!("must not exceed {max_length} characters"),
        ));
    }
    Ok(name.to_string())
}

pub fn technical_id(raw: &str) -> Result<String> {
    let id = raw.trim();
    if id.is_empty() {
        return Err(PicteusError::invalid_parameter(
            "technicalId",
            raw,
            "must not be empty",
        ));
    }
    Ok(id.to_string())
}

pub fn comment(raw: &str, max_length: usize) -> Result<String> {
    if raw.chars().count() > max_length {
        return Err(PicteusError::invalid_parameter(
            "comment",
            raw,
            format!("must not exceed {max_length} characters"),
        ));
    }
    Ok(raw.to_string())
}

/// A bare file name without extension: no separators, not hidden.
pub fn file_stem(raw: &str, field: &'static str, max_length: usize) -> Result<String> {
    let reason = if raw.trim().is_empty() {
        Some("must not be empty".to_string())
    } else if raw.chars().count() > max_length {
        Some(format!("must not exceed {max_length} characters"))
    } else if raw.contains(['/', '\\', '\0']) {
        Some("must not contain path separators".to_string())
    } else if raw.starts_with('.') {
        Some("must not start with a dot".to_string())
    } else {
        None
    };

    match reason {
        Some(reason) => Err(PicteusError::invalid_parameter(field, raw, reason)),
        None => Ok(raw.to_string()),
    }
}

/// Join a caller-supplied relative directory to `root`, refusing anything
/// that would escape it or land in a hidden folder.
pub fn relative_directory(root: &Path, raw: &str) -> Result<PathBuf> {
    let mut directory = root.to_path_buf();
    for component in Path::new(raw).components() {
        match component {
            Component::CurDir => {}
            Component::Normal(segment)
                if !segment.to_string_lossy().starts_with('.') =>
            {
                directory.push(segment);
            }
            _ => {
                return Err(PicteusError::invalid_parameter(
                    "relativeDirectoryPath",
                    raw,
                    "must be a relative path inside the repository",
                ));
            }
        }
    }
    Ok(directory)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationMetadata {
    items: Vec<ApplicationMetadataItem>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApplicationMetadataItem {
    extension_id: String,
    #[allow(dead_code)]
    value: serde_json::Value,
}

/// Check an application metadata document of the form
/// `{"items": [{"extensionId": "...", "value": ...}]}` against the installed
/// extensions.
pub async fn application_metadata(
    raw: &str,
    max_bytes: usize,
    extensions: &dyn ExtensionRegistry,
) -> Result<String> {
    const FIELD: &str = "applicationMetadata";
    if raw.len() > max_bytes {
        return Err(PicteusError::invalid_parameter(
            FIELD,
            format!("{} bytes", raw.len()),
            format!("must not exceed {max_bytes} bytes"),
        ));
    }

    let document: serde_json::Value = serde_json::from_str(raw)
        .map_err(|err| PicteusError::invalid_parameter(FIELD, raw, format!("not JSON: {err}")))?;
    if !document.is_object() {
        return Err(PicteusError::invalid_parameter(
            FIELD,
            raw,
            "must be a JSON object",
        ));
    }
    let metadata: ApplicationMetadata = serde_json::from_value(document)
        .map_err(|err| PicteusError::invalid_parameter(FIELD, raw, err.to_string()))?;

    for item in &metadata.items {
        if !extensions.exists(&item.extension_id).await? {
            return Err(PicteusError::invalid_parameter(
                FIELD,
                raw,
                format!("unknown extension '{}'", item.extension_id),
            ));
        }
    }
    Ok(raw.to_string())
}
