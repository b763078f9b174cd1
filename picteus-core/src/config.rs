use std::{
    env, fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::{Context, anyhow};
use serde::{Deserialize, Serialize};
use tracing::info;

/// File holding the configuration, TOML or JSON.
pub const CONFIG_PATH_VAR: &str = "PICTEUS_SYNC_CONFIG_PATH";
/// Inline JSON configuration.
pub const CONFIG_JSON_VAR: &str = "PICTEUS_SYNC_CONFIG_JSON";

/// Looked up relative to the working directory, in order.
const DEFAULT_FILES: [&str; 4] = [
    "synchronizer.toml",
    "synchronizer.json",
    "config/synchronizer.toml",
    "config/synchronizer.json",
];

/// Source that produced the synchronizer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SynchronizerConfigSource {
    #[default]
    Default,
    EnvPath(PathBuf),
    EnvInline,
    File(PathBuf),
}

impl SynchronizerConfigSource {
    /// Pick the source from the environment: the path variable, then the
    /// inline variable, then the first default file present.
    pub fn detect() -> Self {
        if let Some(path) = non_empty_var(CONFIG_PATH_VAR) {
            return Self::EnvPath(PathBuf::from(path));
        }
        if non_empty_var(CONFIG_JSON_VAR).is_some() {
            return Self::EnvInline;
        }
        DEFAULT_FILES
            .iter()
            .map(PathBuf::from)
            .find(|path| path.is_file())
            .map(Self::File)
            .unwrap_or_default()
    }
}

fn non_empty_var(name: &str) -> Option<String> {
    env::var(name).ok().filter(|value| !value.trim().is_empty())
}

/// Sizing of the per-file analysis pool.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WorkerPoolConfig {
    /// Number of concurrent execution units. Leave unset to use
    /// `max(1, cpus - 2)`.
    pub size: Option<usize>,
    /// How long shutdown waits for in-flight calls before aborting them.
    pub shutdown_grace_ms: u64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            size: None,
            shutdown_grace_ms: 5_000,
        }
    }
}

impl WorkerPoolConfig {
    /// A pool that runs exactly one call at a time, for stateful task runners.
    pub fn singleton() -> Self {
        Self {
            size: Some(1),
            ..Self::default()
        }
    }

    pub fn resolved_size(&self) -> usize {
        self.size
            .unwrap_or_else(|| num_cpus::get().saturating_sub(2))
            .max(1)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Filesystem watcher tuning.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct WatchConfig {
    /// Capacity of the channel between notify callbacks and the per
    /// repository event loop.
    pub channel_capacity: usize,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 1024,
        }
    }
}

/// Top-level synchronization engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SynchronizerConfig {
    pub worker_pool: WorkerPoolConfig,
    pub watch: WatchConfig,
    /// How long a rename waits for the watcher to confirm it.
    pub rename_timeout_ms: u64,
    /// Largest image `store_image` accepts.
    pub max_image_size_bytes: usize,
    pub max_name_length: usize,
    pub max_comment_length: usize,
    pub max_application_metadata_bytes: usize,
}

impl Default for SynchronizerConfig {
    fn default() -> Self {
        Self {
            worker_pool: WorkerPoolConfig::default(),
            watch: WatchConfig::default(),
            rename_timeout_ms: 5_000,
            max_image_size_bytes: 64 * 1024 * 1024,
            max_name_length: 256,
            max_comment_length: 1024,
            max_application_metadata_bytes: 256 * 1024,
        }
    }
}

impl SynchronizerConfig {
    pub fn rename_timeout(&self) -> Duration {
        Duration::from_millis(self.rename_timeout_ms)
    }

    /// Load the configuration from the source [`SynchronizerConfigSource::detect`]
    /// selects, falling back to defaults.
    pub fn load_from_env() -> anyhow::Result<(Self, SynchronizerConfigSource)> {
        let source = SynchronizerConfigSource::detect();
        let config = match &source {
            SynchronizerConfigSource::Default => Self::default(),
            SynchronizerConfigSource::EnvPath(path) | SynchronizerConfigSource::File(path) => {
                Self::load_from_file(path)?
            }
            SynchronizerConfigSource::EnvInline => {
                let raw = non_empty_var(CONFIG_JSON_VAR).unwrap_or_default();
                Self::parse_json(&raw).with_context(|| format!("failed to parse {CONFIG_JSON_VAR}"))?
            }
        };
        info!(?source, "synchronizer configuration loaded");
        Ok((config, source))
    }

    /// Parse a file by extension; other extensions try TOML then JSON.
    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read synchronizer config {}", path.display()))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::parse_json(&contents),
            Some("toml") => Self::parse_toml(&contents),
            _ => Self::parse_from_str(&contents),
        }
        .with_context(|| format!("invalid synchronizer config {}", path.display()))
    }

    pub fn parse_from_str(raw: &str) -> anyhow::Result<Self> {
        Self::parse_toml(raw).or_else(|toml_err| {
            Self::parse_json(raw)
                .map_err(|json_err| anyhow!("neither TOML ({toml_err}) nor JSON ({json_err})"))
        })
    }

    pub fn parse_toml(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn parse_json(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}
