//! Pipeline configuration: caching strategy, storage backend, per-kind
//! source and output directories.
//!
//! Loaded from a small TOML file; every field has a default so an empty file
//! (or no file at all) yields a working configuration.

mod strategy;

pub use strategy::CachingStrategy;

use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::source::AssetKind;
use crate::utils::mtime::mtime_ms;

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error when reading `{0}`")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("config file parsing error")]
    Toml(#[from] toml::de::Error),

    #[error("config validation error: {0}")]
    Validation(String),
}

/// Which storage backend holds built artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// Artifacts are files under each kind's output directory.
    #[default]
    Disk,
    /// Artifacts are byte blocks in a shared in-process store.
    Memory,
}

/// Per-asset-kind settings (one for scripts, one for styles).
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KindConfig {
    /// Directory source files are read from
    pub src_dir: PathBuf,
    /// Directory (or key namespace) built artifacts are written to
    pub out_dir: PathBuf,
    /// Artifact file extension, including the dot
    pub extension: String,
    /// Extensions whose files carry `@import` directives that participate
    /// in freshness (e.g. ".less")
    pub preprocessed_extensions: Vec<String>,
}

impl KindConfig {
    fn script_default() -> Self {
        Self {
            src_dir: PathBuf::from("public/javascripts"),
            out_dir: PathBuf::from("public/javascripts/bundle"),
            extension: ".js".to_string(),
            preprocessed_extensions: Vec::new(),
        }
    }

    fn style_default() -> Self {
        Self {
            src_dir: PathBuf::from("public/stylesheets"),
            out_dir: PathBuf::from("public/stylesheets/bundle"),
            extension: ".css".to_string(),
            preprocessed_extensions: vec![".less".to_string()],
        }
    }

    /// Whether a source path is a preprocessed input (import-carrying).
    pub fn is_preprocessed(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        self.preprocessed_extensions
            .iter()
            .any(|ext| name.ends_with(ext.as_str()))
    }
}

impl Default for KindConfig {
    fn default() -> Self {
        Self::script_default()
    }
}

/// Top-level pipeline configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Master switch; when off the host should emit plain source references
    pub enabled: bool,
    /// Caching strategy (always / never / change)
    pub strategy: CachingStrategy,
    /// Maximum build duration in milliseconds; doubles as the staleness
    /// bound for abandoned producer locks
    pub max_build_ms: u64,
    /// How long a request key maps to its manifest. Only needs to cover the
    /// gap between rendering and the browser fetching the artifact
    pub manifest_ttl_ms: u64,
    /// Storage backend for built artifacts
    pub storage: StorageKind,
    /// Script bundle settings
    pub script: KindConfig,
    /// Style bundle settings
    pub style: KindConfig,

    /// Where the config was loaded from, with its mtime at load time.
    /// Lets the host detect edits without re-parsing
    #[serde(skip)]
    config_path: Option<PathBuf>,
    #[serde(skip)]
    config_mtime_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CachingStrategy::default(),
            max_build_ms: 60_000,
            manifest_ttl_ms: 120_000,
            storage: StorageKind::default(),
            script: KindConfig::script_default(),
            style: KindConfig::style_default(),
            config_path: None,
            config_mtime_ms: 0,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    ///
    /// A missing file yields the defaults; a present but malformed file is
    /// an error.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let mut config: Self = toml::from_str(&text)?;
        config.config_path = Some(path.to_path_buf());
        config.config_mtime_ms = mtime_ms(path).unwrap_or(0);
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string (no file identity attached).
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_build_ms == 0 {
            return Err(ConfigError::Validation(
                "max_build_ms must be greater than zero".to_string(),
            ));
        }
        for kind in [AssetKind::Script, AssetKind::Style] {
            let kc = self.kind(kind);
            if !kc.extension.starts_with('.') {
                return Err(ConfigError::Validation(format!(
                    "{kind} extension `{}` must start with a dot",
                    kc.extension
                )));
            }
        }
        Ok(())
    }

    /// Settings for the given asset kind.
    #[inline]
    pub fn kind(&self, kind: AssetKind) -> &KindConfig {
        match kind {
            AssetKind::Script => &self.script,
            AssetKind::Style => &self.style,
        }
    }

    /// Maximum build duration.
    #[inline]
    pub fn max_build(&self) -> Duration {
        Duration::from_millis(self.max_build_ms)
    }

    /// Manifest registry retention.
    #[inline]
    pub fn manifest_ttl(&self) -> Duration {
        Duration::from_millis(self.manifest_ttl_ms)
    }

    /// Check whether the config file changed on disk since it was loaded.
    ///
    /// Also detects the file being created or deleted after load.
    pub fn has_changed(&self) -> bool {
        let Some(path) = &self.config_path else {
            return false;
        };
        match mtime_ms(path) {
            Some(current) => current > self.config_mtime_ms,
            None => self.config_mtime_ms != 0,
        }
    }
}
