use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::registry::HandlerRegistry;
use crate::Error;

fn default_handlers() -> Vec<String> {
    HandlerRegistry::default()
        .names()
        .map(str::to_string)
        .collect()
}

/// Process-wide settings, usually read from a TOML file.
///
/// ```toml
/// handlers = ["directory", "ZIP", "HTTP"]
/// timeout_secs = 30
///
/// [cache]
/// directory = "/var/cache/vsistore"
/// retention_secs = 3600
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Enabled storage handlers, in the order they are asked to recognize
    /// untyped locators.
    #[serde(default = "default_handlers")]
    pub handlers: Vec<String>,
    #[serde(default)]
    pub cache: CacheConfig,
    /// Deadline for each open and retrieve on a storage.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            handlers: default_handlers(),
            cache: CacheConfig::default(),
            timeout_secs: None,
        }
    }
}

impl Config {
    pub fn from_toml(s: &str) -> Result<Self, Error> {
        toml::from_str(s).map_err(|e| Error::InvalidConfig(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self, Error> {
        let s = std::fs::read_to_string(path).map_err(|e| {
            Error::InvalidConfig(format!("unable to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&s)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// A registry holding the configured handlers.
    pub fn registry(&self) -> Result<HandlerRegistry, Error> {
        HandlerRegistry::from_names(&self.handlers)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CacheConfig {
    /// Without a directory, every cache scope uses a temporary directory of
    /// its own.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    /// How long materialized files are kept for reuse by later scopes. Without
    /// it, files are removed when the scope ends.
    #[serde(default)]
    pub retention_secs: Option<u64>,
}

impl CacheConfig {
    pub fn retention(&self) -> Option<Duration> {
        self.retention_secs.map(Duration::from_secs)
    }
}
