//! # Hub Configuration
//!
//! Loaded from `collate-hub.toml`. Every table and key is optional.
//!
//! ```toml
//! [server]
//! bind = "127.0.0.1:3000"
//!
//! [source]
//! kind = "http"
//! base_url = "https://promos.example.com/api"
//! records_path = "/stores/{parent}/promotions"
//!
//! [aggregator]
//! concurrency = 8
//! fetch_timeout_ms = 5000
//!
//! [[schema.fields]]
//! name = "title"
//! kind = "text"
//! searchable = true
//! ```

use crate::source::HttpSourceConfig;
use collate_core::FieldSpec;
use collate_io::AggregatorConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Toml(#[from] toml::de::Error),
}

#[derive(Deserialize, Default, Clone, Debug)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub aggregator: AggregatorConfig,
    #[serde(default)]
    pub schema: SchemaConfig,
}

#[derive(Deserialize, Clone, Debug)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Aggregate every parent once at startup.
    #[serde(default = "default_refresh_on_start")]
    pub refresh_on_start: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            refresh_on_start: default_refresh_on_start(),
        }
    }
}

#[derive(Deserialize, Clone, Debug)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceConfig {
    /// One `<parent>.json` file per parent.
    Dir {
        #[serde(default = "default_dir")]
        dir: PathBuf,
        #[serde(default)]
        pointer: Option<String>,
    },
    Http(HttpSourceConfig),
}

impl Default for SourceConfig {
    fn default() -> Self {
        SourceConfig::Dir {
            dir: default_dir(),
            pointer: None,
        }
    }
}

#[derive(Deserialize, Default, Clone, Debug)]
pub struct SchemaConfig {
    #[serde(default)]
    pub fields: Vec<FieldSpec>,
}

fn default_bind() -> String {
    "127.0.0.1:3000".to_string()
}
fn default_refresh_on_start() -> bool {
    true
}
fn default_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Config {
    /// Read `path`, or fall back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(toml::from_str(&content)?)
    }
}
