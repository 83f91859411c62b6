//! # Record Sources
//!
//! The abstraction over every place records come from. A source knows how
//! to fetch the children of one parent key and, optionally, how to list
//! the parent keys it serves. Aggregation and querying never depend on
//! what is behind it.

use async_trait::async_trait;
use collate_core::{JsonRecord, ParentKey};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

// =============================================================================
// Core Trait
// =============================================================================

/// Why a fetch or listing failed.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("parent '{0}' not found")]
    NotFound(ParentKey),
    #[error("parent key '{0}' is not valid for this source")]
    InvalidKey(ParentKey),
    #[error("listing parents is not supported by this source")]
    Unsupported,
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid payload: {0}")]
    Decode(String),
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    pub fn other(msg: impl Into<String>) -> Self {
        SourceError::Other(msg.into())
    }
}

/// A provider of records grouped under parent keys.
///
/// Implementations must be safe to call concurrently: the aggregator
/// issues many `fetch` calls at once.
#[async_trait]
pub trait RecordSource: Send + Sync {
    type Record: Send + Sync + 'static;

    /// Fetch every record belonging to `parent`.
    async fn fetch(&self, parent: &ParentKey) -> Result<Vec<Self::Record>, SourceError>;

    /// Enumerate the parent keys this source serves.
    async fn list_parent_keys(&self) -> Result<Vec<ParentKey>, SourceError> {
        Err(SourceError::Unsupported)
    }

    /// Short name used in logs.
    fn name(&self) -> &str {
        "source"
    }
}

#[async_trait]
impl<S: RecordSource + ?Sized> RecordSource for Arc<S> {
    type Record = S::Record;

    async fn fetch(&self, parent: &ParentKey) -> Result<Vec<Self::Record>, SourceError> {
        (**self).fetch(parent).await
    }

    async fn list_parent_keys(&self) -> Result<Vec<ParentKey>, SourceError> {
        (**self).list_parent_keys().await
    }

    fn name(&self) -> &str {
        (**self).name()
    }
}

// =============================================================================
// FnSource
// =============================================================================

/// A source backed by an async closure. Mostly for embedding and tests.
pub struct FnSource<F> {
    fetch: F,
    parents: Option<Vec<ParentKey>>,
}

impl<F> FnSource<F> {
    pub fn new(fetch: F) -> Self {
        Self {
            fetch,
            parents: None,
        }
    }

    /// Fixed answer for [`RecordSource::list_parent_keys`].
    pub fn with_parents<K: Into<ParentKey>>(mut self, keys: impl IntoIterator<Item = K>) -> Self {
        self.parents = Some(keys.into_iter().map(Into::into).collect());
        self
    }
}

#[async_trait]
impl<F, Fut, R> RecordSource for FnSource<F>
where
    F: Fn(ParentKey) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Vec<R>, SourceError>> + Send,
    R: Send + Sync + 'static,
{
    type Record = R;

    async fn fetch(&self, parent: &ParentKey) -> Result<Vec<R>, SourceError> {
        (self.fetch)(parent.clone()).await
    }

    async fn list_parent_keys(&self) -> Result<Vec<ParentKey>, SourceError> {
        self.parents.clone().ok_or(SourceError::Unsupported)
    }

    fn name(&self) -> &str {
        "fn"
    }
}

// =============================================================================
// JsonDirSource
// =============================================================================

/// Reads `<dir>/<parent>.json`. Each file holds a JSON array of records,
/// or an object with the array under `pointer`.
#[derive(Debug, Clone)]
pub struct JsonDirSource {
    dir: PathBuf,
    pointer: Option<String>,
}

impl JsonDirSource {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            pointer: None,
        }
    }

    /// JSON pointer (`/data/items`) to the record array inside each file.
    pub fn with_pointer(mut self, pointer: &str) -> Self {
        self.pointer = Some(pointer.to_string());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, parent: &ParentKey) -> Result<PathBuf, SourceError> {
        let key = parent.as_str();
        if key.is_empty() || key.contains(['/', '\\']) || key == "." || key == ".." {
            return Err(SourceError::InvalidKey(parent.clone()));
        }
        Ok(self.dir.join(format!("{}.json", key)))
    }
}

/// Pull a record array out of a decoded document.
pub fn extract_records(
    doc: serde_json::Value,
    pointer: Option<&str>,
) -> Result<Vec<JsonRecord>, SourceError> {
    let node = match pointer {
        Some(p) => doc
            .pointer(p)
            .cloned()
            .ok_or_else(|| SourceError::Decode(format!("no value at '{}'", p)))?,
        None => doc,
    };
    match node {
        serde_json::Value::Array(items) => Ok(items.into_iter().map(JsonRecord).collect()),
        other => Err(SourceError::Decode(format!(
            "expected an array of records, found {}",
            json_kind(&other)
        ))),
    }
}

fn json_kind(v: &serde_json::Value) -> &'static str {
    match v {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

#[async_trait]
impl RecordSource for JsonDirSource {
    type Record = JsonRecord;

    async fn fetch(&self, parent: &ParentKey) -> Result<Vec<JsonRecord>, SourceError> {
        let path = self.path_for(parent)?;
        let bytes = match tokio::fs::read(&path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(SourceError::NotFound(parent.clone()))
            }
            Err(e) => return Err(e.into()),
        };
        let doc: serde_json::Value =
            serde_json::from_slice(&bytes).map_err(|e| SourceError::Decode(e.to_string()))?;
        extract_records(doc, self.pointer.as_deref())
    }

    /// File stems of every `*.json` in the directory, sorted.
    async fn list_parent_keys(&self) -> Result<Vec<ParentKey>, SourceError> {
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        let mut keys = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                keys.push(ParentKey::from(stem));
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn name(&self) -> &str {
        "json-dir"
    }
}
