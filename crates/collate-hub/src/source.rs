//! # HTTP Record Source
//!
//! Pulls parents and their records from a JSON REST API:
//!
//! - `GET {base_url}{parents_path}` returns the parent list; each parent's
//!   key is read from `parent_id_field`.
//! - `GET {base_url}{records_path}` with `{parent}` substituted returns one
//!   parent's records.
//!
//! Either response may wrap its array in an envelope, located with a JSON
//! pointer.

use async_trait::async_trait;
use collate_core::{JsonRecord, ParentKey};
use collate_io::{extract_records, RecordSource, SourceError};
use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct HttpSourceConfig {
    pub base_url: String,
    #[serde(default = "default_parents_path")]
    pub parents_path: String,
    /// Must contain `{parent}`.
    #[serde(default = "default_records_path")]
    pub records_path: String,
    #[serde(default)]
    pub parents_pointer: Option<String>,
    #[serde(default)]
    pub records_pointer: Option<String>,
    #[serde(default = "default_parent_id_field")]
    pub parent_id_field: String,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_parents_path() -> String {
    "/parents".to_string()
}
fn default_records_path() -> String {
    "/parents/{parent}/records".to_string()
}
fn default_parent_id_field() -> String {
    "id".to_string()
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

pub struct HttpSource {
    client: reqwest::Client,
    config: HttpSourceConfig,
}

impl HttpSource {
    pub fn new(config: HttpSourceConfig) -> Result<Self, SourceError> {
        if !config.records_path.contains("{parent}") {
            return Err(SourceError::other(format!(
                "records_path '{}' has no {{parent}} placeholder",
                config.records_path
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| SourceError::other(e.to_string()))?;
        Ok(Self { client, config })
    }

    pub fn parents_url(&self) -> String {
        format!(
            "{}{}",
            self.config.base_url.trim_end_matches('/'),
            self.config.parents_path
        )
    }

    pub fn records_url(&self, parent: &ParentKey) -> String {
        let path = self
            .config
            .records_path
            .replace("{parent}", &urlencoding::encode(parent.as_str()));
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn get_json(&self, url: &str) -> Result<Option<serde_json::Value>, SourceError> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| SourceError::other(e.to_string()))?;
        let status = resp.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(SourceError::other(format!("HTTP {} from {}", status, url)));
        }
        let doc = resp
            .json::<serde_json::Value>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))?;
        Ok(Some(doc))
    }
}

/// Read parent keys out of a parents listing.
pub fn parent_keys_from(
    doc: serde_json::Value,
    pointer: Option<&str>,
    id_field: &str,
) -> Result<Vec<ParentKey>, SourceError> {
    extract_records(doc, pointer)?
        .iter()
        .map(|parent| match parent.lookup(id_field) {
            Some(serde_json::Value::String(s)) => Ok(ParentKey::from(s.as_str())),
            Some(serde_json::Value::Number(n)) => Ok(ParentKey::from(n.to_string())),
            _ => Err(SourceError::Decode(format!(
                "parent without a usable '{}' field",
                id_field
            ))),
        })
        .collect()
}

#[async_trait]
impl RecordSource for HttpSource {
    type Record = JsonRecord;

    async fn fetch(&self, parent: &ParentKey) -> Result<Vec<JsonRecord>, SourceError> {
        let url = self.records_url(parent);
        let doc = self
            .get_json(&url)
            .await?
            .ok_or_else(|| SourceError::NotFound(parent.clone()))?;
        extract_records(doc, self.config.records_pointer.as_deref())
    }

    async fn list_parent_keys(&self) -> Result<Vec<ParentKey>, SourceError> {
        let url = self.parents_url();
        let doc = self
            .get_json(&url)
            .await?
            .ok_or_else(|| SourceError::other(format!("parents listing not found at {}", url)))?;
        parent_keys_from(
            doc,
            self.config.parents_pointer.as_deref(),
            &self.config.parent_id_field,
        )
    }

    fn name(&self) -> &str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(base_url: &str) -> HttpSourceConfig {
        serde_json::from_value(json!({ "base_url": base_url })).unwrap()
    }

    #[test]
    fn test_urls() {
        let source = HttpSource::new(config("http://api.local/v1/")).unwrap();
        assert_eq!(source.parents_url(), "http://api.local/v1/parents");
        assert_eq!(
            source.records_url(&"store 7/b".into()),
            "http://api.local/v1/parents/store%207%2Fb/records"
        );
        assert_eq!(
            source.records_url(&"café~1".into()),
            "http://api.local/v1/parents/caf%C3%A9~1/records"
        );
    }

    #[test]
    fn test_records_path_needs_placeholder() {
        let mut cfg = config("http://api.local");
        cfg.records_path = "/records".into();
        assert!(HttpSource::new(cfg).is_err());
    }

    #[test]
    fn test_parent_keys_from_envelope() {
        let doc = json!({ "data": { "stores": [{ "id": 3 }, { "id": "north" }] } });
        let keys = parent_keys_from(doc, Some("/data/stores"), "id").unwrap();
        assert_eq!(keys, vec![ParentKey::from("3"), ParentKey::from("north")]);
    }

    #[test]
    fn test_parent_without_id_is_an_error() {
        let doc = json!([{ "id": 1 }, { "name": "no id" }]);
        assert!(matches!(
            parent_keys_from(doc, None, "id"),
            Err(SourceError::Decode(_))
        ));
    }
}
