//! # Records & Schemas
//!
//! The engine never looks inside a record directly. A [`Schema`] lists the
//! fields it may read, each with an accessor closure; anything not in the
//! schema is unknown to the engine and ignored by sort and filter stages.
//!
//! [`JsonRecord`] + [`FieldSpec`] cover the common case of loosely-typed
//! JSON objects whose field list comes from configuration.

use crate::spec::SpecError;
use crate::value::{parse_date, Value};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

/// Reads one field out of a record. `None` means the field is missing.
pub type Accessor<R> = Arc<dyn Fn(&R) -> Option<Value> + Send + Sync>;

/// A named, readable field.
pub struct Field<R> {
    name: String,
    accessor: Accessor<R>,
    searchable: bool,
}

impl<R> Field<R> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_searchable(&self) -> bool {
        self.searchable
    }

    #[inline]
    pub fn read(&self, record: &R) -> Option<Value> {
        (self.accessor)(record)
    }
}

impl<R> Clone for Field<R> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            accessor: self.accessor.clone(),
            searchable: self.searchable,
        }
    }
}

impl<R> fmt::Debug for Field<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Field")
            .field("name", &self.name)
            .field("searchable", &self.searchable)
            .finish()
    }
}

/// The set of fields the engine can search, filter and sort on.
pub struct Schema<R> {
    fields: Vec<Field<R>>,
}

impl<R> Schema<R> {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    /// Add a field usable by filters and sort keys.
    ///
    /// # Panics
    /// Panics if a field with the same name was already added.
    pub fn field<F>(self, name: &str, accessor: F) -> Self
    where
        F: Fn(&R) -> Option<Value> + Send + Sync + 'static,
    {
        self.push(name, Arc::new(accessor), false)
    }

    /// Add a field that is also matched by free-text search.
    ///
    /// # Panics
    /// Panics if a field with the same name was already added.
    pub fn searchable<F>(self, name: &str, accessor: F) -> Self
    where
        F: Fn(&R) -> Option<Value> + Send + Sync + 'static,
    {
        self.push(name, Arc::new(accessor), true)
    }

    fn push(mut self, name: &str, accessor: Accessor<R>, searchable: bool) -> Self {
        assert!(
            self.get(name).is_none(),
            "Field '{}' declared twice in schema",
            name
        );
        self.fields.push(Field {
            name: name.to_string(),
            accessor,
            searchable,
        });
        self
    }

    pub fn get(&self, name: &str) -> Option<&Field<R>> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn fields(&self) -> &[Field<R>] {
        &self.fields
    }

    pub fn searchable_fields(&self) -> impl Iterator<Item = &Field<R>> {
        self.fields.iter().filter(|f| f.searchable)
    }
}

impl<R> Default for Schema<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R> Clone for Schema<R> {
    fn clone(&self) -> Self {
        Self {
            fields: self.fields.clone(),
        }
    }
}

impl<R> fmt::Debug for Schema<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schema").field("fields", &self.fields).finish()
    }
}

// =============================================================================
// JSON records
// =============================================================================

/// A record backed by a JSON object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JsonRecord(pub serde_json::Value);

impl JsonRecord {
    /// Look up a dotted path (`"store.address.city"`) or a JSON pointer
    /// (`"/store/address/city"`).
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        if path.starts_with('/') {
            return self.0.pointer(path);
        }
        path.split('.').try_fold(&self.0, |node, segment| match node {
            serde_json::Value::Object(map) => map.get(segment),
            serde_json::Value::Array(items) => segment
                .parse::<usize>()
                .ok()
                .and_then(|i| items.get(i)),
            _ => None,
        })
    }
}

impl From<serde_json::Value> for JsonRecord {
    fn from(value: serde_json::Value) -> Self {
        Self(value)
    }
}

/// How a raw JSON value is read for a field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Follow the JSON type: strings are text, numbers numbers, and so on.
    #[default]
    Auto,
    Text,
    Number,
    Bool,
    /// Strings in any layout [`parse_date`] accepts; numbers are epoch
    /// milliseconds.
    Date,
    Object,
}

impl FieldKind {
    /// Coerce a raw JSON value. `null` and unreadable values are missing.
    pub fn coerce(self, raw: &serde_json::Value) -> Option<Value> {
        use serde_json::Value as Json;

        if raw.is_null() {
            return None;
        }
        match self {
            FieldKind::Auto => Some(match raw {
                Json::Bool(b) => Value::Bool(*b),
                Json::Number(n) => Value::Number(n.as_f64()?),
                Json::String(s) => Value::Text(s.clone()),
                other => Value::Object(other.clone()),
            }),
            FieldKind::Text => match raw {
                Json::String(s) => Some(Value::Text(s.clone())),
                Json::Number(n) => Some(Value::Text(n.to_string())),
                Json::Bool(b) => Some(Value::Text(b.to_string())),
                _ => None,
            },
            FieldKind::Number => match raw {
                Json::Number(n) => n.as_f64().map(Value::Number),
                Json::String(s) => s.trim().parse::<f64>().ok().map(Value::Number),
                _ => None,
            },
            FieldKind::Bool => match raw {
                Json::Bool(b) => Some(Value::Bool(*b)),
                Json::String(s) => Value::from(s.as_str()).as_bool().map(Value::Bool),
                _ => None,
            },
            FieldKind::Date => match raw {
                Json::String(s) => parse_date(s).map(Value::Date),
                Json::Number(n) => n
                    .as_i64()
                    .and_then(chrono::DateTime::from_timestamp_millis)
                    .map(Value::Date),
                _ => None,
            },
            FieldKind::Object => Some(Value::Object(raw.clone())),
        }
    }
}

/// Declarative description of one JSON field, loadable from config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    /// Dotted path or JSON pointer; defaults to `name`.
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub kind: FieldKind,
    #[serde(default)]
    pub searchable: bool,
}

impl FieldSpec {
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            path: None,
            kind,
            searchable: false,
        }
    }

    pub fn searchable(mut self) -> Self {
        self.searchable = true;
        self
    }

    pub fn at(mut self, path: &str) -> Self {
        self.path = Some(path.to_string());
        self
    }
}

impl Schema<JsonRecord> {
    /// Build a schema for JSON records from field specs.
    pub fn from_specs(specs: &[FieldSpec]) -> Result<Self, SpecError> {
        let mut seen = HashSet::new();
        let mut schema = Schema::new();
        for spec in specs {
            if spec.name.trim().is_empty() {
                return Err(SpecError::EmptyFieldName);
            }
            if !seen.insert(spec.name.as_str()) {
                return Err(SpecError::DuplicateField(spec.name.clone()));
            }
            let path = spec.path.clone().unwrap_or_else(|| spec.name.clone());
            let kind = spec.kind;
            let accessor = move |record: &JsonRecord| {
                record.lookup(&path).and_then(|raw| kind.coerce(raw))
            };
            schema = if spec.searchable {
                schema.searchable(&spec.name, accessor)
            } else {
                schema.field(&spec.name, accessor)
            };
        }
        Ok(schema)
    }

    /// Field specs for every top-level key seen in `records`, in first-seen
    /// order. Keys holding a string anywhere are searchable.
    pub fn infer_specs(records: &[JsonRecord]) -> Vec<FieldSpec> {
        let mut specs: Vec<FieldSpec> = Vec::new();
        for record in records {
            let Some(map) = record.0.as_object() else {
                continue;
            };
            for (key, raw) in map {
                let pos = match specs.iter().position(|s| &s.name == key) {
                    Some(pos) => pos,
                    None => {
                        specs.push(FieldSpec::new(key, FieldKind::Auto));
                        specs.len() - 1
                    }
                };
                if raw.is_string() {
                    specs[pos].searchable = true;
                }
            }
        }
        specs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn promo() -> JsonRecord {
        JsonRecord(json!({
            "id": 7,
            "title": "Spring Sale",
            "discount": "15",
            "active": true,
            "starts_at": "2024-04-01",
            "store": { "name": "Downtown", "tags": ["new", "flagship"] },
            "note": null
        }))
    }

    #[test]
    fn test_lookup_dotted_path_and_pointer() {
        let r = promo();
        assert_eq!(r.lookup("store.name"), Some(&json!("Downtown")));
        assert_eq!(r.lookup("store.tags.1"), Some(&json!("flagship")));
        assert_eq!(r.lookup("/store/tags/0"), Some(&json!("new")));
        assert_eq!(r.lookup("store.missing"), None);
    }

    #[test]
    fn test_kinds_coerce_raw_values() {
        let r = promo();
        let schema = Schema::from_specs(&[
            FieldSpec::new("discount", FieldKind::Number),
            FieldSpec::new("starts_at", FieldKind::Date),
            FieldSpec::new("id", FieldKind::Text),
            FieldSpec::new("store", FieldKind::Object),
            FieldSpec::new("note", FieldKind::Auto),
        ])
        .unwrap();

        let read = |name: &str| schema.get(name).unwrap().read(&r);
        assert_eq!(read("discount"), Some(Value::Number(15.0)));
        assert!(matches!(read("starts_at"), Some(Value::Date(_))));
        assert_eq!(read("id"), Some(Value::from("7")));
        assert!(matches!(read("store"), Some(Value::Object(_))));
        assert_eq!(read("note"), None);
    }

    #[test]
    fn test_path_overrides_name() {
        let schema =
            Schema::from_specs(&[FieldSpec::new("store_name", FieldKind::Text).at("store.name")])
                .unwrap();
        let value = schema.get("store_name").unwrap().read(&promo());
        assert_eq!(value, Some(Value::from("Downtown")));
    }

    #[test]
    fn test_searchable_flag() {
        let schema = Schema::from_specs(&[
            FieldSpec::new("title", FieldKind::Text).searchable(),
            FieldSpec::new("discount", FieldKind::Number),
        ])
        .unwrap();
        let names: Vec<&str> = schema.searchable_fields().map(|f| f.name()).collect();
        assert_eq!(names, vec!["title"]);
    }

    #[test]
    fn test_duplicate_spec_is_rejected() {
        let err = Schema::from_specs(&[
            FieldSpec::new("title", FieldKind::Text),
            FieldSpec::new("title", FieldKind::Auto),
        ])
        .unwrap_err();
        assert_eq!(err, SpecError::DuplicateField("title".into()));
    }

    #[test]
    #[should_panic(expected = "declared twice")]
    fn test_builder_panics_on_duplicate() {
        let _ = Schema::<JsonRecord>::new()
            .field("a", |_| None)
            .field("a", |_| None);
    }

    #[test]
    fn test_infer_specs_from_records() {
        let records = vec![
            JsonRecord(json!({ "title": "A", "rank": 1 })),
            JsonRecord(json!({ "rank": null, "code": "x7", "title": null })),
            JsonRecord(json!("not an object")),
        ];
        let specs = Schema::infer_specs(&records);
        let names: Vec<&str> = specs.iter().map(|s| s.name.as_str()).collect();
        // Object keys iterate in sorted order.
        assert_eq!(names, vec!["rank", "title", "code"]);
        assert!(!specs[0].searchable);
        assert!(specs[1].searchable);
        assert!(specs[2].searchable);
        assert!(Schema::from_specs(&specs).is_ok());
    }

    #[test]
    fn test_field_spec_defaults() {
        let spec: FieldSpec = serde_json::from_str(r#"{"name": "title"}"#).unwrap();
        assert_eq!(spec, FieldSpec::new("title", FieldKind::Auto));
        let spec: FieldSpec =
            serde_json::from_str(r#"{"name": "title", "kind": "text", "searchable": true}"#)
                .unwrap();
        assert_eq!(spec, FieldSpec::new("title", FieldKind::Text).searchable());
    }
}
