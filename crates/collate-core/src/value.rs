//! # Field Values
//!
//! The typed value an accessor extracts from a record, and the
//! [`CollationKey`] the engine sorts by.
//!
//! Values from different sources are loosely typed (a date may arrive as a
//! string, a number as text), so comparisons coerce the other side into the
//! type of the field being examined.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Bool(bool),
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
    /// Nested object (or any other JSON shape). Compared structurally.
    Object(serde_json::Value),
}

impl Value {
    /// Numeric view: numbers as-is, text if it parses as a number.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            Value::Text(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
    }

    /// Timestamp view: dates as-is, text if it looks like a date.
    pub fn as_date(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Date(d) => Some(*d),
            Value::Text(s) => parse_date(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            Value::Text(s) => match s.trim() {
                "true" => Some(true),
                "false" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Equality as used by `Eq` and `AnyOf` filters.
    ///
    /// `self` is the record's value; `wanted` is coerced to its type.
    /// Text compares exactly (case-sensitive).
    pub fn matches(&self, wanted: &Value) -> bool {
        match self {
            Value::Number(n) => wanted.as_number() == Some(*n),
            Value::Bool(b) => wanted.as_bool() == Some(*b),
            Value::Date(d) => wanted.as_date() == Some(*d),
            Value::Text(t) => match wanted {
                Value::Text(w) => t == w,
                Value::Number(n) => t.trim().parse::<f64>().ok() == Some(*n),
                Value::Date(d) => parse_date(t) == Some(*d),
                Value::Bool(b) => t.trim() == if *b { "true" } else { "false" },
                Value::Object(_) => false,
            },
            Value::Object(o) => matches!(wanted, Value::Object(w) if w == o),
        }
    }

    /// Order `self` against a bound of possibly different type.
    ///
    /// Returns `None` when the bound cannot be read as the field's type,
    /// which range filters treat as "does not match".
    pub fn compare_to(&self, bound: &Value) -> Option<Ordering> {
        match self {
            Value::Number(n) => bound.as_number().map(|b| n.total_cmp(&b)),
            Value::Date(d) => bound.as_date().map(|b| d.cmp(&b)),
            Value::Bool(v) => bound.as_bool().map(|b| v.cmp(&b)),
            Value::Text(t) => {
                if let (Some(n), Value::Number(b)) = (t.trim().parse::<f64>().ok(), bound) {
                    return Some(n.total_cmp(b));
                }
                let (a, b) = (self.collation_key(), bound.collation_key());
                (a.rank() == b.rank()).then(|| a.cmp(&b))
            }
            Value::Object(_) => None,
        }
    }

    /// Key used by the sort stage. Date-like text collates as a date.
    pub fn collation_key(&self) -> CollationKey {
        match self {
            Value::Bool(b) => CollationKey::Bool(*b),
            Value::Number(n) => CollationKey::Number(*n),
            Value::Date(d) => CollationKey::Date(*d),
            Value::Text(s) => match parse_date(s) {
                Some(d) => CollationKey::Date(d),
                None => CollationKey::Text(s.to_lowercase()),
            },
            Value::Object(o) => CollationKey::Object(o.to_string()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Bool(b) => write!(f, "{}", b),
            Value::Number(n) => write!(f, "{}", n),
            Value::Date(d) => write!(f, "{}", d.to_rfc3339()),
            Value::Text(s) => write!(f, "{}", s),
            Value::Object(o) => write!(f, "{}", o),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Text(s)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

// =============================================================================
// Collation
// =============================================================================

/// A fully-resolved sort key.
///
/// Keys of different kinds order by a fixed rank:
/// `Bool < Number < Date < Text < Object`. Within a kind the natural order
/// applies (text is compared lowercased). This makes the comparator a total
/// order even for columns that mix types.
#[derive(Debug, Clone)]
pub enum CollationKey {
    Bool(bool),
    Number(f64),
    Date(DateTime<Utc>),
    Text(String),
    Object(String),
}

impl CollationKey {
    #[inline]
    pub fn rank(&self) -> u8 {
        match self {
            CollationKey::Bool(_) => 0,
            CollationKey::Number(_) => 1,
            CollationKey::Date(_) => 2,
            CollationKey::Text(_) => 3,
            CollationKey::Object(_) => 4,
        }
    }
}

impl Ord for CollationKey {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (CollationKey::Bool(a), CollationKey::Bool(b)) => a.cmp(b),
            (CollationKey::Number(a), CollationKey::Number(b)) => a.total_cmp(b),
            (CollationKey::Date(a), CollationKey::Date(b)) => a.cmp(b),
            (CollationKey::Text(a), CollationKey::Text(b)) => a.cmp(b),
            (CollationKey::Object(a), CollationKey::Object(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl PartialOrd for CollationKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for CollationKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for CollationKey {}

// =============================================================================
// Date parsing
// =============================================================================

const NAIVE_DATETIME_FORMATS: [&str; 2] = ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"];

/// Parse the date layouts records commonly carry: RFC 3339, a naive
/// `YYYY-MM-DD[ T]HH:MM:SS[.fff]` (read as UTC), or a bare `YYYY-MM-DD`.
pub fn parse_date(raw: &str) -> Option<DateTime<Utc>> {
    let s = raw.trim();
    // Cheap reject: every accepted layout starts with a 4-digit year.
    if s.len() < 10 || !s.as_bytes()[..4].iter().all(u8::is_ascii_digit) {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for format in NAIVE_DATETIME_FORMATS {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Some(naive.and_utc());
        }
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}
