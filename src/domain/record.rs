//! Record representation and field accessors.
//!
//! Records travel through the core as JSON objects keyed by camelCase field
//! names. Typed views (compatibility profiles, lifecycle states) are parsed
//! out of them where an operation needs them.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// A single entity record: field name → value.
pub type Record = Map<String, Value>;

/// Field carrying the record identifier.
pub const ID_FIELD: &str = "id";
pub const CREATED_AT_FIELD: &str = "createdAt";
pub const UPDATED_AT_FIELD: &str = "updatedAt";
pub const STATUS_FIELD: &str = "status";

/// Typed read access to record fields.
pub trait RecordExt {
    /// String value of a field, if present and a string.
    fn str_field(&self, field: &str) -> Option<&str>;

    /// Numeric value of a field. Numeric strings are accepted.
    fn f64_field(&self, field: &str) -> Option<f64>;

    /// Timestamp value of a field (RFC 3339).
    fn timestamp_field(&self, field: &str) -> Option<DateTime<Utc>>;

    /// List of strings stored either as a JSON array or a comma separated string.
    fn string_list(&self, field: &str) -> Option<Vec<String>>;

    /// The record identifier.
    fn record_id(&self) -> Option<&str> {
        self.str_field(ID_FIELD)
    }
}

impl RecordExt for Record {
    fn str_field(&self, field: &str) -> Option<&str> {
        self.get(field).and_then(Value::as_str)
    }

    fn f64_field(&self, field: &str) -> Option<f64> {
        match self.get(field)? {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        }
        .filter(|v| v.is_finite())
    }

    fn timestamp_field(&self, field: &str) -> Option<DateTime<Utc>> {
        self.str_field(field).and_then(parse_timestamp)
    }

    fn string_list(&self, field: &str) -> Option<Vec<String>> {
        match self.get(field)? {
            Value::Array(items) => Some(
                items
                    .iter()
                    .filter_map(|v| v.as_str().map(str::trim))
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            Value::String(s) => Some(
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect(),
            ),
            // HLA blobs are sometimes stored as {"markers": [...]}.
            Value::Object(obj) => match obj.get("markers") {
                Some(Value::Array(items)) => Some(
                    items
                        .iter()
                        .filter_map(Value::as_str)
                        .map(str::to_string)
                        .collect(),
                ),
                _ => None,
            },
            _ => None,
        }
    }
}

/// Format a timestamp the way records store it (millisecond RFC 3339, `Z`).
///
/// The fixed width keeps lexicographic and chronological order identical,
/// which the storage layer relies on for range predicates.
#[must_use]
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Parse an RFC 3339 timestamp into UTC.
#[must_use]
pub fn parse_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Build a record from a JSON value. Non-objects yield `None`.
#[must_use]
pub fn record_from_value(value: Value) -> Option<Record> {
    match value {
        Value::Object(map) => Some(map),
        _ => None,
    }
}
