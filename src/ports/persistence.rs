//! Persistence port: the record backend under the record store.
//!
//! Backends implement the whole trait. Stored records are opaque JSON
//! objects; PHI fields arrive already encrypted.

use std::cmp::Ordering;

use serde_json::Value;

use crate::adapters::StorageError;
use crate::domain::{EntityKind, Record};

/// A single filter condition on a top-level record field.
#[derive(Debug, Clone, PartialEq)]
pub enum Predicate {
    /// Field equals value. `Value::Null` also matches an absent field.
    Eq(String, Value),
    /// Field is greater than or equal to value (numbers, or strings lexically).
    Gte(String, Value),
    /// Field is less than or equal to value.
    Lte(String, Value),
}

impl Predicate {
    #[must_use]
    pub fn field(&self) -> &str {
        match self {
            Self::Eq(f, _) | Self::Gte(f, _) | Self::Lte(f, _) => f,
        }
    }

    #[must_use]
    pub fn value(&self) -> &Value {
        match self {
            Self::Eq(_, v) | Self::Gte(_, v) | Self::Lte(_, v) => v,
        }
    }

    /// Evaluate against a record in memory.
    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        let actual = record.get(self.field()).unwrap_or(&Value::Null);
        match self {
            Self::Eq(_, expected) => values_equal(actual, expected),
            Self::Gte(_, bound) => {
                matches!(compare_values(actual, bound), Some(Ordering::Greater | Ordering::Equal))
            }
            Self::Lte(_, bound) => {
                matches!(compare_values(actual, bound), Some(Ordering::Less | Ordering::Equal))
            }
        }
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        _ => a == b,
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Conjunction of predicates plus ordering and a limit.
///
/// Without an explicit ordering, records come back in creation order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Query {
    pub predicates: Vec<Predicate>,
    pub order_by: Option<(String, SortOrder)>,
    pub limit: Option<usize>,
}

impl Query {
    /// Every record of the entity.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Eq(field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn gte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Gte(field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn lte(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.predicates.push(Predicate::Lte(field.into(), value.into()));
        self
    }

    #[must_use]
    pub fn order_by(mut self, field: impl Into<String>, order: SortOrder) -> Self {
        self.order_by = Some((field.into(), order));
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn matches(&self, record: &Record) -> bool {
        self.predicates.iter().all(|p| p.matches(record))
    }

    /// Fields referenced by predicates and ordering.
    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.predicates
            .iter()
            .map(Predicate::field)
            .chain(self.order_by.iter().map(|(f, _)| f.as_str()))
    }

    /// Sort and truncate an in-memory result set the way backends do.
    pub fn apply_order_and_limit(&self, records: &mut Vec<Record>) {
        if let Some((field, order)) = &self.order_by {
            records.sort_by(|a, b| {
                let ord = compare_values(
                    a.get(field).unwrap_or(&Value::Null),
                    b.get(field).unwrap_or(&Value::Null),
                )
                .unwrap_or(Ordering::Equal);
                match order {
                    SortOrder::Ascending => ord,
                    SortOrder::Descending => ord.reverse(),
                }
            });
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
    }
}

/// Record backend.
///
/// Upserts are atomic per row; there is no multi-row transaction.
pub trait Persistence: Send + Sync {
    type Error: std::error::Error + Into<StorageError> + Send + Sync + 'static;

    /// Insert a new record.
    ///
    /// # Errors
    /// Fails with a conflict if `id` already exists.
    fn insert(&self, entity: EntityKind, id: &str, record: &Record) -> Result<(), Self::Error>;

    fn fetch(&self, entity: EntityKind, id: &str) -> Result<Option<Record>, Self::Error>;

    /// Insert or replace a record in a single transaction.
    fn upsert(&self, entity: EntityKind, id: &str, record: &Record) -> Result<(), Self::Error>;

    /// Remove a record. Returns whether it existed.
    fn remove(&self, entity: EntityKind, id: &str) -> Result<bool, Self::Error>;

    fn query(&self, entity: EntityKind, query: &Query) -> Result<Vec<Record>, Self::Error>;

    fn count(&self, entity: EntityKind, query: &Query) -> Result<usize, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Record {
        crate::domain::record_from_value(value).expect("object")
    }

    #[test]
    fn test_predicates() {
        let r = record(json!({"status": "available", "viabilityHours": 12, "notes": null}));

        assert!(Predicate::Eq("status".into(), json!("available")).matches(&r));
        assert!(Predicate::Eq("viabilityHours".into(), json!(12.0)).matches(&r));
        assert!(Predicate::Eq("notes".into(), Value::Null).matches(&r));
        assert!(Predicate::Eq("missing".into(), Value::Null).matches(&r));
        assert!(Predicate::Gte("viabilityHours".into(), json!(12)).matches(&r));
        assert!(!Predicate::Lte("viabilityHours".into(), json!(4)).matches(&r));
        assert!(!Predicate::Gte("status".into(), json!(3)).matches(&r));
    }

    #[test]
    fn test_order_and_limit() {
        let mut records = vec![
            record(json!({"n": 2})),
            record(json!({"n": 9})),
            record(json!({"n": 5})),
        ];
        Query::all()
            .order_by("n", SortOrder::Descending)
            .limit(2)
            .apply_order_and_limit(&mut records);

        let ns: Vec<_> = records.iter().map(|r| r["n"].clone()).collect();
        assert_eq!(ns, vec![json!(9), json!(5)]);
    }
}
