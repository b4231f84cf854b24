//! SQLite adapter: implementation of `Persistence` and `AuditSink`.
//!
//! Records of every entity live in one `records` table as JSON bodies and are
//! filtered with `json_extract`. PHI fields inside the bodies are already
//! envelopes when they get here.
//!
//! # Append-only audit tables
//!
//! `audit_log` and `auth_audit_log` carry `BEFORE UPDATE` / `BEFORE DELETE`
//! triggers that abort, so entries cannot be changed even through a raw
//! connection.
//!
//! # Mutex Behavior
//!
//! The connection is protected by a `Mutex`. A poisoned mutex surfaces as
//! `StorageError::LockPoisoned` on every later call instead of a panic.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, ErrorCode, OptionalExtension};
use serde_json::Value;

use crate::domain::{
    format_timestamp, AuditEntry, AuthAuditEntry, EntityKind, Record, CREATED_AT_FIELD,
    UPDATED_AT_FIELD,
};
use crate::ports::{AuditSink, Persistence, Predicate, Query, SortOrder};

/// Error type for storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Record already exists: {0}")]
    Conflict(String),

    #[error("Invalid field name: {0}")]
    InvalidField(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("Storage unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// SQLite persistence adapter.
pub struct SqlitePersistence {
    conn: Mutex<Connection>,
}

impl SqlitePersistence {
    /// Open (or create) a database file.
    ///
    /// # Errors
    /// Returns error if database cannot be opened or initialized.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let conn = Connection::open(path)?;
        Self::with_connection(conn)
    }

    /// Create an in-memory SQLite database (for testing).
    ///
    /// # Errors
    /// Returns error if database cannot be created.
    pub fn in_memory() -> Result<Self, StorageError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, StorageError> {
        let storage = Self {
            conn: Mutex::new(conn),
        };
        storage.init_schema()?;
        Ok(storage)
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StorageError> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    /// Initialize the database schema.
    fn init_schema(&self) -> Result<(), StorageError> {
        let conn = self.lock()?;

        conn.execute_batch(
            r"
            CREATE TABLE IF NOT EXISTS records (
                entity TEXT NOT NULL,
                id TEXT NOT NULL,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (entity, id)
            );

            CREATE INDEX IF NOT EXISTS idx_records_entity_created
                ON records(entity, created_at);

            CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                request_id TEXT NOT NULL,
                user_id TEXT,
                action TEXT NOT NULL,
                category TEXT NOT NULL,
                entity_type TEXT,
                entity_id TEXT,
                phi_accessed INTEGER NOT NULL,
                success INTEGER NOT NULL,
                entry TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_audit_entity
                ON audit_log(entity_type, entity_id);

            CREATE TRIGGER IF NOT EXISTS audit_log_no_update
                BEFORE UPDATE ON audit_log
                BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;

            CREATE TRIGGER IF NOT EXISTS audit_log_no_delete
                BEFORE DELETE ON audit_log
                BEGIN SELECT RAISE(ABORT, 'audit_log is append-only'); END;

            CREATE TABLE IF NOT EXISTS auth_audit_log (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                timestamp TEXT NOT NULL,
                event TEXT NOT NULL,
                email TEXT,
                success INTEGER NOT NULL,
                entry TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_auth_audit_email
                ON auth_audit_log(email);

            CREATE TRIGGER IF NOT EXISTS auth_audit_log_no_update
                BEFORE UPDATE ON auth_audit_log
                BEGIN SELECT RAISE(ABORT, 'auth_audit_log is append-only'); END;

            CREATE TRIGGER IF NOT EXISTS auth_audit_log_no_delete
                BEFORE DELETE ON auth_audit_log
                BEGIN SELECT RAISE(ABORT, 'auth_audit_log is append-only'); END;
            ",
        )?;

        Ok(())
    }

    /// Run a raw statement. Only used to prove the audit triggers hold.
    #[cfg(test)]
    fn execute_raw(&self, sql: &str) -> Result<usize, StorageError> {
        Ok(self.lock()?.execute(sql, [])?)
    }
}

fn is_valid_field(field: &str) -> bool {
    !field.is_empty() && field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn json_path(field: &str) -> Result<String, StorageError> {
    if !is_valid_field(field) {
        return Err(StorageError::InvalidField(field.to_string()));
    }
    Ok(format!("json_extract(body, '$.{field}')"))
}

fn to_sql_value(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => SqlValue::Real(n.as_f64().unwrap_or_default()),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        Value::Array(_) | Value::Object(_) => SqlValue::Text(value.to_string()),
    }
}

/// `WHERE ... ORDER BY ... LIMIT ...` for a query, plus its bound values.
fn query_clause(entity: EntityKind, query: &Query) -> Result<(String, Vec<SqlValue>), StorageError> {
    let mut sql = String::from(" WHERE entity = ?");
    let mut values = vec![SqlValue::Text(entity.as_str().to_string())];

    for predicate in &query.predicates {
        let path = json_path(predicate.field())?;
        match predicate {
            Predicate::Eq(_, Value::Null) => {
                sql.push_str(&format!(" AND {path} IS NULL"));
            }
            Predicate::Eq(_, v) => {
                sql.push_str(&format!(" AND {path} = ?"));
                values.push(to_sql_value(v));
            }
            Predicate::Gte(_, v) => {
                sql.push_str(&format!(" AND {path} >= ?"));
                values.push(to_sql_value(v));
            }
            Predicate::Lte(_, v) => {
                sql.push_str(&format!(" AND {path} <= ?"));
                values.push(to_sql_value(v));
            }
        }
    }

    match &query.order_by {
        Some((field, order)) => {
            let direction = match order {
                SortOrder::Ascending => "ASC",
                SortOrder::Descending => "DESC",
            };
            sql.push_str(&format!(" ORDER BY {} {direction}, rowid ASC", json_path(field)?));
        }
        None => sql.push_str(" ORDER BY created_at ASC, rowid ASC"),
    }

    if let Some(limit) = query.limit {
        sql.push_str(" LIMIT ?");
        values.push(SqlValue::Integer(i64::try_from(limit).unwrap_or(i64::MAX)));
    }

    Ok((sql, values))
}

fn timestamps(record: &Record) -> (String, String) {
    let now = format_timestamp(chrono::Utc::now());
    let created = record
        .get(CREATED_AT_FIELD)
        .and_then(Value::as_str)
        .map_or_else(|| now.clone(), str::to_string);
    let updated = record
        .get(UPDATED_AT_FIELD)
        .and_then(Value::as_str)
        .map_or(now, str::to_string);
    (created, updated)
}

fn parse_body(body: &str) -> Result<Record, StorageError> {
    match serde_json::from_str::<Value>(body)? {
        Value::Object(map) => Ok(map),
        _ => Err(StorageError::Serialization(
            "stored body is not an object".to_string(),
        )),
    }
}

impl Persistence for SqlitePersistence {
    type Error = StorageError;

    fn insert(&self, entity: EntityKind, id: &str, record: &Record) -> Result<(), Self::Error> {
        let conn = self.lock()?;
        let body = serde_json::to_string(record)?;
        let (created, updated) = timestamps(record);

        let result = conn.execute(
            "INSERT INTO records (entity, id, body, created_at, updated_at) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity.as_str(), id, body, created, updated],
        );

        match result {
            Ok(_) => {
                tracing::debug!(entity = entity.as_str(), "Inserted record");
                Ok(())
            }
            Err(rusqlite::Error::SqliteFailure(e, _)) if e.code == ErrorCode::ConstraintViolation => {
                Err(StorageError::Conflict(format!("{entity}/{id}")))
            }
            Err(e) => Err(e.into()),
        }
    }

    fn fetch(&self, entity: EntityKind, id: &str) -> Result<Option<Record>, Self::Error> {
        let conn = self.lock()?;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM records WHERE entity = ?1 AND id = ?2",
                params![entity.as_str(), id],
                |row| row.get(0),
            )
            .optional()?;

        body.as_deref().map(parse_body).transpose()
    }

    fn upsert(&self, entity: EntityKind, id: &str, record: &Record) -> Result<(), Self::Error> {
        let mut conn = self.lock()?;
        let body = serde_json::to_string(record)?;
        let (created, updated) = timestamps(record);

        let tx = conn.transaction()?;
        tx.execute(
            r"
            INSERT INTO records (entity, id, body, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5)
            ON CONFLICT(entity, id) DO UPDATE SET
                body = excluded.body,
                updated_at = excluded.updated_at
            ",
            params![entity.as_str(), id, body, created, updated],
        )?;
        tx.commit()?;

        tracing::debug!(entity = entity.as_str(), "Upserted record");
        Ok(())
    }

    fn remove(&self, entity: EntityKind, id: &str) -> Result<bool, Self::Error> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM records WHERE entity = ?1 AND id = ?2",
            params![entity.as_str(), id],
        )?;
        Ok(removed > 0)
    }

    fn query(&self, entity: EntityKind, query: &Query) -> Result<Vec<Record>, Self::Error> {
        let (clause, values) = query_clause(entity, query)?;
        let conn = self.lock()?;

        let mut stmt = conn.prepare(&format!("SELECT body FROM records{clause}"))?;
        let bodies = stmt
            .query_map(params_from_iter(values.iter()), |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        bodies.iter().map(|b| parse_body(b)).collect()
    }

    fn count(&self, entity: EntityKind, query: &Query) -> Result<usize, Self::Error> {
        let unbounded = Query {
            order_by: None,
            limit: None,
            ..query.clone()
        };
        let (clause, values) = query_clause(entity, &unbounded)?;
        let conn = self.lock()?;

        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM records{clause}"),
            params_from_iter(values.iter()),
            |row| row.get(0),
        )?;

        let count = usize::try_from(count).unwrap_or_default();
        Ok(query.limit.map_or(count, |limit| count.min(limit)))
    }
}

impl AuditSink for SqlitePersistence {
    type Error = StorageError;

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), Self::Error> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO audit_log (
                id, timestamp, request_id, user_id, action, category,
                entity_type, entity_id, phi_accessed, success, entry
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            ",
            params![
                entry.id,
                format_timestamp(entry.timestamp),
                entry.request_id,
                entry.user_id,
                entry.action.as_str(),
                entry.category.as_str(),
                entry.entity_type,
                entry.entity_id,
                entry.phi_accessed,
                entry.success,
                serde_json::to_string(entry)?,
            ],
        )?;
        Ok(())
    }

    fn append_auth_audit(&self, entry: &AuthAuditEntry) -> Result<(), Self::Error> {
        let conn = self.lock()?;
        conn.execute(
            r"
            INSERT INTO auth_audit_log (id, timestamp, event, email, success, entry)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ",
            params![
                entry.id,
                format_timestamp(entry.timestamp),
                entry.event.as_str(),
                entry.email.as_deref().map(str::to_ascii_lowercase),
                entry.success,
                serde_json::to_string(entry)?,
            ],
        )?;
        Ok(())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, Self::Error> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare("SELECT entry FROM audit_log ORDER BY seq DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StorageError::from))
            .collect()
    }

    fn recent_auth_audit(&self, limit: usize) -> Result<Vec<AuthAuditEntry>, Self::Error> {
        let conn = self.lock()?;
        let mut stmt =
            conn.prepare("SELECT entry FROM auth_audit_log ORDER BY seq DESC LIMIT ?1")?;
        let rows = stmt
            .query_map(params![i64::try_from(limit).unwrap_or(i64::MAX)], |row| {
                row.get::<_, String>(0)
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StorageError::from))
            .collect()
    }

    fn auth_audit_for_email(
        &self,
        email: &str,
        limit: usize,
    ) -> Result<Vec<AuthAuditEntry>, Self::Error> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry FROM auth_audit_log WHERE email = ?1 ORDER BY seq DESC LIMIT ?2",
        )?;
        let rows = stmt
            .query_map(
                params![
                    email.to_ascii_lowercase(),
                    i64::try_from(limit).unwrap_or(i64::MAX)
                ],
                |row| row.get::<_, String>(0),
            )?
            .collect::<Result<Vec<_>, _>>()?;

        rows.iter()
            .map(|json| serde_json::from_str(json).map_err(StorageError::from))
            .collect()
    }

    fn audit_count(&self) -> Result<usize, Self::Error> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM audit_log", [], |row| row.get(0))?;
        Ok(usize::try_from(count).unwrap_or_default())
    }
}
