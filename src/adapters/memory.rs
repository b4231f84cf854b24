//! In-memory adapter for tests and local experiments.
//!
//! Same contract as the SQLite adapter. The audit side can be switched into a
//! simulated outage to exercise audit-failure paths.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::domain::{AuditEntry, AuthAuditEntry, EntityKind, Record};
use crate::ports::{AuditSink, Persistence, Query};

use super::StorageError;

type RecordKey = (EntityKind, String);

#[derive(Default)]
pub struct InMemoryPersistence {
    records: RwLock<BTreeMap<RecordKey, (u64, Record)>>,
    audit: RwLock<Vec<AuditEntry>>,
    auth_audit: RwLock<Vec<AuthAuditEntry>>,
    next_seq: AtomicU64,
    audit_outage: AtomicBool,
}

impl InMemoryPersistence {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every audit append fail until switched back.
    pub fn set_audit_outage(&self, down: bool) {
        self.audit_outage.store(down, Ordering::SeqCst);
    }

    fn check_audit_available(&self) -> Result<(), StorageError> {
        if self.audit_outage.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("audit store offline".to_string()));
        }
        Ok(())
    }

    fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>, StorageError> {
        lock.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>, StorageError> {
        lock.write().map_err(|_| StorageError::LockPoisoned)
    }

    fn key(entity: EntityKind, id: &str) -> RecordKey {
        (entity, id.to_string())
    }
}

impl Persistence for InMemoryPersistence {
    type Error = StorageError;

    fn insert(&self, entity: EntityKind, id: &str, record: &Record) -> Result<(), Self::Error> {
        let mut records = Self::write(&self.records)?;
        let key = Self::key(entity, id);
        if records.contains_key(&key) {
            return Err(StorageError::Conflict(format!("{entity}/{id}")));
        }
        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
        records.insert(key, (seq, record.clone()));
        Ok(())
    }

    fn fetch(&self, entity: EntityKind, id: &str) -> Result<Option<Record>, Self::Error> {
        let records = Self::read(&self.records)?;
        Ok(records.get(&Self::key(entity, id)).map(|(_, r)| r.clone()))
    }

    fn upsert(&self, entity: EntityKind, id: &str, record: &Record) -> Result<(), Self::Error> {
        let mut records = Self::write(&self.records)?;
        let key = Self::key(entity, id);
        let seq = match records.get(&key) {
            Some((seq, _)) => *seq,
            None => self.next_seq.fetch_add(1, Ordering::SeqCst),
        };
        records.insert(key, (seq, record.clone()));
        Ok(())
    }

    fn remove(&self, entity: EntityKind, id: &str) -> Result<bool, Self::Error> {
        let mut records = Self::write(&self.records)?;
        Ok(records.remove(&Self::key(entity, id)).is_some())
    }

    fn query(&self, entity: EntityKind, query: &Query) -> Result<Vec<Record>, Self::Error> {
        let records = Self::read(&self.records)?;

        let mut matched: Vec<(u64, Record)> = records
            .iter()
            .filter(|((kind, _), (_, record))| *kind == entity && query.matches(record))
            .map(|(_, (seq, record))| (*seq, record.clone()))
            .collect();
        matched.sort_by_key(|(seq, _)| *seq);

        let mut out: Vec<Record> = matched.into_iter().map(|(_, r)| r).collect();
        query.apply_order_and_limit(&mut out);
        Ok(out)
    }

    fn count(&self, entity: EntityKind, query: &Query) -> Result<usize, Self::Error> {
        self.query(entity, query).map(|r| r.len())
    }
}

impl AuditSink for InMemoryPersistence {
    type Error = StorageError;

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), Self::Error> {
        self.check_audit_available()?;
        Self::write(&self.audit)?.push(entry.clone());
        Ok(())
    }

    fn append_auth_audit(&self, entry: &AuthAuditEntry) -> Result<(), Self::Error> {
        self.check_audit_available()?;
        Self::write(&self.auth_audit)?.push(entry.clone());
        Ok(())
    }

    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, Self::Error> {
        Ok(Self::read(&self.audit)?.iter().rev().take(limit).cloned().collect())
    }

    fn recent_auth_audit(&self, limit: usize) -> Result<Vec<AuthAuditEntry>, Self::Error> {
        Ok(Self::read(&self.auth_audit)?
            .iter()
            .rev()
            .take(limit)
            .cloned()
            .collect())
    }

    fn auth_audit_for_email(
        &self,
        email: &str,
        limit: usize,
    ) -> Result<Vec<AuthAuditEntry>, Self::Error> {
        Ok(Self::read(&self.auth_audit)?
            .iter()
            .rev()
            .filter(|e| e.email.as_deref().is_some_and(|m| m.eq_ignore_ascii_case(email)))
            .take(limit)
            .cloned()
            .collect())
    }

    fn audit_count(&self) -> Result<usize, Self::Error> {
        Ok(Self::read(&self.audit)?.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{record_from_value, CallerContext, RequestInfo};
    use crate::ports::SortOrder;
    use serde_json::json;

    #[test]
    fn test_query_keeps_insertion_order() {
        let store = InMemoryPersistence::new();
        for id in ["z", "a", "m"] {
            let r = record_from_value(json!({"id": id, "kind": "x"})).expect("object");
            store.insert(EntityKind::Message, id, &r).expect("insert");
        }

        let ids: Vec<_> = store
            .query(EntityKind::Message, &Query::all())
            .expect("query")
            .into_iter()
            .map(|r| r["id"].clone())
            .collect();
        assert_eq!(ids, vec![json!("z"), json!("a"), json!("m")]);

        let sorted = store
            .query(EntityKind::Message, &Query::all().order_by("id", SortOrder::Ascending).limit(1))
            .expect("query");
        assert_eq!(sorted[0]["id"], "a");
    }

    #[test]
    fn test_audit_outage() {
        let store = InMemoryPersistence::new();
        let entry = AuditEntry::begin(&CallerContext::anonymous(), &RequestInfo::new("GET", "/api/organs"));

        store.set_audit_outage(true);
        assert!(matches!(store.append_audit(&entry), Err(StorageError::Unavailable(_))));
        store.set_audit_outage(false);
        store.append_audit(&entry).expect("append");
        assert_eq!(store.audit_count().expect("count"), 1);
    }
}
