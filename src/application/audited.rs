//! Audited store decorator.
//!
//! Mutations passing through [`AuditedStore`] produce a before/after diff.
//! Inside an audit interceptor the diff joins the request's entry; outside
//! one, the decorator records a standalone entry for the mutation itself,
//! failures included. Reads are left to the interceptor, except exports.

use std::sync::Arc;

use serde_json::Value;

use crate::domain::{
    changed_fields, schema_for, AuditEntry, EntityKind, MutationDiff, Operation, OperationContext,
    Record, RecordExt, RequestInfo,
};
use crate::ports::{AuditRecorder, EntityStore, Query};
use crate::Result;

pub struct AuditedStore<S> {
    inner: S,
    recorder: Arc<dyn AuditRecorder>,
}

impl<S: EntityStore> AuditedStore<S> {
    pub fn new(inner: S, recorder: Arc<dyn AuditRecorder>) -> Self {
        Self { inner, recorder }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn standalone_entry(ctx: &OperationContext, request: RequestInfo) -> AuditEntry {
        let request = request.with_request_id(ctx.request_id.clone());
        AuditEntry::begin(&ctx.caller, &request)
    }

    /// Hand the outcome of a mutation to the audit trail.
    fn audit_mutation<T>(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        operation: Operation,
        id: Option<&str>,
        outcome: &Result<T>,
        diff: Option<MutationDiff>,
    ) {
        if ctx.is_scoped() {
            if let Some(diff) = diff {
                ctx.capture_mutation(diff);
            }
            return;
        }

        let entry = Self::standalone_entry(ctx, RequestInfo::for_operation(entity, operation, id));
        let entry = match (outcome, diff) {
            (Ok(_), Some(diff)) => {
                let entity_id = diff.entity_id.clone();
                entry.succeeded(None, entity_id).with_mutation(&diff)
            }
            (Ok(_), None) => entry.succeeded(None, id.map(str::to_string)),
            (Err(e), _) => entry.failed(e.code(), e.to_string()),
        };
        self.recorder.record(entry);
    }

    fn diff(
        entity: EntityKind,
        entity_id: Option<String>,
        before: Option<Record>,
        after: Option<Record>,
    ) -> MutationDiff {
        let changed = changed_fields(before.as_ref(), after.as_ref());
        MutationDiff {
            entity,
            entity_id,
            before,
            after,
            changed_fields: changed,
        }
    }
}

impl<S: EntityStore> EntityStore for AuditedStore<S> {
    fn create(&self, ctx: &OperationContext, entity: EntityKind, data: Record) -> Result<Record> {
        let outcome = self.inner.create(ctx, entity, data);
        let diff = outcome.as_ref().ok().map(|after| {
            let id = after.record_id().map(str::to_string);
            Self::diff(entity, id, None, Some(after.clone()))
        });
        let id = outcome.as_ref().ok().and_then(|r| r.record_id());
        self.audit_mutation(ctx, entity, Operation::Create, id, &outcome, diff);
        outcome
    }

    fn get(&self, ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<Record> {
        self.inner.get(ctx, entity, id)
    }

    fn update(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        id: &str,
        changes: Record,
    ) -> Result<Record> {
        let outcome = self
            .inner
            .get(ctx, entity, id)
            .and_then(|before| Ok((before, self.inner.update(ctx, entity, id, changes)?)));

        let diff = outcome.as_ref().ok().map(|(before, after)| {
            Self::diff(entity, Some(id.to_string()), Some(before.clone()), Some(after.clone()))
        });
        self.audit_mutation(ctx, entity, Operation::Update, Some(id), &outcome, diff);
        outcome.map(|(_, after)| after)
    }

    fn delete(&self, ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<()> {
        let outcome = self.inner.get(ctx, entity, id).and_then(|before| {
            self.inner.delete(ctx, entity, id)?;
            // A soft delete leaves the row behind with its new status.
            let after = if schema_for(entity).soft_delete {
                Some(self.inner.get(ctx, entity, id)?)
            } else {
                None
            };
            Ok((before, after))
        });

        let diff = outcome.as_ref().ok().map(|(before, after)| {
            Self::diff(entity, Some(id.to_string()), Some(before.clone()), after.clone())
        });
        self.audit_mutation(ctx, entity, Operation::Delete, Some(id), &outcome, diff);
        outcome.map(|_| ())
    }

    fn list(&self, ctx: &OperationContext, entity: EntityKind, query: &Query) -> Result<Vec<Record>> {
        self.inner.list(ctx, entity, query)
    }

    fn search(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        self.inner.search(ctx, entity, field, value)
    }

    fn export(&self, ctx: &OperationContext, entity: EntityKind) -> Result<Vec<Record>> {
        let outcome = self.inner.export(ctx, entity);
        if !ctx.is_scoped() {
            let entry = Self::standalone_entry(ctx, RequestInfo::for_export(entity))
                .with_target(entity, None);
            let entry = match &outcome {
                Ok(records) => entry.succeeded(Some(records.len()), None),
                Err(e) => entry.failed(e.code(), e.to_string()),
            };
            self.recorder.record(entry);
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::cipher::AesGcmPhiCipher;
    use crate::adapters::keyring::StaticKeyProvider;
    use crate::adapters::memory::InMemoryPersistence;
    use crate::application::record_store::PhiRecordStore;
    use crate::domain::{record_from_value, AuditAction, AuthAuditEntry, CallerContext, Role, REDACTED};
    use crate::OrganGuardError;
    use serde_json::json;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingRecorder {
        entries: Mutex<Vec<AuditEntry>>,
    }

    impl AuditRecorder for CollectingRecorder {
        fn record(&self, entry: AuditEntry) {
            self.entries.lock().expect("lock").push(entry);
        }

        fn record_auth(&self, _entry: AuthAuditEntry) {}
    }

    type Base = PhiRecordStore<InMemoryPersistence, AesGcmPhiCipher>;

    fn audited() -> (AuditedStore<Base>, Arc<CollectingRecorder>) {
        let keys = Arc::new(StaticKeyProvider::generate(1));
        let base = PhiRecordStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(AesGcmPhiCipher::new(keys)),
        );
        let recorder = Arc::new(CollectingRecorder::default());
        (AuditedStore::new(base, recorder.clone()), recorder)
    }

    fn record(value: Value) -> Record {
        record_from_value(value).expect("object")
    }

    fn staff() -> CallerContext {
        CallerContext::new("u-2", Role::MedicalStaff)
    }

    #[test]
    fn test_unscoped_mutations_record_diffs() {
        let (store, recorder) = audited();
        let ctx = OperationContext::new(staff());

        let created = store
            .create(
                &ctx,
                EntityKind::Recipient,
                record(json!({"firstName": "Jane", "bloodType": "A+"})),
            )
            .expect("create");
        let id = created.record_id().expect("id").to_string();

        store
            .update(&ctx, EntityKind::Recipient, &id, record(json!({"status": "matched"})))
            .expect("update");

        let entries = recorder.entries.lock().expect("lock");
        assert_eq!(entries.len(), 2);

        let create_entry = &entries[0];
        assert_eq!(create_entry.action, AuditAction::Create);
        assert_eq!(create_entry.entity_id.as_deref(), Some(id.as_str()));
        assert_eq!(create_entry.after.as_ref().expect("after")["firstName"], REDACTED);

        let update_entry = &entries[1];
        assert_eq!(update_entry.action, AuditAction::Update);
        assert!(update_entry.changed_fields.contains(&"status".to_string()));
        assert_eq!(update_entry.before.as_ref().expect("before")["status"], "waiting");
        assert_eq!(update_entry.after.as_ref().expect("after")["status"], "matched");
    }

    #[test]
    fn test_scoped_mutation_is_captured_not_recorded() {
        let (store, recorder) = audited();
        let ctx = OperationContext::scoped(staff(), "req-9");

        store
            .create(&ctx, EntityKind::Metric, record(json!({"name": "throughput", "value": 3})))
            .expect("create");

        assert!(recorder.entries.lock().expect("lock").is_empty());
        let diff = ctx.take_mutation().expect("captured");
        assert!(diff.before.is_none());
        assert!(diff.changed_fields.contains(&"value".to_string()));
    }

    #[test]
    fn test_unscoped_failure_is_recorded() {
        let (store, recorder) = audited();
        let ctx = OperationContext::new(staff());

        let result = store.delete(&ctx, EntityKind::Organ, "missing");
        assert!(matches!(result, Err(OrganGuardError::NotFound { .. })));

        let entries = recorder.entries.lock().expect("lock");
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].success);
        assert_eq!(entries[0].error_code.as_deref(), Some("NOT_FOUND"));
        assert_eq!(entries[0].action, AuditAction::Delete);
    }

    #[test]
    fn test_soft_delete_diff_has_after() {
        let (store, recorder) = audited();
        let ctx = OperationContext::new(staff());
        let donor = store
            .create(&ctx, EntityKind::Donor, record(json!({"bloodType": "O+"})))
            .expect("create");
        let id = donor.record_id().expect("id").to_string();

        store.delete(&ctx, EntityKind::Donor, &id).expect("delete");

        let entries = recorder.entries.lock().expect("lock");
        let delete_entry = entries.last().expect("entry");
        assert_eq!(delete_entry.after.as_ref().expect("after")["status"], "inactive");
        assert!(delete_entry.changed_fields.contains(&"status".to_string()));
    }
}
