//! Role-based access decorator.
//!
//! [`RbacStore`] checks every call against the [`PermissionMatrix`] before
//! the wrapped store is touched, so a denied caller never reaches
//! persistence or the cipher. Read results are filtered to the fields the
//! caller's role may see.

use std::sync::Arc;

use serde_json::Value;

use super::permissions::PermissionMatrix;
use crate::domain::{
    AuditCategory, AuditEntry, EntityKind, Operation, OperationContext, Record, RequestInfo,
    SpecialOperation,
};
use crate::ports::{AuditRecorder, EntityStore, Query};
use crate::{OrganGuardError, Result};

pub struct RbacStore<S> {
    inner: S,
    permissions: Arc<PermissionMatrix>,
    denials: Option<Arc<dyn AuditRecorder>>,
}

impl<S: EntityStore> RbacStore<S> {
    pub fn new(inner: S, permissions: Arc<PermissionMatrix>) -> Self {
        Self {
            inner,
            permissions,
            denials: None,
        }
    }

    /// Record denials that happen outside an audit interceptor.
    #[must_use]
    pub fn with_denial_recorder(mut self, recorder: Arc<dyn AuditRecorder>) -> Self {
        self.denials = Some(recorder);
        self
    }

    pub fn permissions(&self) -> &PermissionMatrix {
        &self.permissions
    }

    /// Build the rejection and emit telemetry for it.
    ///
    /// Inside an interceptor the request entry already records the failure,
    /// so only unscoped calls get an entry of their own.
    fn reject(&self, ctx: &OperationContext, request: RequestInfo, err: OrganGuardError) -> OrganGuardError {
        tracing::warn!(
            role = ctx.role().map_or("none", |r| r.as_str()),
            method = %request.method,
            path = %request.path,
            code = err.code(),
            "Permission check denied"
        );

        if !ctx.is_scoped() {
            if let Some(recorder) = &self.denials {
                let request = request.with_request_id(ctx.request_id.clone());
                let entry = AuditEntry::begin(&ctx.caller, &request)
                    .failed(err.code(), err.to_string())
                    .with_category(AuditCategory::Authorization);
                recorder.record(entry);
            }
        }
        err
    }

    fn require(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        operation: Operation,
        id: Option<&str>,
    ) -> Result<()> {
        if self.permissions.has_permission(ctx.role(), entity, operation) {
            return Ok(());
        }
        let reason = format!(
            "role {} may not {} {entity}",
            ctx.role().map_or("none", |r| r.as_str()),
            operation.as_str()
        );
        Err(self.reject(
            ctx,
            RequestInfo::for_operation(entity, operation, id),
            OrganGuardError::forbidden(reason),
        ))
    }

    fn require_special(
        &self,
        ctx: &OperationContext,
        special: SpecialOperation,
        request: impl FnOnce() -> RequestInfo,
    ) -> Result<()> {
        if self.permissions.has_special_permission(ctx.role(), special) {
            return Ok(());
        }
        let reason = format!(
            "role {} lacks {}",
            ctx.role().map_or("none", |r| r.as_str()),
            special.as_str()
        );
        Err(self.reject(ctx, request(), OrganGuardError::forbidden(reason)))
    }

    fn validate_fields(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        operation: Operation,
        id: Option<&str>,
        body: &Record,
    ) -> Result<()> {
        let check = if operation == Operation::Create {
            self.permissions.validate_create_fields(body, ctx.role(), entity)
        } else {
            self.permissions.validate_update_fields(body, ctx.role(), entity)
        };
        if check.valid {
            return Ok(());
        }
        Err(self.reject(
            ctx,
            RequestInfo::for_operation(entity, operation, id),
            OrganGuardError::validation(check.unauthorized_fields),
        ))
    }

    /// Filtering or searching on a field leaks it even when it is stripped
    /// from the response.
    fn require_field_access<'a>(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        fields: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        let mut hidden: Vec<String> = fields
            .into_iter()
            .filter(|f| !self.permissions.has_field_access(ctx.role(), entity, f))
            .map(str::to_string)
            .collect();
        if hidden.is_empty() {
            return Ok(());
        }
        hidden.sort();
        hidden.dedup();
        let reason = format!("fields not readable: {}", hidden.join(", "));
        Err(self.reject(
            ctx,
            RequestInfo::for_operation(entity, Operation::Read, None),
            OrganGuardError::forbidden(reason),
        ))
    }

    fn filter(&self, ctx: &OperationContext, entity: EntityKind, record: &Record) -> Record {
        self.permissions.filter_fields_by_role(record, ctx.role(), entity)
    }

    fn filter_all(&self, ctx: &OperationContext, entity: EntityKind, records: &[Record]) -> Vec<Record> {
        records.iter().map(|r| self.filter(ctx, entity, r)).collect()
    }
}

impl<S: EntityStore> EntityStore for RbacStore<S> {
    fn create(&self, ctx: &OperationContext, entity: EntityKind, data: Record) -> Result<Record> {
        self.require(ctx, entity, Operation::Create, None)?;
        self.validate_fields(ctx, entity, Operation::Create, None, &data)?;
        let created = self.inner.create(ctx, entity, data)?;
        Ok(self.filter(ctx, entity, &created))
    }

    fn get(&self, ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<Record> {
        // Every user may read their own account.
        if entity == EntityKind::User && ctx.caller.is_user(id) {
            let record = self.inner.get(ctx, entity, id)?;
            return Ok(self.permissions.filter_own_account(&record, ctx.role()));
        }
        self.require(ctx, entity, Operation::Read, Some(id))?;
        let record = self.inner.get(ctx, entity, id)?;
        Ok(self.filter(ctx, entity, &record))
    }

    fn update(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        id: &str,
        changes: Record,
    ) -> Result<Record> {
        self.require(ctx, entity, Operation::Update, Some(id))?;
        if entity == EntityKind::Allocation {
            self.require_special(ctx, SpecialOperation::UpdateAllocation, || {
                RequestInfo::for_operation(entity, Operation::Update, Some(id))
            })?;
        }
        self.validate_fields(ctx, entity, Operation::Update, Some(id), &changes)?;
        let updated = self.inner.update(ctx, entity, id, changes)?;
        Ok(self.filter(ctx, entity, &updated))
    }

    fn delete(&self, ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<()> {
        self.require(ctx, entity, Operation::Delete, Some(id))?;
        self.inner.delete(ctx, entity, id)
    }

    fn list(&self, ctx: &OperationContext, entity: EntityKind, query: &Query) -> Result<Vec<Record>> {
        self.require(ctx, entity, Operation::Read, None)?;
        self.require_field_access(ctx, entity, query.fields())?;
        let records = self.inner.list(ctx, entity, query)?;
        Ok(self.filter_all(ctx, entity, &records))
    }

    fn search(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        self.require(ctx, entity, Operation::Read, None)?;
        self.require_field_access(ctx, entity, [field])?;
        let records = self.inner.search(ctx, entity, field, value)?;
        Ok(self.filter_all(ctx, entity, &records))
    }

    fn export(&self, ctx: &OperationContext, entity: EntityKind) -> Result<Vec<Record>> {
        self.require_special(ctx, SpecialOperation::Export, || RequestInfo::for_export(entity))?;
        self.require(ctx, entity, Operation::Read, None)?;
        let records = self.inner.export(ctx, entity)?;
        if self
            .permissions
            .has_special_permission(ctx.role(), SpecialOperation::ViewAllData)
        {
            return Ok(records);
        }
        Ok(self.filter_all(ctx, entity, &records))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{record_from_value, AuthAuditEntry, CallerContext, Role};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// Store that counts calls and returns one fixed recipient.
    #[derive(Default)]
    struct CountingStore {
        calls: AtomicUsize,
    }

    fn jane() -> Record {
        record_from_value(json!({
            "id": "r-1",
            "firstName": "Jane",
            "lastName": "Doe",
            "bloodType": "A+",
            "medicalData": {"score": 0.9},
            "status": "waiting"
        }))
        .expect("object")
    }

    impl EntityStore for CountingStore {
        fn create(&self, _: &OperationContext, _: EntityKind, data: Record) -> Result<Record> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(data)
        }

        fn get(&self, _: &OperationContext, _: EntityKind, _: &str) -> Result<Record> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(jane())
        }

        fn update(&self, _: &OperationContext, _: EntityKind, _: &str, changes: Record) -> Result<Record> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(changes)
        }

        fn delete(&self, _: &OperationContext, _: EntityKind, _: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn list(&self, _: &OperationContext, _: EntityKind, _: &Query) -> Result<Vec<Record>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![jane()])
        }

        fn search(&self, _: &OperationContext, _: EntityKind, _: &str, _: &Value) -> Result<Vec<Record>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec![jane()])
        }
    }

    #[derive(Default)]
    struct DenialLog {
        entries: Mutex<Vec<AuditEntry>>,
    }

    impl AuditRecorder for DenialLog {
        fn record(&self, entry: AuditEntry) {
            self.entries.lock().expect("lock").push(entry);
        }

        fn record_auth(&self, _entry: AuthAuditEntry) {}
    }

    fn rbac() -> RbacStore<CountingStore> {
        RbacStore::new(CountingStore::default(), Arc::new(PermissionMatrix::standard()))
    }

    fn ctx(role: Role) -> OperationContext {
        OperationContext::new(CallerContext::new("u-1", role))
    }

    fn calls(store: &RbacStore<CountingStore>) -> usize {
        store.inner.calls.load(Ordering::SeqCst)
    }

    #[test]
    fn test_denied_operation_never_reaches_store() {
        let store = rbac();
        let result = store.delete(&ctx(Role::Viewer), EntityKind::Donor, "d-1");
        assert!(matches!(result, Err(OrganGuardError::Forbidden { .. })));
        assert_eq!(calls(&store), 0);

        let anonymous = OperationContext::new(CallerContext::from_raw_role("u-1", "janitor"));
        assert!(store.list(&anonymous, EntityKind::Metric, &Query::all()).is_err());
        assert_eq!(calls(&store), 0);
    }

    #[test]
    fn test_validation_failure_never_reaches_store() {
        let store = rbac();
        let body = record_from_value(json!({"cost": 900, "status": "in_transit"})).expect("object");
        let result = store.update(&ctx(Role::Transport), EntityKind::Transport, "t-1", body);
        match result {
            Err(OrganGuardError::ValidationFailed { fields }) => assert_eq!(fields, vec!["cost"]),
            other => panic!("expected validation failure, got {other:?}"),
        }
        assert_eq!(calls(&store), 0);
    }

    #[test]
    fn test_reads_are_filtered() {
        let store = rbac();
        let viewer_view = store.get(&ctx(Role::Viewer), EntityKind::Recipient, "r-1").expect("get");
        assert!(viewer_view.get("firstName").is_none());
        assert_eq!(viewer_view["bloodType"], "A+");

        let staff_view = store
            .list(&ctx(Role::MedicalStaff), EntityKind::Recipient, &Query::all())
            .expect("list");
        assert_eq!(staff_view[0]["medicalData"]["score"], 0.9);
    }

    #[test]
    fn test_filtering_on_hidden_field_is_denied() {
        let store = rbac();
        let query = Query::all().eq("lastName", "Doe");
        assert!(store.list(&ctx(Role::Viewer), EntityKind::Recipient, &query).is_err());
        assert!(store
            .search(&ctx(Role::Viewer), EntityKind::Recipient, "lastName", &json!("Doe"))
            .is_err());
        assert_eq!(calls(&store), 0);
    }

    #[test]
    fn test_user_self_access() {
        let store = rbac();
        let own = store.get(&ctx(Role::Viewer), EntityKind::User, "u-1").expect("own account");
        assert_eq!(own["firstName"], "Jane");
        assert_eq!(own["status"], "waiting");
        assert!(own.get("medicalData").is_none());
        assert!(own.get("bloodType").is_none());
        let other = store.get(&ctx(Role::Viewer), EntityKind::User, "u-2");
        assert!(matches!(other, Err(OrganGuardError::Forbidden { .. })));
    }

    #[test]
    fn test_create_checks_fields_against_create_roles() {
        let store = rbac();
        let note = record_from_value(json!({"organId": "o-1", "content": "on the way"})).expect("object");

        store
            .create(&ctx(Role::Transport), EntityKind::Message, note.clone())
            .expect("transport may create messages");
        assert_eq!(calls(&store), 1);

        let edit = store.update(&ctx(Role::Transport), EntityKind::Message, "m-1", note);
        assert!(matches!(edit, Err(OrganGuardError::Forbidden { .. })));
        assert_eq!(calls(&store), 1);
    }

    #[test]
    fn test_allocation_update_requires_special_operation() {
        let store = rbac();
        let body = record_from_value(json!({"status": "accepted"})).expect("object");
        assert!(store
            .update(&ctx(Role::Transport), EntityKind::Allocation, "a-1", body.clone())
            .is_err());
        assert!(store
            .update(&ctx(Role::MedicalStaff), EntityKind::Allocation, "a-1", body)
            .is_ok());
    }

    #[test]
    fn test_export_rules() {
        let store = rbac();
        assert!(store.export(&ctx(Role::MedicalStaff), EntityKind::Recipient).is_err());

        let coordinator = store.export(&ctx(Role::Coordinator), EntityKind::Recipient).expect("export");
        assert_eq!(coordinator[0]["firstName"], "Jane");

        let admin = store.export(&ctx(Role::Admin), EntityKind::Recipient).expect("export");
        assert_eq!(admin[0], jane());
    }

    #[test]
    fn test_unscoped_denials_are_recorded() {
        let log = Arc::new(DenialLog::default());
        let store = rbac().with_denial_recorder(log.clone());

        let _ = store.delete(&ctx(Role::Transport), EntityKind::Organ, "o-1");
        let scoped = OperationContext::scoped(CallerContext::new("u-1", Role::Viewer), "req-1");
        let _ = store.delete(&scoped, EntityKind::Organ, "o-1");

        let entries = log.entries.lock().expect("lock");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].category, AuditCategory::Authorization);
        assert_eq!(entries[0].error_code.as_deref(), Some("FORBIDDEN"));
        assert_eq!(entries[0].entity_id.as_deref(), Some("o-1"));
    }
}
