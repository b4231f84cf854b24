//! Record store: PHI encryption over a persistence backend.
//!
//! The bottom of every store stack. Writes are encrypted field by field per
//! the entity schema before they reach the backend; reads are decrypted on
//! the way out. Lifecycle rules (default statuses, monotonic organ and
//! allocation status, donor soft delete, organ viability deadline) are
//! enforced here so every decorator above sees the same semantics.

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::domain::compatibility::viability_deadline;
use crate::domain::{
    format_timestamp, new_record_id, schema_for, AllocationStatus, EntityKind, EntitySchema,
    OperationContext, OrganStatus, Record, RecordExt, CORRECTION_FLAG, CREATED_AT_FIELD,
    DONOR_DELETED_STATUS, DONOR_INITIAL_STATUS, ID_FIELD, RECIPIENT_WAITING_STATUS, STATUS_FIELD,
    UPDATED_AT_FIELD,
};
use crate::ports::{EntityStore, Persistence, PhiCipher, Predicate, Query};
use crate::{OrganGuardError, Result};

pub const ORGAN_INITIAL_STATUS: &str = "available";
pub const ALLOCATION_INITIAL_STATUS: &str = "proposed";

/// Encrypting record store generic over backend and cipher.
pub struct PhiRecordStore<P, C> {
    persistence: Arc<P>,
    cipher: Arc<C>,
}

impl<P, C> PhiRecordStore<P, C>
where
    P: Persistence,
    C: PhiCipher,
{
    pub fn new(persistence: Arc<P>, cipher: Arc<C>) -> Self {
        Self {
            persistence,
            cipher,
        }
    }

    fn encrypt(&self, schema: &EntitySchema, record: &Record) -> Result<Record> {
        if !schema.has_phi() {
            return Ok(record.clone());
        }
        Ok(self
            .cipher
            .encrypt_object(record, schema.phi_fields, schema.deterministic_fields)?)
    }

    fn decrypt(&self, schema: &EntitySchema, record: &Record) -> Result<Record> {
        if !schema.has_phi() {
            return Ok(record.clone());
        }
        Ok(self
            .cipher
            .decrypt_object(record, schema.phi_fields, schema.deterministic_fields)?)
    }

    fn fetch_stored(&self, entity: EntityKind, id: &str) -> Result<Record> {
        self.persistence
            .fetch(entity, id)
            .map_err(OrganGuardError::storage)?
            .ok_or_else(|| OrganGuardError::not_found(entity, id))
    }

    /// Rewrite a caller query into one the backend can run over ciphertext.
    ///
    /// Equality on a deterministic field is turned into equality on its
    /// ciphertext; any other use of a PHI field is rejected.
    fn translate_query(&self, schema: &EntitySchema, query: &Query) -> Result<Query> {
        let mut rejected = Vec::new();
        let mut predicates = Vec::with_capacity(query.predicates.len());

        for predicate in &query.predicates {
            let field = predicate.field();
            if !schema.is_phi(field) {
                predicates.push(predicate.clone());
                continue;
            }
            match predicate {
                Predicate::Eq(_, value) if schema.is_searchable(field) && !value.is_null() => {
                    let token = self.cipher.encrypt_search_value(field, value)?;
                    predicates.push(Predicate::Eq(field.to_string(), Value::String(token)));
                }
                _ => rejected.push(field.to_string()),
            }
        }

        if let Some((field, _)) = &query.order_by {
            if schema.is_phi(field) {
                rejected.push(field.clone());
            }
        }

        if !rejected.is_empty() {
            rejected.sort();
            rejected.dedup();
            return Err(OrganGuardError::validation(rejected));
        }

        Ok(Query {
            predicates,
            order_by: query.order_by.clone(),
            limit: query.limit,
        })
    }

    fn decrypt_all(&self, schema: &EntitySchema, stored: Vec<Record>) -> Result<Vec<Record>> {
        stored.iter().map(|r| self.decrypt(schema, r)).collect()
    }
}

fn reject_audit_log(entity: EntityKind) -> Result<()> {
    if entity == EntityKind::AuditLog {
        return Err(OrganGuardError::InvalidRecord(
            "audit entries are written by the audit trail only".to_string(),
        ));
    }
    Ok(())
}

/// Remove the correction flag from a write body. Only a literal `true` counts.
fn take_correction_flag(record: &mut Record) -> bool {
    matches!(record.remove(CORRECTION_FLAG), Some(Value::Bool(true)))
}

fn default_status(entity: EntityKind) -> Option<&'static str> {
    match entity {
        EntityKind::Donor => Some(DONOR_INITIAL_STATUS),
        EntityKind::Recipient => Some(RECIPIENT_WAITING_STATUS),
        EntityKind::Organ => Some(ORGAN_INITIAL_STATUS),
        EntityKind::Allocation => Some(ALLOCATION_INITIAL_STATUS),
        _ => None,
    }
}

fn invalid_status(entity: EntityKind, status: &str) -> OrganGuardError {
    OrganGuardError::InvalidRecord(format!("unknown {entity} status '{status}'"))
}

/// Status must parse for entities with a lifecycle.
fn check_status_value(entity: EntityKind, record: &Record) -> Result<()> {
    let Some(status) = record.get(STATUS_FIELD) else {
        return Ok(());
    };
    let Some(status) = status.as_str() else {
        return Err(OrganGuardError::InvalidRecord(format!(
            "{entity} status must be a string"
        )));
    };
    let known = match entity {
        EntityKind::Organ => OrganStatus::parse(status).is_some(),
        EntityKind::Allocation => AllocationStatus::parse(status).is_some(),
        _ => true,
    };
    if known {
        Ok(())
    } else {
        Err(invalid_status(entity, status))
    }
}

/// Forward-only status movement for organs and allocations.
fn check_transition(entity: EntityKind, current: Option<&str>, next: &str) -> Result<()> {
    let Some(current) = current else {
        return Ok(());
    };
    let forward = match entity {
        EntityKind::Organ => {
            let next_status = OrganStatus::parse(next).ok_or_else(|| invalid_status(entity, next))?;
            OrganStatus::parse(current).map_or(true, |c| c.can_progress_to(next_status))
        }
        EntityKind::Allocation => {
            let next_status =
                AllocationStatus::parse(next).ok_or_else(|| invalid_status(entity, next))?;
            AllocationStatus::parse(current).map_or(true, |c| c.can_progress_to(next_status))
        }
        _ => true,
    };

    if forward {
        Ok(())
    } else {
        Err(OrganGuardError::InvalidRecord(format!(
            "{entity} status cannot move from '{current}' to '{next}' without a correction"
        )))
    }
}

/// Recompute `viabilityDeadline` from preservation start and viability hours.
fn refresh_viability_deadline(record: &mut Record) -> Result<()> {
    let start = record.timestamp_field("preservationStartTime");
    let hours = record.f64_field("viabilityHours");
    match (start, hours) {
        (Some(start), Some(hours)) => {
            let deadline = viability_deadline(start, hours).ok_or_else(|| {
                OrganGuardError::InvalidRecord(format!(
                    "viabilityHours {hours} gives a deadline outside the supported range"
                ))
            })?;
            record.insert(
                "viabilityDeadline".to_string(),
                Value::String(format_timestamp(deadline)),
            );
        }
        _ => {
            record.remove("viabilityDeadline");
        }
    }
    Ok(())
}

fn require_donor_reference(record: &Record) -> Result<()> {
    match record.str_field("donorId") {
        Some(id) if !id.trim().is_empty() => Ok(()),
        _ => Err(OrganGuardError::InvalidRecord(
            "organ requires donorId".to_string(),
        )),
    }
}

impl<P, C> EntityStore for PhiRecordStore<P, C>
where
    P: Persistence,
    C: PhiCipher,
{
    fn create(&self, _ctx: &OperationContext, entity: EntityKind, mut data: Record) -> Result<Record> {
        reject_audit_log(entity)?;
        let schema = schema_for(entity);
        take_correction_flag(&mut data);

        let id = match data.get(ID_FIELD).and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.to_string(),
            _ => new_record_id(),
        };
        let now = Value::String(format_timestamp(Utc::now()));
        data.insert(ID_FIELD.to_string(), Value::String(id.clone()));
        data.insert(CREATED_AT_FIELD.to_string(), now.clone());
        data.insert(UPDATED_AT_FIELD.to_string(), now);

        if let Some(status) = default_status(entity) {
            if data.get(STATUS_FIELD).map_or(true, Value::is_null) {
                data.insert(STATUS_FIELD.to_string(), Value::String(status.to_string()));
            }
        }
        check_status_value(entity, &data)?;

        if entity == EntityKind::Organ {
            require_donor_reference(&data)?;
            refresh_viability_deadline(&mut data)?;
        }

        let stored = self.encrypt(schema, &data)?;
        self.persistence
            .insert(entity, &id, &stored)
            .map_err(OrganGuardError::storage)?;

        tracing::debug!(entity = %entity, "Record created");
        Ok(data)
    }

    fn get(&self, _ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<Record> {
        let stored = self.fetch_stored(entity, id)?;
        self.decrypt(schema_for(entity), &stored)
    }

    fn update(
        &self,
        _ctx: &OperationContext,
        entity: EntityKind,
        id: &str,
        mut changes: Record,
    ) -> Result<Record> {
        reject_audit_log(entity)?;
        let schema = schema_for(entity);
        let correction = take_correction_flag(&mut changes);

        // Identity and creation time are fixed.
        changes.remove(ID_FIELD);
        changes.remove(CREATED_AT_FIELD);

        let mut current = self.decrypt(schema, &self.fetch_stored(entity, id)?)?;

        if let Some(next) = changes.get(STATUS_FIELD) {
            let next = next.as_str().ok_or_else(|| {
                OrganGuardError::InvalidRecord(format!("{entity} status must be a string"))
            })?;
            if correction {
                check_status_value(entity, &changes)?;
                tracing::info!(entity = %entity, status = next, "Status correction applied");
            } else {
                check_transition(entity, current.str_field(STATUS_FIELD), next)?;
            }
        }

        for (field, value) in changes {
            current.insert(field, value);
        }
        current.insert(
            UPDATED_AT_FIELD.to_string(),
            Value::String(format_timestamp(Utc::now())),
        );

        if entity == EntityKind::Organ {
            require_donor_reference(&current)?;
            refresh_viability_deadline(&mut current)?;
        }

        let stored = self.encrypt(schema, &current)?;
        self.persistence
            .upsert(entity, id, &stored)
            .map_err(OrganGuardError::storage)?;

        tracing::debug!(entity = %entity, "Record updated");
        Ok(current)
    }

    fn delete(&self, _ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<()> {
        reject_audit_log(entity)?;
        let schema = schema_for(entity);

        if schema.soft_delete {
            let mut stored = self.fetch_stored(entity, id)?;
            stored.insert(
                STATUS_FIELD.to_string(),
                Value::String(DONOR_DELETED_STATUS.to_string()),
            );
            stored.insert(
                UPDATED_AT_FIELD.to_string(),
                Value::String(format_timestamp(Utc::now())),
            );
            // Status and timestamps are never PHI, the stored envelopes are kept as is.
            self.persistence
                .upsert(entity, id, &stored)
                .map_err(OrganGuardError::storage)?;
            tracing::debug!(entity = %entity, "Record deactivated");
            return Ok(());
        }

        let existed = self
            .persistence
            .remove(entity, id)
            .map_err(OrganGuardError::storage)?;
        if !existed {
            return Err(OrganGuardError::not_found(entity, id));
        }
        tracing::debug!(entity = %entity, "Record removed");
        Ok(())
    }

    fn list(&self, _ctx: &OperationContext, entity: EntityKind, query: &Query) -> Result<Vec<Record>> {
        let schema = schema_for(entity);
        let backend_query = self.translate_query(schema, query)?;
        let stored = self
            .persistence
            .query(entity, &backend_query)
            .map_err(OrganGuardError::storage)?;
        self.decrypt_all(schema, stored)
    }

    fn search(
        &self,
        _ctx: &OperationContext,
        entity: EntityKind,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let schema = schema_for(entity);
        if !schema.is_searchable(field) {
            return Err(OrganGuardError::validation(vec![field.to_string()]));
        }

        let token = self.cipher.encrypt_search_value(field, value)?;
        let stored = self
            .persistence
            .query(entity, &Query::all().eq(field, token))
            .map_err(OrganGuardError::storage)?;

        let results = self.decrypt_all(schema, stored)?;
        tracing::debug!(entity = %entity, field, count = results.len(), "Encrypted search");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::cipher::AesGcmPhiCipher;
    use crate::adapters::keyring::StaticKeyProvider;
    use crate::adapters::memory::InMemoryPersistence;
    use crate::domain::{record_from_value, CallerContext, PhiEnvelope};
    use serde_json::json;

    type Store = PhiRecordStore<InMemoryPersistence, AesGcmPhiCipher>;

    fn store() -> (Store, Arc<InMemoryPersistence>) {
        let persistence = Arc::new(InMemoryPersistence::new());
        let keys = Arc::new(StaticKeyProvider::generate(1));
        let cipher = Arc::new(AesGcmPhiCipher::new(keys));
        (PhiRecordStore::new(Arc::clone(&persistence), cipher), persistence)
    }

    fn ctx() -> OperationContext {
        OperationContext::new(CallerContext::system())
    }

    fn record(value: Value) -> Record {
        record_from_value(value).expect("object")
    }

    #[test]
    fn test_create_encrypts_phi_at_rest() {
        let (store, backend) = store();
        let created = store
            .create(
                &ctx(),
                EntityKind::Recipient,
                record(json!({
                    "firstName": "Jane",
                    "lastName": "Doe",
                    "bloodType": "A+",
                    "organNeeded": "kidney",
                    "medicalData": {"compatibilityScore": 0.92}
                })),
            )
            .expect("create");

        let id = created.record_id().expect("id").to_string();
        assert_eq!(created["status"], RECIPIENT_WAITING_STATUS);
        assert_eq!(created["firstName"], "Jane");

        let raw = backend
            .fetch(EntityKind::Recipient, &id)
            .expect("fetch")
            .expect("row");
        assert!(PhiEnvelope::looks_like_envelope(raw.str_field("firstName").expect("str")));
        assert!(PhiEnvelope::looks_like_envelope(raw.str_field("medicalData").expect("str")));
        assert_eq!(raw["bloodType"], "A+");

        let read = store.get(&ctx(), EntityKind::Recipient, &id).expect("get");
        assert_eq!(read["medicalData"]["compatibilityScore"], 0.92);
    }

    #[test]
    fn test_search_on_deterministic_field() {
        let (store, _) = store();
        for name in ["Jane", "John", "Jane"] {
            store
                .create(
                    &ctx(),
                    EntityKind::Recipient,
                    record(json!({"firstName": name, "lastName": "Doe", "bloodType": "O+"})),
                )
                .expect("create");
        }

        let found = store
            .search(&ctx(), EntityKind::Recipient, "firstName", &json!("Jane"))
            .expect("search");
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|r| r["firstName"] == "Jane"));

        let rejected = store.search(&ctx(), EntityKind::Recipient, "medicalData", &json!("x"));
        assert!(matches!(rejected, Err(OrganGuardError::ValidationFailed { .. })));
    }

    #[test]
    fn test_list_rewrites_deterministic_predicates() {
        let (store, _) = store();
        store
            .create(
                &ctx(),
                EntityKind::Donor,
                record(json!({"bloodType": "O-", "location": "Boston", "age": 41})),
            )
            .expect("create");

        let by_location = store
            .list(&ctx(), EntityKind::Donor, &Query::all().eq("location", "Boston"))
            .expect("list");
        assert_eq!(by_location.len(), 1);
        assert_eq!(by_location[0]["age"], 41);

        let by_age = store.list(&ctx(), EntityKind::Donor, &Query::all().gte("age", 18));
        assert!(matches!(by_age, Err(OrganGuardError::ValidationFailed { fields }) if fields == vec!["age"]));
    }

    #[test]
    fn test_organ_requires_donor_and_gets_deadline() {
        let (store, _) = store();
        let missing = store.create(&ctx(), EntityKind::Organ, record(json!({"organType": "kidney"})));
        assert!(matches!(missing, Err(OrganGuardError::InvalidRecord(_))));

        let organ = store
            .create(
                &ctx(),
                EntityKind::Organ,
                record(json!({
                    "donorId": "d-1",
                    "organType": "kidney",
                    "viabilityHours": 12,
                    "preservationStartTime": "2024-03-01T08:00:00Z",
                    "viabilityDeadline": "1999-01-01T00:00:00Z"
                })),
            )
            .expect("create");
        assert_eq!(organ["status"], ORGAN_INITIAL_STATUS);
        assert_eq!(organ["viabilityDeadline"], "2024-03-01T20:00:00.000Z");
    }

    #[test]
    fn test_unrepresentable_viability_is_rejected() {
        let (store, backend) = store();
        for hours in [1e12, -1e12] {
            let result = store.create(
                &ctx(),
                EntityKind::Organ,
                record(json!({
                    "donorId": "d-1",
                    "organType": "kidney",
                    "viabilityHours": hours,
                    "preservationStartTime": "2024-03-01T08:00:00Z"
                })),
            );
            assert!(matches!(result, Err(OrganGuardError::InvalidRecord(_))));
        }
        assert!(backend.query(EntityKind::Organ, &Query::all()).expect("query").is_empty());

        let organ = store
            .create(
                &ctx(),
                EntityKind::Organ,
                record(json!({"donorId": "d-1", "organType": "kidney", "viabilityHours": 12})),
            )
            .expect("create");
        let id = organ.record_id().expect("id").to_string();
        let update = store.update(
            &ctx(),
            EntityKind::Organ,
            &id,
            record(json!({"preservationStartTime": "2024-03-01T08:00:00Z", "viabilityHours": 1e12})),
        );
        assert!(matches!(update, Err(OrganGuardError::InvalidRecord(_))));
    }

    #[test]
    fn test_organ_status_is_forward_only() {
        let (store, backend) = store();
        let organ = store
            .create(
                &ctx(),
                EntityKind::Organ,
                record(json!({"donorId": "d-1", "organType": "liver"})),
            )
            .expect("create");
        let id = organ.record_id().expect("id").to_string();

        store
            .update(&ctx(), EntityKind::Organ, &id, record(json!({"status": "matched"})))
            .expect("forward");

        let regress = store.update(&ctx(), EntityKind::Organ, &id, record(json!({"status": "available"})));
        assert!(matches!(regress, Err(OrganGuardError::InvalidRecord(_))));

        let corrected = store
            .update(
                &ctx(),
                EntityKind::Organ,
                &id,
                record(json!({"status": "available", "statusCorrection": true})),
            )
            .expect("correction");
        assert_eq!(corrected["status"], "available");
        assert!(corrected.get(CORRECTION_FLAG).is_none());

        let raw = backend.fetch(EntityKind::Organ, &id).expect("fetch").expect("row");
        assert!(raw.get(CORRECTION_FLAG).is_none());

        let bogus = store.update(&ctx(), EntityKind::Organ, &id, record(json!({"status": "lost"})));
        assert!(matches!(bogus, Err(OrganGuardError::InvalidRecord(_))));
    }

    #[test]
    fn test_donor_delete_is_soft() {
        let (store, _) = store();
        let donor = store
            .create(&ctx(), EntityKind::Donor, record(json!({"bloodType": "B+", "age": 30})))
            .expect("create");
        let id = donor.record_id().expect("id").to_string();

        store.delete(&ctx(), EntityKind::Donor, &id).expect("delete");
        let read = store.get(&ctx(), EntityKind::Donor, &id).expect("still readable");
        assert_eq!(read["status"], DONOR_DELETED_STATUS);
        assert_eq!(read["age"], 30);
    }

    #[test]
    fn test_missing_records() {
        let (store, _) = store();
        assert!(matches!(
            store.get(&ctx(), EntityKind::Metric, "nope"),
            Err(OrganGuardError::NotFound { .. })
        ));
        assert!(matches!(
            store.delete(&ctx(), EntityKind::Metric, "nope"),
            Err(OrganGuardError::NotFound { .. })
        ));
        assert!(matches!(
            store.update(&ctx(), EntityKind::Transport, "nope", Record::new()),
            Err(OrganGuardError::NotFound { .. })
        ));
    }

    #[test]
    fn test_audit_log_is_not_writable() {
        let (store, _) = store();
        let result = store.create(&ctx(), EntityKind::AuditLog, Record::new());
        assert!(matches!(result, Err(OrganGuardError::InvalidRecord(_))));
    }
}
