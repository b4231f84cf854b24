//! Entity store port: the CRUD surface every store layer implements.
//!
//! The record store, the audited decorator and the RBAC decorator all
//! implement [`EntityStore`], so layering is chosen at construction time.

use serde_json::Value;

use super::persistence::Query;
use crate::domain::{
    EntityKind, OperationContext, Record, RecordExt, RECIPIENT_WAITING_STATUS, STATUS_FIELD,
};
use crate::Result;

pub trait EntityStore: Send + Sync {
    /// Create a record. Returns the stored (decrypted) view.
    fn create(&self, ctx: &OperationContext, entity: EntityKind, data: Record) -> Result<Record>;

    fn get(&self, ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<Record>;

    /// Apply a partial update. Returns the updated view.
    fn update(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        id: &str,
        changes: Record,
    ) -> Result<Record>;

    fn delete(&self, ctx: &OperationContext, entity: EntityKind, id: &str) -> Result<()>;

    fn list(&self, ctx: &OperationContext, entity: EntityKind, query: &Query)
        -> Result<Vec<Record>>;

    /// Equality search on a deterministically encrypted field.
    fn search(
        &self,
        ctx: &OperationContext,
        entity: EntityKind,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>>;

    /// Bulk read for export.
    fn export(&self, ctx: &OperationContext, entity: EntityKind) -> Result<Vec<Record>> {
        self.list(ctx, entity, &Query::all())
    }

    fn available_organs(&self, ctx: &OperationContext) -> Result<Vec<Record>> {
        self.list(
            ctx,
            EntityKind::Organ,
            &Query::all().eq(STATUS_FIELD, "available"),
        )
    }

    /// Waiting recipients, optionally only those needing `organ_type`.
    fn waiting_recipients(
        &self,
        ctx: &OperationContext,
        organ_type: Option<&str>,
    ) -> Result<Vec<Record>> {
        let mut query = Query::all().eq(STATUS_FIELD, RECIPIENT_WAITING_STATUS);
        if let Some(organ_type) = organ_type {
            query = query.eq("organNeeded", organ_type);
        }
        self.list(ctx, EntityKind::Recipient, &query)
    }

    fn organs_for_donor(&self, ctx: &OperationContext, donor_id: &str) -> Result<Vec<Record>> {
        self.list(ctx, EntityKind::Organ, &Query::all().eq("donorId", donor_id))
    }

    fn allocations_for_organ(&self, ctx: &OperationContext, organ_id: &str) -> Result<Vec<Record>> {
        self.list(
            ctx,
            EntityKind::Allocation,
            &Query::all().eq("organId", organ_id),
        )
    }

    fn transports_for_organ(&self, ctx: &OperationContext, organ_id: &str) -> Result<Vec<Record>> {
        self.list(
            ctx,
            EntityKind::Transport,
            &Query::all().eq("organId", organ_id),
        )
    }
}

/// What the audit interceptor learns from a handler's response.
pub trait AuditedResponse {
    /// Number of records returned by a list read.
    fn result_count(&self) -> Option<usize> {
        None
    }

    /// Identifier of the record the response is about.
    fn entity_id(&self) -> Option<String> {
        None
    }
}

impl AuditedResponse for () {}

impl AuditedResponse for bool {}

impl AuditedResponse for Record {
    fn entity_id(&self) -> Option<String> {
        self.record_id().map(str::to_string)
    }
}

impl<T> AuditedResponse for Vec<T> {
    fn result_count(&self) -> Option<usize> {
        Some(self.len())
    }
}

impl<T: AuditedResponse> AuditedResponse for Option<T> {
    fn result_count(&self) -> Option<usize> {
        self.as_ref().and_then(AuditedResponse::result_count)
    }

    fn entity_id(&self) -> Option<String> {
        self.as_ref().and_then(AuditedResponse::entity_id)
    }
}
