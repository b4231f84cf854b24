//! Domain layer: core types and pure logic.
//!
//! Nothing in here touches storage, threads or the environment. Records,
//! roles, PHI schemas, lifecycles, compatibility rules, the ciphertext
//! envelope and the audit entry model all live here.

mod audit;
pub mod compatibility;
mod context;
mod crypto;
mod entity;
mod ids;
pub mod kdf;
mod lifecycle;
mod record;
pub mod schema;

pub use audit::{
    changed_fields, collection_segment, derive_action, parse_target, redact_snapshot, AuditAction,
    AuditCategory, AuditEntry, AuthAuditEntry, AuthEvent, RequestInfo, REDACTED,
};
pub use compatibility::{
    validate_compatibility, OrganProfile, RecipientProfile, UrgencyThresholds, UrgencyTier,
};
pub use context::{CallerContext, MutationDiff, OperationContext};
pub use crypto::{CipherError, CipherMode, MasterKey, PhiEnvelope, KEY_LEN, NONCE_LEN};
pub use entity::{EntityKind, Operation, Role, SpecialOperation};
pub use ids::{new_record_id, request_token};
pub use lifecycle::{
    AllocationStatus, OrganStatus, CORRECTION_FLAG, DONOR_DELETED_STATUS, DONOR_INITIAL_STATUS,
    RECIPIENT_WAITING_STATUS,
};
pub use record::{
    format_timestamp, parse_timestamp, record_from_value, Record, RecordExt, CREATED_AT_FIELD,
    ID_FIELD, STATUS_FIELD, UPDATED_AT_FIELD,
};
pub use schema::{is_phi_entity, schema_for, EntitySchema, MEDICAL_FIELDS};
