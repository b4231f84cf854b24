//! Per-entity field schema: which fields are PHI and which PHI fields are
//! searchable by equality (deterministically encrypted).

use super::entity::EntityKind;

/// PHI layout of one entity kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntitySchema {
    pub kind: EntityKind,
    /// Fields encrypted at rest.
    pub phi_fields: &'static [&'static str],
    /// Subset of `phi_fields` encrypted deterministically (equality search).
    pub deterministic_fields: &'static [&'static str],
    /// Delete is a status transition rather than row removal.
    pub soft_delete: bool,
}

impl EntitySchema {
    #[must_use]
    pub fn is_phi(&self, field: &str) -> bool {
        self.phi_fields.contains(&field)
    }

    #[must_use]
    pub fn is_searchable(&self, field: &str) -> bool {
        self.deterministic_fields.contains(&field)
    }

    #[must_use]
    pub fn has_phi(&self) -> bool {
        !self.phi_fields.is_empty()
    }
}

const DONOR: EntitySchema = EntitySchema {
    kind: EntityKind::Donor,
    phi_fields: &[
        "age",
        "weight",
        "height",
        "location",
        "medicalHistory",
        "hlaMarkers",
    ],
    deterministic_fields: &["location"],
    soft_delete: true,
};

// Biopsy and crossmatch results go through the cipher as well; quality and
// temperature stay queryable for logistics dashboards.
const ORGAN: EntitySchema = EntitySchema {
    kind: EntityKind::Organ,
    phi_fields: &["biopsyResults", "crossmatchResults"],
    deterministic_fields: &[],
    soft_delete: false,
};

const RECIPIENT: EntitySchema = EntitySchema {
    kind: EntityKind::Recipient,
    phi_fields: &["firstName", "lastName", "medicalData", "hlaType", "location"],
    deterministic_fields: &["firstName", "lastName", "location"],
    soft_delete: false,
};

const MESSAGE: EntitySchema = EntitySchema {
    kind: EntityKind::Message,
    phi_fields: &["content"],
    deterministic_fields: &[],
    soft_delete: false,
};

const CUSTODY_LOG: EntitySchema = EntitySchema {
    kind: EntityKind::CustodyLog,
    phi_fields: &["notes"],
    deterministic_fields: &[],
    soft_delete: false,
};

const fn plain(kind: EntityKind) -> EntitySchema {
    EntitySchema {
        kind,
        phi_fields: &[],
        deterministic_fields: &[],
        soft_delete: false,
    }
}

const ALLOCATION: EntitySchema = plain(EntityKind::Allocation);
const TRANSPORT: EntitySchema = plain(EntityKind::Transport);
const METRIC: EntitySchema = plain(EntityKind::Metric);
const USER: EntitySchema = plain(EntityKind::User);
const AUDIT_LOG: EntitySchema = plain(EntityKind::AuditLog);

/// Schema for an entity kind.
#[must_use]
pub fn schema_for(kind: EntityKind) -> &'static EntitySchema {
    match kind {
        EntityKind::Donor => &DONOR,
        EntityKind::Organ => &ORGAN,
        EntityKind::Recipient => &RECIPIENT,
        EntityKind::Allocation => &ALLOCATION,
        EntityKind::Transport => &TRANSPORT,
        EntityKind::Message => &MESSAGE,
        EntityKind::CustodyLog => &CUSTODY_LOG,
        EntityKind::Metric => &METRIC,
        EntityKind::User => &USER,
        EntityKind::AuditLog => &AUDIT_LOG,
    }
}

/// Entities whose access counts as PHI access for the audit trail.
#[must_use]
pub fn is_phi_entity(kind: EntityKind) -> bool {
    matches!(
        kind,
        EntityKind::Donor
            | EntityKind::Organ
            | EntityKind::Recipient
            | EntityKind::Allocation
            | EntityKind::Message
            | EntityKind::CustodyLog
    )
}

/// Fields that carry clinical data; writing them needs `update_medical_data`.
pub const MEDICAL_FIELDS: &[&str] = &[
    "medicalHistory",
    "medicalData",
    "hlaMarkers",
    "hlaType",
    "biopsyResults",
    "crossmatchResults",
];
