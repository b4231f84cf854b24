//! Permission matrix: entity, special-operation and field rules per role.
//!
//! The matrix is plain data, built once (the built-in [`PermissionMatrix::standard`]
//! table or a JSON document) and never mutated. Every decision function is
//! pure; a caller without a recognised role is denied everything.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::config::ConfigError;
use crate::domain::{EntityKind, Operation, Record, Role, SpecialOperation, MEDICAL_FIELDS};

/// Roles allowed per CRUD operation on one entity, plus per-field rules.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityRules {
    #[serde(default)]
    pub create: BTreeSet<Role>,
    #[serde(default)]
    pub read: BTreeSet<Role>,
    #[serde(default)]
    pub update: BTreeSet<Role>,
    #[serde(default)]
    pub delete: BTreeSet<Role>,
    /// Field name → roles that may read and write it. Fields without a rule
    /// follow the entity-level `read`, `create` or `update` set.
    #[serde(default)]
    pub fields: BTreeMap<String, BTreeSet<Role>>,
}

impl EntityRules {
    fn roles_for(&self, operation: Operation) -> &BTreeSet<Role> {
        match operation {
            Operation::Create => &self.create,
            Operation::Read => &self.read,
            Operation::Update => &self.update,
            Operation::Delete => &self.delete,
        }
    }
}

/// Outcome of checking a write payload against field rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldValidation {
    pub valid: bool,
    /// Sorted names of the fields the caller may not write.
    pub unauthorized_fields: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionMatrix {
    pub version: String,
    pub entities: BTreeMap<EntityKind, EntityRules>,
    #[serde(default)]
    pub special: BTreeMap<SpecialOperation, BTreeSet<Role>>,
}

/// Fields a user may read on their own account, whatever their role.
pub const OWN_ACCOUNT_FIELDS: &[&str] = &[
    "id",
    "email",
    "firstName",
    "lastName",
    "role",
    "status",
    "mfaEnabled",
    "lastLogin",
    "createdAt",
    "updatedAt",
];

fn roles(list: &[Role]) -> BTreeSet<Role> {
    list.iter().copied().collect()
}

impl PermissionMatrix {
    /// The built-in matrix.
    #[must_use]
    pub fn standard() -> Self {
        use Role::{Admin, Coordinator, MedicalStaff, Transport, Viewer};

        let admin = roles(&[Admin]);
        let coordination = roles(&[Admin, Coordinator]);
        let clinical = roles(&[Admin, Coordinator, MedicalStaff]);
        let clinical_and_viewer = roles(&[Admin, Coordinator, MedicalStaff, Viewer]);
        let field_ops = roles(&[Admin, Coordinator, MedicalStaff, Transport]);
        let logistics = roles(&[Admin, Coordinator, Transport]);
        let everyone = roles(&Role::ALL);

        let fields = |pairs: &[(&[&str], &BTreeSet<Role>)]| -> BTreeMap<String, BTreeSet<Role>> {
            pairs
                .iter()
                .flat_map(|(names, allowed)| {
                    names.iter().map(move |n| ((*n).to_string(), (*allowed).clone()))
                })
                .collect()
        };

        let mut entities = BTreeMap::new();

        entities.insert(
            EntityKind::Donor,
            EntityRules {
                create: clinical.clone(),
                read: clinical_and_viewer.clone(),
                update: clinical.clone(),
                delete: admin.clone(),
                fields: fields(&[(
                    &["age", "weight", "height", "location", "medicalHistory", "hlaMarkers"],
                    &clinical,
                )]),
            },
        );

        entities.insert(
            EntityKind::Organ,
            EntityRules {
                create: clinical.clone(),
                read: everyone.clone(),
                update: field_ops.clone(),
                delete: admin.clone(),
                fields: fields(&[
                    (&["biopsyResults", "crossmatchResults"], &clinical),
                    (&["currentLocation", "temperature", "status"], &field_ops),
                ]),
            },
        );

        entities.insert(
            EntityKind::Recipient,
            EntityRules {
                create: clinical.clone(),
                read: everyone.clone(),
                update: clinical.clone(),
                delete: admin.clone(),
                fields: fields(&[
                    (&["medicalData", "hlaType"], &clinical),
                    (&["firstName", "lastName", "location"], &field_ops),
                ]),
            },
        );

        entities.insert(
            EntityKind::Allocation,
            EntityRules {
                create: coordination.clone(),
                read: clinical.clone(),
                update: clinical.clone(),
                delete: admin.clone(),
                fields: fields(&[(&["status", "matchScore", "compatibilityData"], &clinical)]),
            },
        );

        entities.insert(
            EntityKind::Transport,
            EntityRules {
                create: logistics.clone(),
                read: field_ops.clone(),
                update: logistics.clone(),
                delete: admin.clone(),
                fields: fields(&[(&["cost"], &coordination)]),
            },
        );

        for kind in [EntityKind::Message, EntityKind::CustodyLog] {
            entities.insert(
                kind,
                EntityRules {
                    create: field_ops.clone(),
                    read: field_ops.clone(),
                    update: admin.clone(),
                    delete: admin.clone(),
                    fields: BTreeMap::new(),
                },
            );
        }

        entities.insert(
            EntityKind::Metric,
            EntityRules {
                create: coordination.clone(),
                read: clinical_and_viewer,
                update: admin.clone(),
                delete: admin.clone(),
                fields: BTreeMap::new(),
            },
        );

        entities.insert(
            EntityKind::User,
            EntityRules {
                create: admin.clone(),
                read: admin.clone(),
                update: admin.clone(),
                delete: admin.clone(),
                fields: fields(&[(&["role"], &admin)]),
            },
        );

        // Audit entries are written by the audit trail only and never changed.
        entities.insert(
            EntityKind::AuditLog,
            EntityRules {
                read: admin.clone(),
                ..EntityRules::default()
            },
        );

        let special = BTreeMap::from([
            (SpecialOperation::Export, coordination),
            (SpecialOperation::ViewAuditLogs, admin.clone()),
            (SpecialOperation::ManageUsers, admin.clone()),
            (SpecialOperation::ViewAllData, admin),
            (SpecialOperation::UpdateAllocation, clinical.clone()),
            (SpecialOperation::UpdateMedicalData, clinical),
        ]);

        Self {
            version: "standard-1".to_string(),
            entities,
            special,
        }
    }

    /// Parse a matrix document.
    ///
    /// # Errors
    /// Returns `ConfigError::InvalidPermissions` on malformed JSON, unknown
    /// roles or entities, or an empty version.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let matrix: Self =
            serde_json::from_str(text).map_err(|e| ConfigError::InvalidPermissions(e.to_string()))?;
        if matrix.version.trim().is_empty() {
            return Err(ConfigError::InvalidPermissions(
                "missing version".to_string(),
            ));
        }
        tracing::info!(version = %matrix.version, "Loaded permission matrix");
        Ok(matrix)
    }

    fn rules(&self, entity: EntityKind) -> Option<&EntityRules> {
        self.entities.get(&entity)
    }

    #[must_use]
    pub fn has_permission(&self, role: Option<Role>, entity: EntityKind, operation: Operation) -> bool {
        let Some(role) = role else {
            return false;
        };
        self.rules(entity)
            .is_some_and(|r| r.roles_for(operation).contains(&role))
    }

    #[must_use]
    pub fn has_special_permission(&self, role: Option<Role>, operation: SpecialOperation) -> bool {
        let Some(role) = role else {
            return false;
        };
        self.special
            .get(&operation)
            .is_some_and(|allowed| allowed.contains(&role))
    }

    /// Explicit field rule if one exists, else entity-level read.
    #[must_use]
    pub fn has_field_access(&self, role: Option<Role>, entity: EntityKind, field: &str) -> bool {
        let Some(r) = role else {
            return false;
        };
        match self.rules(entity).and_then(|rules| rules.fields.get(field)) {
            Some(allowed) => allowed.contains(&r),
            None => self.has_permission(role, entity, Operation::Read),
        }
    }

    /// Copy of `record` with only the fields `role` may read.
    #[must_use]
    pub fn filter_fields_by_role(&self, record: &Record, role: Option<Role>, entity: EntityKind) -> Record {
        if role == Some(Role::Admin) {
            return record.clone();
        }
        record
            .iter()
            .filter(|(field, _)| self.has_field_access(role, entity, field))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// A user's view of their own account. Admin sees the whole row.
    #[must_use]
    pub fn filter_own_account(&self, record: &Record, role: Option<Role>) -> Record {
        if role == Some(Role::Admin) {
            return record.clone();
        }
        record
            .iter()
            .filter(|(field, _)| {
                OWN_ACCOUNT_FIELDS.contains(&field.as_str())
                    || self.has_field_access(role, EntityKind::User, field)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Explicit field rule if one exists, else the entity-level set for
    /// `operation`. Medical fields also need `UpdateMedicalData`.
    fn may_write_field(
        &self,
        role: Option<Role>,
        entity: EntityKind,
        field: &str,
        operation: Operation,
    ) -> bool {
        let Some(r) = role else {
            return false;
        };
        if MEDICAL_FIELDS.contains(&field)
            && !self.has_special_permission(role, SpecialOperation::UpdateMedicalData)
        {
            return false;
        }
        match self.rules(entity).and_then(|rules| rules.fields.get(field)) {
            Some(allowed) => allowed.contains(&r),
            None => self.has_permission(role, entity, operation),
        }
    }

    fn validate_write_fields(
        &self,
        body: &Record,
        role: Option<Role>,
        entity: EntityKind,
        operation: Operation,
    ) -> FieldValidation {
        if role == Some(Role::Admin) {
            return FieldValidation {
                valid: true,
                unauthorized_fields: Vec::new(),
            };
        }

        // Record keys iterate in sorted order.
        let unauthorized_fields: Vec<String> = body
            .keys()
            .filter(|field| !self.may_write_field(role, entity, field, operation))
            .cloned()
            .collect();

        FieldValidation {
            valid: unauthorized_fields.is_empty(),
            unauthorized_fields,
        }
    }

    /// Check every key of an update payload. Admin is always valid.
    #[must_use]
    pub fn validate_update_fields(
        &self,
        update: &Record,
        role: Option<Role>,
        entity: EntityKind,
    ) -> FieldValidation {
        self.validate_write_fields(update, role, entity, Operation::Update)
    }

    /// Same as [`Self::validate_update_fields`], with unruled fields
    /// following the entity-level `create` set.
    #[must_use]
    pub fn validate_create_fields(
        &self,
        data: &Record,
        role: Option<Role>,
        entity: EntityKind,
    ) -> FieldValidation {
        self.validate_write_fields(data, role, entity, Operation::Create)
    }
}

impl Default for PermissionMatrix {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::record_from_value;
    use serde_json::json;

    fn record(value: serde_json::Value) -> Record {
        record_from_value(value).expect("object")
    }

    #[test]
    fn test_entity_permissions() {
        let m = PermissionMatrix::standard();
        assert!(m.has_permission(Some(Role::Coordinator), EntityKind::Allocation, Operation::Create));
        assert!(!m.has_permission(Some(Role::MedicalStaff), EntityKind::Allocation, Operation::Create));
        assert!(m.has_permission(Some(Role::Transport), EntityKind::Organ, Operation::Update));
        assert!(!m.has_permission(Some(Role::Viewer), EntityKind::Donor, Operation::Delete));
        assert!(!m.has_permission(Some(Role::Admin), EntityKind::AuditLog, Operation::Delete));
        assert!(!m.has_permission(None, EntityKind::Metric, Operation::Read));
    }

    #[test]
    fn test_special_permissions() {
        let m = PermissionMatrix::standard();
        assert!(m.has_special_permission(Some(Role::Coordinator), SpecialOperation::Export));
        assert!(!m.has_special_permission(Some(Role::MedicalStaff), SpecialOperation::Export));
        assert!(m.has_special_permission(Some(Role::Admin), SpecialOperation::ViewAuditLogs));
        assert!(!m.has_special_permission(None, SpecialOperation::Export));
    }

    #[test]
    fn test_viewer_sees_no_recipient_phi() {
        let m = PermissionMatrix::standard();
        let jane = record(json!({
            "id": "r-1",
            "firstName": "Jane",
            "lastName": "Doe",
            "bloodType": "A+",
            "medicalData": {"score": 0.9},
            "status": "waiting"
        }));

        let viewer = m.filter_fields_by_role(&jane, Some(Role::Viewer), EntityKind::Recipient);
        assert!(viewer.get("firstName").is_none());
        assert!(viewer.get("medicalData").is_none());
        assert_eq!(viewer["bloodType"], "A+");

        let transport = m.filter_fields_by_role(&jane, Some(Role::Transport), EntityKind::Recipient);
        assert_eq!(transport["firstName"], "Jane");
        assert!(transport.get("medicalData").is_none());

        assert_eq!(m.filter_fields_by_role(&jane, Some(Role::Admin), EntityKind::Recipient), jane);
        assert!(m.filter_fields_by_role(&jane, None, EntityKind::Recipient).is_empty());
    }

    #[test]
    fn test_validate_update_fields() {
        let m = PermissionMatrix::standard();

        let courier_update = record(json!({"currentLocation": "Hub 4", "temperature": 4.1}));
        assert!(m.validate_update_fields(&courier_update, Some(Role::Transport), EntityKind::Organ).valid);

        let sneaky = record(json!({"temperature": 4.0, "crossmatchResults": "negative"}));
        let result = m.validate_update_fields(&sneaky, Some(Role::Transport), EntityKind::Organ);
        assert!(!result.valid);
        assert_eq!(result.unauthorized_fields, vec!["crossmatchResults"]);

        let cost = record(json!({"cost": 1200, "status": "in_transit"}));
        let result = m.validate_update_fields(&cost, Some(Role::Transport), EntityKind::Transport);
        assert_eq!(result.unauthorized_fields, vec!["cost"]);

        let promote = record(json!({"role": "admin"}));
        assert!(m.validate_update_fields(&promote, Some(Role::Admin), EntityKind::User).valid);
        assert!(!m.validate_update_fields(&promote, None, EntityKind::User).valid);
    }

    #[test]
    fn test_create_fields_follow_create_set() {
        let m = PermissionMatrix::standard();

        let note = record(json!({"organId": "o-1", "content": "arriving in 20 minutes"}));
        assert!(m.validate_create_fields(&note, Some(Role::MedicalStaff), EntityKind::Message).valid);
        assert!(!m.validate_update_fields(&note, Some(Role::MedicalStaff), EntityKind::Message).valid);

        let handoff = record(json!({"organId": "o-1", "notes": "seal intact"}));
        assert!(m.validate_create_fields(&handoff, Some(Role::Transport), EntityKind::CustodyLog).valid);
        assert!(!m.validate_create_fields(&handoff, Some(Role::Viewer), EntityKind::CustodyLog).valid);

        let metric = record(json!({"name": "offers", "value": 3}));
        assert!(m.validate_create_fields(&metric, Some(Role::Coordinator), EntityKind::Metric).valid);

        let leg = record(json!({"organId": "o-1", "cost": 900}));
        let result = m.validate_create_fields(&leg, Some(Role::Transport), EntityKind::Transport);
        assert_eq!(result.unauthorized_fields, vec!["cost"]);
    }

    #[test]
    fn test_from_json() {
        let doc = r#"{
            "version": "2024-06",
            "entities": {
                "metric": {"read": ["viewer", "admin"], "fields": {"cost": ["admin"]}}
            },
            "special": {"export": ["admin"]}
        }"#;
        let m = PermissionMatrix::from_json(doc).expect("valid matrix");
        assert_eq!(m.version, "2024-06");
        assert!(m.has_permission(Some(Role::Viewer), EntityKind::Metric, Operation::Read));
        assert!(!m.has_permission(Some(Role::Viewer), EntityKind::Donor, Operation::Read));
        assert!(!m.has_field_access(Some(Role::Viewer), EntityKind::Metric, "cost"));

        assert!(PermissionMatrix::from_json(r#"{"version": "x", "entities": {"metric": {"read": ["janitor"]}}}"#).is_err());
        assert!(PermissionMatrix::from_json(r#"{"version": "", "entities": {}}"#).is_err());
    }

    #[test]
    fn test_standard_roundtrips_through_json() {
        let m = PermissionMatrix::standard();
        let text = serde_json::to_string(&m).expect("serialize");
        assert_eq!(PermissionMatrix::from_json(&text).expect("parse"), m);
    }
}
