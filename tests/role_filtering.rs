//! Property tests for role-based field filtering and write validation.

use proptest::prelude::*;
use serde_json::{json, Value};

use organguard::application::PermissionMatrix;
use organguard::domain::{Operation, MEDICAL_FIELDS};
use organguard::{EntityKind, Record, Role};

const FIELD_POOL: &[&str] = &[
    "id",
    "firstName",
    "lastName",
    "location",
    "bloodType",
    "medicalData",
    "medicalHistory",
    "hlaType",
    "hlaMarkers",
    "biopsyResults",
    "crossmatchResults",
    "currentLocation",
    "status",
    "cost",
    "role",
    "matchScore",
];

fn any_role() -> impl Strategy<Value = Option<Role>> {
    prop_oneof![
        Just(None),
        (0..Role::ALL.len()).prop_map(|i| Some(Role::ALL[i])),
    ]
}

fn any_entity() -> impl Strategy<Value = EntityKind> {
    (0..EntityKind::ALL.len()).prop_map(|i| EntityKind::ALL[i])
}

fn any_field() -> impl Strategy<Value = String> {
    prop_oneof![
        3 => (0..FIELD_POOL.len()).prop_map(|i| FIELD_POOL[i].to_string()),
        1 => "[a-z][a-zA-Z]{0,12}",
    ]
}

fn any_record() -> impl Strategy<Value = Record> {
    prop::collection::vec((any_field(), any::<i64>()), 0..12).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(k, v)| (k, Value::from(v)))
            .collect()
    })
}

proptest! {
    /// Filtering never adds fields and keeps only readable ones, unchanged.
    #[test]
    fn prop_filter_is_readable_subset(
        record in any_record(),
        role in any_role(),
        entity in any_entity(),
    ) {
        let matrix = PermissionMatrix::standard();
        let filtered = matrix.filter_fields_by_role(&record, role, entity);

        for (field, value) in &filtered {
            prop_assert_eq!(record.get(field), Some(value));
            prop_assert!(matrix.has_field_access(role, entity, field));
        }
        if role != Some(Role::Admin) {
            for field in record.keys() {
                let kept = filtered.contains_key(field);
                prop_assert_eq!(kept, matrix.has_field_access(role, entity, field));
            }
        }
    }

    /// Admin sees every record exactly as stored.
    #[test]
    fn prop_admin_filter_is_identity(record in any_record(), entity in any_entity()) {
        let matrix = PermissionMatrix::standard();
        prop_assert_eq!(matrix.filter_fields_by_role(&record, Some(Role::Admin), entity), record);
    }

    /// A caller without a role sees nothing and may write nothing.
    #[test]
    fn prop_no_role_gets_nothing(record in any_record(), entity in any_entity()) {
        let matrix = PermissionMatrix::standard();
        prop_assert!(matrix.filter_fields_by_role(&record, None, entity).is_empty());

        let validation = matrix.validate_update_fields(&record, None, entity);
        prop_assert_eq!(validation.valid, record.is_empty());
    }

    /// Rejected fields are exactly a subset of the payload's keys.
    #[test]
    fn prop_rejections_come_from_payload(
        record in any_record(),
        role in any_role(),
        entity in any_entity(),
    ) {
        let matrix = PermissionMatrix::standard();
        let validation = matrix.validate_update_fields(&record, role, entity);

        prop_assert_eq!(validation.valid, validation.unauthorized_fields.is_empty());
        for field in &validation.unauthorized_fields {
            prop_assert!(record.contains_key(field));
        }
    }

    /// Unruled, non-medical fields on create follow the entity's create set.
    #[test]
    fn prop_create_fields_follow_create_set(
        field in any_field(),
        role in any_role(),
        entity in any_entity(),
    ) {
        let matrix = PermissionMatrix::standard();
        let ruled = matrix
            .entities
            .get(&entity)
            .is_some_and(|rules| rules.fields.contains_key(&field));
        prop_assume!(!ruled && !MEDICAL_FIELDS.contains(&field.as_str()));

        let mut body = Record::new();
        body.insert(field, Value::from(1));
        let expected = role == Some(Role::Admin)
            || matrix.has_permission(role, entity, Operation::Create);
        prop_assert_eq!(matrix.validate_create_fields(&body, role, entity).valid, expected);
    }
}

#[test]
fn test_transport_never_writes_medical_fields() {
    let matrix = PermissionMatrix::standard();
    for entity in EntityKind::ALL {
        for field in organguard::domain::MEDICAL_FIELDS {
            let mut update = Record::new();
            update.insert((*field).to_string(), json!("x"));
            let validation = matrix.validate_update_fields(&update, Some(Role::Transport), entity);
            assert!(!validation.valid, "{field} writable on {entity}");
        }
    }
}
