//! Every operation leaves exactly one audit entry, whatever its outcome, and
//! an unavailable audit store never blocks the operation itself.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use organguard::adapters::keyring::StaticKeyProvider;
use organguard::adapters::memory::InMemoryPersistence;
use organguard::application::{AuditTrail, OrganGuard, PermissionMatrix};
use organguard::config::Config;
use organguard::domain::{record_from_value, AuditCategory, AuthEvent, RecordExt, RequestInfo};
use organguard::ports::{AuditSink, Query};
use organguard::{CallerContext, EntityKind, OrganGuardError, Record, Role};

fn record(value: Value) -> Record {
    record_from_value(value).expect("object")
}

fn guard() -> OrganGuard<InMemoryPersistence> {
    OrganGuard::new(
        Arc::new(InMemoryPersistence::new()),
        Arc::new(StaticKeyProvider::generate(1)),
        PermissionMatrix::standard(),
        &Config::default(),
    )
}

fn entries_per_request(guard: &OrganGuard<InMemoryPersistence>) -> HashMap<String, usize> {
    guard.flush();
    let mut counts = HashMap::new();
    for entry in guard.backend().recent_audit(usize::MAX).expect("audit") {
        *counts.entry(entry.request_id).or_insert(0) += 1;
    }
    counts
}

#[test]
fn test_one_entry_per_operation_regardless_of_outcome() {
    let guard = guard();
    let coordinator = CallerContext::new("u-1", Role::Coordinator);
    let viewer = CallerContext::new("u-2", Role::Viewer);

    let created = guard
        .create(&coordinator, EntityKind::Recipient, record(json!({"firstName": "Ana", "bloodType": "B+"})))
        .expect("create");
    let id = created.record_id().expect("id").to_string();

    let outcomes = [
        guard.get(&viewer, EntityKind::Recipient, &id).is_ok(),
        guard.get(&coordinator, EntityKind::Recipient, "missing").is_ok(),
        guard.delete(&viewer, EntityKind::Recipient, &id).is_ok(),
        guard
            .update(&viewer, EntityKind::Recipient, &id, record(json!({"status": "matched"})))
            .is_ok(),
        guard
            .search(&coordinator, EntityKind::Recipient, "medicalData", &json!("x"))
            .is_ok(),
        guard.list(&viewer, EntityKind::Recipient, &Query::all()).is_ok(),
    ];
    assert_eq!(outcomes, [true, false, false, false, false, true]);

    let counts = entries_per_request(&guard);
    assert_eq!(counts.len(), 7);
    assert!(counts.values().all(|&n| n == 1));
}

#[test]
fn test_failure_entries_carry_codes() {
    let guard = guard();
    let viewer = CallerContext::new("u-2", Role::Viewer);

    let result = guard.delete(&viewer, EntityKind::Organ, "o-1");
    assert!(matches!(result, Err(OrganGuardError::Forbidden { .. })));

    let missing = guard.get(&CallerContext::system(), EntityKind::Organ, "o-404");
    assert!(matches!(missing, Err(OrganGuardError::NotFound { .. })));

    guard.flush();
    let entries = guard.backend().recent_audit(2).expect("audit");
    assert_eq!(entries[0].error_code.as_deref(), Some("NOT_FOUND"));
    assert_eq!(entries[0].category, AuditCategory::DataAccess);
    assert_eq!(entries[1].error_code.as_deref(), Some("FORBIDDEN"));
    assert_eq!(entries[1].category, AuditCategory::Authorization);
    assert_eq!(entries[1].entity_id.as_deref(), Some("o-1"));
    assert!(entries.iter().all(|e| !e.success));
}

#[test]
fn test_audit_outage_does_not_block_operations() {
    let guard = guard();
    guard.backend().set_audit_outage(true);

    let coordinator = CallerContext::new("u-1", Role::Coordinator);
    let created = guard
        .create(&coordinator, EntityKind::Metric, record(json!({"name": "offers", "value": 7})))
        .expect("operation completes during outage");
    let id = created.record_id().expect("id").to_string();
    assert_eq!(
        guard.get(&coordinator, EntityKind::Metric, &id).expect("read")["value"],
        7
    );

    guard.flush();
    assert_eq!(guard.trail().failed_writes(), 2);

    guard.backend().set_audit_outage(false);
    guard.get(&coordinator, EntityKind::Metric, &id).expect("read");
    guard.flush();
    assert_eq!(guard.backend().audit_count().expect("count"), 1);
}

#[test]
fn test_intercept_keeps_caller_request_id() {
    let sink = Arc::new(InMemoryPersistence::new());
    let trail = AuditTrail::spawn(Arc::clone(&sink));
    let request = RequestInfo::new("GET", "/api/v1/organs/o-7").with_request_id("req-external-1");

    let _ = trail.intercept(&CallerContext::anonymous(), &request, |ctx| {
        assert_eq!(ctx.request_id, "req-external-1");
        Ok(())
    });
    trail.flush();

    let entry = &sink.recent_audit(1).expect("audit")[0];
    assert_eq!(entry.request_id, "req-external-1");
    assert_eq!(entry.entity_type.as_deref(), Some("organ"));
    assert_eq!(entry.entity_id.as_deref(), Some("o-7"));
    assert!(entry.user_id.is_none());
}

#[test]
fn test_auth_stream_through_facade() {
    let guard = guard();
    let anon = CallerContext::anonymous();
    let counts: Vec<u32> = (0..5)
        .map(|_| guard.auth().login_failed(&anon, "someone@hospital.org", "bad password"))
        .collect();
    assert_eq!(counts, vec![1, 2, 3, 4, 5]);
    guard.flush();

    let events: Vec<AuthEvent> = guard
        .backend()
        .auth_audit_for_email("SOMEONE@hospital.org", 10)
        .expect("auth audit")
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert_eq!(events.first(), Some(&AuthEvent::Lockout));
    assert_eq!(events.len(), 6);
}
