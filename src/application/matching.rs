//! Matching and viability queries over the store stack.
//!
//! Everything is read through an [`EntityStore`], normally the RBAC stack,
//! so a caller only ever matches on what their role can see.

use std::cmp::Ordering;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::domain::compatibility::{
    blood_compatibility_score, shared_hla_markers, viability_deadline, viability_remaining,
};
use crate::domain::{
    format_timestamp, validate_compatibility, EntityKind, OperationContext, OrganProfile,
    RecipientProfile, RecordExt, UrgencyThresholds, UrgencyTier,
};
use crate::ports::EntityStore;
use crate::{OrganGuardError, Result};

/// One waiting recipient evaluated against an organ.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchCandidate {
    pub recipient_id: String,
    pub blood_type: String,
    pub urgency_status: Option<String>,
    /// 100 identical, 90 compatible, 0 otherwise.
    pub blood_score: u32,
    /// `None` when HLA data was not available on both sides.
    pub shared_hla_markers: Option<usize>,
    /// Empty when fully compatible.
    pub violations: Vec<String>,
}

impl MatchCandidate {
    #[must_use]
    pub fn is_compatible(&self) -> bool {
        self.violations.is_empty()
    }
}

/// Remaining viability of one available organ.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ViabilityStatus {
    pub organ_id: String,
    pub organ_type: Option<String>,
    pub deadline: Option<String>,
    pub remaining_hours: Option<f64>,
    /// `None` when preservation start or viability hours are missing.
    pub tier: Option<UrgencyTier>,
}

pub struct MatchingService<S> {
    store: Arc<S>,
    thresholds: UrgencyThresholds,
}

impl<S: EntityStore> MatchingService<S> {
    pub fn new(store: Arc<S>, thresholds: UrgencyThresholds) -> Self {
        Self { store, thresholds }
    }

    /// HLA markers of the organ's donor, if the caller may see them.
    fn donor_hla(&self, ctx: &OperationContext, donor_id: Option<&str>) -> Result<Option<Vec<String>>> {
        let Some(donor_id) = donor_id else {
            return Ok(None);
        };
        match self.store.get(ctx, EntityKind::Donor, donor_id) {
            Ok(donor) => Ok(donor.string_list("hlaMarkers")),
            Err(OrganGuardError::NotFound { .. } | OrganGuardError::Forbidden { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Waiting recipients needing the organ's type, compatible ones first.
    ///
    /// # Errors
    /// Propagates store errors; `NotFound` if the organ does not exist.
    pub fn compatible_recipients(&self, ctx: &OperationContext, organ_id: &str) -> Result<Vec<MatchCandidate>> {
        let organ = self.store.get(ctx, EntityKind::Organ, organ_id)?;
        let donor_hla = self.donor_hla(ctx, organ.str_field("donorId"))?;
        let organ_profile = OrganProfile::from_record(&organ, donor_hla);

        let recipients = self
            .store
            .waiting_recipients(ctx, organ.str_field("organType"))?;

        let mut candidates: Vec<MatchCandidate> = recipients
            .iter()
            .filter_map(|recipient| {
                let id = recipient.record_id()?.to_string();
                let profile = RecipientProfile::from_record(recipient);
                let shared = match (&organ_profile.hla_markers, &profile.hla_markers) {
                    (Some(d), Some(r)) => Some(shared_hla_markers(d, r)),
                    _ => None,
                };
                Some(MatchCandidate {
                    recipient_id: id,
                    blood_score: blood_compatibility_score(&organ_profile.blood_type, &profile.blood_type),
                    urgency_status: recipient.str_field("urgencyStatus").map(str::to_string),
                    shared_hla_markers: shared,
                    violations: validate_compatibility(Some(&organ_profile), Some(&profile)),
                    blood_type: profile.blood_type,
                })
            })
            .collect();

        candidates.sort_by(|a, b| {
            b.is_compatible()
                .cmp(&a.is_compatible())
                .then_with(|| b.blood_score.cmp(&a.blood_score))
        });

        tracing::info!(
            candidates = candidates.len(),
            compatible = candidates.iter().filter(|c| c.is_compatible()).count(),
            "Evaluated recipients"
        );
        Ok(candidates)
    }

    /// Available organs with remaining hours, most urgent first.
    ///
    /// # Errors
    /// Propagates store errors.
    pub fn viability_report(&self, ctx: &OperationContext, now: DateTime<Utc>) -> Result<Vec<ViabilityStatus>> {
        let organs = self.store.available_organs(ctx)?;

        let mut report: Vec<ViabilityStatus> = organs
            .iter()
            .filter_map(|organ| {
                let organ_id = organ.record_id()?.to_string();
                let start = organ.timestamp_field("preservationStartTime");
                let hours = organ.f64_field("viabilityHours");
                let (deadline, remaining) = match (start, hours) {
                    (Some(start), Some(hours)) => (
                        viability_deadline(start, hours).map(format_timestamp),
                        Some(viability_remaining(start, hours, now)),
                    ),
                    _ => (None, None),
                };
                Some(ViabilityStatus {
                    organ_id,
                    organ_type: organ.str_field("organType").map(str::to_string),
                    deadline,
                    remaining_hours: remaining,
                    tier: remaining.map(|h| self.thresholds.tier(h)),
                })
            })
            .collect();

        report.sort_by(|a, b| match (a.remaining_hours, b.remaining_hours) {
            (Some(x), Some(y)) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        });

        let urgent = report
            .iter()
            .filter(|s| matches!(s.tier, Some(UrgencyTier::Critical | UrgencyTier::Expired)))
            .count();
        if urgent > 0 {
            tracing::warn!(urgent, "Organs at or past critical viability");
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::cipher::AesGcmPhiCipher;
    use crate::adapters::keyring::StaticKeyProvider;
    use crate::adapters::memory::InMemoryPersistence;
    use crate::application::record_store::PhiRecordStore;
    use crate::domain::{record_from_value, CallerContext, Record};
    use chrono::Duration;
    use serde_json::{json, Value};

    type Base = PhiRecordStore<InMemoryPersistence, AesGcmPhiCipher>;

    fn setup() -> (MatchingService<Base>, Arc<Base>, OperationContext) {
        let keys = Arc::new(StaticKeyProvider::generate(1));
        let store = Arc::new(PhiRecordStore::new(
            Arc::new(InMemoryPersistence::new()),
            Arc::new(AesGcmPhiCipher::new(keys)),
        ));
        let service = MatchingService::new(Arc::clone(&store), UrgencyThresholds::default());
        (service, store, OperationContext::new(CallerContext::system()))
    }

    fn record(value: Value) -> Record {
        record_from_value(value).expect("object")
    }

    fn create(store: &Base, ctx: &OperationContext, entity: EntityKind, value: Value) -> String {
        store
            .create(ctx, entity, record(value))
            .expect("create")
            .record_id()
            .expect("id")
            .to_string()
    }

    #[test]
    fn test_compatible_recipients_ranked() {
        let (service, store, ctx) = setup();
        let donor = create(&store, &ctx, EntityKind::Donor, json!({
            "bloodType": "O-",
            "hlaMarkers": ["A1", "A2", "B7", "B8", "DR3", "DR4"]
        }));
        let organ = create(&store, &ctx, EntityKind::Organ, json!({
            "donorId": donor, "organType": "kidney", "bloodType": "O-"
        }));

        create(&store, &ctx, EntityKind::Recipient, json!({
            "firstName": "Ann", "organNeeded": "kidney", "bloodType": "A+",
            "hlaType": ["A1", "B7", "DR3"]
        }));
        create(&store, &ctx, EntityKind::Recipient, json!({
            "firstName": "Bob", "organNeeded": "kidney", "bloodType": "O-",
            "hlaType": ["A1", "B7", "DR3", "DR4"]
        }));
        create(&store, &ctx, EntityKind::Recipient, json!({
            "firstName": "Cy", "organNeeded": "kidney", "bloodType": "B+",
            "hlaType": ["A9"]
        }));
        create(&store, &ctx, EntityKind::Recipient, json!({
            "firstName": "Di", "organNeeded": "liver", "bloodType": "O-"
        }));

        let candidates = service.compatible_recipients(&ctx, &organ).expect("match");
        assert_eq!(candidates.len(), 3);
        assert_eq!(candidates[0].blood_score, 100);
        assert!(candidates[0].is_compatible());
        assert_eq!(candidates[0].shared_hla_markers, Some(4));
        assert_eq!(candidates[1].blood_score, 90);
        assert!(candidates[1].is_compatible());
        assert!(!candidates[2].is_compatible());
        assert!(candidates[2].violations[0].contains("HLA"));
    }

    #[test]
    fn test_viability_report_tiers() {
        let (service, store, ctx) = setup();
        let now = Utc::now();
        let start = |hours_ago: i64| format_timestamp(now - Duration::hours(hours_ago));

        create(&store, &ctx, EntityKind::Organ, json!({
            "donorId": "d-1", "organType": "heart", "viabilityHours": 12,
            "preservationStartTime": start(1)
        }));
        create(&store, &ctx, EntityKind::Organ, json!({
            "donorId": "d-1", "organType": "kidney", "viabilityHours": 12,
            "preservationStartTime": start(9)
        }));
        create(&store, &ctx, EntityKind::Organ, json!({
            "donorId": "d-1", "organType": "lung"
        }));

        let report = service.viability_report(&ctx, now).expect("report");
        assert_eq!(report.len(), 3);
        assert_eq!(report[0].organ_type.as_deref(), Some("kidney"));
        assert_eq!(report[0].tier, Some(UrgencyTier::Warning));
        assert_eq!(report[1].tier, Some(UrgencyTier::Normal));
        assert!(report[2].tier.is_none());
    }
}
