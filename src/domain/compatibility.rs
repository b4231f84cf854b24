//! Organ/recipient compatibility and viability countdown.
//!
//! Pure functions only: no storage, no clock reads. Callers pass `now`.

use std::collections::BTreeSet;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::record::{Record, RecordExt};

/// Minimum number of shared HLA markers for a compatible pairing.
pub const HLA_MATCH_THRESHOLD: usize = 3;

/// ABO group with the Rh sign stripped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BloodGroup {
    O,
    A,
    B,
    AB,
}

impl BloodGroup {
    /// Parse a blood type such as `"O-"`, `"ab+"` or `"B"`.
    #[must_use]
    pub fn parse(blood_type: &str) -> Option<Self> {
        let group: String = blood_type
            .trim()
            .trim_end_matches(['+', '-'])
            .trim()
            .to_ascii_uppercase();

        match group.as_str() {
            "O" => Some(Self::O),
            "A" => Some(Self::A),
            "B" => Some(Self::B),
            "AB" => Some(Self::AB),
            _ => None,
        }
    }

    /// Recipient groups this donor group can give to.
    #[must_use]
    pub fn compatible_recipients(&self) -> &'static [BloodGroup] {
        match self {
            Self::O => &[Self::O, Self::A, Self::B, Self::AB],
            Self::A => &[Self::A, Self::AB],
            Self::B => &[Self::B, Self::AB],
            Self::AB => &[Self::AB],
        }
    }
}

/// Whether a donor blood type may be given to a recipient blood type.
///
/// O is the universal donor, AB the universal recipient. Unparseable types
/// are never compatible.
#[must_use]
pub fn is_blood_compatible(donor_type: &str, recipient_type: &str) -> bool {
    match (BloodGroup::parse(donor_type), BloodGroup::parse(recipient_type)) {
        (Some(donor), Some(recipient)) => donor.compatible_recipients().contains(&recipient),
        _ => false,
    }
}

/// Ranking aid for candidate lists: 100 identical group, 90 compatible, 0 otherwise.
#[must_use]
pub fn blood_compatibility_score(donor_type: &str, recipient_type: &str) -> u32 {
    match (BloodGroup::parse(donor_type), BloodGroup::parse(recipient_type)) {
        (Some(d), Some(r)) if d == r => 100,
        (Some(d), Some(r)) if d.compatible_recipients().contains(&r) => 90,
        _ => 0,
    }
}

/// Number of distinct markers present on both sides (case-insensitive).
#[must_use]
pub fn shared_hla_markers(donor: &[String], recipient: &[String]) -> usize {
    let normalize = |markers: &[String]| -> BTreeSet<String> {
        markers
            .iter()
            .map(|m| m.trim().to_ascii_uppercase())
            .filter(|m| !m.is_empty())
            .collect()
    };
    normalize(donor).intersection(&normalize(recipient)).count()
}

/// HLA compatibility. `None` means not evaluated (either side has no data),
/// which is not a failure.
#[must_use]
pub fn is_hla_compatible(donor: Option<&[String]>, recipient: Option<&[String]>) -> Option<bool> {
    match (donor, recipient) {
        (Some(d), Some(r)) => Some(shared_hla_markers(d, r) >= HLA_MATCH_THRESHOLD),
        _ => None,
    }
}

/// Organ-side inputs to a compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrganProfile {
    pub organ_type: String,
    pub blood_type: String,
    pub hla_markers: Option<Vec<String>>,
}

impl OrganProfile {
    /// Read an organ record. Donor HLA markers are attached separately since
    /// they live on the donor.
    #[must_use]
    pub fn from_record(organ: &Record, donor_hla: Option<Vec<String>>) -> Self {
        Self {
            organ_type: organ.str_field("organType").unwrap_or_default().to_string(),
            blood_type: organ.str_field("bloodType").unwrap_or_default().to_string(),
            hla_markers: donor_hla.or_else(|| organ.string_list("hlaMarkers")),
        }
    }
}

/// Recipient-side inputs to a compatibility check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipientProfile {
    pub organ_needed: String,
    pub blood_type: String,
    pub hla_markers: Option<Vec<String>>,
}

impl RecipientProfile {
    #[must_use]
    pub fn from_record(recipient: &Record) -> Self {
        Self {
            organ_needed: recipient.str_field("organNeeded").unwrap_or_default().to_string(),
            blood_type: recipient.str_field("bloodType").unwrap_or_default().to_string(),
            hla_markers: recipient.string_list("hlaType"),
        }
    }
}

/// Every reason the pairing is not allowed. Empty means fully compatible.
///
/// All checks run; nothing short-circuits, so a clinician sees every mismatch.
#[must_use]
pub fn validate_compatibility(
    organ: Option<&OrganProfile>,
    recipient: Option<&RecipientProfile>,
) -> Vec<String> {
    let mut violations = Vec::new();

    let (organ, recipient) = match (organ, recipient) {
        (Some(o), Some(r)) => (o, r),
        (o, r) => {
            if o.is_none() {
                violations.push("organ data missing".to_string());
            }
            if r.is_none() {
                violations.push("recipient data missing".to_string());
            }
            return violations;
        }
    };

    if !organ
        .organ_type
        .trim()
        .eq_ignore_ascii_case(recipient.organ_needed.trim())
        || organ.organ_type.trim().is_empty()
    {
        violations.push(format!(
            "organ type mismatch: organ is '{}', recipient needs '{}'",
            organ.organ_type, recipient.organ_needed
        ));
    }

    if !is_blood_compatible(&organ.blood_type, &recipient.blood_type) {
        violations.push(format!(
            "blood type incompatible: donor '{}' cannot give to recipient '{}'",
            organ.blood_type, recipient.blood_type
        ));
    }

    if let (Some(d), Some(r)) = (&organ.hla_markers, &recipient.hla_markers) {
        let shared = shared_hla_markers(d, r);
        if shared < HLA_MATCH_THRESHOLD {
            violations.push(format!(
                "insufficient HLA match: {shared} shared markers, {HLA_MATCH_THRESHOLD} required"
            ));
        }
    }

    violations
}

fn hours_to_duration(hours: f64) -> Option<Duration> {
    let millis = (hours * 3_600_000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    Duration::try_milliseconds(millis as i64)
}

/// `preservation_start + viability_hours`, or `None` when the result falls
/// outside the representable date range.
#[must_use]
pub fn viability_deadline(
    preservation_start: DateTime<Utc>,
    viability_hours: f64,
) -> Option<DateTime<Utc>> {
    preservation_start.checked_add_signed(hours_to_duration(viability_hours)?)
}

/// Hours of usable life left. Zero or negative means expired.
#[must_use]
pub fn viability_remaining(
    preservation_start: DateTime<Utc>,
    viability_hours: f64,
    now: DateTime<Utc>,
) -> f64 {
    let elapsed = now - preservation_start;
    viability_hours - elapsed.num_milliseconds() as f64 / 3_600_000.0
}

#[must_use]
pub fn is_expired(preservation_start: DateTime<Utc>, viability_hours: f64, now: DateTime<Utc>) -> bool {
    viability_remaining(preservation_start, viability_hours, now) <= 0.0
}

/// Urgency of an organ given its remaining hours.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrgencyTier {
    Expired,
    Critical,
    Warning,
    Normal,
}

impl std::fmt::Display for UrgencyTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Expired => write!(f, "EXPIRED"),
            Self::Critical => write!(f, "CRITICAL"),
            Self::Warning => write!(f, "WARNING"),
            Self::Normal => write!(f, "NORMAL"),
        }
    }
}

/// Policy thresholds for urgency tiering, in hours.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UrgencyThresholds {
    /// Below this many hours the organ is critical.
    pub critical_hours: f64,
    /// Below this many hours the organ is in warning.
    pub warning_hours: f64,
}

impl Default for UrgencyThresholds {
    fn default() -> Self {
        Self {
            critical_hours: 2.0,
            warning_hours: 4.0,
        }
    }
}

impl UrgencyThresholds {
    #[must_use]
    pub fn tier(&self, remaining_hours: f64) -> UrgencyTier {
        if remaining_hours <= 0.0 {
            UrgencyTier::Expired
        } else if remaining_hours < self.critical_hours {
            UrgencyTier::Critical
        } else if remaining_hours < self.warning_hours {
            UrgencyTier::Warning
        } else {
            UrgencyTier::Normal
        }
    }
}

/// Tier under the default thresholds.
#[must_use]
pub fn urgency_tier(remaining_hours: f64) -> UrgencyTier {
    UrgencyThresholds::default().tier(remaining_hours)
}
