//! Status lifecycles for organs and allocations.
//!
//! Status only moves forward. A regression is accepted only when the update
//! is flagged as an explicit correction (see [`CORRECTION_FLAG`]).

use serde::{Deserialize, Serialize};

/// Update-body flag that authorizes a status regression. It is consumed by the
/// record store and never persisted.
pub const CORRECTION_FLAG: &str = "statusCorrection";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrganStatus {
    Available,
    Matched,
    InTransit,
    Transplanted,
    Expired,
    Discarded,
}

impl OrganStatus {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "available" => Some(Self::Available),
            "matched" => Some(Self::Matched),
            "in_transit" => Some(Self::InTransit),
            "transplanted" => Some(Self::Transplanted),
            "expired" => Some(Self::Expired),
            "discarded" => Some(Self::Discarded),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Matched => "matched",
            Self::InTransit => "in_transit",
            Self::Transplanted => "transplanted",
            Self::Expired => "expired",
            Self::Discarded => "discarded",
        }
    }

    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Transplanted | Self::Expired | Self::Discarded)
    }

    /// Whether moving from `self` to `next` is forward progress.
    #[must_use]
    pub fn can_progress_to(&self, next: Self) -> bool {
        use OrganStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Available, Matched | InTransit | Expired | Discarded)
                | (Matched, InTransit | Transplanted | Expired | Discarded)
                | (InTransit, Transplanted | Expired | Discarded)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    Proposed,
    Accepted,
    Declined,
    Completed,
}

impl AllocationStatus {
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "proposed" => Some(Self::Proposed),
            "accepted" => Some(Self::Accepted),
            "declined" => Some(Self::Declined),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposed => "proposed",
            Self::Accepted => "accepted",
            Self::Declined => "declined",
            Self::Completed => "completed",
        }
    }

    /// Active allocations are the ones a coordinator still acts on.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Proposed | Self::Accepted)
    }

    #[must_use]
    pub fn can_progress_to(&self, next: Self) -> bool {
        use AllocationStatus::*;
        if *self == next {
            return true;
        }
        matches!(
            (self, next),
            (Proposed, Accepted | Declined) | (Accepted, Completed | Declined)
        )
    }
}

/// Default status assigned on creation.
pub const DONOR_INITIAL_STATUS: &str = "active";
pub const DONOR_DELETED_STATUS: &str = "inactive";
pub const RECIPIENT_WAITING_STATUS: &str = "waiting";
