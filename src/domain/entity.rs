//! Entity kinds, roles and operations shared by every layer.

use serde::{Deserialize, Serialize};

/// Kind of persisted record handled by the data access core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Donor,
    Organ,
    Recipient,
    Allocation,
    Transport,
    Message,
    CustodyLog,
    Metric,
    User,
    AuditLog,
}

impl EntityKind {
    /// Every entity kind, in schema order.
    pub const ALL: [EntityKind; 10] = [
        Self::Donor,
        Self::Organ,
        Self::Recipient,
        Self::Allocation,
        Self::Transport,
        Self::Message,
        Self::CustodyLog,
        Self::Metric,
        Self::User,
        Self::AuditLog,
    ];

    /// Stable storage name.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Donor => "donor",
            Self::Organ => "organ",
            Self::Recipient => "recipient",
            Self::Allocation => "allocation",
            Self::Transport => "transport",
            Self::Message => "message",
            Self::CustodyLog => "custody_log",
            Self::Metric => "metric",
            Self::User => "user",
            Self::AuditLog => "audit_log",
        }
    }

    /// Parse a storage name (`custody_log`) or a REST collection segment
    /// (`custody-logs`, `donors`).
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        let singular = match normalized.as_str() {
            "custody" | "custody_logs" | "custodylogs" => "custody_log",
            "audit" | "audit_logs" | "auditlogs" => "audit_log",
            other => other.strip_suffix('s').unwrap_or(other),
        };

        Self::ALL.into_iter().find(|kind| kind.as_str() == singular)
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller role, resolved by the (external) authentication layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    Coordinator,
    MedicalStaff,
    Transport,
    Viewer,
}

impl Role {
    pub const ALL: [Role; 5] = [
        Self::Admin,
        Self::Coordinator,
        Self::MedicalStaff,
        Self::Transport,
        Self::Viewer,
    ];

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::Coordinator => "coordinator",
            Self::MedicalStaff => "medical_staff",
            Self::Transport => "transport",
            Self::Viewer => "viewer",
        }
    }

    /// Parse a role name. Unknown names yield `None` and are denied everything.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        let normalized = name.trim().to_ascii_lowercase().replace('-', "_");
        Self::ALL.into_iter().find(|role| role.as_str() == normalized)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Entity-level CRUD operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Create,
    Read,
    Update,
    Delete,
}

impl Operation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    /// HTTP verb the route layer maps onto this operation.
    #[must_use]
    pub fn http_method(&self) -> &'static str {
        match self {
            Self::Create => "POST",
            Self::Read => "GET",
            Self::Update => "PATCH",
            Self::Delete => "DELETE",
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Operations gated outside of the CRUD matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpecialOperation {
    Export,
    ViewAuditLogs,
    ManageUsers,
    ViewAllData,
    UpdateAllocation,
    UpdateMedicalData,
}

impl SpecialOperation {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Export => "export",
            Self::ViewAuditLogs => "view_audit_logs",
            Self::ManageUsers => "manage_users",
            Self::ViewAllData => "view_all_data",
            Self::UpdateAllocation => "update_allocation",
            Self::UpdateMedicalData => "update_medical_data",
        }
    }
}

impl std::fmt::Display for SpecialOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_parse_accepts_collection_segments() {
        assert_eq!(EntityKind::parse("donors"), Some(EntityKind::Donor));
        assert_eq!(EntityKind::parse("custody-logs"), Some(EntityKind::CustodyLog));
        assert_eq!(EntityKind::parse("audit_log"), Some(EntityKind::AuditLog));
        assert_eq!(EntityKind::parse("Recipients"), Some(EntityKind::Recipient));
        assert_eq!(EntityKind::parse("transports"), Some(EntityKind::Transport));
        assert_eq!(EntityKind::parse("transport"), Some(EntityKind::Transport));
        assert_eq!(EntityKind::parse("widgets"), None);
    }

    #[test]
    fn test_role_parse() {
        assert_eq!(Role::parse("medical-staff"), Some(Role::MedicalStaff));
        assert_eq!(Role::parse("ADMIN"), Some(Role::Admin));
        assert_eq!(Role::parse("surgeon"), None);
    }

    #[test]
    fn test_special_operation_serde_names() {
        let json = serde_json::to_string(&SpecialOperation::ViewAuditLogs).expect("serialize");
        assert_eq!(json, "\"view_audit_logs\"");
    }
}
