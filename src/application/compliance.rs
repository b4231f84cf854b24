//! Compliance self-check.
//!
//! Reports whether the operational controls around the data core are in
//! place, together with the most recent audit activity. Restricted to roles
//! holding the view-audit-logs special operation.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::permissions::PermissionMatrix;
use crate::config::ComplianceSettings;
use crate::domain::{AuditEntry, AuthAuditEntry, CallerContext, SpecialOperation};
use crate::ports::{AuditSink, AuditedResponse, KeyProvider};
use crate::{OrganGuardError, Result};

/// Entries of each audit stream included in a report.
pub const RECENT_ENTRIES: usize = 20;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ComplianceCheck {
    pub control: String,
    pub status: CheckStatus,
    pub detail: String,
}

impl ComplianceCheck {
    fn new(control: &str, status: CheckStatus, detail: impl Into<String>) -> Self {
        Self {
            control: control.to_string(),
            status,
            detail: detail.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceReport {
    pub generated_at: DateTime<Utc>,
    pub checks: Vec<ComplianceCheck>,
    pub recent_audit: Vec<AuditEntry>,
    pub recent_auth_audit: Vec<AuthAuditEntry>,
}

impl ComplianceReport {
    /// Worst status across all checks.
    #[must_use]
    pub fn overall(&self) -> CheckStatus {
        self.checks
            .iter()
            .map(|c| c.status)
            .max()
            .unwrap_or(CheckStatus::Pass)
    }
}

impl AuditedResponse for ComplianceReport {}

pub struct ComplianceService<A> {
    sink: Arc<A>,
    keys: Arc<dyn KeyProvider>,
    permissions: Arc<PermissionMatrix>,
    settings: ComplianceSettings,
}

impl<A: AuditSink> ComplianceService<A> {
    pub fn new(
        sink: Arc<A>,
        keys: Arc<dyn KeyProvider>,
        permissions: Arc<PermissionMatrix>,
        settings: ComplianceSettings,
    ) -> Self {
        Self {
            sink,
            keys,
            permissions,
            settings,
        }
    }

    fn key_check(&self) -> ComplianceCheck {
        match self.keys.current_key() {
            Ok(key) => ComplianceCheck::new(
                "encryption_keys",
                CheckStatus::Pass,
                format!("key version {} available", key.version()),
            ),
            Err(e) => ComplianceCheck::new("encryption_keys", CheckStatus::Fail, e.to_string()),
        }
    }

    fn settings_checks(&self) -> Vec<ComplianceCheck> {
        let backups = if self.settings.backups_configured {
            ComplianceCheck::new("backups", CheckStatus::Pass, "backups configured")
        } else {
            ComplianceCheck::new("backups", CheckStatus::Fail, "no backup configuration declared")
        };

        let mfa = if self.settings.mfa_configured {
            ComplianceCheck::new("mfa", CheckStatus::Pass, "multi-factor authentication enabled")
        } else {
            ComplianceCheck::new("mfa", CheckStatus::Warn, "multi-factor authentication not enabled")
        };

        let monitoring = match &self.settings.monitoring_endpoint {
            Some(_) => ComplianceCheck::new("monitoring", CheckStatus::Pass, "monitoring endpoint configured"),
            None => ComplianceCheck::new("monitoring", CheckStatus::Warn, "no monitoring endpoint configured"),
        };

        vec![backups, mfa, monitoring]
    }

    fn audit_volume_check(&self) -> Result<ComplianceCheck> {
        let count = self.sink.audit_count().map_err(OrganGuardError::storage)?;
        Ok(if count > 0 {
            ComplianceCheck::new("audit_volume", CheckStatus::Pass, format!("{count} audit entries recorded"))
        } else {
            ComplianceCheck::new("audit_volume", CheckStatus::Warn, "audit log is empty")
        })
    }

    /// Build a report for `caller`.
    ///
    /// # Errors
    /// `Forbidden` without the view-audit-logs permission; `Storage` if the
    /// audit store cannot be read.
    pub fn report(&self, caller: &CallerContext) -> Result<ComplianceReport> {
        if !self
            .permissions
            .has_special_permission(caller.role, SpecialOperation::ViewAuditLogs)
        {
            return Err(OrganGuardError::forbidden("compliance report requires view_audit_logs"));
        }

        let mut checks = vec![self.key_check()];
        checks.extend(self.settings_checks());
        checks.push(self.audit_volume_check()?);

        let report = ComplianceReport {
            generated_at: Utc::now(),
            checks,
            recent_audit: self
                .sink
                .recent_audit(RECENT_ENTRIES)
                .map_err(OrganGuardError::storage)?,
            recent_auth_audit: self
                .sink
                .recent_auth_audit(RECENT_ENTRIES)
                .map_err(OrganGuardError::storage)?,
        };

        tracing::info!(overall = ?report.overall(), "Compliance report generated");
        Ok(report)
    }
}
