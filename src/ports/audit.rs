//! Audit ports: the append-only backend and the recording injection point.

use crate::adapters::StorageError;
use crate::domain::{AuditEntry, AuthAuditEntry};

/// Append-only audit storage. No update, no delete.
pub trait AuditSink: Send + Sync {
    type Error: std::error::Error + Into<StorageError> + Send + Sync + 'static;

    fn append_audit(&self, entry: &AuditEntry) -> Result<(), Self::Error>;

    fn append_auth_audit(&self, entry: &AuthAuditEntry) -> Result<(), Self::Error>;

    /// Newest entries first.
    fn recent_audit(&self, limit: usize) -> Result<Vec<AuditEntry>, Self::Error>;

    /// Newest entries first.
    fn recent_auth_audit(&self, limit: usize) -> Result<Vec<AuthAuditEntry>, Self::Error>;

    /// Authentication events for one email (case-insensitive), newest first.
    fn auth_audit_for_email(
        &self,
        email: &str,
        limit: usize,
    ) -> Result<Vec<AuthAuditEntry>, Self::Error>;

    fn audit_count(&self) -> Result<usize, Self::Error>;
}

/// Where decorators and services hand finished entries.
///
/// Recording never fails from the caller's point of view; write failures are
/// the recorder's problem.
pub trait AuditRecorder: Send + Sync {
    fn record(&self, entry: AuditEntry);

    fn record_auth(&self, entry: AuthAuditEntry);
}
