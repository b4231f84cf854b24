//! Application layer: permission engine, store decorators and services.
//!
//! [`OrganGuard`] wires the usual stack together:
//!
//! ```text
//! RbacStore -> AuditedStore -> PhiRecordStore -> Persistence
//! ```
//!
//! and runs every operation through the [`AuditTrail`] interceptor so each
//! call leaves exactly one audit entry.

pub mod audit_trail;
pub mod audited;
pub mod auth_audit;
pub mod compliance;
pub mod matching;
pub mod permissions;
pub mod rbac;
pub mod record_store;

pub use audit_trail::AuditTrail;
pub use audited::AuditedStore;
pub use auth_audit::AuthAuditLogger;
pub use compliance::{CheckStatus, ComplianceCheck, ComplianceReport, ComplianceService};
pub use matching::{MatchCandidate, MatchingService, ViabilityStatus};
pub use permissions::{EntityRules, FieldValidation, PermissionMatrix};
pub use rbac::RbacStore;
pub use record_store::PhiRecordStore;

use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;

use crate::adapters::cipher::AesGcmPhiCipher;
use crate::adapters::keyring::PassphraseKeyProvider;
use crate::adapters::sqlite::SqlitePersistence;
use crate::config::Config;
use crate::domain::kdf::KdfParams;
use crate::domain::{
    collection_segment, AuditEntry, CallerContext, EntityKind, Operation, Record, RequestInfo,
    SpecialOperation,
};
use crate::ports::{AuditRecorder, AuditSink, EntityStore, KeyProvider, Persistence, Query};
use crate::{OrganGuardError, Result};

/// The full store stack over backend `P`.
pub type GuardedStore<P> = RbacStore<AuditedStore<PhiRecordStore<P, AesGcmPhiCipher>>>;

/// Audited, permission-checked access to the data core.
///
/// Every method takes the caller resolved by the external authentication
/// layer and records one audit entry, whether it succeeds or not.
pub struct OrganGuard<P>
where
    P: Persistence + AuditSink + 'static,
{
    backend: Arc<P>,
    permissions: Arc<PermissionMatrix>,
    trail: Arc<AuditTrail>,
    store: Arc<GuardedStore<P>>,
    matching: MatchingService<GuardedStore<P>>,
    compliance: ComplianceService<P>,
    auth: AuthAuditLogger<P>,
}

impl<P> OrganGuard<P>
where
    P: Persistence + AuditSink + 'static,
{
    pub fn new(
        backend: Arc<P>,
        keys: Arc<dyn KeyProvider>,
        permissions: PermissionMatrix,
        config: &Config,
    ) -> Self {
        let permissions = Arc::new(permissions);
        let trail = Arc::new(AuditTrail::spawn(Arc::clone(&backend)));
        let recorder: Arc<dyn AuditRecorder> = trail.clone();

        let cipher = Arc::new(AesGcmPhiCipher::new(Arc::clone(&keys)));
        let base = PhiRecordStore::new(Arc::clone(&backend), cipher);
        let audited = AuditedStore::new(base, Arc::clone(&recorder));
        let store = Arc::new(
            RbacStore::new(audited, Arc::clone(&permissions))
                .with_denial_recorder(Arc::clone(&recorder)),
        );

        let matching = MatchingService::new(Arc::clone(&store), config.urgency);
        let compliance = ComplianceService::new(
            Arc::clone(&backend),
            keys,
            Arc::clone(&permissions),
            config.compliance.clone(),
        );
        let auth = AuthAuditLogger::new(Arc::clone(&backend), recorder, config.lockout_threshold);

        tracing::info!(permissions = %permissions.version, "Data core ready");

        Self {
            backend,
            permissions,
            trail,
            store,
            matching,
            compliance,
            auth,
        }
    }

    pub fn permissions(&self) -> &PermissionMatrix {
        &self.permissions
    }

    pub fn trail(&self) -> &AuditTrail {
        &self.trail
    }

    /// The raw store stack, for callers running their own interceptor.
    pub fn store(&self) -> &GuardedStore<P> {
        &self.store
    }

    pub fn backend(&self) -> &P {
        &self.backend
    }

    pub fn auth(&self) -> &AuthAuditLogger<P> {
        &self.auth
    }

    /// Wait for queued audit entries to be written.
    pub fn flush(&self) {
        self.trail.flush();
    }

    pub fn create(&self, caller: &CallerContext, entity: EntityKind, data: Record) -> Result<Record> {
        let request = RequestInfo::for_operation(entity, Operation::Create, None);
        self.trail
            .intercept(caller, &request, |ctx| self.store.create(ctx, entity, data))
    }

    pub fn get(&self, caller: &CallerContext, entity: EntityKind, id: &str) -> Result<Record> {
        let request = RequestInfo::for_operation(entity, Operation::Read, Some(id));
        self.trail
            .intercept(caller, &request, |ctx| self.store.get(ctx, entity, id))
    }

    pub fn update(
        &self,
        caller: &CallerContext,
        entity: EntityKind,
        id: &str,
        changes: Record,
    ) -> Result<Record> {
        let request = RequestInfo::for_operation(entity, Operation::Update, Some(id));
        self.trail
            .intercept(caller, &request, |ctx| self.store.update(ctx, entity, id, changes))
    }

    pub fn delete(&self, caller: &CallerContext, entity: EntityKind, id: &str) -> Result<()> {
        let request = RequestInfo::for_operation(entity, Operation::Delete, Some(id));
        self.trail
            .intercept(caller, &request, |ctx| self.store.delete(ctx, entity, id))
    }

    pub fn list(&self, caller: &CallerContext, entity: EntityKind, query: &Query) -> Result<Vec<Record>> {
        let request = RequestInfo::for_operation(entity, Operation::Read, None);
        self.trail
            .intercept(caller, &request, |ctx| self.store.list(ctx, entity, query))
    }

    /// Equality search on a deterministically encrypted field.
    pub fn search(
        &self,
        caller: &CallerContext,
        entity: EntityKind,
        field: &str,
        value: &Value,
    ) -> Result<Vec<Record>> {
        let request = RequestInfo::new("POST", format!("/api/{}/search", collection_segment(entity)));
        self.trail.intercept(caller, &request, |ctx| {
            self.store.search(ctx, entity, field, value)
        })
    }

    pub fn export(&self, caller: &CallerContext, entity: EntityKind) -> Result<Vec<Record>> {
        let request = RequestInfo::for_export(entity);
        self.trail
            .intercept(caller, &request, |ctx| self.store.export(ctx, entity))
    }

    pub fn available_organs(&self, caller: &CallerContext) -> Result<Vec<Record>> {
        let request = RequestInfo::new("GET", "/api/organs/available");
        self.trail
            .intercept(caller, &request, |ctx| self.store.available_organs(ctx))
    }

    pub fn waiting_recipients(&self, caller: &CallerContext, organ_type: Option<&str>) -> Result<Vec<Record>> {
        let request = RequestInfo::new("GET", "/api/recipients/waiting");
        self.trail.intercept(caller, &request, |ctx| {
            self.store.waiting_recipients(ctx, organ_type)
        })
    }

    pub fn organs_for_donor(&self, caller: &CallerContext, donor_id: &str) -> Result<Vec<Record>> {
        let request = RequestInfo::new("GET", format!("/api/organs?donorId={donor_id}"));
        self.trail
            .intercept(caller, &request, |ctx| self.store.organs_for_donor(ctx, donor_id))
    }

    pub fn allocations_for_organ(&self, caller: &CallerContext, organ_id: &str) -> Result<Vec<Record>> {
        let request = RequestInfo::new("GET", format!("/api/allocations?organId={organ_id}"));
        self.trail.intercept(caller, &request, |ctx| {
            self.store.allocations_for_organ(ctx, organ_id)
        })
    }

    pub fn transports_for_organ(&self, caller: &CallerContext, organ_id: &str) -> Result<Vec<Record>> {
        let request = RequestInfo::new("GET", format!("/api/transports?organId={organ_id}"));
        self.trail.intercept(caller, &request, |ctx| {
            self.store.transports_for_organ(ctx, organ_id)
        })
    }

    pub fn compatible_recipients(&self, caller: &CallerContext, organ_id: &str) -> Result<Vec<MatchCandidate>> {
        let request = RequestInfo::new("GET", format!("/api/organs/{organ_id}/compatible"));
        self.trail.intercept(caller, &request, |ctx| {
            self.matching.compatible_recipients(ctx, organ_id)
        })
    }

    pub fn viability_report(&self, caller: &CallerContext) -> Result<Vec<ViabilityStatus>> {
        let request = RequestInfo::new("GET", "/api/organs/viability");
        self.trail.intercept(caller, &request, |ctx| {
            self.matching.viability_report(ctx, Utc::now())
        })
    }

    pub fn compliance_report(&self, caller: &CallerContext) -> Result<ComplianceReport> {
        let request = RequestInfo::new("GET", "/api/compliance/report");
        self.trail
            .intercept(caller, &request, |_| self.compliance.report(caller))
    }

    /// Most recent audit entries, newest first.
    pub fn recent_audit(&self, caller: &CallerContext, limit: usize) -> Result<Vec<AuditEntry>> {
        let request = RequestInfo::new("GET", "/api/audit-logs");
        self.trail.intercept(caller, &request, |_| {
            if !self
                .permissions
                .has_special_permission(caller.role, SpecialOperation::ViewAuditLogs)
            {
                return Err(OrganGuardError::forbidden("audit log requires view_audit_logs"));
            }
            self.backend
                .recent_audit(limit)
                .map_err(OrganGuardError::storage)
        })
    }
}

impl OrganGuard<SqlitePersistence> {
    /// Open the SQLite-backed core described by `config`.
    ///
    /// Keys are derived from the passphrase found through the secret sources
    /// in [`crate::adapters::keyring`].
    ///
    /// # Errors
    /// Fails if the database cannot be opened, no key passphrase is available
    /// or the permission matrix cannot be loaded.
    pub fn open(config: &Config) -> Result<Self> {
        let permissions = config.load_permissions()?;
        let keys = PassphraseKeyProvider::from_secret_sources(
            config.installation_salt.clone(),
            config.key_version,
            KdfParams::default(),
        )
        .map_err(|e| OrganGuardError::EncryptionUnavailable(e.to_string()))?;
        let backend = SqlitePersistence::open(&config.db_path)?;

        Ok(Self::new(Arc::new(backend), Arc::new(keys), permissions, config))
    }
}
