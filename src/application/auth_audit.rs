//! Authentication event stream.
//!
//! Logins, logouts, failed attempts, lockouts, role changes and MFA
//! challenges are recorded as [`AuthAuditEntry`] values on the audit trail.
//! Failed logins carry a per-email consecutive failure count, and crossing
//! the lockout threshold adds a lockout event.
//!
//! Counts live in process. The persisted stream only seeds an email's
//! counter the first time it is seen, so a burst of attempts or an audit
//! store outage cannot reset the count.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::json;

use crate::domain::{AuthAuditEntry, AuthEvent, CallerContext, Role};
use crate::ports::{AuditRecorder, AuditSink};

/// History scanned when seeding a counter from the persisted stream.
const FAILURE_WINDOW: usize = 100;

fn normalize(email: &str) -> String {
    email.trim().to_lowercase()
}

pub struct AuthAuditLogger<A> {
    sink: Arc<A>,
    recorder: Arc<dyn AuditRecorder>,
    lockout_threshold: u32,
    failures: Mutex<HashMap<String, u32>>,
}

impl<A: AuditSink> AuthAuditLogger<A> {
    /// `sink` seeds failure counts; entries are written via `recorder`.
    pub fn new(sink: Arc<A>, recorder: Arc<dyn AuditRecorder>, lockout_threshold: u32) -> Self {
        Self {
            sink,
            recorder,
            lockout_threshold: lockout_threshold.max(1),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn login_succeeded(&self, caller: &CallerContext, mfa_used: bool) {
        if let Some(email) = &caller.email {
            self.counters().insert(normalize(email), 0);
        }
        let mut entry = AuthAuditEntry::new(AuthEvent::Login, caller);
        entry.mfa_used = mfa_used;
        self.recorder.record_auth(entry);
        tracing::info!(mfa_used, "Login recorded");
    }

    /// Record a failed attempt for `email` (as typed, whether or not a user
    /// exists). Returns the consecutive failure count including this one.
    pub fn login_failed(&self, caller: &CallerContext, email: &str, reason: &str) -> u32 {
        let key = normalize(email);
        let failures = {
            let mut counters = self.counters();
            let seeded = match counters.get(&key) {
                Some(count) => *count,
                None => self.persisted_failures(&key),
            };
            let failures = seeded.saturating_add(1);
            counters.insert(key, failures);
            failures
        };

        let caller = caller.clone().with_email(email);
        let mut entry = AuthAuditEntry::new(AuthEvent::LoginFailed, &caller);
        entry.failure_reason = Some(reason.to_string());
        entry.consecutive_failures = failures;
        self.recorder.record_auth(entry);

        if failures == self.lockout_threshold {
            let mut lockout = AuthAuditEntry::new(AuthEvent::Lockout, &caller);
            lockout.failure_reason = Some("too many failed login attempts".to_string());
            lockout.consecutive_failures = failures;
            self.recorder.record_auth(lockout);
            tracing::warn!(failures, "Account lockout threshold reached");
        } else {
            tracing::info!(failures, "Failed login recorded");
        }

        failures
    }

    pub fn logout(&self, caller: &CallerContext) {
        self.recorder
            .record_auth(AuthAuditEntry::new(AuthEvent::Logout, caller));
    }

    /// `caller` changed the role of `target_user_id`.
    pub fn role_changed(
        &self,
        caller: &CallerContext,
        target_user_id: &str,
        from: Option<Role>,
        to: Role,
    ) {
        let mut entry = AuthAuditEntry::new(AuthEvent::RoleChange, caller);
        entry.metadata = json!({
            "targetUserId": target_user_id,
            "fromRole": from.map(|r| r.as_str()),
            "toRole": to.as_str(),
        });
        self.recorder.record_auth(entry);
        tracing::info!(to = to.as_str(), "Role change recorded");
    }

    pub fn mfa_challenge(&self, caller: &CallerContext, success: bool) {
        let mut entry = AuthAuditEntry::new(AuthEvent::MfaChallenge, caller);
        entry.mfa_used = true;
        entry.success = success;
        if !success {
            entry.failure_reason = Some("mfa verification failed".to_string());
        }
        self.recorder.record_auth(entry);
    }

    /// Failed logins for `email` since its last successful login.
    pub fn consecutive_failures(&self, email: &str) -> u32 {
        let key = normalize(email);
        if let Some(count) = self.counters().get(&key) {
            return *count;
        }
        self.persisted_failures(&key)
    }

    fn counters(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failures.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count from the persisted stream. An unreadable store counts as zero.
    fn persisted_failures(&self, email: &str) -> u32 {
        let history = match self.sink.auth_audit_for_email(email, FAILURE_WINDOW) {
            Ok(history) => history,
            Err(e) => {
                tracing::warn!(error = %e, "Auth audit history unavailable; counting from zero");
                return 0;
            }
        };

        let count = history
            .iter()
            .take_while(|e| !(e.event == AuthEvent::Login && e.success))
            .filter(|e| e.event == AuthEvent::LoginFailed)
            .count();
        u32::try_from(count).unwrap_or(u32::MAX)
    }
}
