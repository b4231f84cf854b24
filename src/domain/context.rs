//! Caller identity and per-operation context.

use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use super::entity::{EntityKind, Role};
use super::ids::request_token;
use super::record::Record;

/// Authenticated identity handed over by the (external) auth layer.
///
/// Every field is optional: unauthenticated callers still get audited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerContext {
    pub user_id: Option<String>,
    pub email: Option<String>,
    pub role: Option<Role>,
    pub name: Option<String>,
    pub session_id: Option<String>,
    pub source_addr: Option<String>,
}

impl CallerContext {
    /// Caller with a known role.
    #[must_use]
    pub fn new(user_id: impl Into<String>, role: Role) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: Some(role),
            ..Self::default()
        }
    }

    /// Caller whose role arrives as a raw string. Unknown roles become `None`.
    #[must_use]
    pub fn from_raw_role(user_id: impl Into<String>, role: &str) -> Self {
        Self {
            user_id: Some(user_id.into()),
            role: Role::parse(role),
            ..Self::default()
        }
    }

    /// No identity at all.
    #[must_use]
    pub fn anonymous() -> Self {
        Self::default()
    }

    /// Internal maintenance identity (CLI, scheduled jobs).
    #[must_use]
    pub fn system() -> Self {
        Self {
            user_id: Some("system".to_string()),
            role: Some(Role::Admin),
            name: Some("organguard".to_string()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    #[must_use]
    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    #[must_use]
    pub fn with_source_addr(mut self, addr: impl Into<String>) -> Self {
        self.source_addr = Some(addr.into());
        self
    }

    /// Whether this caller is the owner of user record `id`.
    #[must_use]
    pub fn is_user(&self, id: &str) -> bool {
        self.user_id.as_deref() == Some(id)
    }
}

/// Before/after snapshots of one mutation.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationDiff {
    pub entity: EntityKind,
    pub entity_id: Option<String>,
    pub before: Option<Record>,
    pub after: Option<Record>,
    pub changed_fields: Vec<String>,
}

/// Context carried through every store call of one operation.
///
/// When created by the audit interceptor the context is *scoped*: mutation
/// diffs captured by the audited store are attached to the request's single
/// audit entry instead of producing a second one.
#[derive(Debug)]
pub struct OperationContext {
    pub caller: CallerContext,
    pub request_id: String,
    scope: Option<Mutex<Option<MutationDiff>>>,
}

impl OperationContext {
    /// Standalone context with a fresh request id.
    #[must_use]
    pub fn new(caller: CallerContext) -> Self {
        Self {
            caller,
            request_id: request_token(),
            scope: None,
        }
    }

    /// Context owned by an audit interceptor.
    #[must_use]
    pub fn scoped(caller: CallerContext, request_id: impl Into<String>) -> Self {
        Self {
            caller,
            request_id: request_id.into(),
            scope: Some(Mutex::new(None)),
        }
    }

    #[must_use]
    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    #[must_use]
    pub fn role(&self) -> Option<Role> {
        self.caller.role
    }

    /// Attach a mutation diff to the enclosing request.
    ///
    /// Returns `false` when the context is not scoped; the caller must then
    /// record the diff itself.
    pub fn capture_mutation(&self, diff: MutationDiff) -> bool {
        match &self.scope {
            Some(slot) => {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(diff);
                true
            }
            None => false,
        }
    }

    /// Remove the captured diff, if any.
    pub fn take_mutation(&self) -> Option<MutationDiff> {
        self.scope
            .as_ref()
            .and_then(|slot| slot.lock().unwrap_or_else(PoisonError::into_inner).take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diff() -> MutationDiff {
        MutationDiff {
            entity: EntityKind::Organ,
            entity_id: Some("o-1".into()),
            before: None,
            after: Some(Record::new()),
            changed_fields: vec![],
        }
    }

    #[test]
    fn test_unscoped_context_rejects_capture() {
        let ctx = OperationContext::new(CallerContext::anonymous());
        assert!(!ctx.capture_mutation(diff()));
        assert!(ctx.take_mutation().is_none());
        assert_eq!(ctx.request_id.len(), 32);
    }

    #[test]
    fn test_scoped_context_keeps_last_diff() {
        let ctx = OperationContext::scoped(CallerContext::system(), "req-1");
        assert!(ctx.capture_mutation(diff()));
        let taken = ctx.take_mutation().expect("captured");
        assert_eq!(taken.entity_id.as_deref(), Some("o-1"));
        assert!(ctx.take_mutation().is_none());
    }

    #[test]
    fn test_unknown_raw_role_has_no_role() {
        let caller = CallerContext::from_raw_role("u-1", "janitor");
        assert!(caller.role.is_none());
        assert!(caller.is_user("u-1"));
    }
}
