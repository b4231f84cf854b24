//! Audit entry model: data-access entries and authentication events.
//!
//! Entries are plain values. They are built once per operation, handed to an
//! audit sink and never modified afterwards.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::context::{CallerContext, MutationDiff};
use super::entity::{EntityKind, Operation};
use super::ids::{new_record_id, request_token};
use super::record::Record;
use super::schema::{is_phi_entity, schema_for};

/// Placeholder stored in audit snapshots instead of PHI values.
pub const REDACTED: &str = "[REDACTED]";

/// Path segments that name a sub-resource rather than a record id.
const RESERVED_SEGMENTS: &[&str] = &[
    "search",
    "export",
    "available",
    "waiting",
    "stats",
    "count",
    "compatible",
    "viability",
    "me",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    View,
    Create,
    Update,
    Delete,
    Export,
    Login,
    Logout,
    Other,
}

impl AuditAction {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Export => "export",
            Self::Login => "login",
            Self::Logout => "logout",
            Self::Other => "other",
        }
    }

    /// Default category for an action.
    #[must_use]
    pub fn category(&self) -> AuditCategory {
        match self {
            Self::View => AuditCategory::DataAccess,
            Self::Create | Self::Update | Self::Delete => AuditCategory::DataModification,
            Self::Export => AuditCategory::Export,
            Self::Login | Self::Logout => AuditCategory::Authentication,
            Self::Other => AuditCategory::Other,
        }
    }

    #[must_use]
    pub fn is_mutation(&self) -> bool {
        matches!(self, Self::Create | Self::Update | Self::Delete)
    }
}

impl From<Operation> for AuditAction {
    fn from(op: Operation) -> Self {
        match op {
            Operation::Create => Self::Create,
            Operation::Read => Self::View,
            Operation::Update => Self::Update,
            Operation::Delete => Self::Delete,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    DataAccess,
    DataModification,
    Authentication,
    Export,
    Authorization,
    Other,
}

impl AuditCategory {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataAccess => "data_access",
            Self::DataModification => "data_modification",
            Self::Authentication => "authentication",
            Self::Export => "export",
            Self::Authorization => "authorization",
            Self::Other => "other",
        }
    }
}

/// The inbound request an audit entry describes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestInfo {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub user_agent: Option<String>,
}

impl RequestInfo {
    #[must_use]
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            request_id: request_token(),
            method: method.into().to_ascii_uppercase(),
            path: path.into(),
            user_agent: None,
        }
    }

    /// Synthesize the request for a direct store operation.
    #[must_use]
    pub fn for_operation(entity: EntityKind, op: Operation, id: Option<&str>) -> Self {
        let mut path = format!("/api/{}", collection_segment(entity));
        if let Some(id) = id {
            path.push('/');
            path.push_str(id);
        }
        Self::new(op.http_method(), path)
    }

    #[must_use]
    pub fn for_export(entity: EntityKind) -> Self {
        Self::new("GET", format!("/api/export/{}", collection_segment(entity)))
    }

    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    #[must_use]
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    #[must_use]
    pub fn action(&self) -> AuditAction {
        derive_action(&self.method, &self.path)
    }

    #[must_use]
    pub fn target(&self) -> (Option<EntityKind>, Option<String>) {
        parse_target(&self.path)
    }
}

/// REST collection name for an entity (`custody-logs`).
#[must_use]
pub fn collection_segment(entity: EntityKind) -> String {
    format!("{}s", entity.as_str()).replace('_', "-")
}

fn path_segments(path: &str) -> Vec<String> {
    let path = path.split(['?', '#']).next().unwrap_or_default();
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(str::to_ascii_lowercase)
        .collect()
}

/// Action implied by verb and path.
#[must_use]
pub fn derive_action(method: &str, path: &str) -> AuditAction {
    let segments = path_segments(path);
    let has = |name: &str| segments.iter().any(|s| s == name);

    if has("login") {
        return AuditAction::Login;
    }
    if has("logout") {
        return AuditAction::Logout;
    }
    if has("export") {
        return AuditAction::Export;
    }

    match method.to_ascii_uppercase().as_str() {
        "GET" | "HEAD" => AuditAction::View,
        // Search endpoints take their criteria in the body.
        "POST" if segments.last().map(String::as_str) == Some("search") => AuditAction::View,
        "POST" => AuditAction::Create,
        "PUT" | "PATCH" => AuditAction::Update,
        "DELETE" => AuditAction::Delete,
        _ => AuditAction::Other,
    }
}

/// Entity type and record id addressed by a path such as
/// `/api/recipients/abc-123` or `/api/v1/export/donors`.
#[must_use]
pub fn parse_target(path: &str) -> (Option<EntityKind>, Option<String>) {
    let raw_segments: Vec<&str> = path
        .split(['?', '#'])
        .next()
        .unwrap_or_default()
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    let mut iter = raw_segments.iter().skip_while(|s| {
        let lower = s.to_ascii_lowercase();
        lower == "api" || lower == "export" || is_version_segment(&lower)
    });

    let entity = match iter.next().and_then(|s| EntityKind::parse(s)) {
        Some(entity) => entity,
        None => return (None, None),
    };

    let id = iter
        .next()
        .filter(|s| !RESERVED_SEGMENTS.contains(&s.to_ascii_lowercase().as_str()))
        .map(|s| (*s).to_string());

    (Some(entity), id)
}

fn is_version_segment(segment: &str) -> bool {
    segment.len() > 1
        && segment.starts_with('v')
        && segment[1..].chars().all(|c| c.is_ascii_digit())
}

/// Names of fields whose serialized value differs between two snapshots.
///
/// A field present on one side only counts as changed. Sorted by name.
#[must_use]
pub fn changed_fields(before: Option<&Record>, after: Option<&Record>) -> Vec<String> {
    let empty = Record::new();
    let before = before.unwrap_or(&empty);
    let after = after.unwrap_or(&empty);

    let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
    keys.sort();
    keys.dedup();

    keys.into_iter()
        .filter(|key| {
            let serialized = |r: &Record| r.get(key.as_str()).map(Value::to_string);
            serialized(before) != serialized(after)
        })
        .cloned()
        .collect()
}

/// Snapshot for the audit log with PHI values replaced by [`REDACTED`].
#[must_use]
pub fn redact_snapshot(entity: EntityKind, record: &Record) -> Value {
    let schema = schema_for(entity);
    let redacted: Map<String, Value> = record
        .iter()
        .map(|(key, value)| {
            if schema.is_phi(key) && !value.is_null() {
                (key.clone(), Value::String(REDACTED.to_string()))
            } else {
                (key.clone(), value.clone())
            }
        })
        .collect();
    Value::Object(redacted)
}

/// One immutable data-access audit entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub request_id: String,

    pub user_id: Option<String>,
    pub user_email: Option<String>,
    pub user_role: Option<String>,
    pub user_name: Option<String>,
    pub session_id: Option<String>,
    pub source_addr: Option<String>,

    pub action: AuditAction,
    pub category: AuditCategory,
    pub entity_type: Option<String>,
    pub entity_id: Option<String>,
    pub phi_accessed: bool,

    pub success: bool,
    pub error_code: Option<String>,
    pub error_message: Option<String>,
    pub result_count: Option<usize>,

    pub before: Option<Value>,
    pub after: Option<Value>,
    #[serde(default)]
    pub changed_fields: Vec<String>,

    pub metadata: Value,
}

impl AuditEntry {
    /// Start an entry for `request` made by `caller`. The outcome defaults to
    /// success until one of the outcome builders says otherwise.
    #[must_use]
    pub fn begin(caller: &CallerContext, request: &RequestInfo) -> Self {
        let action = request.action();
        let (entity, entity_id) = request.target();

        let mut metadata = json!({
            "method": request.method,
            "path": request.path,
            "requestToken": request_token(),
        });
        if let Some(agent) = &request.user_agent {
            metadata["userAgent"] = Value::String(agent.clone());
        }

        Self {
            id: new_record_id(),
            timestamp: Utc::now(),
            request_id: request.request_id.clone(),
            user_id: caller.user_id.clone(),
            user_email: caller.email.clone(),
            user_role: caller.role.map(|r| r.as_str().to_string()),
            user_name: caller.name.clone(),
            session_id: caller.session_id.clone(),
            source_addr: caller.source_addr.clone(),
            action,
            category: action.category(),
            entity_type: entity.map(|e| e.as_str().to_string()),
            entity_id,
            phi_accessed: entity.is_some_and(is_phi_entity),
            success: true,
            error_code: None,
            error_message: None,
            result_count: None,
            before: None,
            after: None,
            changed_fields: Vec::new(),
            metadata,
        }
    }

    /// Successful outcome. `entity_id` fills in the id when the path had none
    /// (e.g. a create).
    #[must_use]
    pub fn succeeded(mut self, result_count: Option<usize>, entity_id: Option<String>) -> Self {
        self.success = true;
        self.result_count = result_count;
        if self.entity_id.is_none() {
            self.entity_id = entity_id;
        }
        self
    }

    #[must_use]
    pub fn failed(mut self, error_code: impl Into<String>, error_message: impl Into<String>) -> Self {
        self.success = false;
        self.error_code = Some(error_code.into());
        self.error_message = Some(error_message.into());
        self
    }

    #[must_use]
    pub fn with_category(mut self, category: AuditCategory) -> Self {
        self.category = category;
        self
    }

    #[must_use]
    pub fn with_target(mut self, entity: EntityKind, entity_id: Option<String>) -> Self {
        self.entity_type = Some(entity.as_str().to_string());
        self.phi_accessed = is_phi_entity(entity);
        if entity_id.is_some() {
            self.entity_id = entity_id;
        }
        self
    }

    /// Attach before/after snapshots (PHI redacted) and the changed field set.
    #[must_use]
    pub fn with_mutation(mut self, diff: &MutationDiff) -> Self {
        self.before = diff.before.as_ref().map(|r| redact_snapshot(diff.entity, r));
        self.after = diff.after.as_ref().map(|r| redact_snapshot(diff.entity, r));
        self.changed_fields = diff.changed_fields.clone();
        if self.entity_id.is_none() {
            self.entity_id = diff.entity_id.clone();
        }
        self
    }

    #[must_use]
    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        let ms = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        self.metadata["durationMs"] = json!(ms);
        self
    }

    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        if !self.metadata.is_object() {
            self.metadata = json!({});
        }
        self.metadata[key] = value;
        self
    }
}

/// Authentication stream event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthEvent {
    Login,
    LoginFailed,
    Logout,
    Lockout,
    RoleChange,
    MfaChallenge,
}

impl AuthEvent {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Login => "login",
            Self::LoginFailed => "login_failed",
            Self::Logout => "logout",
            Self::Lockout => "lockout",
            Self::RoleChange => "role_change",
            Self::MfaChallenge => "mfa_challenge",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Login,
            Self::LoginFailed,
            Self::Logout,
            Self::Lockout,
            Self::RoleChange,
            Self::MfaChallenge,
        ]
        .into_iter()
        .find(|e| e.as_str() == s)
    }
}

/// One immutable authentication event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthAuditEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event: AuthEvent,
    pub user_id: Option<String>,
    /// Email as typed by the caller; recorded even when it matches no user.
    pub email: Option<String>,
    pub role: Option<String>,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub consecutive_failures: u32,
    pub mfa_used: bool,
    pub source_addr: Option<String>,
    pub session_id: Option<String>,
    pub metadata: Value,
}

impl AuthAuditEntry {
    #[must_use]
    pub fn new(event: AuthEvent, caller: &CallerContext) -> Self {
        Self {
            id: new_record_id(),
            timestamp: Utc::now(),
            event,
            user_id: caller.user_id.clone(),
            email: caller.email.clone(),
            role: caller.role.map(|r| r.as_str().to_string()),
            success: !matches!(event, AuthEvent::LoginFailed | AuthEvent::Lockout),
            failure_reason: None,
            consecutive_failures: 0,
            mfa_used: false,
            source_addr: caller.source_addr.clone(),
            session_id: caller.session_id.clone(),
            metadata: json!({}),
        }
    }
}
