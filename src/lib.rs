//! # organguard
//!
//! Compliance-aware data access core for organ donation logistics.
//!
//! This crate provides:
//! - Field-level AES-256-GCM encryption of PHI at rest
//! - Role-scoped authorization for entities, fields and special operations
//! - An immutable, outcome-independent audit trail
//! - Blood type / HLA compatibility and organ viability tracking
//!
//! ## Architecture
//!
//! The crate follows Hexagonal Architecture:
//! - `domain`: Core types (records, schemas, lifecycles, envelopes, audit entries)
//! - `ports`: Trait definitions (key provisioning, persistence, audit sink, entity store)
//! - `adapters`: Concrete implementations (AES-GCM cipher, SQLite, in-memory, log sanitizer)
//! - `application`: Permission matrix, store decorators, audit trail and services
//!
//! The usual stack is `RbacStore<AuditedStore<PhiRecordStore<_, _>>>`; see
//! [`application::OrganGuard`].

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod ports;

pub use domain::{CallerContext, EntityKind, OperationContext, Record, Role};

/// Result type for organguard operations
pub type Result<T> = std::result::Result<T, OrganGuardError>;

/// Main error type for organguard
#[derive(Debug, thiserror::Error)]
pub enum OrganGuardError {
    #[error("Access denied: {reason}")]
    Forbidden { reason: String },

    #[error("{entity} {id} not found")]
    NotFound { entity: EntityKind, id: String },

    #[error("Encryption unavailable: {0}")]
    EncryptionUnavailable(String),

    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Validation failed for fields: {}", fields.join(", "))]
    ValidationFailed { fields: Vec<String> },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Audit write failed: {0}")]
    AuditWriteFailed(String),

    #[error("Storage operation failed: {0}")]
    Storage(#[from] adapters::StorageError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<domain::CipherError> for OrganGuardError {
    fn from(e: domain::CipherError) -> Self {
        match e {
            domain::CipherError::EncryptionUnavailable(m) | domain::CipherError::KeyDerivation(m) => {
                Self::EncryptionUnavailable(m)
            }
            domain::CipherError::DecryptionFailed(m) => Self::DecryptionFailed(m),
        }
    }
}

impl OrganGuardError {
    pub(crate) fn forbidden(reason: impl Into<String>) -> Self {
        Self::Forbidden {
            reason: reason.into(),
        }
    }

    pub(crate) fn not_found(entity: EntityKind, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub(crate) fn validation(fields: Vec<String>) -> Self {
        Self::ValidationFailed { fields }
    }

    /// Lift a backend error into the storage variant.
    pub(crate) fn storage<E: Into<adapters::StorageError>>(e: E) -> Self {
        Self::Storage(e.into())
    }

    /// Stable machine-readable code, recorded in audit entries.
    #[must_use]
    pub fn code(&self) -> &'static str {
        match self {
            Self::Forbidden { .. } => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::EncryptionUnavailable(_) => "ENCRYPTION_UNAVAILABLE",
            Self::DecryptionFailed(_) => "DECRYPTION_FAILED",
            Self::ValidationFailed { .. } => "VALIDATION_FAILED",
            Self::InvalidRecord(_) => "INVALID_RECORD",
            Self::AuditWriteFailed(_) => "AUDIT_WRITE_FAILED",
            Self::Storage(_) => "STORAGE_ERROR",
            Self::Config(_) => "CONFIG_ERROR",
            Self::Io(_) => "IO_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Text safe to hand back to a caller. Detail stays in the audit entry.
    #[must_use]
    pub fn public_message(&self) -> String {
        match self {
            Self::Forbidden { .. } => "access denied".to_string(),
            Self::NotFound { entity, .. } => format!("{entity} not found"),
            Self::ValidationFailed { fields } => {
                format!("not permitted to modify fields: {}", fields.join(", "))
            }
            Self::InvalidRecord(reason) => format!("invalid record: {reason}"),
            _ => "internal server error".to_string(),
        }
    }
}
