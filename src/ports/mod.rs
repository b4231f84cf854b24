//! Ports layer: Trait definitions for external operations.
//!
//! Following Hexagonal Architecture, these traits define the boundaries
//! between the application and its collaborators (key provisioning, the
//! record backend, the audit backend).

mod audit;
mod cipher;
mod entity_store;
mod keys;
mod persistence;

pub use audit::{AuditRecorder, AuditSink};
pub use cipher::PhiCipher;
pub use entity_store::{AuditedResponse, EntityStore};
pub use keys::KeyProvider;
pub use persistence::{Persistence, Predicate, Query, SortOrder};
