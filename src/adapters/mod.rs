//! Adapters layer: Concrete implementations of ports.
//!
//! - `cipher`: AES-256-GCM PHI field cipher
//! - `keyring`: key providers and secure passphrase sources
//! - `sqlite`: SQLite record and audit storage
//! - `memory`: in-memory storage for tests
//! - `sanitize`: PHI filtering for logs

pub mod cipher;
pub mod keyring;
pub mod memory;
pub mod sanitize;
pub mod sqlite;

// Re-export storage error for lib.rs
pub use sqlite::StorageError;
