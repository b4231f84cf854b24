//! Key provisioning port.
//!
//! Key management and rotation live outside this crate; the cipher only asks
//! for the current version and for the key of a given version.

use crate::domain::{CipherError, MasterKey};

/// Source of versioned master keys.
pub trait KeyProvider: Send + Sync {
    /// Version new ciphertext is written under.
    ///
    /// # Errors
    /// Returns `CipherError::EncryptionUnavailable` if no key is configured.
    fn current_version(&self) -> Result<u32, CipherError>;

    /// Key for `version`.
    ///
    /// # Errors
    /// Returns `CipherError::EncryptionUnavailable` for unknown versions.
    fn key(&self, version: u32) -> Result<MasterKey, CipherError>;

    /// Key for the current version.
    ///
    /// # Errors
    /// Same as [`KeyProvider::key`].
    fn current_key(&self) -> Result<MasterKey, CipherError> {
        self.key(self.current_version()?)
    }
}
