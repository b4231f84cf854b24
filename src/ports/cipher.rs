//! PHI cipher port: field-level encryption of records.

use serde_json::Value;

use crate::domain::{CipherError, Record};

/// Encrypts and decrypts the PHI fields of a record.
///
/// Fields not listed as PHI pass through unchanged, as do `null` or absent
/// PHI fields.
pub trait PhiCipher: Send + Sync {
    /// Encrypt `phi_fields`; those also in `deterministic_fields` get stable
    /// ciphertext so they can be searched by equality.
    ///
    /// # Errors
    /// Returns `CipherError::EncryptionUnavailable` if no key is available.
    fn encrypt_object(
        &self,
        record: &Record,
        phi_fields: &[&str],
        deterministic_fields: &[&str],
    ) -> Result<Record, CipherError>;

    /// Decrypt `phi_fields`.
    ///
    /// # Errors
    /// - `CipherError::EncryptionUnavailable` if the envelope's key version is unknown
    /// - `CipherError::DecryptionFailed` on a corrupt envelope, a tag mismatch,
    ///   a plaintext value in a PHI field or a deterministic field stored in
    ///   randomized mode
    fn decrypt_object(
        &self,
        record: &Record,
        phi_fields: &[&str],
        deterministic_fields: &[&str],
    ) -> Result<Record, CipherError>;

    /// Deterministic ciphertext of `value` for `field` under the current key
    /// version, for equality lookups.
    ///
    /// # Errors
    /// Returns `CipherError::EncryptionUnavailable` if no key is available.
    fn encrypt_search_value(&self, field: &str, value: &Value) -> Result<String, CipherError>;
}
