//! AES-256-GCM field cipher.
//!
//! # Security
//!
//! - Field name is bound to the ciphertext as AAD, so an envelope copied into
//!   another field fails authentication
//! - Randomized fields use a fresh 96-bit nonce from `OsRng` per call
//! - Deterministic fields use a synthetic nonce,
//!   `SHA-256(subkey || field || 0x00 || plaintext)[..12]`, where the subkey is
//!   derived from the master key and never used for encryption itself
//! - Values are JSON-serialized first so structured blobs survive the round trip

use std::sync::Arc;

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use serde_json::Value;
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::domain::{CipherError, CipherMode, MasterKey, PhiEnvelope, Record, NONCE_LEN};
use crate::ports::{KeyProvider, PhiCipher};

const DETERMINISTIC_NONCE_LABEL: &[u8] = b"organguard/phi/deterministic-nonce";

/// PHI cipher backed by a [`KeyProvider`].
#[derive(Clone)]
pub struct AesGcmPhiCipher {
    keys: Arc<dyn KeyProvider>,
}

impl AesGcmPhiCipher {
    #[must_use]
    pub fn new(keys: Arc<dyn KeyProvider>) -> Self {
        Self { keys }
    }

    /// Encrypt one value under the current key version.
    ///
    /// # Errors
    /// Returns `CipherError::EncryptionUnavailable` if no key is available.
    pub fn encrypt_value(
        &self,
        field: &str,
        value: &Value,
        mode: CipherMode,
    ) -> Result<String, CipherError> {
        let key = self.keys.current_key()?;
        seal(&key, field, value, mode).map(|envelope| envelope.encode())
    }

    /// Decrypt one stored envelope.
    ///
    /// # Errors
    /// See [`PhiCipher::decrypt_object`].
    pub fn decrypt_value(&self, field: &str, stored: &str) -> Result<Value, CipherError> {
        let envelope = PhiEnvelope::parse(stored)?;
        let key = self.keys.key(envelope.key_version)?;
        open(&key, field, &envelope)
    }
}

impl std::fmt::Debug for AesGcmPhiCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AesGcmPhiCipher").finish_non_exhaustive()
    }
}

fn aes(key: &MasterKey) -> Result<Aes256Gcm, CipherError> {
    Aes256Gcm::new_from_slice(key.as_bytes())
        .map_err(|e| CipherError::EncryptionUnavailable(e.to_string()))
}

fn synthetic_nonce(key: &MasterKey, field: &str, plaintext: &[u8]) -> [u8; NONCE_LEN] {
    let subkey = key.derive_subkey(DETERMINISTIC_NONCE_LABEL);
    let mut hasher = Sha256::new();
    hasher.update(subkey.as_slice());
    hasher.update(field.as_bytes());
    hasher.update([0u8]);
    hasher.update(plaintext);
    let digest = hasher.finalize();

    let mut nonce = [0u8; NONCE_LEN];
    nonce.copy_from_slice(&digest[..NONCE_LEN]);
    nonce
}

fn seal(
    key: &MasterKey,
    field: &str,
    value: &Value,
    mode: CipherMode,
) -> Result<PhiEnvelope, CipherError> {
    let plaintext = Zeroizing::new(
        serde_json::to_vec(value).map_err(|e| CipherError::EncryptionUnavailable(e.to_string()))?,
    );

    let nonce = match mode {
        CipherMode::Deterministic => synthetic_nonce(key, field, &plaintext),
        CipherMode::Randomized => {
            let mut nonce = [0u8; NONCE_LEN];
            OsRng.fill_bytes(&mut nonce);
            nonce
        }
    };

    let ciphertext = aes(key)?
        .encrypt(
            Nonce::from_slice(&nonce),
            Payload {
                msg: plaintext.as_slice(),
                aad: field.as_bytes(),
            },
        )
        .map_err(|e| CipherError::EncryptionUnavailable(e.to_string()))?;

    Ok(PhiEnvelope {
        mode,
        key_version: key.version(),
        nonce,
        ciphertext,
    })
}

fn open(key: &MasterKey, field: &str, envelope: &PhiEnvelope) -> Result<Value, CipherError> {
    let plaintext = Zeroizing::new(
        aes(key)?
            .decrypt(
                Nonce::from_slice(&envelope.nonce),
                Payload {
                    msg: envelope.ciphertext.as_slice(),
                    aad: field.as_bytes(),
                },
            )
            .map_err(|_| {
                CipherError::DecryptionFailed(format!("authentication failed for field {field}"))
            })?,
    );

    serde_json::from_slice(&plaintext)
        .map_err(|_| CipherError::DecryptionFailed(format!("field {field} is not valid JSON")))
}

fn mode_for(field: &str, deterministic_fields: &[&str]) -> CipherMode {
    if deterministic_fields.contains(&field) {
        CipherMode::Deterministic
    } else {
        CipherMode::Randomized
    }
}

impl PhiCipher for AesGcmPhiCipher {
    fn encrypt_object(
        &self,
        record: &Record,
        phi_fields: &[&str],
        deterministic_fields: &[&str],
    ) -> Result<Record, CipherError> {
        let mut out = record.clone();
        let mut key: Option<MasterKey> = None;

        for field in phi_fields {
            let Some(value) = record.get(*field) else {
                continue;
            };
            if value.is_null() {
                continue;
            }

            if key.is_none() {
                key = Some(self.keys.current_key()?);
            }
            if let Some(key) = key.as_ref() {
                let envelope = seal(key, field, value, mode_for(field, deterministic_fields))?;
                out.insert((*field).to_string(), Value::String(envelope.encode()));
            }
        }

        Ok(out)
    }

    fn decrypt_object(
        &self,
        record: &Record,
        phi_fields: &[&str],
        deterministic_fields: &[&str],
    ) -> Result<Record, CipherError> {
        let mut out = record.clone();

        for field in phi_fields {
            let stored = match record.get(*field) {
                None | Some(Value::Null) => continue,
                Some(Value::String(s)) if PhiEnvelope::looks_like_envelope(s) => s,
                Some(_) => {
                    return Err(CipherError::DecryptionFailed(format!(
                        "field {field} holds plaintext"
                    )))
                }
            };

            let envelope = PhiEnvelope::parse(stored)?;
            if envelope.mode != mode_for(field, deterministic_fields) {
                return Err(CipherError::DecryptionFailed(format!(
                    "field {field} stored in {} mode",
                    envelope.mode.algorithm_id()
                )));
            }

            let key = self.keys.key(envelope.key_version)?;
            out.insert((*field).to_string(), open(&key, field, &envelope)?);
        }

        Ok(out)
    }

    fn encrypt_search_value(&self, field: &str, value: &Value) -> Result<String, CipherError> {
        self.encrypt_value(field, value, CipherMode::Deterministic)
    }
}
