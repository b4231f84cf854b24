//! Key material and the PHI ciphertext envelope.
//!
//! # Memory Security
//!
//! `MasterKey` implements `Zeroize` and `ZeroizeOnDrop` so key bytes are erased
//! when the value goes out of scope. Its `Debug` output shows only a SHA-256
//! fingerprint.

use base64::engine::general_purpose::STANDARD_NO_PAD as B64;
use base64::Engine;
use sha2::{Digest, Sha256};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

/// Error type for field encryption.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CipherError {
    /// No usable key: the provider is unconfigured or the version is unknown.
    #[error("Encryption unavailable: {0}")]
    EncryptionUnavailable(String),

    /// The stored value is not a valid envelope or fails authentication.
    #[error("Decryption failed: {0}")]
    DecryptionFailed(String),

    #[error("Key derivation failed: {0}")]
    KeyDerivation(String),
}

/// Length of an AES-256 key.
pub const KEY_LEN: usize = 32;

/// Length of an AES-GCM nonce.
pub const NONCE_LEN: usize = 12;

/// Versioned 256-bit master key for PHI field encryption.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct MasterKey {
    bytes: [u8; KEY_LEN],

    #[zeroize(skip)]
    version: u32,

    /// Key fingerprint for identification (NOT secret)
    #[zeroize(skip)]
    fingerprint: String,
}

impl MasterKey {
    /// Wrap raw key bytes for a key version.
    #[must_use]
    pub fn new(version: u32, bytes: [u8; KEY_LEN]) -> Self {
        let fingerprint = compute_fingerprint(&bytes);
        Self {
            bytes,
            version,
            fingerprint,
        }
    }

    /// Wrap a key from a slice.
    ///
    /// # Errors
    /// Returns `CipherError::EncryptionUnavailable` if the slice is not 32 bytes.
    pub fn from_slice(version: u32, bytes: &[u8]) -> Result<Self, CipherError> {
        let array: [u8; KEY_LEN] = bytes.try_into().map_err(|_| {
            CipherError::EncryptionUnavailable(format!(
                "key version {version} must be {KEY_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self::new(version, array))
    }

    #[must_use]
    pub fn version(&self) -> u32 {
        self.version
    }

    #[must_use]
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.bytes
    }

    /// Derive a purpose-bound subkey: `SHA-256(label || 0x00 || key)`.
    #[must_use]
    pub fn derive_subkey(&self, label: &[u8]) -> Zeroizing<[u8; KEY_LEN]> {
        let mut hasher = Sha256::new();
        hasher.update(label);
        hasher.update([0u8]);
        hasher.update(self.bytes);
        let mut out = Zeroizing::new([0u8; KEY_LEN]);
        out.copy_from_slice(&hasher.finalize());
        out
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("version", &self.version)
            .field("fingerprint", &self.fingerprint)
            .finish()
    }
}

/// How a PHI field was encrypted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CipherMode {
    /// Synthetic nonce: identical plaintext → identical envelope (searchable).
    Deterministic,
    /// Fresh random nonce per call.
    Randomized,
}

impl CipherMode {
    #[must_use]
    pub fn algorithm_id(&self) -> &'static str {
        match self {
            Self::Deterministic => "det",
            Self::Randomized => "rnd",
        }
    }

    fn from_algorithm_id(id: &str) -> Option<Self> {
        match id {
            "det" => Some(Self::Deterministic),
            "rnd" => Some(Self::Randomized),
            _ => None,
        }
    }
}

/// Stored form of an encrypted field:
/// `phi1$<alg>$<key_version>$<nonce_b64>$<ciphertext_b64>`.
#[derive(Clone, PartialEq, Eq)]
pub struct PhiEnvelope {
    pub mode: CipherMode,
    pub key_version: u32,
    pub nonce: [u8; NONCE_LEN],
    /// AES-256-GCM ciphertext including the authentication tag.
    pub ciphertext: Vec<u8>,
}

const ENVELOPE_PREFIX: &str = "phi1";

impl PhiEnvelope {
    /// Serialize for storage.
    #[must_use]
    pub fn encode(&self) -> String {
        format!(
            "{ENVELOPE_PREFIX}${}${}${}${}",
            self.mode.algorithm_id(),
            self.key_version,
            B64.encode(self.nonce),
            B64.encode(&self.ciphertext)
        )
    }

    /// Parse a stored value.
    ///
    /// # Errors
    /// Returns `CipherError::DecryptionFailed` if the format is invalid.
    pub fn parse(stored: &str) -> Result<Self, CipherError> {
        let corrupt = |what: &str| CipherError::DecryptionFailed(format!("corrupt envelope: {what}"));

        let mut parts = stored.split('$');
        if parts.next() != Some(ENVELOPE_PREFIX) {
            return Err(corrupt("missing prefix"));
        }

        let mode = parts
            .next()
            .and_then(CipherMode::from_algorithm_id)
            .ok_or_else(|| corrupt("unknown algorithm"))?;
        let key_version = parts
            .next()
            .and_then(|v| v.parse::<u32>().ok())
            .ok_or_else(|| corrupt("bad key version"))?;
        let nonce_vec = parts
            .next()
            .and_then(|n| B64.decode(n).ok())
            .ok_or_else(|| corrupt("bad nonce"))?;
        let ciphertext = parts
            .next()
            .and_then(|c| B64.decode(c).ok())
            .ok_or_else(|| corrupt("bad ciphertext"))?;

        if parts.next().is_some() {
            return Err(corrupt("trailing data"));
        }

        let nonce: [u8; NONCE_LEN] = nonce_vec
            .as_slice()
            .try_into()
            .map_err(|_| corrupt("bad nonce length"))?;

        Ok(Self {
            mode,
            key_version,
            nonce,
            ciphertext,
        })
    }

    /// Cheap check for whether a stored string looks like an envelope.
    #[must_use]
    pub fn looks_like_envelope(stored: &str) -> bool {
        stored.starts_with("phi1$")
    }
}

impl std::fmt::Debug for PhiEnvelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PhiEnvelope")
            .field("mode", &self.mode)
            .field("key_version", &self.key_version)
            .field("size_bytes", &self.ciphertext.len())
            .finish()
    }
}

/// Fingerprint for key identification: first 8 bytes of SHA-256, hex.
fn compute_fingerprint(bytes: &[u8]) -> String {
    let result = Sha256::digest(bytes);
    result[..8].iter().map(|b| format!("{b:02x}")).collect()
}
