//! Key provider adapters.
//!
//! - [`StaticKeyProvider`]: explicit versioned keys (tests, external KMS handoff)
//! - [`PassphraseKeyProvider`]: Argon2id keys derived from an operator passphrase
//!
//! # Passphrase sources
//!
//! Precedence (highest first):
//! - `ORGANGUARD_KEY_PASSWORD_FD` (read from an already-open FD, then close it)
//! - `ORGANGUARD_KEY_PASSWORD_FILE` (read from a file path)
//! - `/run/secrets/organguard_key_password` (Docker/Compose secret default)
//! - `ORGANGUARD_KEY_PASSWORD`, debug builds only
//!
//! In release builds, reading secrets from environment variables is refused.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};
#[cfg(unix)]
use std::{io::Read, os::unix::io::FromRawFd};

use aes_gcm::aead::OsRng;
use rand::RngCore;
use zeroize::Zeroizing;

use crate::domain::kdf::{derive_master_key, KdfParams};
use crate::domain::{CipherError, MasterKey, KEY_LEN};
use crate::ports::KeyProvider;

pub const KEY_PASSWORD_FD_ENV: &str = "ORGANGUARD_KEY_PASSWORD_FD";
pub const KEY_PASSWORD_FILE_ENV: &str = "ORGANGUARD_KEY_PASSWORD_FILE";
pub const KEY_PASSWORD_DOCKER_SECRET_PATH: &str = "/run/secrets/organguard_key_password";

// Dev-only escape hatch for local runs and tests.
const KEY_PASSWORD_ENV_DEV: &str = "ORGANGUARD_KEY_PASSWORD";

/// Failure to obtain the key passphrase.
#[derive(Debug, thiserror::Error)]
pub enum KeySourceError {
    #[error(
        "Missing key password: provide {KEY_PASSWORD_FD_ENV} or {KEY_PASSWORD_FILE_ENV} (or mount {KEY_PASSWORD_DOCKER_SECRET_PATH})"
    )]
    MissingPassword,

    #[error("Invalid {KEY_PASSWORD_FD_ENV}: {0}")]
    InvalidFd(String),

    #[error("Failed to read key password: {0}")]
    Io(#[from] std::io::Error),
}

fn non_empty(secret: &str) -> Result<Zeroizing<String>, KeySourceError> {
    let secret = secret.trim_end_matches(['\n', '\r']);
    if secret.is_empty() {
        return Err(KeySourceError::MissingPassword);
    }
    Ok(Zeroizing::new(secret.to_string()))
}

/// Read the key passphrase from the first configured secure source.
///
/// # Errors
/// Returns `KeySourceError::MissingPassword` if no source is configured or the
/// configured source is empty.
pub fn load_key_passphrase() -> Result<Zeroizing<String>, KeySourceError> {
    // 1) Already-open FD (systemd / K8s sidecars)
    #[cfg(unix)]
    if let Ok(fd_str) = std::env::var(KEY_PASSWORD_FD_ENV) {
        let fd: i32 = fd_str
            .trim()
            .parse()
            .map_err(|_| KeySourceError::InvalidFd(fd_str.clone()))?;
        if fd <= 2 {
            return Err(KeySourceError::InvalidFd(format!("refusing stdio fd {fd}")));
        }

        // SAFETY: We take ownership of the FD for a one-time secret read and close it.
        let mut file = unsafe { std::fs::File::from_raw_fd(fd) };
        let mut buf = Zeroizing::new(String::new());
        file.read_to_string(&mut buf)?;
        return non_empty(&buf);
    }

    // 2) Explicit file path
    if let Ok(path) = std::env::var(KEY_PASSWORD_FILE_ENV) {
        let content = Zeroizing::new(std::fs::read_to_string(path.trim())?);
        return non_empty(&content);
    }

    // 3) Docker secrets default path
    if Path::new(KEY_PASSWORD_DOCKER_SECRET_PATH).exists() {
        let content = Zeroizing::new(std::fs::read_to_string(KEY_PASSWORD_DOCKER_SECRET_PATH)?);
        return non_empty(&content);
    }

    // 4) Dev-only env var (refused in release builds)
    if cfg!(debug_assertions) {
        if let Ok(v) = std::env::var(KEY_PASSWORD_ENV_DEV) {
            tracing::warn!("Using key password from environment (debug build only)");
            return non_empty(&v);
        }
    }

    Err(KeySourceError::MissingPassword)
}

/// Keys held in memory, by version.
#[derive(Clone, Default)]
pub struct StaticKeyProvider {
    keys: BTreeMap<u32, MasterKey>,
    current: Option<u32>,
}

impl StaticKeyProvider {
    /// Provider with no keys; every call fails with `EncryptionUnavailable`.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn single(key: MasterKey) -> Self {
        Self::empty().with_key(key)
    }

    /// Add a key. The highest version becomes current.
    #[must_use]
    pub fn with_key(mut self, key: MasterKey) -> Self {
        let version = key.version();
        self.current = Some(self.current.map_or(version, |c| c.max(version)));
        self.keys.insert(version, key);
        self
    }

    /// Random key for `version` (development and tests).
    #[must_use]
    pub fn generate(version: u32) -> Self {
        let mut bytes = Zeroizing::new([0u8; KEY_LEN]);
        OsRng.fill_bytes(&mut bytes[..]);
        Self::single(MasterKey::new(version, *bytes))
    }

    #[must_use]
    pub fn versions(&self) -> Vec<u32> {
        self.keys.keys().copied().collect()
    }
}

impl std::fmt::Debug for StaticKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKeyProvider")
            .field("versions", &self.versions())
            .field("current", &self.current)
            .finish()
    }
}

impl KeyProvider for StaticKeyProvider {
    fn current_version(&self) -> Result<u32, CipherError> {
        self.current
            .ok_or_else(|| CipherError::EncryptionUnavailable("no key configured".to_string()))
    }

    fn key(&self, version: u32) -> Result<MasterKey, CipherError> {
        self.keys.get(&version).cloned().ok_or_else(|| {
            CipherError::EncryptionUnavailable(format!("key version {version} not available"))
        })
    }
}

/// Argon2id-derived keys. Each version is derived on first use and cached.
pub struct PassphraseKeyProvider {
    passphrase: Zeroizing<String>,
    installation_salt: String,
    current: u32,
    params: KdfParams,
    cache: Mutex<BTreeMap<u32, MasterKey>>,
}

impl PassphraseKeyProvider {
    #[must_use]
    pub fn new(
        passphrase: Zeroizing<String>,
        installation_salt: impl Into<String>,
        current: u32,
        params: KdfParams,
    ) -> Self {
        Self {
            passphrase,
            installation_salt: installation_salt.into(),
            current,
            params,
            cache: Mutex::new(BTreeMap::new()),
        }
    }

    /// Provider whose passphrase comes from [`load_key_passphrase`].
    ///
    /// # Errors
    /// Returns `KeySourceError` if no passphrase source is configured.
    pub fn from_secret_sources(
        installation_salt: impl Into<String>,
        current: u32,
        params: KdfParams,
    ) -> Result<Self, KeySourceError> {
        Ok(Self::new(
            load_key_passphrase()?,
            installation_salt,
            current,
            params,
        ))
    }
}

impl std::fmt::Debug for PassphraseKeyProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassphraseKeyProvider")
            .field("current", &self.current)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

impl KeyProvider for PassphraseKeyProvider {
    fn current_version(&self) -> Result<u32, CipherError> {
        Ok(self.current)
    }

    fn key(&self, version: u32) -> Result<MasterKey, CipherError> {
        if version == 0 || version > self.current {
            return Err(CipherError::EncryptionUnavailable(format!(
                "key version {version} not available"
            )));
        }

        let mut cache = self.cache.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = cache.get(&version) {
            return Ok(key.clone());
        }

        let key = derive_master_key(&self.passphrase, &self.installation_salt, version, self.params)
            .map_err(|e| CipherError::EncryptionUnavailable(e.to_string()))?;
        tracing::info!(version, fingerprint = key.fingerprint(), "Derived PHI master key");
        cache.insert(version, key.clone());
        Ok(key)
    }
}
