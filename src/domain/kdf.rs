//! Master key derivation from an operator passphrase.
//!
//! Each key version gets its own Argon2id salt (`<installation salt>/v<N>`),
//! so rotating to a new version yields an unrelated key from the same
//! passphrase.
//!
//! # Security
//!
//! - Argon2id (memory-hard, resistant to GPU/ASIC attacks)
//! - Derived key bytes are returned inside `MasterKey` (zeroized on drop)

use argon2::{password_hash::SaltString, Algorithm, Argon2, Params, PasswordHasher, Version};

use super::crypto::{CipherError, MasterKey, KEY_LEN};

/// Argon2id cost parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KdfParams {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            memory_kib: 47104,
            iterations: 1,
            parallelism: 1,
        }
    }
}

/// Derive the master key for `version` from a passphrase.
///
/// # Errors
/// Returns `CipherError::KeyDerivation` on empty input or bad parameters.
pub fn derive_master_key(
    passphrase: &str,
    installation_salt: &str,
    version: u32,
    params: KdfParams,
) -> Result<MasterKey, CipherError> {
    if passphrase.is_empty() {
        return Err(CipherError::KeyDerivation("empty passphrase".to_string()));
    }

    let salt_input = format!("{installation_salt}/v{version}");
    if salt_input.len() < 8 {
        return Err(CipherError::KeyDerivation(
            "installation salt too short".to_string(),
        ));
    }
    let salt = SaltString::encode_b64(salt_input.as_bytes())
        .map_err(|e| CipherError::KeyDerivation(format!("Invalid salt: {e}")))?;

    let argon_params = Params::new(
        params.memory_kib,
        params.iterations,
        params.parallelism,
        Some(KEY_LEN),
    )
    .map_err(|e| CipherError::KeyDerivation(format!("Invalid Argon2 params: {e}")))?;
    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon_params);

    let hash = argon2
        .hash_password(passphrase.as_bytes(), &salt)
        .map_err(|e| CipherError::KeyDerivation(e.to_string()))?;

    let hash_bytes = hash
        .hash
        .ok_or_else(|| CipherError::KeyDerivation("Hash output missing".to_string()))?;

    MasterKey::from_slice(version, hash_bytes.as_bytes())
        .map_err(|e| CipherError::KeyDerivation(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Small cost so the tests stay fast; production uses `KdfParams::default()`.
    const FAST: KdfParams = KdfParams {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    };

    #[test]
    fn test_derivation_is_stable() {
        let a = derive_master_key("correct-horse-battery-staple", "organguard", 1, FAST)
            .expect("derive");
        let b = derive_master_key("correct-horse-battery-staple", "organguard", 1, FAST)
            .expect("derive");
        assert_eq!(a.as_bytes(), b.as_bytes());
        assert_eq!(a.version(), 1);
    }

    #[test]
    fn test_versions_yield_distinct_keys() {
        let v1 = derive_master_key("passphrase", "organguard", 1, FAST).expect("derive");
        let v2 = derive_master_key("passphrase", "organguard", 2, FAST).expect("derive");
        assert_ne!(v1.as_bytes(), v2.as_bytes());
        assert_ne!(v1.fingerprint(), v2.fingerprint());
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        let result = derive_master_key("", "organguard", 1, FAST);
        assert!(matches!(result, Err(CipherError::KeyDerivation(_))));
    }
}
