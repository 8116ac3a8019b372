//! Key hierarchy: master key → per-owner secret (stored wrapped)
//!
//! Every owner gets a random 32-byte secret at creation. It is persisted only
//! in sealed form (`nonce ‖ AES-GCM(secret)`) under the process master key, with
//! the owner's external id as AAD. The unwrapped secret is never cached; each
//! encrypted preference operation unwraps it again and drops it when done.

use base64::{engine::general_purpose::STANDARD, Engine};

use crate::crypto::{AesGcmCipher, SecretKey, AES_256_KEY_SIZE, NONCE_SIZE, TAG_SIZE};
use crate::error::{Result, VaultError};

/// Size of a wrapped owner secret: nonce + sealed 32-byte secret incl. tag
pub const WRAPPED_SECRET_SIZE: usize = NONCE_SIZE + AES_256_KEY_SIZE + TAG_SIZE;

/// Environment variable holding the base64-encoded master key
pub const MASTER_KEY_ENV: &str = "MASTER_KEY_BASE64";

/// The process-wide root key. Supplied by the operator, never persisted here.
///
/// Passed explicitly to every call that needs it rather than read from global state.
#[derive(Clone)]
pub struct MasterKey(SecretKey);

impl MasterKey {
    /// Build from raw bytes; anything other than 32 bytes is a misconfiguration
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        SecretKey::from_slice(bytes).map(Self).ok_or_else(|| {
            VaultError::KeyMisconfigured(format!(
                "master key must be exactly {} bytes, got {}",
                AES_256_KEY_SIZE,
                bytes.len()
            ))
        })
    }

    /// Decode from base64 (the configuration format)
    pub fn from_base64(encoded: &str) -> Result<Self> {
        let bytes = STANDARD
            .decode(encoded.trim())
            .map_err(|e| VaultError::KeyMisconfigured(format!("invalid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Load from `MASTER_KEY_BASE64`
    pub fn from_env() -> Result<Self> {
        let encoded = std::env::var(MASTER_KEY_ENV)
            .map_err(|_| VaultError::KeyMisconfigured(format!("{} not set", MASTER_KEY_ENV)))?;
        Self::from_base64(&encoded)
    }

    /// Generate a fresh random master key
    pub fn generate() -> Self {
        Self(SecretKey::generate())
    }

    /// Base64 form for the operator to put into configuration
    pub fn to_base64(&self) -> String {
        STANDARD.encode(self.0.as_bytes())
    }

    fn key(&self) -> &SecretKey {
        &self.0
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey([REDACTED])")
    }
}

/// Generate a new owner secret and seal it under the master key.
///
/// Returns the 44-byte wrapped form for storage.
pub fn provision_owner_secret(master: &MasterKey, external_id: &str) -> Result<Vec<u8>> {
    let secret = SecretKey::generate();
    AesGcmCipher::seal(master.key(), secret.as_bytes(), external_id.as_bytes())
}

/// Unwrap an owner secret. Fails with `DecryptionFailed` on any mismatch.
pub fn unwrap_owner_secret(
    master: &MasterKey,
    external_id: &str,
    wrapped_secret: &[u8],
) -> Result<SecretKey> {
    let mut bytes = AesGcmCipher::open(master.key(), wrapped_secret, external_id.as_bytes())?;
    let secret = SecretKey::from_slice(&bytes);
    zeroize::Zeroize::zeroize(&mut bytes);
    secret.ok_or(VaultError::DecryptionFailed)
}

/// Re-seal an owner secret under a new master key. The secret itself is unchanged,
/// so values already encrypted with it stay readable.
pub fn rewrap_owner_secret(
    old_master: &MasterKey,
    new_master: &MasterKey,
    external_id: &str,
    wrapped_secret: &[u8],
) -> Result<Vec<u8>> {
    let secret = unwrap_owner_secret(old_master, external_id, wrapped_secret)?;
    AesGcmCipher::seal(new_master.key(), secret.as_bytes(), external_id.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provision_and_unwrap() {
        let master = MasterKey::generate();
        let wrapped = provision_owner_secret(&master, "guild-42").unwrap();
        assert_eq!(wrapped.len(), WRAPPED_SECRET_SIZE);
        assert_eq!(wrapped.len(), 44);

        let a = unwrap_owner_secret(&master, "guild-42", &wrapped).unwrap();
        let b = unwrap_owner_secret(&master, "guild-42", &wrapped).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_each_owner_gets_distinct_secret() {
        let master = MasterKey::generate();
        let w1 = provision_owner_secret(&master, "user-1").unwrap();
        let w2 = provision_owner_secret(&master, "user-1").unwrap();
        let s1 = unwrap_owner_secret(&master, "user-1", &w1).unwrap();
        let s2 = unwrap_owner_secret(&master, "user-1", &w2).unwrap();
        assert_ne!(s1.as_bytes(), s2.as_bytes());
    }

    #[test]
    fn test_unwrap_rejects_wrong_master_or_owner() {
        let master = MasterKey::generate();
        let wrapped = provision_owner_secret(&master, "user-1").unwrap();

        let other = MasterKey::generate();
        assert!(matches!(
            unwrap_owner_secret(&other, "user-1", &wrapped),
            Err(VaultError::DecryptionFailed)
        ));
        assert!(matches!(
            unwrap_owner_secret(&master, "user-2", &wrapped),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_rewrap_keeps_secret() {
        let old = MasterKey::generate();
        let new = MasterKey::generate();
        let wrapped = provision_owner_secret(&old, "guild-7").unwrap();
        let before = unwrap_owner_secret(&old, "guild-7", &wrapped).unwrap();

        let rewrapped = rewrap_owner_secret(&old, &new, "guild-7", &wrapped).unwrap();
        let after = unwrap_owner_secret(&new, "guild-7", &rewrapped).unwrap();
        assert_eq!(before.as_bytes(), after.as_bytes());
        assert!(unwrap_owner_secret(&old, "guild-7", &rewrapped).is_err());
    }

    #[test]
    fn test_master_key_validation() {
        assert!(matches!(
            MasterKey::from_bytes(&[0u8; 16]),
            Err(VaultError::KeyMisconfigured(_))
        ));
        assert!(matches!(
            MasterKey::from_base64("not base64!!"),
            Err(VaultError::KeyMisconfigured(_))
        ));
        // 24 bytes, valid base64 but wrong length
        assert!(matches!(
            MasterKey::from_base64(&STANDARD.encode([1u8; 24])),
            Err(VaultError::KeyMisconfigured(_))
        ));

        let key = MasterKey::generate();
        let restored = MasterKey::from_base64(&key.to_base64()).unwrap();
        assert_eq!(key.key().as_bytes(), restored.key().as_bytes());
        assert_eq!(format!("{:?}", key), "MasterKey([REDACTED])");
    }
}
