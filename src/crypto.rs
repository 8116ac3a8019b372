//! Cryptographic primitives for the tenant secret store
//!
//! AES-256-GCM sealing/opening with associated data, plus the CSPRNG helpers used
//! for nonces, owner secrets and master key generation.
//!
//! Sealed layout: `nonce (12 bytes) ‖ ciphertext ‖ tag (16 bytes)`.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use rand::{Rng, RngCore};
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Result, VaultError};

/// AES-256 key size in bytes (256 bits)
pub const AES_256_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits)
pub const NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits)
pub const TAG_SIZE: usize = 16;

/// A 256-bit key that zeroizes memory on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SecretKey {
    bytes: [u8; AES_256_KEY_SIZE],
}

impl SecretKey {
    /// Build a key from a slice, which must be exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; AES_256_KEY_SIZE] = bytes.try_into().ok()?;
        Some(Self { bytes })
    }

    /// Generate a new random AES-256 key
    pub fn generate() -> Self {
        let mut bytes = [0u8; AES_256_KEY_SIZE];
        OsRng.fill_bytes(&mut bytes);
        Self { bytes }
    }

    /// Get the key bytes (use with caution)
    pub fn as_bytes(&self) -> &[u8; AES_256_KEY_SIZE] {
        &self.bytes
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey([REDACTED])")
    }
}

/// Sealed payload split into nonce and ciphertext (tag included)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedData {
    /// The nonce used for encryption (12 bytes for AES-GCM)
    pub nonce: [u8; NONCE_SIZE],
    /// The ciphertext including authentication tag
    pub ciphertext: Vec<u8>,
}

impl EncryptedData {
    /// Concatenate into the stored layout `nonce ‖ ciphertext`
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(NONCE_SIZE + self.ciphertext.len());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Split the stored layout. Anything too short to hold a nonce and a tag
    /// is reported as a decryption failure.
    pub fn from_bytes(sealed: &[u8]) -> Result<Self> {
        if sealed.len() < NONCE_SIZE + TAG_SIZE {
            return Err(VaultError::DecryptionFailed);
        }
        let (nonce, ciphertext) = sealed.split_at(NONCE_SIZE);
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        nonce_bytes.copy_from_slice(nonce);
        Ok(Self {
            nonce: nonce_bytes,
            ciphertext: ciphertext.to_vec(),
        })
    }
}

/// AES-256-GCM cipher wrapper
pub struct AesGcmCipher;

impl AesGcmCipher {
    /// Seal plaintext under `key`, binding `aad`.
    ///
    /// A fresh nonce is drawn from the OS CSPRNG on every call; callers cannot
    /// supply one.
    pub fn seal(key: &SecretKey, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        Self::encrypt(key, plaintext, aad).map(|data| data.to_bytes())
    }

    /// Open `nonce ‖ ciphertext ‖ tag` under `key` with `aad`.
    ///
    /// Every failure (truncation, bad tag, wrong key, wrong AAD) collapses into
    /// `VaultError::DecryptionFailed`.
    pub fn open(key: &SecretKey, sealed: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let encrypted = EncryptedData::from_bytes(sealed)?;
        Self::decrypt(key, &encrypted, aad)
    }

    /// Encrypt plaintext, returning nonce and ciphertext separately
    pub fn encrypt(key: &SecretKey, plaintext: &[u8], aad: &[u8]) -> Result<EncryptedData> {
        let cipher = Aes256Gcm::new_from_slice(key.as_bytes())
            .map_err(|e| VaultError::Crypto(format!("Cipher init error: {}", e)))?;

        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = cipher
            .encrypt(nonce, Payload { msg: plaintext, aad })
            .map_err(|e| VaultError::Crypto(format!("Encryption error: {}", e)))?;

        Ok(EncryptedData {
            nonce: nonce_bytes,
            ciphertext,
        })
    }

    /// Decrypt an `EncryptedData` container
    pub fn decrypt(key: &SecretKey, encrypted: &EncryptedData, aad: &[u8]) -> Result<Vec<u8>> {
        let cipher =
            Aes256Gcm::new_from_slice(key.as_bytes()).map_err(|_| VaultError::DecryptionFailed)?;
        let nonce = Nonce::from_slice(&encrypted.nonce);

        cipher
            .decrypt(
                nonce,
                Payload {
                    msg: &encrypted.ciphertext,
                    aad,
                },
            )
            .map_err(|_| VaultError::DecryptionFailed)
    }
}

/// Uniform random number in `0..max`; returns 0 when `max` is 0
pub fn random_below(max: u64) -> u64 {
    if max == 0 {
        return 0;
    }
    OsRng.gen_range(0..max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open() {
        let key = SecretKey::generate();
        let plaintext = b"Hello, tenant!";

        let sealed = AesGcmCipher::seal(&key, plaintext, b"guild-42").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + plaintext.len() + TAG_SIZE);

        let opened = AesGcmCipher::open(&key, &sealed, b"guild-42").unwrap();
        assert_eq!(plaintext.to_vec(), opened);
    }

    #[test]
    fn test_fresh_nonce_per_seal() {
        let key = SecretKey::generate();
        let a = AesGcmCipher::seal(&key, b"same", b"aad").unwrap();
        let b = AesGcmCipher::seal(&key, b"same", b"aad").unwrap();
        assert_ne!(a[..NONCE_SIZE], b[..NONCE_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_any_flipped_byte_fails() {
        let key = SecretKey::generate();
        let sealed = AesGcmCipher::seal(&key, b"secret cookie", b"user-1").unwrap();

        for i in 0..sealed.len() {
            let mut tampered = sealed.clone();
            tampered[i] ^= 0x01;
            let result = AesGcmCipher::open(&key, &tampered, b"user-1");
            assert!(matches!(result, Err(VaultError::DecryptionFailed)), "byte {}", i);
        }
    }

    #[test]
    fn test_wrong_key_or_aad_fails() {
        let key = SecretKey::generate();
        let other = SecretKey::generate();
        let sealed = AesGcmCipher::seal(&key, b"data", b"user-1").unwrap();

        assert!(matches!(
            AesGcmCipher::open(&other, &sealed, b"user-1"),
            Err(VaultError::DecryptionFailed)
        ));
        assert!(matches!(
            AesGcmCipher::open(&key, &sealed, b"user-2"),
            Err(VaultError::DecryptionFailed)
        ));
    }

    #[test]
    fn test_truncated_input_fails() {
        let key = SecretKey::generate();
        let sealed = AesGcmCipher::seal(&key, b"data", b"aad").unwrap();

        for len in [0, 5, NONCE_SIZE - 1, NONCE_SIZE, NONCE_SIZE + TAG_SIZE - 1] {
            let result = AesGcmCipher::open(&key, &sealed[..len], b"aad");
            assert!(matches!(result, Err(VaultError::DecryptionFailed)), "len {}", len);
        }
    }

    #[test]
    fn test_empty_plaintext_round_trips() {
        let key = SecretKey::generate();
        let sealed = AesGcmCipher::seal(&key, b"", b"aad").unwrap();
        assert_eq!(sealed.len(), NONCE_SIZE + TAG_SIZE);
        assert!(AesGcmCipher::open(&key, &sealed, b"aad").unwrap().is_empty());
    }

    #[test]
    fn test_secret_key_from_slice() {
        assert!(SecretKey::from_slice(&[0u8; 31]).is_none());
        assert!(SecretKey::from_slice(&[0u8; 33]).is_none());
        assert!(SecretKey::from_slice(&[7u8; 32]).is_some());
        assert_eq!(format!("{:?}", SecretKey::generate()), "SecretKey([REDACTED])");
    }

    #[test]
    fn test_random_below() {
        assert_eq!(random_below(0), 0);
        for _ in 0..100 {
            assert!(random_below(10) < 10);
        }
    }
}
