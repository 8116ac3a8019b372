//! Error types for the tenant secret store

use std::time::Duration;

use thiserror::Error;

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, VaultError>;

/// Errors that can occur while provisioning owners or reading/writing preferences
#[derive(Error, Debug)]
pub enum VaultError {
    /// Master key absent or not exactly 32 bytes
    #[error("Master key misconfigured: {0}")]
    KeyMisconfigured(String),

    /// Owner (guild or user) not present in storage
    #[error("Owner not found: {0}")]
    OwnerNotFound(String),

    /// Preference not present for the requested owner/key/mode
    #[error("Preference not found: {0}")]
    PrefNotFound(String),

    /// AEAD authentication failed. Carries no detail on purpose.
    #[error("Decryption failed")]
    DecryptionFailed,

    /// Typed value could not be decoded
    #[error("Decode error: {0}")]
    Decode(String),

    /// A storage round trip exceeded its deadline
    #[error("Storage timeout after {0:?}")]
    StorageTimeout(Duration),

    /// Storage operation failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// Sealing failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Invalid configuration (other than the master key)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Write would flip the encrypted flag of an existing preference
    #[error("Preference mode conflict: {0}")]
    ModeConflict(String),

    /// Stored credential is past its expiry
    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VaultError {
    /// True for both owner and preference lookups that found nothing
    pub fn is_not_found(&self) -> bool {
        matches!(self, VaultError::OwnerNotFound(_) | VaultError::PrefNotFound(_))
    }

    /// True for backing-store failures the caller may retry
    pub fn is_transient(&self) -> bool {
        matches!(self, VaultError::StorageTimeout(_) | VaultError::Storage(_))
    }
}

impl From<serde_json::Error> for VaultError {
    fn from(err: serde_json::Error) -> Self {
        VaultError::Serialization(err.to_string())
    }
}

impl From<sqlx::Error> for VaultError {
    fn from(err: sqlx::Error) -> Self {
        VaultError::Storage(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(VaultError::PrefNotFound("k".into()).is_not_found());
        assert!(VaultError::OwnerNotFound("o".into()).is_not_found());
        assert!(!VaultError::DecryptionFailed.is_not_found());

        assert!(VaultError::StorageTimeout(Duration::from_secs(1)).is_transient());
        assert!(VaultError::Storage("down".into()).is_transient());
        assert!(!VaultError::Decode("bad".into()).is_transient());
    }

    #[test]
    fn test_decryption_failed_is_opaque() {
        assert_eq!(VaultError::DecryptionFailed.to_string(), "Decryption failed");
    }
}
