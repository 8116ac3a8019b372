pub mod codec;
pub mod config;
pub mod crypto;
pub mod error;
pub mod key_manager;
pub mod storage;
pub mod prefs;
pub mod credential;
pub mod checker;

// PostgreSQL backend
pub mod postgres_storage;

pub use codec::{PrefType, PrefValue};
pub use config::Config;
pub use crypto::{AesGcmCipher, EncryptedData, SecretKey, AES_256_KEY_SIZE, NONCE_SIZE, TAG_SIZE};
pub use error::{Result, VaultError};
pub use key_manager::{
    provision_owner_secret, rewrap_owner_secret, unwrap_owner_secret, MasterKey,
    WRAPPED_SECRET_SIZE,
};
pub use storage::{InMemoryStorage, Owner, OwnerId, OwnerKind, PrefRow, PrefStorage};
pub use prefs::{GuildPref, OwnerRegistry, PreferenceStore, RewrapResult, UserPref};
pub use credential::{
    CredentialLifecycle, CredentialProbe, CredentialStatus, ProbeOutcome, RatCookie,
};
pub use checker::{CheckReport, CredentialChecker, ExpiryNotifier};

pub use postgres_storage::PostgresStorage;
