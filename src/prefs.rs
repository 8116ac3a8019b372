//! Tenant preference store
//!
//! Typed get/set of named preferences per owner, in plaintext or encrypted form.
//! Encrypted values are sealed under the owner's secret (unwrapped from the
//! master key for each call and dropped right after) with the owner's external
//! id as AAD, so a value copied onto another owner's row does not open.
//!
//! Errors are passed through as-is; there is no default-value fallback here.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::codec::{self, PrefType};
use crate::crypto::AesGcmCipher;
use crate::error::{Result, VaultError};
use crate::key_manager::{self, MasterKey};
use crate::storage::{Owner, OwnerKind, PrefStorage};

/// Guild preference keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuildPref {
    /// En-/disables the scheduled Flameheart spam
    ScheduledFlameheart,
    /// Channel for announcements; falls back to the system channel
    AnnounceChannel,
}

impl GuildPref {
    pub fn as_str(&self) -> &'static str {
        match self {
            GuildPref::ScheduledFlameheart => "scheduled_fh",
            GuildPref::AnnounceChannel => "announce_channel",
        }
    }
}

impl AsRef<str> for GuildPref {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// User preference keys
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UserPref {
    /// Game API session cookie (encrypted)
    SotAuthToken,
    /// Cookie expiry as unix seconds (encrypted)
    SotAuthTokenExpiration,
    /// Whether the owner was told about the expiry (plaintext)
    SotAuthTokenNotified,
    PlaysSot,
    PlaysSotStartTime,
}

impl UserPref {
    pub fn as_str(&self) -> &'static str {
        match self {
            UserPref::SotAuthToken => "rat_token",
            UserPref::SotAuthTokenExpiration => "rat_token_expire",
            UserPref::SotAuthTokenNotified => "rat_expiry_notified",
            UserPref::PlaysSot => "plays_sot",
            UserPref::PlaysSotStartTime => "plays_sot_start",
        }
    }
}

impl AsRef<str> for UserPref {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

/// Generic preference store over any row storage
pub struct PreferenceStore<S: PrefStorage> {
    storage: Arc<S>,
}

impl<S: PrefStorage> Clone for PreferenceStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: PrefStorage> PreferenceStore<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    /// Read a plaintext preference
    pub async fn get_plain<T: PrefType>(&self, owner: &Owner, key: impl AsRef<str>) -> Result<T> {
        let key = key.as_ref();
        let bytes = self
            .storage
            .get_pref(owner.owner_id(), key, false)
            .await?
            .ok_or_else(|| not_found(owner, key))?;
        codec::decode(&bytes)
    }

    /// Write a plaintext preference (atomic upsert)
    pub async fn set_plain<T: PrefType>(
        &self,
        owner: &Owner,
        key: impl AsRef<str>,
        value: T,
    ) -> Result<()> {
        let key = key.as_ref();
        let bytes = codec::encode(value)?;
        self.storage
            .upsert_pref(owner.owner_id(), key, &bytes, false)
            .await?;
        debug!(owner = %owner.owner_id(), key, "stored plaintext preference");
        Ok(())
    }

    /// Read and decrypt an encrypted preference
    pub async fn get_encrypted<T: PrefType>(
        &self,
        owner: &Owner,
        key: impl AsRef<str>,
        master: &MasterKey,
    ) -> Result<T> {
        let key = key.as_ref();
        let sealed = self
            .storage
            .get_pref(owner.owner_id(), key, true)
            .await?
            .ok_or_else(|| not_found(owner, key))?;

        let secret =
            key_manager::unwrap_owner_secret(master, &owner.external_id, &owner.wrapped_secret)?;
        let mut plain = AesGcmCipher::open(&secret, &sealed, owner.external_id.as_bytes())
            .inspect_err(|_| {
                warn!(owner = %owner.owner_id(), key, "encrypted preference failed authentication");
            })?;
        drop(secret);

        let value = codec::decode(&plain);
        zeroize::Zeroize::zeroize(&mut plain);
        value
    }

    /// Encrypt and write a preference (atomic upsert)
    pub async fn set_encrypted<T: PrefType>(
        &self,
        owner: &Owner,
        key: impl AsRef<str>,
        value: T,
        master: &MasterKey,
    ) -> Result<()> {
        let key = key.as_ref();
        let mut plain = codec::encode(value)?;

        let sealed = {
            let secret = key_manager::unwrap_owner_secret(
                master,
                &owner.external_id,
                &owner.wrapped_secret,
            )?;
            AesGcmCipher::seal(&secret, &plain, owner.external_id.as_bytes())
        };
        zeroize::Zeroize::zeroize(&mut plain);
        let sealed = sealed?;

        self.storage
            .upsert_pref(owner.owner_id(), key, &sealed, true)
            .await?;
        debug!(owner = %owner.owner_id(), key, "stored encrypted preference");
        Ok(())
    }

    /// Whether the key exists for this owner, in either mode
    pub async fn exists(&self, owner: &Owner, key: impl AsRef<str>) -> Result<bool> {
        self.storage.pref_exists(owner.owner_id(), key.as_ref()).await
    }

    /// Remove a preference
    pub async fn delete(&self, owner: &Owner, key: impl AsRef<str>) -> Result<bool> {
        self.storage.delete_pref(owner.owner_id(), key.as_ref()).await
    }

    /// Guild announcement channel, or `fallback` (usually the system channel) when unset
    pub async fn announce_channel(&self, guild: &Owner, fallback: &str) -> Result<String> {
        match self
            .get_plain::<String>(guild, GuildPref::AnnounceChannel)
            .await
        {
            Ok(channel) => Ok(channel),
            Err(VaultError::PrefNotFound(_)) => Ok(fallback.to_string()),
            Err(e) => Err(e),
        }
    }
}

fn not_found(owner: &Owner, key: &str) -> VaultError {
    VaultError::PrefNotFound(format!("{} on {}", key, owner.owner_id()))
}

/// Result of a maintenance re-wrap pass
#[derive(Debug, Default)]
pub struct RewrapResult {
    pub rewrapped: usize,
    pub failed: Vec<String>,
}

impl std::fmt::Display for RewrapResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} secrets re-wrapped, {} failed", self.rewrapped, self.failed.len())
    }
}

/// Owner creation, lookup and removal
pub struct OwnerRegistry<S: PrefStorage> {
    storage: Arc<S>,
}

impl<S: PrefStorage> OwnerRegistry<S> {
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Find an owner by external id
    pub async fn owner(&self, kind: OwnerKind, external_id: &str) -> Result<Owner> {
        self.storage
            .get_owner(kind, external_id)
            .await?
            .ok_or_else(|| VaultError::OwnerNotFound(format!("{} {}", kind, external_id)))
    }

    /// All owners of a kind
    pub async fn owners(&self, kind: OwnerKind) -> Result<Vec<Owner>> {
        self.storage.list_owners(kind).await
    }

    /// Create an owner with a freshly wrapped secret.
    ///
    /// Idempotent: an owner that already exists is returned as stored and its
    /// secret is left alone. New guilds start with the scheduled spam disabled.
    pub async fn provision_owner(
        &self,
        kind: OwnerKind,
        external_id: &str,
        master: &MasterKey,
    ) -> Result<Owner> {
        if let Some(existing) = self.storage.get_owner(kind, external_id).await? {
            debug!(owner = %existing.owner_id(), "owner already provisioned");
            return Ok(existing);
        }

        let wrapped = key_manager::provision_owner_secret(master, external_id)?;
        let (owner, created) = self
            .storage
            .get_or_insert_owner(kind, external_id, &wrapped)
            .await?;
        if !created {
            debug!(owner = %owner.owner_id(), "owner provisioned concurrently");
            return Ok(owner);
        }
        info!(owner = %owner.owner_id(), external_id, "provisioned owner");

        if kind == OwnerKind::Guild {
            PreferenceStore::new(Arc::clone(&self.storage))
                .set_plain(&owner, GuildPref::ScheduledFlameheart, false)
                .await?;
        }
        Ok(owner)
    }

    /// Delete an owner and all of its preferences
    pub async fn remove_owner(&self, kind: OwnerKind, external_id: &str) -> Result<bool> {
        let Some(owner) = self.storage.get_owner(kind, external_id).await? else {
            warn!(%kind, external_id, "owner not found, nothing to remove");
            return Ok(false);
        };
        let removed = self.storage.delete_owner(owner.owner_id()).await?;
        info!(owner = %owner.owner_id(), "removed owner");
        Ok(removed)
    }

    /// Re-seal every owner secret of `kind` from `old_master` to `new_master`.
    ///
    /// Owners whose secret does not open under `old_master` are reported and left
    /// untouched. Run while nothing else writes owners; switch the configured key
    /// afterwards.
    pub async fn rewrap_all(
        &self,
        kind: OwnerKind,
        old_master: &MasterKey,
        new_master: &MasterKey,
    ) -> Result<RewrapResult> {
        let mut result = RewrapResult::default();
        for owner in self.storage.list_owners(kind).await? {
            match key_manager::rewrap_owner_secret(
                old_master,
                new_master,
                &owner.external_id,
                &owner.wrapped_secret,
            ) {
                Ok(wrapped) => {
                    self.storage
                        .update_owner_secret(owner.owner_id(), &wrapped)
                        .await?;
                    result.rewrapped += 1;
                }
                Err(e) => {
                    warn!(owner = %owner.owner_id(), error = %e, "could not re-wrap owner secret");
                    result.failed.push(owner.external_id);
                }
            }
        }
        info!(%kind, %result, "re-wrap pass finished");
        Ok(result)
    }
}
