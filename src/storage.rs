//! Storage abstraction for owners and their preferences
//!
//! This module provides a trait-based row store that can be implemented for
//! various backends (in-memory, PostgreSQL, etc.). The store never sees plaintext
//! secrets: owner secrets arrive wrapped and encrypted preference values arrive
//! sealed.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};

/// Kind of tenant owning preferences
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OwnerKind {
    /// A chat server
    Guild,
    /// An individual account
    User,
}

impl OwnerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OwnerKind::Guild => "guild",
            OwnerKind::User => "user",
        }
    }
}

impl std::fmt::Display for OwnerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Storage identity of an owner: the kind selects the table, `id` is the row id
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId {
    pub kind: OwnerKind,
    pub id: i64,
}

impl std::fmt::Display for OwnerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.kind, self.id)
    }
}

/// A guild or user row
#[derive(Clone, Serialize, Deserialize)]
pub struct Owner {
    /// Internal numeric identity, assigned by storage
    pub id: i64,
    pub kind: OwnerKind,
    /// Platform-facing id; AAD for everything sealed for this owner
    pub external_id: String,
    /// `nonce ‖ sealed(owner secret)` under the master key
    pub wrapped_secret: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Owner {
    pub fn owner_id(&self) -> OwnerId {
        OwnerId {
            kind: self.kind,
            id: self.id,
        }
    }
}

impl std::fmt::Debug for Owner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Owner")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("external_id", &self.external_id)
            .field("wrapped_secret", &format_args!("[{} bytes]", self.wrapped_secret.len()))
            .field("created_at", &self.created_at)
            .field("modified_at", &self.modified_at)
            .finish()
    }
}

/// One preference row, unique per (owner, key)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefRow {
    pub owner_id: i64,
    pub key: String,
    /// Codec bytes, or `nonce ‖ sealed(codec bytes)` when encrypted
    pub value: Vec<u8>,
    pub is_encrypted: bool,
    pub modified_at: DateTime<Utc>,
}

/// Row store backing the preference store
#[async_trait]
pub trait PrefStorage: Send + Sync {
    /// Insert a new owner, or return the one already stored under this external id.
    ///
    /// Atomic: concurrent calls for the same id all get the same row back. The flag
    /// is true only for the call that created it; the others' `wrapped_secret` is
    /// discarded.
    async fn get_or_insert_owner(
        &self,
        kind: OwnerKind,
        external_id: &str,
        wrapped_secret: &[u8],
    ) -> Result<(Owner, bool)>;

    /// Look up an owner by its external id
    async fn get_owner(&self, kind: OwnerKind, external_id: &str) -> Result<Option<Owner>>;

    /// All owners of a kind, ordered by id
    async fn list_owners(&self, kind: OwnerKind) -> Result<Vec<Owner>>;

    /// Replace the wrapped secret (maintenance re-wrap only)
    async fn update_owner_secret(&self, owner: OwnerId, wrapped_secret: &[u8]) -> Result<()>;

    /// Delete an owner together with all its preferences
    async fn delete_owner(&self, owner: OwnerId) -> Result<bool>;

    /// Fetch a preference value, matching on the encrypted flag
    async fn get_pref(&self, owner: OwnerId, key: &str, encrypted: bool)
        -> Result<Option<Vec<u8>>>;

    /// Atomic insert-or-update of a preference.
    ///
    /// Returns `ModeConflict` without writing if the key exists with the other
    /// encrypted flag.
    async fn upsert_pref(
        &self,
        owner: OwnerId,
        key: &str,
        value: &[u8],
        encrypted: bool,
    ) -> Result<()>;

    /// Whether a preference exists in either mode
    async fn pref_exists(&self, owner: OwnerId, key: &str) -> Result<bool>;

    /// Remove a preference
    async fn delete_pref(&self, owner: OwnerId, key: &str) -> Result<bool>;
}

/// In-memory implementation of PrefStorage
///
/// Suitable for development, testing, and single-instance deployments.
/// Data is lost when the process terminates.
pub struct InMemoryStorage {
    next_id: AtomicI64,
    owners: RwLock<HashMap<OwnerId, Owner>>,
    prefs: RwLock<HashMap<(OwnerId, String), PrefRow>>,
}

impl InMemoryStorage {
    /// Create a new in-memory storage instance
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            owners: RwLock::new(HashMap::new()),
            prefs: RwLock::new(HashMap::new()),
        }
    }

    /// Number of preference rows stored for an owner
    pub fn pref_count(&self, owner: OwnerId) -> usize {
        self.prefs.read().keys().filter(|(o, _)| *o == owner).count()
    }

    /// Raw row, including its encrypted flag
    pub fn pref_row(&self, owner: OwnerId, key: &str) -> Option<PrefRow> {
        self.prefs.read().get(&(owner, key.to_string())).cloned()
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PrefStorage for InMemoryStorage {
    async fn get_or_insert_owner(
        &self,
        kind: OwnerKind,
        external_id: &str,
        wrapped_secret: &[u8],
    ) -> Result<(Owner, bool)> {
        let mut owners = self.owners.write();
        if let Some(existing) = owners
            .values()
            .find(|o| o.kind == kind && o.external_id == external_id)
        {
            return Ok((existing.clone(), false));
        }

        let now = Utc::now();
        let owner = Owner {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            kind,
            external_id: external_id.to_string(),
            wrapped_secret: wrapped_secret.to_vec(),
            created_at: now,
            modified_at: now,
        };
        owners.insert(owner.owner_id(), owner.clone());
        Ok((owner, true))
    }

    async fn get_owner(&self, kind: OwnerKind, external_id: &str) -> Result<Option<Owner>> {
        let owners = self.owners.read();
        Ok(owners
            .values()
            .find(|o| o.kind == kind && o.external_id == external_id)
            .cloned())
    }

    async fn list_owners(&self, kind: OwnerKind) -> Result<Vec<Owner>> {
        let owners = self.owners.read();
        let mut list: Vec<Owner> = owners.values().filter(|o| o.kind == kind).cloned().collect();
        list.sort_by_key(|o| o.id);
        Ok(list)
    }

    async fn update_owner_secret(&self, owner: OwnerId, wrapped_secret: &[u8]) -> Result<()> {
        let mut owners = self.owners.write();
        match owners.get_mut(&owner) {
            Some(stored) => {
                stored.wrapped_secret = wrapped_secret.to_vec();
                stored.modified_at = Utc::now();
                Ok(())
            }
            None => Err(VaultError::OwnerNotFound(owner.to_string())),
        }
    }

    async fn delete_owner(&self, owner: OwnerId) -> Result<bool> {
        // lock order is owners, then prefs
        let mut owners = self.owners.write();
        let removed = owners.remove(&owner).is_some();
        if removed {
            self.prefs.write().retain(|(o, _), _| *o != owner);
        }
        Ok(removed)
    }

    async fn get_pref(
        &self,
        owner: OwnerId,
        key: &str,
        encrypted: bool,
    ) -> Result<Option<Vec<u8>>> {
        let prefs = self.prefs.read();
        Ok(prefs
            .get(&(owner, key.to_string()))
            .filter(|row| row.is_encrypted == encrypted)
            .map(|row| row.value.clone()))
    }

    async fn upsert_pref(
        &self,
        owner: OwnerId,
        key: &str,
        value: &[u8],
        encrypted: bool,
    ) -> Result<()> {
        // owners stays read-locked until the row is written
        let owners = self.owners.read();
        if !owners.contains_key(&owner) {
            return Err(VaultError::OwnerNotFound(owner.to_string()));
        }

        let mut prefs = self.prefs.write();
        let now = Utc::now();
        match prefs.get_mut(&(owner, key.to_string())) {
            Some(row) if row.is_encrypted != encrypted => Err(VaultError::ModeConflict(format!(
                "{} on {} is stored with encrypted={}",
                key, owner, row.is_encrypted
            ))),
            Some(row) => {
                row.value = value.to_vec();
                row.modified_at = now;
                Ok(())
            }
            None => {
                prefs.insert(
                    (owner, key.to_string()),
                    PrefRow {
                        owner_id: owner.id,
                        key: key.to_string(),
                        value: value.to_vec(),
                        is_encrypted: encrypted,
                        modified_at: now,
                    },
                );
                Ok(())
            }
        }
    }

    async fn pref_exists(&self, owner: OwnerId, key: &str) -> Result<bool> {
        Ok(self.prefs.read().contains_key(&(owner, key.to_string())))
    }

    async fn delete_pref(&self, owner: OwnerId, key: &str) -> Result<bool> {
        Ok(self.prefs.write().remove(&(owner, key.to_string())).is_some())
    }
}
