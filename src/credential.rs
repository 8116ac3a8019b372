//! Credential lifecycle
//!
//! One encrypted credential per user (`rat_token`) with two companion prefs: the
//! expiry as unix seconds (encrypted) and a plaintext "already notified" flag.
//!
//! ```text
//! Absent -> Valid -> ExpiringSoon -> ExpiredUnnotified -> ExpiredNotified
//!             ^                                                 |
//!             +---------------- store_credential ---------------+
//! ```

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use tracing::{debug, info};

use crate::error::{Result, VaultError};
use crate::key_manager::MasterKey;
use crate::prefs::{PreferenceStore, UserPref};
use crate::storage::{Owner, PrefStorage};

/// Default lead window for `ExpiringSoon`
pub const DEFAULT_LEAD_WINDOW_SECS: i64 = 6 * 60 * 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialStatus {
    /// Nothing stored
    Absent,
    Valid,
    /// Expiry falls inside the lead window
    ExpiringSoon,
    /// Expired, owner not told yet
    ExpiredUnnotified,
    ExpiredNotified,
}

impl CredentialStatus {
    pub fn is_expired(&self) -> bool {
        matches!(
            self,
            CredentialStatus::ExpiredUnnotified | CredentialStatus::ExpiredNotified
        )
    }

    /// True exactly when one notification is owed
    pub fn needs_notification(&self) -> bool {
        matches!(self, CredentialStatus::ExpiredUnnotified)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Absent => "absent",
            CredentialStatus::Valid => "valid",
            CredentialStatus::ExpiringSoon => "expiring_soon",
            CredentialStatus::ExpiredUnnotified => "expired_unnotified",
            CredentialStatus::ExpiredNotified => "expired_notified",
        }
    }
}

impl std::fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Session cookie as handed over by the user: base64 of `{"Value": ..., "Expiration": ...}`
#[derive(Clone, Deserialize)]
pub struct RatCookie {
    #[serde(rename = "Value")]
    pub value: String,
    /// Unix seconds
    #[serde(rename = "Expiration")]
    pub expiration: i64,
}

impl RatCookie {
    pub fn parse(encoded: &str) -> Result<Self> {
        let encoded = encoded.trim();
        if encoded.is_empty() {
            return Err(VaultError::Decode("cookie cannot be empty".into()));
        }
        let raw = STANDARD
            .decode(encoded)
            .map_err(|e| VaultError::Decode(format!("failed to base64 decode cookie: {}", e)))?;
        let cookie: RatCookie = serde_json::from_slice(&raw)?;
        if cookie.value.is_empty() {
            return Err(VaultError::Decode("cookie value cannot be empty".into()));
        }
        Ok(cookie)
    }

    pub fn expires_at(&self) -> Result<DateTime<Utc>> {
        DateTime::from_timestamp(self.expiration, 0).ok_or_else(|| {
            VaultError::Decode(format!("expiration out of range: {}", self.expiration))
        })
    }
}

impl std::fmt::Debug for RatCookie {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RatCookie")
            .field("value", &"[REDACTED]")
            .field("expiration", &self.expiration)
            .finish()
    }
}

/// Answer of a live check against the remote API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeOutcome {
    Authorized,
    Unauthorized,
}

/// One authenticated call against the remote API using the stored credential.
/// The remote side may revoke a credential before its stated expiry.
#[async_trait]
pub trait CredentialProbe: Send + Sync {
    async fn probe(&self, credential: &str) -> Result<ProbeOutcome>;
}

/// Drives the credential state machine on top of the preference store
pub struct CredentialLifecycle<S: PrefStorage> {
    store: PreferenceStore<S>,
    lead_window: Duration,
}

impl<S: PrefStorage> CredentialLifecycle<S> {
    pub fn new(store: PreferenceStore<S>, lead_window: Duration) -> Self {
        Self { store, lead_window }
    }

    pub fn lead_window(&self) -> Duration {
        self.lead_window
    }

    /// Store (or replace) the credential. Re-arms the expiry notification.
    pub async fn store_credential(
        &self,
        owner: &Owner,
        value: &str,
        expires_at: DateTime<Utc>,
        master: &MasterKey,
    ) -> Result<()> {
        // Flag first: a failure further down may cost a duplicate notification,
        // never a missing one.
        self.store
            .set_plain(owner, UserPref::SotAuthTokenNotified, false)
            .await?;
        self.store
            .set_encrypted(owner, UserPref::SotAuthToken, value.to_string(), master)
            .await?;
        self.store
            .set_encrypted(
                owner,
                UserPref::SotAuthTokenExpiration,
                expires_at.timestamp(),
                master,
            )
            .await?;
        info!(owner = %owner.owner_id(), expires_at = %expires_at, "stored credential");
        Ok(())
    }

    /// Parse a cookie and store it
    pub async fn store_cookie(&self, owner: &Owner, encoded: &str, master: &MasterKey) -> Result<()> {
        let cookie = RatCookie::parse(encoded)?;
        let expires_at = cookie.expires_at()?;
        self.store_credential(owner, &cookie.value, expires_at, master)
            .await
    }

    /// The stored credential, as long as it has not expired
    pub async fn credential(&self, owner: &Owner, master: &MasterKey) -> Result<String> {
        self.credential_at(owner, master, Utc::now()).await
    }

    pub async fn credential_at(
        &self,
        owner: &Owner,
        master: &MasterKey,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let expiry = self.expiry(owner, master).await?;
        if now.timestamp() >= expiry {
            return Err(VaultError::CredentialExpired(owner.owner_id().to_string()));
        }
        self.store
            .get_encrypted(owner, UserPref::SotAuthToken, master)
            .await
    }

    pub async fn credential_status(
        &self,
        owner: &Owner,
        master: &MasterKey,
    ) -> Result<CredentialStatus> {
        self.credential_status_at(owner, master, Utc::now()).await
    }

    /// Status from the stored expiry alone. Expiry is reached at `now >= expiry`.
    /// Without a stored value, or without an expiry, the credential is `Absent`.
    pub async fn credential_status_at(
        &self,
        owner: &Owner,
        master: &MasterKey,
        now: DateTime<Utc>,
    ) -> Result<CredentialStatus> {
        if !self.store.exists(owner, UserPref::SotAuthToken).await? {
            return Ok(CredentialStatus::Absent);
        }
        let expiry = match self.expiry(owner, master).await {
            Ok(expiry) => expiry,
            Err(VaultError::PrefNotFound(_)) => return Ok(CredentialStatus::Absent),
            Err(e) => return Err(e),
        };

        let now = now.timestamp();
        if now >= expiry {
            return self.expired_status(owner).await;
        }
        if now >= expiry.saturating_sub(self.lead_window.num_seconds()) {
            return Ok(CredentialStatus::ExpiringSoon);
        }
        Ok(CredentialStatus::Valid)
    }

    /// Like `credential_status`, but a not-yet-expired credential is also checked
    /// live. `Unauthorized` counts as expired regardless of the stored timestamp.
    pub async fn status_with_probe(
        &self,
        owner: &Owner,
        master: &MasterKey,
        probe: &dyn CredentialProbe,
    ) -> Result<CredentialStatus> {
        self.status_with_probe_at(owner, master, probe, Utc::now())
            .await
    }

    pub async fn status_with_probe_at(
        &self,
        owner: &Owner,
        master: &MasterKey,
        probe: &dyn CredentialProbe,
        now: DateTime<Utc>,
    ) -> Result<CredentialStatus> {
        let status = self.credential_status_at(owner, master, now).await?;
        if !matches!(
            status,
            CredentialStatus::Valid | CredentialStatus::ExpiringSoon
        ) {
            return Ok(status);
        }

        let credential: String = self
            .store
            .get_encrypted(owner, UserPref::SotAuthToken, master)
            .await?;
        match probe.probe(&credential).await? {
            ProbeOutcome::Authorized => Ok(status),
            ProbeOutcome::Unauthorized => {
                debug!(owner = %owner.owner_id(), "credential rejected by remote API");
                self.expired_status(owner).await
            }
        }
    }

    /// Record that the expiry notification went out
    pub async fn mark_notified(&self, owner: &Owner) -> Result<()> {
        self.store
            .set_plain(owner, UserPref::SotAuthTokenNotified, true)
            .await
    }

    async fn expiry(&self, owner: &Owner, master: &MasterKey) -> Result<i64> {
        self.store
            .get_encrypted(owner, UserPref::SotAuthTokenExpiration, master)
            .await
    }

    async fn expired_status(&self, owner: &Owner) -> Result<CredentialStatus> {
        let notified = match self
            .store
            .get_plain::<bool>(owner, UserPref::SotAuthTokenNotified)
            .await
        {
            Ok(notified) => notified,
            Err(VaultError::PrefNotFound(_)) => false,
            Err(e) => return Err(e),
        };
        Ok(if notified {
            CredentialStatus::ExpiredNotified
        } else {
            CredentialStatus::ExpiredUnnotified
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prefs::OwnerRegistry;
    use crate::storage::{InMemoryStorage, OwnerId, OwnerKind};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// In-memory storage whose n-th preference write (1-based) fails
    #[derive(Default)]
    struct FlakyStorage {
        inner: InMemoryStorage,
        upserts: AtomicUsize,
        fail_at: AtomicUsize,
    }

    impl FlakyStorage {
        fn fail_write_after_next(&self, n: usize) {
            let done = self.upserts.load(Ordering::SeqCst);
            self.fail_at.store(done + n, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PrefStorage for FlakyStorage {
        async fn get_or_insert_owner(
            &self,
            kind: OwnerKind,
            external_id: &str,
            wrapped_secret: &[u8],
        ) -> Result<(Owner, bool)> {
            self.inner.get_or_insert_owner(kind, external_id, wrapped_secret).await
        }

        async fn get_owner(&self, kind: OwnerKind, external_id: &str) -> Result<Option<Owner>> {
            self.inner.get_owner(kind, external_id).await
        }

        async fn list_owners(&self, kind: OwnerKind) -> Result<Vec<Owner>> {
            self.inner.list_owners(kind).await
        }

        async fn update_owner_secret(&self, owner: OwnerId, wrapped_secret: &[u8]) -> Result<()> {
            self.inner.update_owner_secret(owner, wrapped_secret).await
        }

        async fn delete_owner(&self, owner: OwnerId) -> Result<bool> {
            self.inner.delete_owner(owner).await
        }

        async fn get_pref(
            &self,
            owner: OwnerId,
            key: &str,
            encrypted: bool,
        ) -> Result<Option<Vec<u8>>> {
            self.inner.get_pref(owner, key, encrypted).await
        }

        async fn upsert_pref(
            &self,
            owner: OwnerId,
            key: &str,
            value: &[u8],
            encrypted: bool,
        ) -> Result<()> {
            let n = self.upserts.fetch_add(1, Ordering::SeqCst) + 1;
            if n == self.fail_at.load(Ordering::SeqCst) {
                return Err(VaultError::StorageTimeout(std::time::Duration::from_secs(1)));
            }
            self.inner.upsert_pref(owner, key, value, encrypted).await
        }

        async fn pref_exists(&self, owner: OwnerId, key: &str) -> Result<bool> {
            self.inner.pref_exists(owner, key).await
        }

        async fn delete_pref(&self, owner: OwnerId, key: &str) -> Result<bool> {
            self.inner.delete_pref(owner, key).await
        }
    }

    struct FixedProbe {
        outcome: ProbeOutcome,
        calls: AtomicUsize,
    }

    impl FixedProbe {
        fn new(outcome: ProbeOutcome) -> Self {
            Self {
                outcome,
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl CredentialProbe for FixedProbe {
        async fn probe(&self, credential: &str) -> Result<ProbeOutcome> {
            assert_eq!(credential, "tok");
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.outcome)
        }
    }

    async fn setup() -> (CredentialLifecycle<InMemoryStorage>, Owner, MasterKey) {
        let storage = Arc::new(InMemoryStorage::new());
        let master = MasterKey::generate();
        let owner = OwnerRegistry::new(Arc::clone(&storage))
            .provision_owner(OwnerKind::User, "user-1", &master)
            .await
            .unwrap();
        let lifecycle = CredentialLifecycle::new(
            PreferenceStore::new(storage),
            Duration::seconds(DEFAULT_LEAD_WINDOW_SECS),
        );
        (lifecycle, owner, master)
    }

    fn at(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_state_machine() {
        let (lc, owner, master) = setup().await;
        let t0 = 1_700_000_000;
        let lead = DEFAULT_LEAD_WINDOW_SECS;

        assert_eq!(
            lc.credential_status_at(&owner, &master, at(t0)).await.unwrap(),
            CredentialStatus::Absent
        );

        lc.store_credential(&owner, "tok", at(t0), &master).await.unwrap();
        let status = |secs| {
            let lc = &lc;
            let owner = &owner;
            let master = &master;
            async move { lc.credential_status_at(owner, master, at(secs)).await.unwrap() }
        };

        assert_eq!(status(t0 - lead - 1).await, CredentialStatus::Valid);
        assert_eq!(status(t0 - lead).await, CredentialStatus::ExpiringSoon);
        assert_eq!(status(t0 - 1).await, CredentialStatus::ExpiringSoon);
        assert_eq!(status(t0).await, CredentialStatus::ExpiredUnnotified);
        assert_eq!(status(t0 + 3600).await, CredentialStatus::ExpiredUnnotified);

        lc.mark_notified(&owner).await.unwrap();
        assert_eq!(status(t0 + 3600).await, CredentialStatus::ExpiredNotified);

        // replacing the credential re-arms the notification
        lc.store_credential(&owner, "tok", at(t0 + 86_400), &master).await.unwrap();
        assert_eq!(status(t0 + 3600).await, CredentialStatus::Valid);
        assert_eq!(status(t0 + 86_400).await, CredentialStatus::ExpiredUnnotified);
    }

    #[tokio::test]
    async fn test_credential_only_before_expiry() {
        let (lc, owner, master) = setup().await;
        let t0 = 1_700_000_000;
        lc.store_credential(&owner, "tok", at(t0), &master).await.unwrap();

        assert_eq!(lc.credential_at(&owner, &master, at(t0 - 1)).await.unwrap(), "tok");
        assert!(matches!(
            lc.credential_at(&owner, &master, at(t0)).await,
            Err(VaultError::CredentialExpired(_))
        ));
    }

    #[tokio::test]
    async fn test_probe_overrides_stored_expiry() {
        let (lc, owner, master) = setup().await;
        let t0 = 1_700_000_000;
        lc.store_credential(&owner, "tok", at(t0), &master).await.unwrap();

        let ok = FixedProbe::new(ProbeOutcome::Authorized);
        assert_eq!(
            lc.status_with_probe_at(&owner, &master, &ok, at(t0 - 86_400)).await.unwrap(),
            CredentialStatus::Valid
        );

        let revoked = FixedProbe::new(ProbeOutcome::Unauthorized);
        assert_eq!(
            lc.status_with_probe_at(&owner, &master, &revoked, at(t0 - 86_400)).await.unwrap(),
            CredentialStatus::ExpiredUnnotified
        );

        // already expired: no live call
        assert_eq!(
            lc.status_with_probe_at(&owner, &master, &revoked, at(t0)).await.unwrap(),
            CredentialStatus::ExpiredUnnotified
        );
        assert_eq!(revoked.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_store_cookie() {
        let (lc, owner, master) = setup().await;
        let far = Utc::now().timestamp() + 30 * 86_400;
        let encoded = STANDARD.encode(format!(r#"{{"Value":"tok","Expiration":{}}}"#, far));

        lc.store_cookie(&owner, &encoded, &master).await.unwrap();
        assert_eq!(lc.credential(&owner, &master).await.unwrap(), "tok");
        assert_eq!(
            lc.credential_status(&owner, &master).await.unwrap(),
            CredentialStatus::Valid
        );
    }

    #[tokio::test]
    async fn test_expiry_without_value_is_absent() {
        let (lc, owner, master) = setup().await;
        let t0 = 1_700_000_000;
        lc.store_credential(&owner, "tok", at(t0), &master).await.unwrap();
        assert!(lc.store.delete(&owner, UserPref::SotAuthToken).await.unwrap());

        for now in [t0 - 86_400, t0 - 60, t0 + 60] {
            assert_eq!(
                lc.credential_status_at(&owner, &master, at(now)).await.unwrap(),
                CredentialStatus::Absent
            );
        }

        // no live call for a credential that is not there
        let probe = FixedProbe::new(ProbeOutcome::Unauthorized);
        assert_eq!(
            lc.status_with_probe_at(&owner, &master, &probe, at(t0 - 86_400)).await.unwrap(),
            CredentialStatus::Absent
        );
        assert_eq!(probe.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_replacement_never_suppresses_notification() {
        let t0 = 1_700_000_000;
        let later = t0 + 86_400;

        // fail each of the three writes of a replacement in turn
        for failing_write in 1..=3 {
            let storage = Arc::new(FlakyStorage::default());
            let master = MasterKey::generate();
            let owner = OwnerRegistry::new(Arc::clone(&storage))
                .provision_owner(OwnerKind::User, "user-1", &master)
                .await
                .unwrap();
            let lc = CredentialLifecycle::new(
                PreferenceStore::new(Arc::clone(&storage)),
                Duration::seconds(DEFAULT_LEAD_WINDOW_SECS),
            );

            lc.store_credential(&owner, "tok", at(t0), &master).await.unwrap();
            lc.mark_notified(&owner).await.unwrap();

            storage.fail_write_after_next(failing_write);
            assert!(lc.store_credential(&owner, "tok-2", at(later), &master).await.is_err());

            let status = lc.credential_status_at(&owner, &master, at(later)).await.unwrap();
            let expected = if failing_write == 1 {
                // nothing was written, the old expiry event stays handled
                CredentialStatus::ExpiredNotified
            } else {
                CredentialStatus::ExpiredUnnotified
            };
            assert_eq!(status, expected, "failing write {}", failing_write);
        }
    }

    #[test]
    fn test_cookie_parse_rejects_bad_input() {
        assert!(matches!(RatCookie::parse("  "), Err(VaultError::Decode(_))));
        assert!(matches!(RatCookie::parse("%%%"), Err(VaultError::Decode(_))));
        assert!(matches!(
            RatCookie::parse(&STANDARD.encode("not json")),
            Err(VaultError::Serialization(_))
        ));
        assert!(matches!(
            RatCookie::parse(&STANDARD.encode(r#"{"Value":"","Expiration":1}"#)),
            Err(VaultError::Decode(_))
        ));

        let cookie = RatCookie::parse(&STANDARD.encode(r#"{"Value":"abc","Expiration":42}"#)).unwrap();
        assert_eq!(cookie.value, "abc");
        assert_eq!(cookie.expires_at().unwrap().timestamp(), 42);
        assert!(!format!("{:?}", cookie).contains("abc"));
    }

    #[test]
    fn test_status_helpers() {
        assert!(CredentialStatus::ExpiredUnnotified.needs_notification());
        assert!(!CredentialStatus::ExpiredNotified.needs_notification());
        assert!(CredentialStatus::ExpiredNotified.is_expired());
        assert!(!CredentialStatus::ExpiringSoon.is_expired());
    }
}
