//! Tenant secrets demo
//!
//! Walks through owner provisioning, plain and encrypted preferences, tamper
//! detection, the credential lifecycle and a master key re-wrap, all in memory.

use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{Duration, Utc};
use tokio::sync::watch;

use tenant_secrets::{
    CredentialChecker, CredentialLifecycle, ExpiryNotifier, GuildPref, InMemoryStorage,
    MasterKey, Owner, OwnerKind, OwnerRegistry, PrefStorage, PreferenceStore, Result,
    UserPref, VaultError,
};

fn b64(data: &[u8]) -> String {
    let encoded = STANDARD.encode(data);
    if encoded.len() > 16 {
        format!("{}...{}", &encoded[..8], &encoded[encoded.len() - 4..])
    } else {
        encoded
    }
}

struct PrintNotifier;

#[async_trait]
impl ExpiryNotifier for PrintNotifier {
    async fn notify_expired(&self, owner: &Owner) -> Result<()> {
        println!("   -> DM to {}: your cookie has expired, please set a new one", owner.external_id);
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    println!("=== Tenant Secrets: per-owner encrypted preferences ===\n");

    let storage = Arc::new(InMemoryStorage::new());
    let registry = OwnerRegistry::new(Arc::clone(&storage));
    let store = PreferenceStore::new(Arc::clone(&storage));
    let master = MasterKey::generate();
    let key_b64 = master.to_base64();
    println!("[INIT] Master key (32B): {}...{}\n", &key_b64[..8], &key_b64[key_b64.len() - 4..]);

    // Owners
    let guild = registry.provision_owner(OwnerKind::Guild, "guild-42", &master).await?;
    let user = registry.provision_owner(OwnerKind::User, "user-7", &master).await?;
    println!("[OWNER] {} wrapped secret ({}B): {}", guild.owner_id(), guild.wrapped_secret.len(), b64(&guild.wrapped_secret));
    println!("[OWNER] {} wrapped secret ({}B): {}\n", user.owner_id(), user.wrapped_secret.len(), b64(&user.wrapped_secret));

    // Plain preferences
    let spam: bool = store.get_plain(&guild, GuildPref::ScheduledFlameheart).await?;
    println!("[PLAIN] scheduled_fh default: {}", spam);
    println!("[PLAIN] announce channel: {}", store.announce_channel(&guild, "system-channel").await?);
    store.set_plain(&guild, GuildPref::AnnounceChannel, "treasure-news".to_string()).await?;
    println!("[PLAIN] announce channel after set: {}\n", store.announce_channel(&guild, "system-channel").await?);

    // Encrypted preferences
    store.set_encrypted(&guild, "token", "abc123".to_string(), &master).await?;
    let token: String = store.get_encrypted(&guild, "token", &master).await?;
    println!("[ENC] token round trip: {}", token);
    println!("[ENC] plaintext read of encrypted key: {}", describe(store.get_plain::<String>(&guild, "token").await));

    let mut sealed = storage
        .get_pref(guild.owner_id(), "token", true)
        .await?
        .ok_or_else(|| VaultError::PrefNotFound("token".into()))?;
    println!("[ENC] stored value ({}B): {}", sealed.len(), b64(&sealed));
    sealed[20] ^= 0x01;
    storage.upsert_pref(guild.owner_id(), "token", &sealed, true).await?;
    println!("[TAMPER] after flipping byte 20: {}\n", describe(store.get_encrypted::<String>(&guild, "token", &master).await));

    // Typed reads
    store.set_plain(&guild, "k", true).await?;
    println!("[CODEC] bool read as i64: {}\n", describe(store.get_plain::<i64>(&guild, "k").await));

    // Credential lifecycle
    println!("=== Credential lifecycle ===\n");
    let lifecycle = CredentialLifecycle::new(store.clone(), Duration::hours(6));
    println!("[CRED] status: {}", lifecycle.credential_status(&user, &master).await?);

    let cookie = STANDARD.encode(format!(
        r#"{{"Value":"rat-cookie-value","Expiration":{}}}"#,
        (Utc::now() + Duration::hours(2)).timestamp()
    ));
    lifecycle.store_cookie(&user, &cookie, &master).await?;
    println!("[CRED] status after storing a 2h cookie: {}", lifecycle.credential_status(&user, &master).await?);

    lifecycle
        .store_credential(&user, "rat-cookie-value", Utc::now() - Duration::minutes(5), &master)
        .await?;
    println!("[CRED] status after expiry: {}", lifecycle.credential_status(&user, &master).await?);
    println!("[CRED] fetch: {}", describe(lifecycle.credential(&user, &master).await));

    let checker = CredentialChecker::new(
        OwnerRegistry::new(Arc::clone(&storage)),
        CredentialLifecycle::new(store.clone(), Duration::hours(6)),
        Arc::new(PrintNotifier),
    );
    let (_shutdown_tx, mut shutdown_rx) = watch::channel(false);
    for pass in 1..=2 {
        println!("[CHECK] pass {}", pass);
        let report = checker.run_once(&master, &mut shutdown_rx).await?;
        println!("   checked={} notified={} already_notified={}", report.checked, report.notified, report.already_notified);
    }
    println!("[CRED] status: {}\n", lifecycle.credential_status(&user, &master).await?);

    // Master key re-wrap
    println!("=== Master key re-wrap ===\n");
    store.set_encrypted(&user, UserPref::PlaysSotStartTime, Utc::now().timestamp(), &master).await?;
    let new_master = MasterKey::generate();
    let result = registry.rewrap_all(OwnerKind::User, &master, &new_master).await?;
    println!("[REWRAP] {}", result);

    let user = registry.owner(OwnerKind::User, "user-7").await?;
    let started: i64 = store.get_encrypted(&user, UserPref::PlaysSotStartTime, &new_master).await?;
    println!("[REWRAP] read under new key: {}", started);
    println!("[REWRAP] read under old key: {}", describe(store.get_encrypted::<i64>(&user, UserPref::PlaysSotStartTime, &master).await));

    println!("\n=== Done ===");
    Ok(())
}

fn describe<T: std::fmt::Display>(result: Result<T>) -> String {
    match result {
        Ok(v) => format!("Ok({})", v),
        Err(e) => format!("Err({})", e),
    }
}
