use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, warn};

use crate::error::{Result, VaultError};
use crate::storage::{Owner, OwnerId, OwnerKind, PrefStorage};

/// Schema applied by `init_schema`
pub const SCHEMA: &str = include_str!("../migrations/001_init_schema.sql");

/// Default deadline for a single database round trip
pub const DEFAULT_SQL_TIMEOUT: Duration = Duration::from_secs(1);

/// Table and column names for one owner kind
struct Tables {
    owners: &'static str,
    prefs: &'static str,
    /// external id column on the owner table, and FK column on the pref table
    id_col: &'static str,
}

fn tables(kind: OwnerKind) -> Tables {
    match kind {
        OwnerKind::Guild => Tables {
            owners: "guilds",
            prefs: "guild_prefs",
            id_col: "guild_id",
        },
        OwnerKind::User => Tables {
            owners: "users",
            prefs: "user_prefs",
            id_col: "user_id",
        },
    }
}

/// Production PostgreSQL storage implementation
///
/// - Owner secrets are stored wrapped only (`enc_key`)
/// - Encrypted preference values are stored sealed (`pref_val` with `is_enc = TRUE`)
/// - Preferences cascade on owner deletion
/// - Every round trip is bounded by `sql_timeout`
pub struct PostgresStorage {
    pool: PgPool,
    sql_timeout: Duration,
}

impl PostgresStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            sql_timeout: DEFAULT_SQL_TIMEOUT,
        }
    }

    pub fn with_timeout(pool: PgPool, sql_timeout: Duration) -> Self {
        Self { pool, sql_timeout }
    }

    /// Connect a small pool and verify the connection within the timeout
    pub async fn connect(database_url: &str, sql_timeout: Duration) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .acquire_timeout(sql_timeout)
            .connect(database_url)
            .await
            .map_err(|e| VaultError::Storage(format!("Failed to connect: {}", e)))?;
        Ok(Self::with_timeout(pool, sql_timeout))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create tables if missing
    pub async fn init_schema(&self) -> Result<()> {
        self.timed("init schema", sqlx::raw_sql(SCHEMA).execute(&self.pool))
            .await?;
        debug!("schema ready");
        Ok(())
    }

    async fn timed<T, F>(&self, op: &str, fut: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, sqlx::Error>>,
    {
        match tokio::time::timeout(self.sql_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(VaultError::Storage(format!("Failed to {}: {}", op, e))),
            Err(_) => {
                warn!(operation = op, timeout_ms = self.sql_timeout.as_millis() as u64, "query timed out");
                Err(VaultError::StorageTimeout(self.sql_timeout))
            }
        }
    }
}

fn owner_from_row(kind: OwnerKind, r: &PgRow) -> Result<Owner> {
    Ok(Owner {
        id: r.try_get("id")?,
        kind,
        external_id: r.try_get("external_id")?,
        wrapped_secret: r.try_get("enc_key")?,
        created_at: r.try_get("ctime")?,
        modified_at: r.try_get("mtime")?,
    })
}

#[async_trait]
impl PrefStorage for PostgresStorage {
    async fn get_or_insert_owner(
        &self,
        kind: OwnerKind,
        external_id: &str,
        wrapped_secret: &[u8],
    ) -> Result<(Owner, bool)> {
        let t = tables(kind);
        let q = format!(
            r#"
            INSERT INTO {owners} ({col}, enc_key)
            VALUES ($1, $2)
            ON CONFLICT ({col}) DO NOTHING
            RETURNING id, {col} AS external_id, enc_key, ctime, mtime
            "#,
            owners = t.owners,
            col = t.id_col,
        );
        let row = self
            .timed(
                "insert owner",
                sqlx::query(&q)
                    .bind(external_id)
                    .bind(wrapped_secret)
                    .fetch_optional(&self.pool),
            )
            .await?;
        if let Some(row) = row {
            return Ok((owner_from_row(kind, &row)?, true));
        }

        // lost the race (or already there): the stored row wins
        let existing = self
            .get_owner(kind, external_id)
            .await?
            .ok_or_else(|| VaultError::OwnerNotFound(format!("{} {}", kind, external_id)))?;
        Ok((existing, false))
    }

    async fn get_owner(&self, kind: OwnerKind, external_id: &str) -> Result<Option<Owner>> {
        let t = tables(kind);
        let q = format!(
            r#"
            SELECT id, {col} AS external_id, enc_key, ctime, mtime
            FROM {owners}
            WHERE {col} = $1
            "#,
            owners = t.owners,
            col = t.id_col,
        );
        let row = self
            .timed(
                "get owner",
                sqlx::query(&q).bind(external_id).fetch_optional(&self.pool),
            )
            .await?;
        row.map(|r| owner_from_row(kind, &r)).transpose()
    }

    async fn list_owners(&self, kind: OwnerKind) -> Result<Vec<Owner>> {
        let t = tables(kind);
        let q = format!(
            r#"
            SELECT id, {col} AS external_id, enc_key, ctime, mtime
            FROM {owners}
            ORDER BY id
            "#,
            owners = t.owners,
            col = t.id_col,
        );
        let rows = self
            .timed("list owners", sqlx::query(&q).fetch_all(&self.pool))
            .await?;
        rows.iter().map(|r| owner_from_row(kind, r)).collect()
    }

    async fn update_owner_secret(&self, owner: OwnerId, wrapped_secret: &[u8]) -> Result<()> {
        let t = tables(owner.kind);
        let q = format!(
            "UPDATE {owners} SET enc_key = $2, mtime = NOW() WHERE id = $1",
            owners = t.owners
        );
        let done = self
            .timed(
                "update owner secret",
                sqlx::query(&q)
                    .bind(owner.id)
                    .bind(wrapped_secret)
                    .execute(&self.pool),
            )
            .await?;
        if done.rows_affected() == 0 {
            return Err(VaultError::OwnerNotFound(owner.to_string()));
        }
        Ok(())
    }

    async fn delete_owner(&self, owner: OwnerId) -> Result<bool> {
        let t = tables(owner.kind);
        let q = format!("DELETE FROM {owners} WHERE id = $1", owners = t.owners);
        let done = self
            .timed(
                "delete owner",
                sqlx::query(&q).bind(owner.id).execute(&self.pool),
            )
            .await?;
        Ok(done.rows_affected() > 0)
    }

    async fn get_pref(
        &self,
        owner: OwnerId,
        key: &str,
        encrypted: bool,
    ) -> Result<Option<Vec<u8>>> {
        let t = tables(owner.kind);
        let q = format!(
            r#"
            SELECT pref_val
            FROM {prefs}
            WHERE {col} = $1 AND pref_key = $2 AND is_enc = $3
            "#,
            prefs = t.prefs,
            col = t.id_col,
        );
        let row = self
            .timed(
                "get preference",
                sqlx::query(&q)
                    .bind(owner.id)
                    .bind(key)
                    .bind(encrypted)
                    .fetch_optional(&self.pool),
            )
            .await?;
        row.map(|r| r.try_get("pref_val").map_err(VaultError::from))
            .transpose()
    }

    async fn upsert_pref(
        &self,
        owner: OwnerId,
        key: &str,
        value: &[u8],
        encrypted: bool,
    ) -> Result<()> {
        let t = tables(owner.kind);
        // The WHERE on the conflict branch keeps is_enc fixed: a mode flip updates
        // nothing and returns no row.
        let q = format!(
            r#"
            INSERT INTO {prefs} ({col}, pref_key, pref_val, is_enc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT ({col}, pref_key) DO UPDATE
               SET pref_val = EXCLUDED.pref_val, mtime = NOW()
             WHERE {prefs}.is_enc = EXCLUDED.is_enc
            RETURNING id
            "#,
            prefs = t.prefs,
            col = t.id_col,
        );
        let row = self
            .timed(
                "upsert preference",
                sqlx::query(&q)
                    .bind(owner.id)
                    .bind(key)
                    .bind(value)
                    .bind(encrypted)
                    .fetch_optional(&self.pool),
            )
            .await?;
        match row {
            Some(_) => Ok(()),
            None => Err(VaultError::ModeConflict(format!(
                "{} on {} is stored with encrypted={}",
                key, owner, !encrypted
            ))),
        }
    }

    async fn pref_exists(&self, owner: OwnerId, key: &str) -> Result<bool> {
        let t = tables(owner.kind);
        let q = format!(
            "SELECT EXISTS (SELECT 1 FROM {prefs} WHERE {col} = $1 AND pref_key = $2) AS present",
            prefs = t.prefs,
            col = t.id_col,
        );
        let row = self
            .timed(
                "check preference",
                sqlx::query(&q).bind(owner.id).bind(key).fetch_one(&self.pool),
            )
            .await?;
        Ok(row.try_get("present")?)
    }

    async fn delete_pref(&self, owner: OwnerId, key: &str) -> Result<bool> {
        let t = tables(owner.kind);
        let q = format!(
            "DELETE FROM {prefs} WHERE {col} = $1 AND pref_key = $2",
            prefs = t.prefs,
            col = t.id_col,
        );
        let done = self
            .timed(
                "delete preference",
                sqlx::query(&q).bind(owner.id).bind(key).execute(&self.pool),
            )
            .await?;
        Ok(done.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_covers_both_kinds() {
        for kind in [OwnerKind::Guild, OwnerKind::User] {
            let t = tables(kind);
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", t.owners)));
            assert!(SCHEMA.contains(&format!("CREATE TABLE IF NOT EXISTS {} ", t.prefs)));
            assert!(SCHEMA.contains(&format!("UNIQUE ({}, pref_key)", t.id_col)));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_round_trip_is_storage_timeout() {
        let pool = PgPoolOptions::new()
            .connect_lazy("postgres://localhost/unused")
            .unwrap();
        let storage = PostgresStorage::with_timeout(pool, Duration::from_millis(50));

        let stuck = std::future::pending::<std::result::Result<(), sqlx::Error>>();
        match storage.timed("stuck query", stuck).await {
            Err(VaultError::StorageTimeout(after)) => assert_eq!(after, Duration::from_millis(50)),
            other => panic!("expected timeout, got {:?}", other),
        }

        let failing = async { Err::<(), _>(sqlx::Error::RowNotFound) };
        let err = storage.timed("failing query", failing).await.unwrap_err();
        assert!(matches!(err, VaultError::Storage(_)));
        assert!(err.is_transient());

        let done = async { Ok::<_, sqlx::Error>(7) };
        assert_eq!(storage.timed("quick query", done).await.unwrap(), 7);
    }

    /// Needs a disposable database: `DATABASE_URL=... cargo test -- --ignored`
    #[tokio::test]
    #[ignore]
    async fn test_postgres_upsert_and_mode_conflict() {
        let url = std::env::var("DATABASE_URL").expect("DATABASE_URL");
        let storage = PostgresStorage::connect(&url, Duration::from_secs(5)).await.unwrap();
        storage.init_schema().await.unwrap();

        let external_id = format!("pg-test-{}", chrono::Utc::now().timestamp_nanos_opt().unwrap());
        let (owner, created) = storage
            .get_or_insert_owner(OwnerKind::User, &external_id, &[1u8; 44])
            .await
            .unwrap();
        assert!(created);
        let (again, created) = storage
            .get_or_insert_owner(OwnerKind::User, &external_id, &[2u8; 44])
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(again.wrapped_secret, vec![1u8; 44]);
        let owner = owner.owner_id();

        storage.upsert_pref(owner, "k", b"v1", false).await.unwrap();
        storage.upsert_pref(owner, "k", b"v2", false).await.unwrap();
        assert_eq!(
            storage.get_pref(owner, "k", false).await.unwrap(),
            Some(b"v2".to_vec())
        );
        assert_eq!(storage.get_pref(owner, "k", true).await.unwrap(), None);
        assert!(matches!(
            storage.upsert_pref(owner, "k", b"v3", true).await,
            Err(VaultError::ModeConflict(_))
        ));

        assert!(storage.delete_owner(owner).await.unwrap());
        assert!(!storage.pref_exists(owner, "k").await.unwrap());
    }
}
