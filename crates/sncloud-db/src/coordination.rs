//! Coordination store backed by the `kv_store` table.
//!
//! Expiry is evaluated with the database clock so that several server
//! processes sharing one database agree on lock ownership.

use std::time::Duration;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::debug;

use sncloud_core::{defaults::KV_DEFAULT_TTL_SECS, CoordinationStore, Error, Result};

/// Prefix separating lock entries from plain values.
pub const LOCK_PREFIX: &str = "lock:";

pub(crate) fn lock_key(key: &str) -> String {
    format!("{LOCK_PREFIX}{key}")
}

/// PostgreSQL implementation of CoordinationStore.
pub struct PgCoordinationStore {
    pool: Pool<Postgres>,
}

impl PgCoordinationStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    /// Delete every expired entry. Returns the number removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM kv_store WHERE expires_at <= now()")
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl CoordinationStore for PgCoordinationStore {
    async fn set_value(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let ttl = ttl.unwrap_or(Duration::from_secs(KV_DEFAULT_TTL_SECS));
        sqlx::query(
            "INSERT INTO kv_store (key, value, expires_at)
             VALUES ($1, $2, now() + ($3 * interval '1 second'))
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(ttl.as_secs_f64())
        .execute(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(())
    }

    async fn get_value(&self, key: &str) -> Result<Option<String>> {
        let row: Option<(String, bool)> =
            sqlx::query_as("SELECT value, expires_at <= now() FROM kv_store WHERE key = $1")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(Error::Database)?;

        match row {
            Some((_, true)) => {
                sqlx::query("DELETE FROM kv_store WHERE key = $1 AND expires_at <= now()")
                    .bind(key)
                    .execute(&self.pool)
                    .await
                    .map_err(Error::Database)?;
                Ok(None)
            }
            Some((value, false)) => Ok(Some(value)),
            None => Ok(None),
        }
    }

    async fn delete_value(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(())
    }

    async fn acquire_lock(&self, key: &str, owner: &str, ttl: Duration) -> Result<bool> {
        // The conditional upsert only overwrites an expired lock or our own.
        let acquired = sqlx::query_scalar::<_, String>(
            "INSERT INTO kv_store (key, value, expires_at)
             VALUES ($1, $2, now() + ($3 * interval '1 second'))
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at
             WHERE kv_store.expires_at <= now() OR kv_store.value = EXCLUDED.value
             RETURNING key",
        )
        .bind(lock_key(key))
        .bind(owner)
        .bind(ttl.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?
        .is_some();

        debug!(
            subsystem = "db",
            component = "coordination",
            op = "acquire_lock",
            lock = key,
            owner,
            acquired,
            "Lock acquisition attempted"
        );
        Ok(acquired)
    }

    async fn release_lock(&self, key: &str, owner: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM kv_store WHERE key = $1 AND value = $2")
            .bind(lock_key(key))
            .bind(owner)
            .execute(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(result.rows_affected() > 0)
    }
}
