//! PostgreSQL storage for device authentication state
//!
//! Challenges and device keys are persisted so that enrollment survives
//! restarts and multiple gateway replicas share one view of the replay
//! counters. The counter advance is a conditional UPDATE so racing
//! assertions resolve at the database rather than in application code.

use std::str::FromStr;

use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;

use super::{ChallengeRecord, DeviceKeyRecord, StorageError};
use crate::config::Config;

/// PostgreSQL-backed device store
pub struct PostgresDeviceStore {
    pool: PgPool,
}

impl PostgresDeviceStore {
    /// Create a new PostgreSQL device store with a bounded connection pool.
    ///
    /// Prepared statements are cached per connection with a bounded (LRU)
    /// capacity so distinct query shapes cannot grow the cache without limit.
    pub async fn new(database_url: &str, config: &Config) -> Result<Self, StorageError> {
        let options = PgConnectOptions::from_str(database_url)
            .map_err(|e| StorageError::Connection(e.to_string()))?
            .statement_cache_capacity(config.statement_cache_capacity);

        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        tracing::info!("Connected to PostgreSQL database");
        Ok(Self { pool })
    }

    /// Create from an existing pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<(), StorageError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::Migration(e.to_string()))?;

        tracing::info!("Database migrations completed");
        Ok(())
    }

    /// Check database connection health
    pub async fn check_health(&self) -> Result<(), StorageError> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;
        Ok(())
    }

    /// Store a challenge, replacing any prior challenge for the same key
    pub async fn upsert_challenge(&self, key_id: &str, value: &str) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO challenges (key_id, value, created_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (key_id) DO UPDATE SET
                value = EXCLUDED.value,
                created_at = NOW()
            "#,
        )
        .bind(key_id)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(())
    }

    /// Get the outstanding challenge for a key, if any
    pub async fn get_challenge(&self, key_id: &str) -> Result<Option<ChallengeRecord>, StorageError> {
        let row = sqlx::query_as::<_, ChallengeRow>(
            "SELECT value, created_at FROM challenges WHERE key_id = $1",
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(row.map(|row| ChallengeRecord {
            value: row.value,
            created_at: row.created_at,
        }))
    }

    /// Delete the outstanding challenge for a key
    pub async fn delete_challenge(&self, key_id: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM challenges WHERE key_id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(())
    }

    /// Store an enrolled device key (upsert)
    pub async fn upsert_device_key(
        &self,
        key_id: &str,
        public_key: &str,
        counter: u32,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO device_keys (key_id, public_key, counter, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (key_id) DO UPDATE SET
                public_key = EXCLUDED.public_key,
                counter = EXCLUDED.counter,
                updated_at = NOW()
            "#,
        )
        .bind(key_id)
        .bind(public_key)
        .bind(counter as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        tracing::info!(key_id = %key_id, "Device key stored in database");
        Ok(())
    }

    /// Get an enrolled device key
    pub async fn get_device_key(
        &self,
        key_id: &str,
    ) -> Result<Option<DeviceKeyRecord>, StorageError> {
        let row = sqlx::query_as::<_, DeviceKeyRow>(
            r#"
            SELECT key_id, public_key, counter, updated_at
            FROM device_keys
            WHERE key_id = $1
            "#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(row.map(DeviceKeyRow::into_record))
    }

    /// Advance the replay counter with a conditional write.
    ///
    /// The `counter < $2` guard makes the bump a compare-and-swap at the
    /// storage layer; of two racing assertions carrying the same counter,
    /// only one sees a row affected.
    pub async fn advance_counter(&self, key_id: &str, counter: u32) -> Result<bool, StorageError> {
        let result = sqlx::query(
            r#"
            UPDATE device_keys
            SET counter = $2, updated_at = NOW()
            WHERE key_id = $1 AND counter < $2
            "#,
        )
        .bind(key_id)
        .bind(counter as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }
}

/// Database row for challenges
#[derive(sqlx::FromRow)]
struct ChallengeRow {
    value: String,
    created_at: chrono::DateTime<chrono::Utc>,
}

/// Database row for device keys
#[derive(sqlx::FromRow)]
struct DeviceKeyRow {
    key_id: String,
    public_key: String,
    counter: i64,
    updated_at: chrono::DateTime<chrono::Utc>,
}

impl DeviceKeyRow {
    fn into_record(self) -> DeviceKeyRecord {
        DeviceKeyRecord {
            key_id: self.key_id,
            public_key: self.public_key,
            counter: self.counter as u32,
            updated_at: self.updated_at,
        }
    }
}

impl std::fmt::Debug for PostgresDeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresDeviceStore")
            .field("pool", &"<PgPool>")
            .finish()
    }
}
