//! Device authentication storage module
//!
//! Provides persistence for:
//! - **Challenges**: one outstanding challenge per device key id (upsert
//!   semantics, single-use, consumed on first read by a verification attempt).
//! - **Device keys**: enrolled public key material and the monotonic signing
//!   counter. Counter advances use a conditional write so concurrent
//!   assertions for the same key race safely at the storage layer.
//!
//! If `DATABASE_URL` is not set, falls back to in-memory storage
//! (useful for development and tests, but state is lost on restart).

mod memory;
mod postgres;

pub use memory::MemoryDeviceStore;
pub use postgres::PostgresDeviceStore;

use chrono::{DateTime, Utc};

use crate::config::Config;

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("Database migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),
}

/// An outstanding challenge for a device key
#[derive(Debug, Clone)]
pub struct ChallengeRecord {
    pub value: String,
    pub created_at: DateTime<Utc>,
}

/// An enrolled device key with its replay counter
#[derive(Debug, Clone)]
pub struct DeviceKeyRecord {
    pub key_id: String,
    pub public_key: String,
    pub counter: u32,
    pub updated_at: DateTime<Utc>,
}

/// Storage backend
enum Backend {
    /// PostgreSQL storage (production)
    Postgres(PostgresDeviceStore),
    /// In-memory storage (development fallback)
    Memory(MemoryDeviceStore),
}

/// Unified storage for challenges and device keys
pub struct DeviceStore {
    backend: Backend,
}

impl DeviceStore {
    /// Create storage with PostgreSQL backend
    pub async fn with_postgres(database_url: &str, config: &Config) -> Result<Self, StorageError> {
        let pg_store = PostgresDeviceStore::new(database_url, config).await?;
        pg_store.migrate().await?;

        Ok(Self {
            backend: Backend::Postgres(pg_store),
        })
    }

    /// Create storage with in-memory backend (development only)
    pub fn in_memory() -> Self {
        tracing::warn!("Using in-memory device storage - state will be lost on restart!");
        Self {
            backend: Backend::Memory(MemoryDeviceStore::new()),
        }
    }

    /// Create storage from configuration
    ///
    /// Uses PostgreSQL if `database_url` is set, otherwise falls back to in-memory.
    pub async fn from_config(config: &Config) -> Result<Self, StorageError> {
        match &config.database_url {
            Some(url) => {
                tracing::info!("Using PostgreSQL device storage");
                Self::with_postgres(url, config).await
            }
            None => Ok(Self::in_memory()),
        }
    }

    /// Check if using persistent storage
    pub fn is_persistent(&self) -> bool {
        matches!(self.backend, Backend::Postgres(_))
    }

    /// Check database health (always Ok for memory backend)
    pub async fn check_health(&self) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.check_health().await,
            Backend::Memory(_) => Ok(()),
        }
    }

    // ==================== Challenge Methods ====================

    /// Store a challenge, replacing any prior challenge for the same key
    pub async fn upsert_challenge(&self, key_id: &str, value: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.upsert_challenge(key_id, value).await,
            Backend::Memory(mem) => {
                mem.upsert_challenge(key_id, value);
                Ok(())
            }
        }
    }

    /// Get the outstanding challenge for a key, if any
    pub async fn get_challenge(&self, key_id: &str) -> Result<Option<ChallengeRecord>, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.get_challenge(key_id).await,
            Backend::Memory(mem) => Ok(mem.get_challenge(key_id)),
        }
    }

    /// Delete the outstanding challenge for a key
    pub async fn delete_challenge(&self, key_id: &str) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.delete_challenge(key_id).await,
            Backend::Memory(mem) => {
                mem.delete_challenge(key_id);
                Ok(())
            }
        }
    }

    // ==================== Device Key Methods ====================

    /// Store an enrolled device key (upsert; re-enrollment replaces the record)
    pub async fn upsert_device_key(
        &self,
        key_id: &str,
        public_key: &str,
        counter: u32,
    ) -> Result<(), StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.upsert_device_key(key_id, public_key, counter).await,
            Backend::Memory(mem) => {
                mem.upsert_device_key(key_id, public_key, counter);
                Ok(())
            }
        }
    }

    /// Get an enrolled device key
    pub async fn get_device_key(
        &self,
        key_id: &str,
    ) -> Result<Option<DeviceKeyRecord>, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.get_device_key(key_id).await,
            Backend::Memory(mem) => Ok(mem.get_device_key(key_id)),
        }
    }

    /// Advance the replay counter with a conditional write.
    ///
    /// Returns `true` only when the stored counter was strictly smaller and
    /// was updated. Concurrent callers with the same counter value race at
    /// the storage layer; exactly one observes `true`.
    pub async fn advance_counter(&self, key_id: &str, counter: u32) -> Result<bool, StorageError> {
        match &self.backend {
            Backend::Postgres(pg) => pg.advance_counter(key_id, counter).await,
            Backend::Memory(mem) => Ok(mem.advance_counter(key_id, counter)),
        }
    }
}

impl std::fmt::Debug for DeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let backend = match &self.backend {
            Backend::Postgres(_) => "PostgreSQL",
            Backend::Memory(_) => "Memory",
        };
        f.debug_struct("DeviceStore").field("backend", &backend).finish()
    }
}
