//! In-memory storage for device authentication state
//!
//! Development and test fallback. The counter advance relies on DashMap's
//! per-entry locking to give the same one-winner semantics as the
//! conditional UPDATE in the PostgreSQL backend.

use chrono::Utc;
use dashmap::DashMap;

use super::{ChallengeRecord, DeviceKeyRecord};

/// In-memory device store
#[derive(Default)]
pub struct MemoryDeviceStore {
    challenges: DashMap<String, ChallengeRecord>,
    keys: DashMap<String, DeviceKeyRecord>,
}

impl MemoryDeviceStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_challenge(&self, key_id: &str, value: &str) {
        self.challenges.insert(
            key_id.to_string(),
            ChallengeRecord {
                value: value.to_string(),
                created_at: Utc::now(),
            },
        );
    }

    pub fn get_challenge(&self, key_id: &str) -> Option<ChallengeRecord> {
        self.challenges.get(key_id).map(|entry| entry.value().clone())
    }

    pub fn delete_challenge(&self, key_id: &str) {
        self.challenges.remove(key_id);
    }

    pub fn upsert_device_key(&self, key_id: &str, public_key: &str, counter: u32) {
        self.keys.insert(
            key_id.to_string(),
            DeviceKeyRecord {
                key_id: key_id.to_string(),
                public_key: public_key.to_string(),
                counter,
                updated_at: Utc::now(),
            },
        );
    }

    pub fn get_device_key(&self, key_id: &str) -> Option<DeviceKeyRecord> {
        self.keys.get(key_id).map(|entry| entry.value().clone())
    }

    /// Conditional counter bump; the entry lock makes this atomic against
    /// concurrent callers for the same key.
    pub fn advance_counter(&self, key_id: &str, counter: u32) -> bool {
        match self.keys.get_mut(key_id) {
            Some(mut entry) if entry.counter < counter => {
                entry.counter = counter;
                entry.updated_at = Utc::now();
                true
            }
            _ => false,
        }
    }
}

impl std::fmt::Debug for MemoryDeviceStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDeviceStore")
            .field("challenges", &self.challenges.len())
            .field("keys", &self.keys.len())
            .finish()
    }
}
