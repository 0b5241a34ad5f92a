//! Key-value settings.
//!
//! Loads never fail outward: a missing or unreadable value is logged and
//! treated as "nothing stored".

use std::collections::HashMap;

use rusqlite::{params, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tasktank_shared::models::DeviceGroup;
use tasktank_shared::types::{DeviceId, SyncKey, TankId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::RelayCache;

const SYNC_KEYS_KEY: &str = "sync_keys";
const DEVICE_GROUP_KEY: &str = "device_group";
const RELAY_CACHE_KEY: &str = "relay_cache";
const DEVICE_ID_KEY: &str = "device_id";

impl Database {
    pub fn get_setting(&self, key: &str) -> Result<Option<String>> {
        Ok(self
            .conn()
            .query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_setting(&self, key: &str, value: &str) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO settings (key, value, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
                params![key, value, chrono::Utc::now().to_rfc3339()],
            )
            .map_err(StoreError::from_write)?;
        Ok(())
    }

    pub fn delete_setting(&self, key: &str) -> Result<bool> {
        let affected = self
            .conn()
            .execute("DELETE FROM settings WHERE key = ?1", params![key])?;
        Ok(affected > 0)
    }

    fn load_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = match self.get_setting(key) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::warn!(key, error = %e, "failed to read setting");
                return None;
            }
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(key, error = %e, "ignoring unreadable setting");
                None
            }
        }
    }

    fn save_json<T: Serialize>(&self, key: &str, value: &T) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.set_setting(key, &raw)
    }

    // -- device id ----------------------------------------------------------

    /// This installation's device id, generated and stored on first use.
    pub fn device_id(&self) -> Result<DeviceId> {
        if let Some(id) = self.get_setting(DEVICE_ID_KEY)?.filter(|id| !id.is_empty()) {
            return Ok(DeviceId(id));
        }
        let id = DeviceId::generate();
        self.set_setting(DEVICE_ID_KEY, id.as_str())?;
        tracing::info!(device = %id.short(), "generated device id");
        Ok(id)
    }

    // -- sync keys ----------------------------------------------------------

    pub fn load_sync_keys(&self) -> HashMap<TankId, SyncKey> {
        self.load_json(SYNC_KEYS_KEY).unwrap_or_default()
    }

    pub fn save_sync_keys(&self, keys: &HashMap<TankId, SyncKey>) -> Result<()> {
        self.save_json(SYNC_KEYS_KEY, keys)
    }

    // -- device group -------------------------------------------------------

    pub fn load_device_group(&self) -> Option<DeviceGroup> {
        self.load_json(DEVICE_GROUP_KEY)
    }

    pub fn save_device_group(&self, group: &DeviceGroup) -> Result<()> {
        self.save_json(DEVICE_GROUP_KEY, group)
    }

    pub fn clear_device_group(&self) -> Result<()> {
        self.delete_setting(DEVICE_GROUP_KEY)?;
        Ok(())
    }

    // -- relay cache --------------------------------------------------------

    pub fn load_relay_cache(&self) -> Option<RelayCache> {
        self.load_json(RELAY_CACHE_KEY)
    }

    pub fn save_relay_cache(&self, cache: &RelayCache) -> Result<()> {
        self.save_json(RELAY_CACHE_KEY, cache)
    }
}
