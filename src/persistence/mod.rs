//! # Persistence Module
//!
//! ## Why This Module Exists
//! A handful of connectivity settings must survive restarts: the MQTT keep-alive, the NTP
//! server, the auto-NTP policy and the master/slave link. They are owned by the core but
//! stored through a small key-value boundary so the same code runs against a file on a
//! host, flash on a device, or memory in tests.
//!
//! ## Key Abstractions
//! - **KeyValueStore**: typed get/set of small scalars and byte blobs by string key
//! - **StoredValue**: the scalar/blob union kept per key
//! - **MemoryStore**: volatile store for tests and dry runs
//! - **FileStore**: TOML-file store written on every change
//!
//! ## Error Handling Strategy
//! Store failures never stop the modem loop. Callers log them with `warn!` and keep the
//! value in memory; the next successful write persists it.

pub mod file_store;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub use file_store::FileStore;

/// Keys owned by the connectivity core
pub mod keys {
    pub const KEEPALIVE: &str = "keepalive";
    pub const NTP_SERVER: &str = "ntp_server";
    pub const AUTO_NTP: &str = "auto_ntp";
    pub const MASTER: &str = "master";
    pub const SLAVE_UID: &str = "slave_uid";
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to serialize store: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to parse store: {0}")]
    Parse(#[from] toml::de::Error),
}

/// One stored value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StoredValue {
    Bool(bool),
    Integer(i64),
    Text(String),
    Bytes(Vec<u8>),
}

/// Typed key-value persistence.
///
/// Only the four primitive operations are required; the typed helpers are provided.
pub trait KeyValueStore: Send {
    fn get(&self, key: &str) -> Option<StoredValue>;
    fn set(&mut self, key: &str, value: StoredValue) -> Result<(), StoreError>;
    fn remove(&mut self, key: &str) -> Result<(), StoreError>;
    fn clear(&mut self) -> Result<(), StoreError>;

    fn get_u32(&self, key: &str) -> Option<u32> {
        match self.get(key)? {
            StoredValue::Integer(value) => u32::try_from(value).ok(),
            _ => None,
        }
    }

    fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key)? {
            StoredValue::Bool(value) => Some(value),
            StoredValue::Integer(value) => Some(value != 0),
            _ => None,
        }
    }

    fn get_text(&self, key: &str) -> Option<String> {
        match self.get(key)? {
            StoredValue::Text(value) => Some(value),
            _ => None,
        }
    }

    fn get_bytes(&self, key: &str) -> Option<Vec<u8>> {
        match self.get(key)? {
            StoredValue::Bytes(value) => Some(value),
            _ => None,
        }
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StoreError> {
        self.set(key, StoredValue::Integer(i64::from(value)))
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StoreError> {
        self.set(key, StoredValue::Bool(value))
    }

    fn set_text(&mut self, key: &str, value: &str) -> Result<(), StoreError> {
        self.set(key, StoredValue::Text(value.to_string()))
    }
}

/// Volatile store
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    values: BTreeMap<String, StoredValue>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: StoredValue) -> Result<(), StoreError> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&mut self, key: &str) -> Result<(), StoreError> {
        self.values.remove(key);
        Ok(())
    }

    fn clear(&mut self) -> Result<(), StoreError> {
        self.values.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_helpers_reject_mismatched_kinds() {
        let mut store = MemoryStore::new();
        store.set_text(keys::NTP_SERVER, "ntp.se").unwrap();
        store.set_u32(keys::KEEPALIVE, 360).unwrap();

        assert_eq!(store.get_text(keys::NTP_SERVER).as_deref(), Some("ntp.se"));
        assert_eq!(store.get_u32(keys::KEEPALIVE), Some(360));
        assert_eq!(store.get_u32(keys::NTP_SERVER), None);
        assert_eq!(store.get_bytes(keys::KEEPALIVE), None);
    }

    #[test]
    fn integer_flags_read_as_bool() {
        let mut store = MemoryStore::new();
        store.set(keys::AUTO_NTP, StoredValue::Integer(0)).unwrap();
        assert_eq!(store.get_bool(keys::AUTO_NTP), Some(false));
    }
}
