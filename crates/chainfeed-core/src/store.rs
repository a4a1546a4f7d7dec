//! State store — persists actor snapshots for recovery.
//!
//! Every actor writes a JSON snapshot of its state after each mutation,
//! keyed by the actor kind (`"ledger"`, `"app"`, `"pusher"`, `"registry"`)
//! and the key's `storage_key()`. On activation the actor loads its last
//! snapshot instead of starting empty.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::FeedError;

/// Trait for storing and loading actor snapshots.
///
/// Implementations include `MemoryStateStore` and `SqliteStateStore`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the snapshot stored under (`kind`, `key`).
    async fn load(&self, kind: &str, key: &str) -> Result<Option<serde_json::Value>, FeedError>;

    /// Save (upsert) a snapshot.
    async fn save(&self, kind: &str, key: &str, value: serde_json::Value) -> Result<(), FeedError>;

    /// Delete a snapshot. Deleting a missing snapshot is not an error.
    async fn delete(&self, kind: &str, key: &str) -> Result<(), FeedError>;

    /// All keys stored for `kind`, sorted.
    async fn keys(&self, kind: &str) -> Result<Vec<String>, FeedError>;
}

/// Load and decode a typed snapshot.
pub async fn load_state<T: DeserializeOwned>(
    store: &dyn StateStore,
    kind: &str,
    key: &str,
) -> Result<Option<T>, FeedError> {
    match store.load(kind, key).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| FeedError::Storage(format!("corrupt {kind} snapshot '{key}': {e}"))),
        None => Ok(None),
    }
}

/// Encode and save a typed snapshot.
pub async fn save_state<T: Serialize + Sync>(
    store: &dyn StateStore,
    kind: &str,
    key: &str,
    state: &T,
) -> Result<(), FeedError> {
    let value = serde_json::to_value(state).map_err(|e| FeedError::Storage(e.to_string()))?;
    store.save(kind, key, value).await
}

// ─── In-memory store (for testing) ────────────────────────────────────────────

/// In-memory state store for tests and ephemeral feeds.
#[derive(Default)]
pub struct MemoryStateStore {
    data: Mutex<HashMap<(String, String), serde_json::Value>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<(String, String), serde_json::Value>>, FeedError> {
        self.data
            .lock()
            .map_err(|_| FeedError::Storage("memory store lock poisoned".into()))
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self, kind: &str, key: &str) -> Result<Option<serde_json::Value>, FeedError> {
        Ok(self.lock()?.get(&(kind.to_string(), key.to_string())).cloned())
    }

    async fn save(&self, kind: &str, key: &str, value: serde_json::Value) -> Result<(), FeedError> {
        self.lock()?.insert((kind.to_string(), key.to_string()), value);
        Ok(())
    }

    async fn delete(&self, kind: &str, key: &str) -> Result<(), FeedError> {
        self.lock()?.remove(&(kind.to_string(), key.to_string()));
        Ok(())
    }

    async fn keys(&self, kind: &str) -> Result<Vec<String>, FeedError> {
        let mut keys: Vec<String> = self
            .lock()?
            .keys()
            .filter(|(k, _)| k == kind)
            .map(|(_, key)| key.clone())
            .collect();
        keys.sort();
        Ok(keys)
    }
}
