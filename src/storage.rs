//! # Persistent Key-Value Storage Boundary
//!
//! Storage is an external collaborator: weft only requires an async
//! get/set/delete map of strings. The trait seam lets callers plug in
//! whatever durable store the host environment provides, and lets tests
//! and the demo binary use [`MemoryStorage`].
//!
//! Consumers: local identity, trust store, peer persistence, ban list.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

/// Async key-value storage collaborator.
///
/// Implementations must be safe for concurrent access; weft components
/// hold the store behind an `Arc` and call it from multiple tasks.
#[async_trait]
pub trait KvStorage: Send + Sync {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    async fn set(&self, key: &str, value: String) -> anyhow::Result<()>;
    async fn delete(&self, key: &str) -> anyhow::Result<()>;
}

/// In-memory storage backend.
///
/// Cloning shares the underlying map, so one `MemoryStorage` can play the
/// role of a persistent profile across simulated restarts in tests.
#[derive(Clone, Default)]
pub struct MemoryStorage {
    entries: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStorage for MemoryStorage {
    async fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: String) -> anyhow::Result<()> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> anyhow::Result<()> {
        self.entries.lock().await.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn get_set_delete_roundtrip() {
        let storage = MemoryStorage::new();

        assert_eq!(storage.get("k").await.unwrap(), None);
        storage.set("k", "v".to_string()).await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), Some("v".to_string()));
        storage.delete("k").await.unwrap();
        assert_eq!(storage.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn clones_share_state() {
        let a = MemoryStorage::new();
        let b = a.clone();
        a.set("shared", "1".to_string()).await.unwrap();
        assert_eq!(b.get("shared").await.unwrap(), Some("1".to_string()));
    }
}
