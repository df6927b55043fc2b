//! Single-process in-memory store, used for development and tests.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::error::Result;

use super::KeyValueStore;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// In-memory [`KeyValueStore`]. TTL entries are reaped lazily on access.
#[derive(Default)]
pub struct InMemoryKeyValueStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKeyValueStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for InMemoryKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(entry) if entry.is_expired() => {
                entries.remove(key);
                Ok(None)
            }
            Some(entry) => Ok(Some(entry.value.clone())),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let expires_at = ttl.map(|d| Instant::now() + d);
        self.entries
            .lock()
            .insert(key.to_string(), Entry { value, expires_at });
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.lock().remove(key).is_some())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.get(key).await?.is_some())
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired());
        let mut keys: Vec<String> = entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn range_get(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let mut entries = self.entries.lock();
        entries.retain(|_, entry| !entry.is_expired());
        let mut pairs: Vec<(String, Vec<u8>)> = entries
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, entry)| (k.clone(), entry.value.clone()))
            .collect();
        pairs.sort_by(|a, b| a.0.cmp(&b.0));
        if let Some(limit) = limit {
            pairs.truncate(limit);
        }
        Ok(pairs)
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::KeyValueStoreExt;

    #[tokio::test]
    async fn basic_operations() {
        let store = InMemoryKeyValueStore::new();

        store.put("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        assert!(store.exists("a").await.unwrap());

        assert!(store.delete("a").await.unwrap());
        assert!(!store.delete("a").await.unwrap());
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn scan_and_range_are_sorted_and_prefixed() {
        let store = InMemoryKeyValueStore::new();
        store.put("q:items:2", b"b".to_vec(), None).await.unwrap();
        store.put("q:items:1", b"a".to_vec(), None).await.unwrap();
        store.put("other:1", b"x".to_vec(), None).await.unwrap();

        let keys = store.scan("q:items:").await.unwrap();
        assert_eq!(keys, vec!["q:items:1".to_string(), "q:items:2".to_string()]);

        let pairs = store.range_get("q:items:", Some(1)).await.unwrap();
        assert_eq!(pairs, vec![("q:items:1".to_string(), b"a".to_vec())]);
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_expiry() {
        let store = InMemoryKeyValueStore::new();
        store
            .put("k", b"v".to_vec(), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert!(store.exists("k").await.unwrap());

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.scan("k").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn typed_helpers() {
        let store = InMemoryKeyValueStore::new();

        store.put_u64("counter", 42).await.unwrap();
        assert_eq!(store.get_u64("counter", 0).await.unwrap(), 42);
        assert_eq!(store.get_u64("missing", 7).await.unwrap(), 7);

        store
            .put_json("state", &serde_json::json!({"cursor": "*"}), None)
            .await
            .unwrap();
        let state: Option<serde_json::Value> = store.get_json("state").await.unwrap();
        assert_eq!(state.unwrap()["cursor"], "*");
    }
}
