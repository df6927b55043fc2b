//! Durable key-value storage backing queue and locator state.
//!
//! Values are opaque byte payloads; typed helpers are layered on top via
//! [`KeyValueStoreExt`]. TTL support is best-effort.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{FetchError, Result};

mod memory;
mod redis_store;
pub mod serializers;

pub use memory::InMemoryKeyValueStore;
pub use redis_store::{RedisConfig, RedisKeyValueStore};
pub use serializers::{BincodeSerializer, JsonSerializer, RequestMetaSerializer, Serializer};

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()>;

    /// Returns whether the key existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    async fn exists(&self, key: &str) -> Result<bool>;

    /// All keys starting with `prefix`, sorted.
    async fn scan(&self, prefix: &str) -> Result<Vec<String>>;

    /// Key/value pairs for keys starting with `prefix`, sorted by key,
    /// truncated to `limit` when given.
    async fn range_get(&self, prefix: &str, limit: Option<usize>)
        -> Result<Vec<(String, Vec<u8>)>>;

    async fn close(&self) -> Result<()>;
}

/// Typed convenience layer over the raw byte interface.
#[async_trait]
pub trait KeyValueStoreExt: KeyValueStore {
    async fn get_json<T>(&self, key: &str) -> Result<Option<T>>
    where
        T: DeserializeOwned + Send,
    {
        match self.get(key).await? {
            Some(bytes) => {
                let value = serde_json::from_slice(&bytes).map_err(|e| {
                    FetchError::storage_from("kv_store", format!("corrupt value at {key}"), e)
                })?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    async fn put_json<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> Result<()>
    where
        T: Serialize + Sync,
    {
        let bytes = serde_json::to_vec(value)
            .map_err(|e| FetchError::storage_from("kv_store", "serialization failed", e))?;
        self.put(key, bytes, ttl).await
    }

    async fn get_u64(&self, key: &str, default: u64) -> Result<u64> {
        match self.get(key).await? {
            Some(bytes) => {
                let text = std::str::from_utf8(&bytes).map_err(|e| {
                    FetchError::storage_from("kv_store", format!("corrupt counter at {key}"), e)
                })?;
                text.trim().parse().map_err(|e| {
                    FetchError::storage_from("kv_store", format!("corrupt counter at {key}"), e)
                })
            }
            None => Ok(default),
        }
    }

    async fn put_u64(&self, key: &str, value: u64) -> Result<()> {
        self.put(key, value.to_string().into_bytes(), None).await
    }
}

impl<S: KeyValueStore + ?Sized> KeyValueStoreExt for S {}
