//! Redis-backed key-value store.
//!
//! All keys are namespaced under a configurable prefix so several deployments
//! can share one Redis instance. TTLs map directly onto `SET ... PX`.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use tracing::debug;

use crate::error::{FetchError, Result};

use super::KeyValueStore;

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        RedisConfig {
            host: "localhost".to_string(),
            port: 6379,
            db: 0,
            password: None,
            key_prefix: String::new(),
        }
    }
}

impl RedisConfig {
    fn connection_url(&self) -> String {
        match &self.password {
            Some(password) => format!(
                "redis://:{}@{}:{}/{}",
                password, self.host, self.port, self.db
            ),
            None => format!("redis://{}:{}/{}", self.host, self.port, self.db),
        }
    }
}

pub struct RedisKeyValueStore {
    manager: ConnectionManager,
    key_prefix: String,
}

impl RedisKeyValueStore {
    pub async fn connect(config: &RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.connection_url())
            .map_err(|e| FetchError::storage_from("redis", "invalid connection config", e))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| FetchError::storage_from("redis", "connection failed", e))?;

        debug!(host = %config.host, port = config.port, db = config.db, "REDIS_STORE_CONNECTED");

        Ok(RedisKeyValueStore {
            manager,
            key_prefix: config.key_prefix.clone(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.key_prefix, key)
    }

    fn strip_prefix<'a>(&self, key: &'a str) -> &'a str {
        key.strip_prefix(&self.key_prefix).unwrap_or(key)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let pattern = format!("{}*", redis_escape(&self.full_key(prefix)));
        let mut connection = self.manager.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(200)
                .query_async(&mut connection)
                .await
                .map_err(|e| FetchError::storage_from("redis", "SCAN failed", e))?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        let mut keys: Vec<String> = keys
            .iter()
            .map(|k| self.strip_prefix(k).to_string())
            .collect();
        keys.sort();
        Ok(keys)
    }
}

// Redis glob patterns treat *, ?, [ and ] specially; key prefixes must match
// literally.
fn redis_escape(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl KeyValueStore for RedisKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut connection = self.manager.clone();
        redis::cmd("GET")
            .arg(self.full_key(key))
            .query_async(&mut connection)
            .await
            .map_err(|e| FetchError::storage_from("redis", format!("GET {key} failed"), e))
    }

    async fn put(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>) -> Result<()> {
        let mut connection = self.manager.clone();
        let mut cmd = redis::cmd("SET");
        cmd.arg(self.full_key(key)).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl.as_millis() as u64);
        }
        let _: () = cmd
            .query_async(&mut connection)
            .await
            .map_err(|e| FetchError::storage_from("redis", format!("SET {key} failed"), e))?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let mut connection = self.manager.clone();
        let removed: u64 = redis::cmd("DEL")
            .arg(self.full_key(key))
            .query_async(&mut connection)
            .await
            .map_err(|e| FetchError::storage_from("redis", format!("DEL {key} failed"), e))?;
        Ok(removed > 0)
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let mut connection = self.manager.clone();
        let found: u64 = redis::cmd("EXISTS")
            .arg(self.full_key(key))
            .query_async(&mut connection)
            .await
            .map_err(|e| FetchError::storage_from("redis", format!("EXISTS {key} failed"), e))?;
        Ok(found > 0)
    }

    async fn scan(&self, prefix: &str) -> Result<Vec<String>> {
        self.scan_keys(prefix).await
    }

    async fn range_get(
        &self,
        prefix: &str,
        limit: Option<usize>,
    ) -> Result<Vec<(String, Vec<u8>)>> {
        let mut keys = self.scan_keys(prefix).await?;
        if let Some(limit) = limit {
            keys.truncate(limit);
        }

        let mut pairs = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(&key).await? {
                pairs.push((key, value));
            }
        }
        Ok(pairs)
    }

    async fn close(&self) -> Result<()> {
        // ConnectionManager tears down with the last clone.
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_url_formats() {
        let plain = RedisConfig::default();
        assert_eq!(plain.connection_url(), "redis://localhost:6379/0");

        let with_auth = RedisConfig {
            password: Some("secret".to_string()),
            db: 2,
            ..RedisConfig::default()
        };
        assert_eq!(with_auth.connection_url(), "redis://:secret@localhost:6379/2");
    }

    #[test]
    fn glob_characters_are_escaped() {
        assert_eq!(redis_escape("fetch:run[1]:*"), "fetch:run\\[1\\]:\\*");
        assert_eq!(redis_escape("plain:prefix:"), "plain:prefix:");
    }
}
