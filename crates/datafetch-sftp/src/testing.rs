//! In-memory fake SFTP server and context fixtures for this crate's tests.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;

use datafetch_core::kv::InMemoryKeyValueStore;
use datafetch_core::model::{
    AppConfig, BundleRef, CredentialProvider, FetchRunContext, FetcherRecipe,
};
use datafetch_core::storage::{BundleStorage, BundleStorageContext, ByteStream};
use datafetch_core::{Bid, FetchError, Result};

use crate::config::SftpProtocolConfig;
use crate::manager::SftpManager;
use crate::transport::{SftpConnector, SftpCredentials, SftpFileStat, SftpSessionOps};

#[derive(Default)]
struct FakeState {
    files: HashMap<String, (i64, Vec<u8>)>,
    connections: usize,
}

/// Shared in-memory remote filesystem.
#[derive(Clone, Default)]
pub struct FakeSftpServer {
    state: Arc<Mutex<FakeState>>,
}

impl FakeSftpServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, path: &str, mtime: i64, contents: &[u8]) {
        self.state
            .lock()
            .files
            .insert(path.to_string(), (mtime, contents.to_vec()));
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections
    }

    pub fn connector(&self) -> FakeConnector {
        FakeConnector {
            server: self.clone(),
        }
    }

    fn is_dir(&self, path: &str) -> bool {
        let prefix = format!("{}/", path.trim_end_matches('/'));
        self.state
            .lock()
            .files
            .keys()
            .any(|k| k.starts_with(&prefix))
    }
}

pub struct FakeConnector {
    server: FakeSftpServer,
}

#[async_trait]
impl SftpConnector for FakeConnector {
    async fn connect(
        &self,
        _config: &SftpProtocolConfig,
        _credentials: &SftpCredentials,
    ) -> Result<Arc<dyn SftpSessionOps>> {
        self.server.state.lock().connections += 1;
        Ok(Arc::new(FakeSession {
            server: self.server.clone(),
        }))
    }
}

struct FakeSession {
    server: FakeSftpServer,
}

#[async_trait]
impl SftpSessionOps for FakeSession {
    async fn listdir(&self, path: &str) -> Result<Vec<String>> {
        if !self.server.is_dir(path) {
            return Err(FetchError::network(format!("no such directory: {path}")));
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        let names = self
            .server
            .state
            .lock()
            .files
            .keys()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        Ok(names)
    }

    async fn stat(&self, path: &str) -> Result<SftpFileStat> {
        if let Some((mtime, contents)) = self.server.state.lock().files.get(path) {
            return Ok(SftpFileStat {
                size: Some(contents.len() as u64),
                mtime: Some(*mtime),
                is_dir: false,
                is_file: true,
            });
        }
        if self.server.is_dir(path) {
            return Ok(SftpFileStat {
                size: None,
                mtime: None,
                is_dir: true,
                is_file: false,
            });
        }
        Err(FetchError::network(format!("no such file: {path}")))
    }

    async fn open_read(&self, path: &str) -> Result<ByteStream> {
        let contents = self
            .server
            .state
            .lock()
            .files
            .get(path)
            .map(|(_, contents)| contents.clone())
            .ok_or_else(|| FetchError::network(format!("no such file: {path}")))?;

        let chunks: Vec<std::io::Result<Bytes>> = contents
            .chunks(8 * 1024)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures_util::stream::iter(chunks)))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let known_file = self.server.state.lock().files.contains_key(path);
        Ok(known_file || self.server.is_dir(path))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Connector whose first N sessions fail on every operation, to exercise
/// reconnect-on-failure.
pub struct FlakyConnector {
    server: FakeSftpServer,
    failing_sessions_left: Mutex<u32>,
}

impl FlakyConnector {
    pub fn new(server: FakeSftpServer, failing_sessions: u32) -> Self {
        FlakyConnector {
            server,
            failing_sessions_left: Mutex::new(failing_sessions),
        }
    }
}

#[async_trait]
impl SftpConnector for FlakyConnector {
    async fn connect(
        &self,
        config: &SftpProtocolConfig,
        credentials: &SftpCredentials,
    ) -> Result<Arc<dyn SftpSessionOps>> {
        let should_fail = {
            let mut left = self.failing_sessions_left.lock();
            if *left > 0 {
                *left -= 1;
                true
            } else {
                false
            }
        };
        if should_fail {
            self.server.state.lock().connections += 1;
            return Ok(Arc::new(BrokenSession));
        }
        self.server.connector().connect(config, credentials).await
    }
}

struct BrokenSession;

#[async_trait]
impl SftpSessionOps for BrokenSession {
    async fn listdir(&self, _path: &str) -> Result<Vec<String>> {
        Err(FetchError::network("connection reset by peer"))
    }

    async fn stat(&self, _path: &str) -> Result<SftpFileStat> {
        Err(FetchError::network("connection reset by peer"))
    }

    async fn open_read(&self, _path: &str) -> Result<ByteStream> {
        Err(FetchError::network("connection reset by peer"))
    }

    async fn exists(&self, _path: &str) -> Result<bool> {
        Err(FetchError::network("connection reset by peer"))
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

struct MintingStorage;

#[async_trait]
impl BundleStorage for MintingStorage {
    fn bundle_found(&self, _metadata: serde_json::Value) -> Bid {
        Bid::mint()
    }

    async fn start_bundle(
        &self,
        _bundle_ref: BundleRef,
        _recipe: Arc<FetcherRecipe>,
    ) -> Result<Arc<dyn BundleStorageContext>> {
        unimplemented!("not used in sftp tests")
    }
}

struct StaticCredentials;

#[async_trait]
impl CredentialProvider for StaticCredentials {
    async fn get(&self, _config_name: &str, key: &str) -> Result<String> {
        Ok(match key {
            "host" => "sftp.test".to_string(),
            "port" => "22".to_string(),
            "username" => "worker".to_string(),
            "password" => "secret".to_string(),
            _ => String::new(),
        })
    }
}

pub fn test_context() -> FetchRunContext {
    FetchRunContext::new(
        "run_sftp_test",
        Arc::new(AppConfig {
            config_id: "sftp_test".to_string(),
            credential_provider: Arc::new(StaticCredentials),
            kv_store: Arc::new(InMemoryKeyValueStore::new()),
            storage: Arc::new(MintingStorage),
        }),
    )
}

pub fn context_with_server(server: &FakeSftpServer) -> (Arc<SftpManager>, FetchRunContext) {
    let manager = Arc::new(SftpManager::new(Arc::new(server.connector())));
    (manager, test_context())
}
