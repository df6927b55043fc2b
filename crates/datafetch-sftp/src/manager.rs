//! SFTP connection manager.
//!
//! One session pool per configuration key. Each operation waits for the
//! pool's gates and rate-limit slot, then runs against a lazily-created
//! session; a failed operation resets the session so the next attempt
//! reconnects transparently. Retries wrap the whole sequence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use datafetch_core::storage::ByteStream;
use datafetch_core::{FetchRunContext, Result, RetryConfig, RetryEngine};

use crate::config::SftpProtocolConfig;
use crate::transport::{SftpConnector, SftpCredentials, SftpFileStat, SftpSessionOps};

pub struct SftpManager {
    connector: Arc<dyn SftpConnector>,
    pools: tokio::sync::Mutex<HashMap<String, Arc<SftpConnectionPool>>>,
}

impl SftpManager {
    pub fn new(connector: Arc<dyn SftpConnector>) -> Self {
        SftpManager {
            connector,
            pools: tokio::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn pool(&self, config: &SftpProtocolConfig) -> Arc<SftpConnectionPool> {
        let mut pools = self.pools.lock().await;
        let key = config.connection_key();
        pools
            .entry(key)
            .or_insert_with(|| Arc::new(SftpConnectionPool::new(config.clone())))
            .clone()
    }

    async fn run_op<T, F, Fut>(
        &self,
        config: &SftpProtocolConfig,
        ctx: &FetchRunContext,
        op: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn SftpSessionOps>) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let pool = self.pool(config).await;
        let credentials = SftpCredentials::resolve(
            &config.config_name,
            ctx.app_config.credential_provider.as_ref(),
        )
        .await?;

        pool.retry
            .execute(|| {
                let pool = pool.clone();
                let credentials = credentials.clone();
                let op = &op;
                async move {
                    pool.wait_gates().await;
                    pool.wait_rate_limit().await;

                    let session = pool.session(&credentials, self.connector.as_ref()).await?;
                    match op(session).await {
                        Ok(value) => Ok(value),
                        Err(err) => {
                            // The session may be wedged; force a reconnect on
                            // the next attempt.
                            pool.reset_session().await;
                            Err(err)
                        }
                    }
                }
            })
            .await
    }

    pub async fn listdir(
        &self,
        config: &SftpProtocolConfig,
        ctx: &FetchRunContext,
        path: &str,
    ) -> Result<Vec<String>> {
        self.run_op(config, ctx, |session| {
            let path = path.to_string();
            async move { session.listdir(&path).await }
        })
        .await
    }

    pub async fn stat(
        &self,
        config: &SftpProtocolConfig,
        ctx: &FetchRunContext,
        path: &str,
    ) -> Result<SftpFileStat> {
        self.run_op(config, ctx, |session| {
            let path = path.to_string();
            async move { session.stat(&path).await }
        })
        .await
    }

    /// Open a remote file for streaming reads.
    pub async fn open(
        &self,
        config: &SftpProtocolConfig,
        ctx: &FetchRunContext,
        path: &str,
    ) -> Result<ByteStream> {
        self.run_op(config, ctx, |session| {
            let path = path.to_string();
            async move { session.open_read(&path).await }
        })
        .await
    }

    pub async fn exists(
        &self,
        config: &SftpProtocolConfig,
        ctx: &FetchRunContext,
        path: &str,
    ) -> Result<bool> {
        self.run_op(config, ctx, |session| {
            let path = path.to_string();
            async move { session.exists(&path).await }
        })
        .await
    }

    pub async fn isdir(
        &self,
        config: &SftpProtocolConfig,
        ctx: &FetchRunContext,
        path: &str,
    ) -> Result<bool> {
        Ok(self.stat(config, ctx, path).await?.is_dir)
    }

    pub async fn isfile(
        &self,
        config: &SftpProtocolConfig,
        ctx: &FetchRunContext,
        path: &str,
    ) -> Result<bool> {
        Ok(self.stat(config, ctx, path).await?.is_file)
    }

    pub async fn close_all(&self) -> Result<()> {
        let pools = self.pools.lock().await;
        for pool in pools.values() {
            if let Err(err) = pool.close().await {
                warn!(error = %err, "SFTP_POOL_CLOSE_FAILED");
            }
        }
        Ok(())
    }
}

struct SftpConnectionPool {
    config: SftpProtocolConfig,
    retry: RetryEngine,
    session: tokio::sync::Mutex<Option<Arc<dyn SftpSessionOps>>>,
    last_request: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl SftpConnectionPool {
    fn new(config: SftpProtocolConfig) -> Self {
        let retry = RetryEngine::new(RetryConfig {
            max_retries: config.max_retries,
            ..RetryConfig::connection()
        });
        SftpConnectionPool {
            config,
            retry,
            session: tokio::sync::Mutex::new(None),
            last_request: tokio::sync::Mutex::new(None),
        }
    }

    async fn wait_gates(&self) {
        if let Some(daily) = &self.config.daily_gate {
            daily.wait_if_needed().await;
        }
        if let Some(interval) = &self.config.interval_gate {
            interval.wait_if_needed().await;
        }
    }

    async fn wait_rate_limit(&self) {
        let min_interval =
            Duration::from_secs_f64(1.0 / self.config.rate_limit_requests_per_second);
        let mut last = self.last_request.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < min_interval {
                tokio::time::sleep(min_interval - elapsed).await;
            }
        }
        *last = Some(tokio::time::Instant::now());
    }

    /// Lazily establish the session for this pool.
    async fn session(
        &self,
        credentials: &SftpCredentials,
        connector: &dyn SftpConnector,
    ) -> Result<Arc<dyn SftpSessionOps>> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.as_ref() {
            return Ok(existing.clone());
        }
        debug!(config = %self.config.config_name, "SFTP_CONNECTING");
        let created = connector.connect(&self.config, credentials).await?;
        *session = Some(created.clone());
        Ok(created)
    }

    async fn reset_session(&self) {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.take() {
            if let Err(err) = existing.close().await {
                debug!(error = %err, "SFTP_SESSION_CLOSE_ON_RESET_FAILED");
            }
        }
    }

    async fn close(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        if let Some(existing) = session.take() {
            existing.close().await?;
        }
        Ok(())
    }
}
