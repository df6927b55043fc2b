//! HTTP connection manager.
//!
//! One connection pool per configuration key. Inside a pool every request
//! runs the same sequence: wait for the daily gate, wait for the interval
//! gate, take the rate-limit slot, apply authentication, issue the request.
//! Retries wrap the whole sequence through the shared retry engine, and the
//! rate-limit slot is held under the pool mutex so concurrent workers apply
//! backpressure at the pool rather than at the worker count.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use tracing::debug;

use datafetch_core::{FetchError, FetchRunContext, Result, RetryConfig, RetryEngine};

use crate::auth::OAuthTokenCache;
use crate::config::HttpProtocolConfig;

/// Keyed pool of HTTP clients with unified gate/rate/retry discipline.
#[derive(Default)]
pub struct HttpManager {
    pools: tokio::sync::Mutex<HashMap<String, Arc<HttpConnectionPool>>>,
    oauth_cache: OAuthTokenCache,
}

impl HttpManager {
    pub fn new() -> Self {
        Self::default()
    }

    async fn pool(&self, config: &HttpProtocolConfig) -> Result<Arc<HttpConnectionPool>> {
        let mut pools = self.pools.lock().await;
        let key = config.connection_key();
        if let Some(pool) = pools.get(&key) {
            return Ok(pool.clone());
        }
        let pool = Arc::new(HttpConnectionPool::new(config.clone())?);
        pools.insert(key, pool.clone());
        Ok(pool)
    }

    /// Issue one request through the pool for `config`.
    pub async fn request(
        &self,
        config: &HttpProtocolConfig,
        ctx: &FetchRunContext,
        method: Method,
        url: &str,
        headers: Option<HashMap<String, String>>,
    ) -> Result<reqwest::Response> {
        let pool = self.pool(config).await?;
        let extra_headers = headers.unwrap_or_default();

        pool.retry
            .execute(|| {
                let method = method.clone();
                let extra_headers = extra_headers.clone();
                let pool = pool.clone();
                async move {
                    pool.wait_gates().await;
                    pool.wait_rate_limit().await;

                    let authenticated = pool
                        .config
                        .auth
                        .authenticate_request(
                            &pool.config.config_name,
                            ctx.app_config.credential_provider.as_ref(),
                            &self.oauth_cache,
                            extra_headers,
                        )
                        .await?;

                    debug!(url, method = %method, "HTTP_REQUEST_ISSUED");
                    pool.client
                        .request(method, url)
                        .headers(to_header_map(&authenticated)?)
                        .send()
                        .await
                        .map_err(|e| {
                            FetchError::network_from(format!("request to {url} failed"), e)
                        })
                }
            })
            .await
    }
}

fn to_header_map(headers: &HashMap<String, String>) -> Result<HeaderMap> {
    let mut map = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| FetchError::validation("headers", format!("invalid header name: {e}")))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| FetchError::validation("headers", format!("invalid header value: {e}")))?;
        map.insert(name, value);
    }
    Ok(map)
}

struct HttpConnectionPool {
    config: HttpProtocolConfig,
    client: reqwest::Client,
    retry: RetryEngine,
    last_request: tokio::sync::Mutex<Option<tokio::time::Instant>>,
}

impl HttpConnectionPool {
    fn new(config: HttpProtocolConfig) -> Result<Self> {
        let redirect_policy = if config.follow_redirects {
            reqwest::redirect::Policy::limited(config.max_redirects)
        } else {
            reqwest::redirect::Policy::none()
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .default_headers(to_header_map(&config.default_headers)?)
            .redirect(redirect_policy)
            .build()
            .map_err(|e| FetchError::configuration("http_manager", format!("client build failed: {e}")))?;

        let retry = RetryEngine::new(RetryConfig {
            max_retries: config.max_retries,
            ..RetryConfig::connection()
        });

        Ok(HttpConnectionPool {
            config,
            client,
            retry,
            last_request: tokio::sync::Mutex::new(None),
        })
    }

    async fn wait_gates(&self) {
        if let Some(daily) = &self.config.daily_gate {
            daily.wait_if_needed().await;
        }
        if let Some(interval) = &self.config.interval_gate {
            interval.wait_if_needed().await;
        }
    }

    /// Enforce the minimum spacing `1/rps` between request starts. The slot
    /// mutex is held across the sleep so waiters queue in order.
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
}
