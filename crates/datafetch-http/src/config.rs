//! Per-endpoint HTTP protocol configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use datafetch_core::gates::{DailyGate, IntervalGate};

use crate::auth::AuthMechanism;

/// Configuration for one HTTP endpoint family. Pools are keyed by
/// [`HttpProtocolConfig::connection_key`], so two configs with the same name
/// share a connection pool and its rate limiter.
#[derive(Clone)]
pub struct HttpProtocolConfig {
    pub config_name: String,
    pub timeout: Duration,
    pub rate_limit_requests_per_second: f64,
    pub max_retries: u32,
    pub default_headers: HashMap<String, String>,
    pub auth: AuthMechanism,
    pub follow_redirects: bool,
    pub max_redirects: usize,
    pub daily_gate: Option<Arc<DailyGate>>,
    pub interval_gate: Option<Arc<IntervalGate>>,
}

impl HttpProtocolConfig {
    pub fn new(config_name: impl Into<String>) -> Self {
        HttpProtocolConfig {
            config_name: config_name.into(),
            timeout: Duration::from_secs(30),
            rate_limit_requests_per_second: 2.0,
            max_retries: 3,
            default_headers: HashMap::new(),
            auth: AuthMechanism::None,
            follow_redirects: true,
            max_redirects: 10,
            daily_gate: None,
            interval_gate: None,
        }
    }

    pub fn with_auth(mut self, auth: AuthMechanism) -> Self {
        self.auth = auth;
        self
    }

    pub fn with_rate_limit(mut self, requests_per_second: f64) -> Self {
        self.rate_limit_requests_per_second = requests_per_second;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_default_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.default_headers = headers;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn without_redirects(mut self) -> Self {
        self.follow_redirects = false;
        self
    }

    pub fn connection_key(&self) -> String {
        self.config_name.clone()
    }
}

impl std::fmt::Debug for HttpProtocolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProtocolConfig")
            .field("config_name", &self.config_name)
            .field("timeout", &self.timeout)
            .field(
                "rate_limit_requests_per_second",
                &self.rate_limit_requests_per_second,
            )
            .field("max_retries", &self.max_retries)
            .field("follow_redirects", &self.follow_redirects)
            .finish_non_exhaustive()
    }
}
