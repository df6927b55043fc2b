//! Per-server SFTP protocol configuration.
//!
//! Connection details (host, port, username, password) are deliberately not
//! part of this struct; they come from the credential provider under
//! `config_name` at connect time.

use std::sync::Arc;
use std::time::Duration;

use datafetch_core::gates::{DailyGate, IntervalGate};

#[derive(Clone)]
pub struct SftpProtocolConfig {
    pub config_name: String,
    pub rate_limit_requests_per_second: f64,
    pub max_retries: u32,
    pub connect_timeout: Duration,
    pub daily_gate: Option<Arc<DailyGate>>,
    pub interval_gate: Option<Arc<IntervalGate>>,
}

impl SftpProtocolConfig {
    pub fn new(config_name: impl Into<String>) -> Self {
        SftpProtocolConfig {
            config_name: config_name.into(),
            rate_limit_requests_per_second: 2.0,
            max_retries: 3,
            connect_timeout: Duration::from_secs(30),
            daily_gate: None,
            interval_gate: None,
        }
    }

    pub fn with_rate_limit(mut self, requests_per_second: f64) -> Self {
        self.rate_limit_requests_per_second = requests_per_second;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn connection_key(&self) -> String {
        self.config_name.clone()
    }
}

impl std::fmt::Debug for SftpProtocolConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SftpProtocolConfig")
            .field("config_name", &self.config_name)
            .field(
                "rate_limit_requests_per_second",
                &self.rate_limit_requests_per_second,
            )
            .field("max_retries", &self.max_retries)
            .finish_non_exhaustive()
    }
}
