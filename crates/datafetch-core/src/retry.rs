//! Unified retry engine.
//!
//! All protocol managers and components share this implementation so retry
//! behavior stays consistent across the application. Delay for attempt `k`
//! (0-based) is `min(base_delay * exponential_base^k, max_delay)`, optionally
//! multiplied by a uniform jitter factor.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

use crate::error::{FetchError, Result};

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
    pub jitter_range: (f64, f64),
}

impl RetryConfig {
    pub fn new(
        max_retries: u32,
        base_delay: Duration,
        max_delay: Duration,
        exponential_base: f64,
    ) -> Result<Self> {
        let config = RetryConfig {
            max_retries,
            base_delay,
            max_delay,
            exponential_base,
            jitter: true,
            jitter_range: (0.5, 1.5),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    pub fn with_jitter_range(mut self, min: f64, max: f64) -> Result<Self> {
        self.jitter_range = (min, max);
        self.validate()?;
        Ok(self)
    }

    fn validate(&self) -> Result<()> {
        if self.base_delay.is_zero() {
            return Err(FetchError::validation("base_delay", "must be positive"));
        }
        if self.max_delay.is_zero() {
            return Err(FetchError::validation("max_delay", "must be positive"));
        }
        if self.exponential_base <= 1.0 {
            return Err(FetchError::validation(
                "exponential_base",
                "must be greater than 1",
            ));
        }
        if self.jitter_range.0 >= self.jitter_range.1 {
            return Err(FetchError::validation(
                "jitter_range",
                "must be (min, max) where min < max",
            ));
        }
        Ok(())
    }

    /// Profile for connection establishment: 3 retries, 1s..60s, base 2.
    pub fn connection() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
            jitter_range: (0.5, 1.5),
        }
    }

    /// Profile for general operations: 3 retries, 0.5s..30s, base 2.
    pub fn operation() -> Self {
        RetryConfig {
            max_retries: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            exponential_base: 2.0,
            jitter: true,
            jitter_range: (0.5, 1.5),
        }
    }

    /// Profile for critical operations that need more attempts:
    /// 5 retries, 0.1s..120s, base 3.
    pub fn aggressive() -> Self {
        RetryConfig {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(120),
            exponential_base: 3.0,
            jitter: true,
            jitter_range: (0.5, 1.5),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::connection()
    }
}

/// Drives retryable operations to success or surfaces the last error.
#[derive(Debug, Clone)]
pub struct RetryEngine {
    config: RetryConfig,
}

impl RetryEngine {
    pub fn new(config: RetryConfig) -> Self {
        RetryEngine { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Delay before the retry following attempt `attempt` (0-based).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exponential = self.config.base_delay.as_secs_f64()
            * self.config.exponential_base.powi(attempt as i32);
        let mut delay = exponential.min(self.config.max_delay.as_secs_f64());

        if self.config.jitter {
            let (min, max) = self.config.jitter_range;
            delay *= rand::thread_rng().gen_range(min..max);
        }

        Duration::from_secs_f64(delay)
    }

    /// Execute `op` with retries. The operation is retried on any error;
    /// after `max_retries + 1` attempts the last error is returned.
    pub async fn execute<T, E, F, Fut>(&self, mut op: F) -> std::result::Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) => {
                    if attempt >= self.config.max_retries {
                        return Err(err);
                    }
                    let delay = self.calculate_delay(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}
