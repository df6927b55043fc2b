//! Credential providers.
//!
//! The engine looks credentials up by `(config_name, key)`; these providers
//! resolve that pair from process environment variables or from AWS Secrets
//! Manager (one JSON secret per protocol configuration, cached per run).

use std::collections::HashMap;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::debug;

use datafetch_core::{CredentialProvider, FetchError, Result};

/// Resolves `OC_CREDENTIAL_{CONFIG}_{KEY}` environment variables.
#[derive(Debug, Default)]
pub struct EnvironmentCredentialProvider;

impl EnvironmentCredentialProvider {
    pub fn new() -> Self {
        Self
    }

    fn variable_name(config_name: &str, key: &str) -> String {
        let sanitize = |raw: &str| {
            raw.chars()
                .map(|c| {
                    if c.is_ascii_alphanumeric() {
                        c.to_ascii_uppercase()
                    } else {
                        '_'
                    }
                })
                .collect::<String>()
        };
        format!(
            "OC_CREDENTIAL_{}_{}",
            sanitize(config_name),
            sanitize(key)
        )
    }
}

#[async_trait]
impl CredentialProvider for EnvironmentCredentialProvider {
    async fn get(&self, config_name: &str, key: &str) -> Result<String> {
        let variable = Self::variable_name(config_name, key);
        std::env::var(&variable).map_err(|_| {
            FetchError::configuration(
                "credentials",
                format!("environment variable {variable} is not set"),
            )
        })
    }
}

/// Resolves credentials from AWS Secrets Manager. Each protocol
/// configuration has one secret named `{prefix}{config_name}` holding a JSON
/// object of key/value pairs; secrets are fetched once per run.
pub struct AwsSecretsManagerCredentialProvider {
    client: aws_sdk_secretsmanager::Client,
    secret_prefix: String,
    cache: Mutex<HashMap<String, HashMap<String, String>>>,
}

impl AwsSecretsManagerCredentialProvider {
    pub async fn new(region: Option<String>, secret_prefix: String) -> Self {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(aws_config::Region::new(region));
        }
        let config = loader.load().await;
        AwsSecretsManagerCredentialProvider {
            client: aws_sdk_secretsmanager::Client::new(&config),
            secret_prefix,
            cache: Mutex::new(HashMap::new()),
        }
    }

    async fn secret_values(&self, config_name: &str) -> Result<HashMap<String, String>> {
        let mut cache = self.cache.lock().await;
        if let Some(values) = cache.get(config_name) {
            return Ok(values.clone());
        }

        let secret_id = format!("{}{}", self.secret_prefix, config_name);
        debug!(secret_id = %secret_id, "SECRETS_MANAGER_FETCH");

        let response = self
            .client
            .get_secret_value()
            .secret_id(&secret_id)
            .send()
            .await
            .map_err(|e| {
                FetchError::configuration(
                    "credentials",
                    format!("failed to fetch secret {secret_id}: {e}"),
                )
            })?;

        let payload = response.secret_string().ok_or_else(|| {
            FetchError::configuration(
                "credentials",
                format!("secret {secret_id} has no string payload"),
            )
        })?;

        let values: HashMap<String, String> = serde_json::from_str(payload).map_err(|e| {
            FetchError::configuration(
                "credentials",
                format!("secret {secret_id} is not a JSON object of strings: {e}"),
            )
        })?;

        cache.insert(config_name.to_string(), values.clone());
        Ok(values)
    }
}

#[async_trait]
impl CredentialProvider for AwsSecretsManagerCredentialProvider {
    async fn get(&self, config_name: &str, key: &str) -> Result<String> {
        let values = self.secret_values(config_name).await?;
        values.get(key).cloned().ok_or_else(|| {
            FetchError::configuration(
                "credentials",
                format!("secret for {config_name} is missing key {key}"),
            )
        })
    }
}
