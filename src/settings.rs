//! Environment-driven application settings and component wiring.
//!
//! Providers are constructed here and passed explicitly through
//! `FetchRunContext.app_config`; nothing is resolved through globals.
//! Precedence for regions: `AWS_REGION` wins over the service-specific
//! variables.

use std::sync::Arc;

use anyhow::{bail, Context, Result};

use datafetch_core::kv::{InMemoryKeyValueStore, KeyValueStore, RedisConfig, RedisKeyValueStore};
use datafetch_core::model::AppConfig;
use datafetch_core::storage::BundleStorage;
use datafetch_notify::{CompletionPublisher, LoggingPublisher, SqsPublisher};
use datafetch_storage::{ObjectStoreStorage, PipelineStorage, TarGzDecorator, UnzipDecorator};

use crate::credentials::{AwsSecretsManagerCredentialProvider, EnvironmentCredentialProvider};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsProviderKind {
    Aws,
    Environment,
}

impl std::str::FromStr for CredentialsProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            "environment" | "env" => Ok(Self::Environment),
            other => bail!("unsupported credentials provider: {other}. Supported: aws, environment"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KvStoreKind {
    Memory,
    Redis,
}

impl std::str::FromStr for KvStoreKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => bail!("unsupported kv store: {other}. Supported: memory, redis"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    S3,
    File,
}

impl std::str::FromStr for StorageKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "s3" => Ok(Self::S3),
            "file" | "fs" => Ok(Self::File),
            other => bail!("unsupported storage backend: {other}. Supported: s3, file"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "text" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => bail!("unsupported log format: {other}. Supported: text, json"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedisSettings {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub password: Option<String>,
    pub key_prefix: String,
}

#[derive(Debug, Clone)]
pub struct S3Settings {
    pub bucket: Option<String>,
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AppSettings {
    pub credentials_provider: CredentialsProviderKind,
    pub kv_store: KvStoreKind,
    pub storage: StorageKind,
    pub dev_mode: bool,
    pub concurrency: usize,
    pub target_queue_size: usize,
    pub log_level: String,
    pub log_format: LogFormat,
    pub redis: RedisSettings,
    pub s3: S3Settings,
    pub file_path: String,
    pub use_unzip: bool,
    pub sqs_queue_url: Option<String>,
    pub aws_region: Option<String>,
    pub credential_secret_prefix: String,
    pub request_urls: Vec<String>,
    pub sftp_remote_dir: Option<String>,
    pub sftp_filename_pattern: String,
}

impl AppSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable lookup. Tests feed a map
    /// here instead of mutating the process environment.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let parse_kind = |key: &str, default: &str| -> Result<String> {
            Ok(lookup(key).unwrap_or_else(|| default.to_string()))
        };

        let aws_region = lookup("AWS_REGION");
        let s3_region = aws_region
            .clone()
            .or_else(|| lookup("OC_STORAGE_S3_REGION"));

        let concurrency = lookup("DATA_FETCHER_APP_CONCURRENCY")
            .map(|raw| raw.parse::<usize>())
            .transpose()
            .context("DATA_FETCHER_APP_CONCURRENCY must be an integer")?
            .unwrap_or(1)
            .max(1);
        let target_queue_size = lookup("DATA_FETCHER_APP_TARGET_QUEUE_SIZE")
            .map(|raw| raw.parse::<usize>())
            .transpose()
            .context("DATA_FETCHER_APP_TARGET_QUEUE_SIZE must be an integer")?
            .unwrap_or(100)
            .max(1);

        Ok(AppSettings {
            credentials_provider: parse_kind("OC_CREDENTIAL_PROVIDER_TYPE", "environment")?
                .parse()?,
            kv_store: parse_kind("OC_KV_STORE_TYPE", "memory")?.parse()?,
            storage: parse_kind("OC_STORAGE_TYPE", "file")?.parse()?,
            dev_mode: truthy(lookup("DATA_FETCHER_APP_DEV_MODE")),
            concurrency,
            target_queue_size,
            log_level: lookup("DATA_FETCHER_APP_LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            log_format: parse_kind("DATA_FETCHER_APP_LOG_FORMAT", "text")?.parse()?,
            redis: RedisSettings {
                host: lookup("OC_KV_STORE_REDIS_HOST").unwrap_or_else(|| "localhost".to_string()),
                port: lookup("OC_KV_STORE_REDIS_PORT")
                    .map(|raw| raw.parse::<u16>())
                    .transpose()
                    .context("OC_KV_STORE_REDIS_PORT must be a port number")?
                    .unwrap_or(6379),
                db: lookup("OC_KV_STORE_REDIS_DB")
                    .map(|raw| raw.parse::<i64>())
                    .transpose()
                    .context("OC_KV_STORE_REDIS_DB must be an integer")?
                    .unwrap_or(0),
                password: lookup("OC_KV_STORE_REDIS_PASSWORD"),
                key_prefix: lookup("OC_KV_STORE_REDIS_KEY_PREFIX").unwrap_or_default(),
            },
            s3: S3Settings {
                bucket: lookup("OC_STORAGE_S3_BUCKET"),
                prefix: lookup("OC_STORAGE_S3_PREFIX").unwrap_or_default(),
                region: s3_region,
                endpoint_url: lookup("OC_STORAGE_S3_ENDPOINT_URL"),
            },
            file_path: lookup("OC_STORAGE_FILE_PATH").unwrap_or_else(|| "./data".to_string()),
            use_unzip: truthy(lookup("OC_STORAGE_USE_UNZIP")),
            sqs_queue_url: lookup("OC_SQS_QUEUE_URL"),
            aws_region,
            credential_secret_prefix: lookup("OC_CREDENTIAL_PROVIDER_AWS_SECRET_PREFIX")
                .unwrap_or_else(|| "datafetch/".to_string()),
            request_urls: lookup("DATA_FETCHER_APP_URLS")
                .map(|raw| {
                    raw.split(',')
                        .map(str::trim)
                        .filter(|u| !u.is_empty())
                        .map(str::to_string)
                        .collect()
                })
                .unwrap_or_default(),
            sftp_remote_dir: lookup("DATA_FETCHER_APP_SFTP_REMOTE_DIR"),
            sftp_filename_pattern: lookup("DATA_FETCHER_APP_SFTP_PATTERN")
                .unwrap_or_else(|| "*".to_string()),
        })
    }

    /// Apply dev-mode overrides: local components only, log-only
    /// notifications.
    pub fn apply_dev_mode(&mut self) {
        self.dev_mode = true;
        self.kv_store = KvStoreKind::Memory;
        self.storage = StorageKind::File;
        self.credentials_provider = CredentialsProviderKind::Environment;
    }
}

fn truthy(value: Option<String>) -> bool {
    matches!(
        value.as_deref().map(str::to_lowercase).as_deref(),
        Some("1") | Some("true") | Some("yes") | Some("on")
    )
}

/// Construct the run components described by the settings.
pub async fn build_app_config(settings: &AppSettings, config_id: &str) -> Result<Arc<AppConfig>> {
    let credential_provider: Arc<dyn datafetch_core::CredentialProvider> =
        match settings.credentials_provider {
            CredentialsProviderKind::Environment => Arc::new(EnvironmentCredentialProvider::new()),
            CredentialsProviderKind::Aws => Arc::new(
                AwsSecretsManagerCredentialProvider::new(
                    settings.aws_region.clone(),
                    settings.credential_secret_prefix.clone(),
                )
                .await,
            ),
        };

    let kv_store: Arc<dyn KeyValueStore> = match settings.kv_store {
        KvStoreKind::Memory => Arc::new(InMemoryKeyValueStore::new()),
        KvStoreKind::Redis => {
            let config = RedisConfig {
                host: settings.redis.host.clone(),
                port: settings.redis.port,
                db: settings.redis.db,
                password: settings.redis.password.clone(),
                key_prefix: settings.redis.key_prefix.clone(),
            };
            Arc::new(
                RedisKeyValueStore::connect(&config)
                    .await
                    .context("failed to connect to Redis")?,
            )
        }
    };

    let sink = build_sink(settings)?;
    let mut chain: Arc<dyn BundleStorage> = Arc::new(sink);
    if settings.use_unzip {
        chain = Arc::new(UnzipDecorator::new(chain));
    }
    chain = Arc::new(TarGzDecorator::new(chain));

    let publisher: Arc<dyn CompletionPublisher> = match (&settings.sqs_queue_url, settings.dev_mode)
    {
        (Some(queue_url), false) => match &settings.s3.endpoint_url {
            Some(endpoint) => Arc::new(
                SqsPublisher::with_endpoint(
                    queue_url.clone(),
                    settings.aws_region.clone(),
                    endpoint.clone(),
                )
                .await,
            ),
            None => Arc::new(SqsPublisher::new(queue_url.clone(), settings.aws_region.clone()).await),
        },
        _ => Arc::new(LoggingPublisher),
    };

    let storage: Arc<dyn BundleStorage> =
        Arc::new(PipelineStorage::new(chain, kv_store.clone(), publisher));

    Ok(Arc::new(AppConfig {
        config_id: config_id.to_string(),
        credential_provider,
        kv_store,
        storage,
    }))
}

/// Build the terminal object-store sink on its own (also used by `health`).
pub fn build_sink(settings: &AppSettings) -> Result<ObjectStoreStorage> {
    match settings.storage {
        StorageKind::S3 => {
            let bucket = settings
                .s3
                .bucket
                .as_deref()
                .context("OC_STORAGE_S3_BUCKET is required for the s3 backend")?;
            let region = settings.s3.region.as_deref().unwrap_or("eu-west-2");
            ObjectStoreStorage::new_s3(
                bucket,
                region,
                &settings.s3.prefix,
                settings.s3.endpoint_url.as_deref(),
            )
            .context("failed to create S3 storage")
        }
        StorageKind::File => ObjectStoreStorage::new_fs(&settings.file_path, &settings.s3.prefix)
            .context("failed to create filesystem storage"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| map.get(key).map(|v| v.to_string())
    }

    #[test]
    fn defaults_are_local_friendly() {
        let settings = AppSettings::from_lookup(|_| None).unwrap();
        assert_eq!(settings.credentials_provider, CredentialsProviderKind::Environment);
        assert_eq!(settings.kv_store, KvStoreKind::Memory);
        assert_eq!(settings.storage, StorageKind::File);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.target_queue_size, 100);
        assert!(!settings.use_unzip);
    }

    #[test]
    fn reads_service_variables() {
        let map = HashMap::from([
            ("OC_KV_STORE_TYPE", "redis"),
            ("OC_KV_STORE_REDIS_HOST", "redis.internal"),
            ("OC_KV_STORE_REDIS_PORT", "6380"),
            ("OC_KV_STORE_REDIS_DB", "2"),
            ("OC_KV_STORE_REDIS_KEY_PREFIX", "df:"),
            ("OC_STORAGE_TYPE", "s3"),
            ("OC_STORAGE_S3_BUCKET", "bundles"),
            ("OC_STORAGE_S3_PREFIX", "prod"),
            ("OC_STORAGE_S3_REGION", "eu-west-1"),
            ("OC_STORAGE_USE_UNZIP", "true"),
            ("OC_SQS_QUEUE_URL", "https://sqs.example/q"),
            ("DATA_FETCHER_APP_CONCURRENCY", "4"),
        ]);
        let settings = AppSettings::from_lookup(lookup_from(&map)).unwrap();

        assert_eq!(settings.kv_store, KvStoreKind::Redis);
        assert_eq!(settings.redis.host, "redis.internal");
        assert_eq!(settings.redis.port, 6380);
        assert_eq!(settings.redis.db, 2);
        assert_eq!(settings.redis.key_prefix, "df:");
        assert_eq!(settings.storage, StorageKind::S3);
        assert_eq!(settings.s3.bucket.as_deref(), Some("bundles"));
        assert_eq!(settings.s3.region.as_deref(), Some("eu-west-1"));
        assert!(settings.use_unzip);
        assert_eq!(settings.sqs_queue_url.as_deref(), Some("https://sqs.example/q"));
        assert_eq!(settings.concurrency, 4);
    }

    #[test]
    fn aws_region_takes_precedence() {
        let map = HashMap::from([
            ("AWS_REGION", "us-east-1"),
            ("OC_STORAGE_S3_REGION", "eu-west-1"),
        ]);
        let settings = AppSettings::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(settings.s3.region.as_deref(), Some("us-east-1"));
        assert_eq!(settings.aws_region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        let bad_kind = HashMap::from([("OC_STORAGE_TYPE", "tape")]);
        assert!(AppSettings::from_lookup(lookup_from(&bad_kind)).is_err());

        let bad_port = HashMap::from([("OC_KV_STORE_REDIS_PORT", "not-a-port")]);
        assert!(AppSettings::from_lookup(lookup_from(&bad_port)).is_err());
    }

    #[test]
    fn dev_mode_forces_local_components() {
        let map = HashMap::from([
            ("OC_KV_STORE_TYPE", "redis"),
            ("OC_STORAGE_TYPE", "s3"),
            ("OC_CREDENTIAL_PROVIDER_TYPE", "aws"),
        ]);
        let mut settings = AppSettings::from_lookup(lookup_from(&map)).unwrap();
        settings.apply_dev_mode();

        assert!(settings.dev_mode);
        assert_eq!(settings.kv_store, KvStoreKind::Memory);
        assert_eq!(settings.storage, StorageKind::File);
        assert_eq!(
            settings.credentials_provider,
            CredentialsProviderKind::Environment
        );
    }

    #[test]
    fn url_list_parsing() {
        let map = HashMap::from([(
            "DATA_FETCHER_APP_URLS",
            "http://x/1, http://x/2 ,,http://x/3",
        )]);
        let settings = AppSettings::from_lookup(lookup_from(&map)).unwrap();
        assert_eq!(
            settings.request_urls,
            vec![
                "http://x/1".to_string(),
                "http://x/2".to_string(),
                "http://x/3".to_string()
            ]
        );
    }
}
