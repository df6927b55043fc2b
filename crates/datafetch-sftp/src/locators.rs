//! SFTP bundle locators.
//!
//! Both locators mint their bundle references up front (via the storage
//! layer's `bundle_found`) and carry the bid in the request flags, so only
//! the request travels through the persistent queue. Progress markers live
//! in the key-value store, which makes both locators resumable:
//! `DirectorySftpBundleLocator` skips files it already processed;
//! `FileSftpBundleLocator` re-emits a file only when its remote mtime moved
//! past the recorded one.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};

use datafetch_core::kv::{KeyValueStore, KeyValueStoreExt};
use datafetch_core::locator::BID_FLAG;
use datafetch_core::model::{BundleRef, FetchRunContext, RequestMeta};
use datafetch_core::{BundleLocator, Result};

use crate::config::SftpProtocolConfig;
use crate::manager::SftpManager;
use crate::strategies::{glob_match, FileSortStrategy, FilenameFilter};

const DEFAULT_PROCESSED_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const DEFAULT_RESULTS_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const DEFAULT_ERRORS_TTL: Duration = Duration::from_secs(24 * 3600);

const SFTP_URL_SCHEME: &str = "sftp://";

fn key_hash(value: &str) -> String {
    blake3::hash(value.as_bytes()).to_hex()[..16].to_string()
}

fn remote_path_of(request: &RequestMeta) -> &str {
    request
        .url
        .strip_prefix(SFTP_URL_SCHEME)
        .unwrap_or(&request.url)
}

fn request_for(path: &str, ctx: &FetchRunContext, source_meta: serde_json::Value) -> Result<RequestMeta> {
    let storage = ctx.app_config.storage.clone();
    let bid = storage.bundle_found(source_meta);
    Ok(RequestMeta::new(format!("{SFTP_URL_SCHEME}{path}"))?
        .with_flag(BID_FLAG, serde_json::Value::String(bid.to_string())))
}

async fn save_error_record(
    kv: &dyn KeyValueStore,
    key: &str,
    remote_path: &str,
    error: &str,
    ttl: Duration,
) -> Result<()> {
    let record = json!({
        "remote_path": remote_path,
        "error": error,
        "timestamp": Utc::now().to_rfc3339(),
        "retry_count": 0,
    });
    kv.put_json(key, &record, Some(ttl)).await
}

/// Enumerates one remote directory, filtered and ordered by strategies.
pub struct DirectorySftpBundleLocator {
    manager: Arc<SftpManager>,
    config: SftpProtocolConfig,
    remote_dir: String,
    filename_pattern: String,
    max_files: Option<usize>,
    file_filter: Option<Arc<dyn FilenameFilter>>,
    file_sort: Option<Arc<dyn FileSortStrategy>>,
    state_management_prefix: String,
    processed_ttl: Duration,
    results_ttl: Duration,
    errors_ttl: Duration,
    state: tokio::sync::Mutex<DirectoryState>,
}

struct DirectoryState {
    file_queue: VecDeque<String>,
    initialized: bool,
}

impl DirectorySftpBundleLocator {
    pub fn new(
        manager: Arc<SftpManager>,
        config: SftpProtocolConfig,
        remote_dir: impl Into<String>,
        filename_pattern: impl Into<String>,
    ) -> Self {
        DirectorySftpBundleLocator {
            manager,
            config,
            remote_dir: remote_dir.into(),
            filename_pattern: filename_pattern.into(),
            max_files: None,
            file_filter: None,
            file_sort: None,
            state_management_prefix: "sftp_directory_provider".to_string(),
            processed_ttl: DEFAULT_PROCESSED_TTL,
            results_ttl: DEFAULT_RESULTS_TTL,
            errors_ttl: DEFAULT_ERRORS_TTL,
            state: tokio::sync::Mutex::new(DirectoryState {
                file_queue: VecDeque::new(),
                initialized: false,
            }),
        }
    }

    pub fn with_max_files(mut self, max_files: usize) -> Self {
        self.max_files = Some(max_files);
        self
    }

    pub fn with_file_filter(mut self, filter: Arc<dyn FilenameFilter>) -> Self {
        self.file_filter = Some(filter);
        self
    }

    pub fn with_file_sort(mut self, sort: Arc<dyn FileSortStrategy>) -> Self {
        self.file_sort = Some(sort);
        self
    }

    pub fn with_state_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.state_management_prefix = prefix.into();
        self
    }

    fn processed_key(&self, file_path: &str) -> String {
        format!(
            "{}:processed:{}:{}",
            self.state_management_prefix, self.remote_dir, file_path
        )
    }

    /// List, filter, sort, and queue the unprocessed directory entries.
    async fn initialize(&self, ctx: &FetchRunContext, state: &mut DirectoryState) -> Result<()> {
        let kv = ctx.app_config.kv_store.clone();
        let names = self.manager.listdir(&self.config, ctx, &self.remote_dir).await?;

        let mut candidates: Vec<(String, Option<i64>)> = Vec::new();
        for name in names {
            if name == "." || name == ".." {
                continue;
            }
            if !glob_match(&self.filename_pattern, &name) {
                continue;
            }
            if let Some(filter) = &self.file_filter {
                if !filter.keep(&name) {
                    continue;
                }
            }
            let file_path = format!("{}/{}", self.remote_dir.trim_end_matches('/'), name);
            let stat = self.manager.stat(&self.config, ctx, &file_path).await?;
            candidates.push((file_path, stat.mtime));
        }

        if let Some(sort) = &self.file_sort {
            candidates = sort.sort(candidates);
        }

        for (file_path, _) in candidates {
            if !kv.exists(&self.processed_key(&file_path)).await? {
                state.file_queue.push_back(file_path);
            }
        }

        info!(
            directory = %self.remote_dir,
            file_count = state.file_queue.len(),
            "DIRECTORY_PROVIDER_INITIALIZED"
        );
        Ok(())
    }
}

#[async_trait]
impl BundleLocator for DirectorySftpBundleLocator {
    async fn next_requests(
        &self,
        ctx: &FetchRunContext,
        wanted: usize,
    ) -> Result<Vec<RequestMeta>> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            self.initialize(ctx, &mut state).await?;
            state.initialized = true;
        }

        let cap = self.max_files.map_or(wanted, |max| wanted.min(max));
        let mut requests = Vec::new();
        while requests.len() < cap {
            let Some(file_path) = state.file_queue.pop_front() else {
                break;
            };
            debug!(file_path = %file_path, "FILE_POPPED_FROM_QUEUE");
            requests.push(request_for(
                &file_path,
                ctx,
                json!({
                    "source": "sftp",
                    "primary_url": format!("{SFTP_URL_SCHEME}{file_path}"),
                    "config_id": &ctx.app_config.config_id,
                }),
            )?);
        }
        Ok(requests)
    }

    async fn handle_request_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        ctx: &FetchRunContext,
    ) -> Result<()> {
        if !request.url.starts_with(SFTP_URL_SCHEME) {
            return Ok(());
        }
        let remote_path = remote_path_of(request);
        if !remote_path.starts_with(self.remote_dir.trim_end_matches('/')) {
            return Ok(());
        }

        let kv = ctx.app_config.kv_store.clone();
        kv.put_json(&self.processed_key(remote_path), &true, Some(self.processed_ttl))
            .await?;

        let result_key = format!(
            "{}:results:{}:{}",
            self.state_management_prefix,
            self.remote_dir,
            key_hash(remote_path)
        );
        let record = json!({
            "remote_path": remote_path,
            "timestamp": Utc::now().to_rfc3339(),
            "success": true,
            "bundle_bids": bundle_refs.iter().map(|b| b.bid.to_string()).collect::<Vec<_>>(),
        });
        kv.put_json(&result_key, &record, Some(self.results_ttl)).await
    }

    async fn handle_bundle_error(
        &self,
        request: &RequestMeta,
        error: &str,
        ctx: &FetchRunContext,
    ) -> Result<()> {
        if !request.url.starts_with(SFTP_URL_SCHEME) {
            return Ok(());
        }
        let remote_path = remote_path_of(request);
        let error_key = format!(
            "{}:errors:{}:{}",
            self.state_management_prefix,
            self.remote_dir,
            key_hash(remote_path)
        );
        save_error_record(
            ctx.app_config.kv_store.as_ref(),
            &error_key,
            remote_path,
            error,
            self.errors_ttl,
        )
        .await
    }
}

/// Emits explicit remote paths whose mtime moved past the recorded one.
pub struct FileSftpBundleLocator {
    manager: Arc<SftpManager>,
    config: SftpProtocolConfig,
    file_paths: Vec<String>,
    state_management_prefix: String,
    processed_ttl: Duration,
    results_ttl: Duration,
    errors_ttl: Duration,
    state: tokio::sync::Mutex<FileState>,
}

struct FileState {
    file_queue: VecDeque<String>,
    initialized: bool,
}

impl FileSftpBundleLocator {
    pub fn new(
        manager: Arc<SftpManager>,
        config: SftpProtocolConfig,
        file_paths: Vec<String>,
    ) -> Self {
        FileSftpBundleLocator {
            manager,
            config,
            file_paths,
            state_management_prefix: "sftp_file_provider".to_string(),
            processed_ttl: DEFAULT_PROCESSED_TTL,
            results_ttl: DEFAULT_RESULTS_TTL,
            errors_ttl: DEFAULT_ERRORS_TTL,
            state: tokio::sync::Mutex::new(FileState {
                file_queue: VecDeque::new(),
                initialized: false,
            }),
        }
    }

    pub fn with_state_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.state_management_prefix = prefix.into();
        self
    }

    fn mtime_key(&self, file_path: &str) -> String {
        format!(
            "{}:processed_mtime:{}",
            self.state_management_prefix, file_path
        )
    }

    async fn should_process(&self, ctx: &FetchRunContext, file_path: &str) -> Result<bool> {
        if !self.manager.exists(&self.config, ctx, file_path).await? {
            warn!(file_path = %file_path, "FILE_NOT_FOUND_ON_SFTP_SERVER");
            return Ok(false);
        }

        let stat = self.manager.stat(&self.config, ctx, file_path).await?;
        let Some(current_mtime) = stat.mtime else {
            // No mtime reported: process it, there is nothing to compare.
            return Ok(true);
        };

        let kv = ctx.app_config.kv_store.clone();
        let last_processed: Option<i64> = kv.get_json(&self.mtime_key(file_path)).await?;
        match last_processed {
            None => {
                info!(file_path = %file_path, current_mtime, "FILE_NEVER_PROCESSED");
                Ok(true)
            }
            Some(last) if current_mtime > last => {
                info!(
                    file_path = %file_path,
                    current_mtime,
                    last_processed_mtime = last,
                    "FILE_MODIFIED_SINCE_LAST_PROCESSING"
                );
                Ok(true)
            }
            Some(_) => {
                debug!(file_path = %file_path, "FILE_UNCHANGED_SINCE_LAST_PROCESSING");
                Ok(false)
            }
        }
    }
}

#[async_trait]
impl BundleLocator for FileSftpBundleLocator {
    async fn next_requests(
        &self,
        ctx: &FetchRunContext,
        wanted: usize,
    ) -> Result<Vec<RequestMeta>> {
        let mut state = self.state.lock().await;
        if !state.initialized {
            for file_path in &self.file_paths {
                if self.should_process(ctx, file_path).await? {
                    state.file_queue.push_back(file_path.clone());
                }
            }
            state.initialized = true;
            info!(
                file_count = state.file_queue.len(),
                total_files = self.file_paths.len(),
                "FILE_PROVIDER_INITIALIZED"
            );
        }

        let mut requests = Vec::new();
        while requests.len() < wanted {
            let Some(file_path) = state.file_queue.pop_front() else {
                break;
            };
            requests.push(request_for(
                &file_path,
                ctx,
                json!({
                    "source": "sftp",
                    "primary_url": format!("{SFTP_URL_SCHEME}{file_path}"),
                    "config_id": &ctx.app_config.config_id,
                }),
            )?);
        }
        Ok(requests)
    }

    async fn handle_request_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        ctx: &FetchRunContext,
    ) -> Result<()> {
        if !request.url.starts_with(SFTP_URL_SCHEME) {
            return Ok(());
        }
        let remote_path = remote_path_of(request);
        if !self.file_paths.iter().any(|p| p == remote_path) {
            return Ok(());
        }

        let stat = self.manager.stat(&self.config, ctx, remote_path).await?;
        let kv = ctx.app_config.kv_store.clone();
        if let Some(mtime) = stat.mtime {
            kv.put_json(&self.mtime_key(remote_path), &mtime, Some(self.processed_ttl))
                .await?;
            info!(file_path = %remote_path, mtime, "FILE_PROCESSING_COMPLETED");
        }

        let result_key = format!(
            "{}:results:{}",
            self.state_management_prefix,
            key_hash(remote_path)
        );
        let record = json!({
            "remote_path": remote_path,
            "timestamp": Utc::now().to_rfc3339(),
            "success": true,
            "bundle_bids": bundle_refs.iter().map(|b| b.bid.to_string()).collect::<Vec<_>>(),
        });
        kv.put_json(&result_key, &record, Some(self.results_ttl)).await
    }

    async fn handle_bundle_error(
        &self,
        request: &RequestMeta,
        error: &str,
        ctx: &FetchRunContext,
    ) -> Result<()> {
        if !request.url.starts_with(SFTP_URL_SCHEME) {
            return Ok(());
        }
        let remote_path = remote_path_of(request);
        let error_key = format!(
            "{}:errors:{}",
            self.state_management_prefix,
            key_hash(remote_path)
        );
        save_error_record(
            ctx.app_config.kv_store.as_ref(),
            &error_key,
            remote_path,
            error,
            self.errors_ttl,
        )
        .await
    }
}
