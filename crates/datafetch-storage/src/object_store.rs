//! Object-store sink built on the OpenDAL operator abstraction.
//!
//! Resources stream into the store through a chunked writer so memory stays
//! bounded by the part size regardless of payload size. Keys embed the bid
//! prefix so object listings sort chronologically:
//! `{prefix}/{bid}/{basename_or_hash}`, with a terminating
//! `{prefix}/bundles/{bid}/metadata.json` per bundle.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::StreamExt;
use opendal::Operator;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tracing::{debug, error, info};

use datafetch_core::model::{BundleRef, FetcherRecipe, ResourceMeta};
use datafetch_core::storage::{BundleStorage, BundleStorageContext, ByteStream};
use datafetch_core::{Bid, FetchError, Result};

/// Upload part size. Each part is shipped as soon as this threshold is
/// crossed, freeing its memory immediately.
pub const CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// OpenDAL-backed bundle storage.
#[derive(Clone)]
pub struct ObjectStoreStorage {
    operator: Operator,
    prefix: String,
}

impl ObjectStoreStorage {
    pub fn new(operator: Operator, prefix: impl Into<String>) -> Self {
        ObjectStoreStorage {
            operator,
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// S3 (or any S3-compatible endpoint).
    #[cfg(feature = "services-s3")]
    pub fn new_s3(
        bucket: &str,
        region: &str,
        prefix: &str,
        endpoint: Option<&str>,
    ) -> Result<Self> {
        let mut builder = opendal::services::S3::default().bucket(bucket).region(region);
        if let Some(endpoint) = endpoint {
            builder = builder.endpoint(endpoint);
        }
        let operator = Operator::new(builder)
            .map_err(|e| FetchError::storage_from("object_store", "failed to create S3 operator", e))?
            .finish();
        Ok(Self::new(operator, prefix))
    }

    /// Local filesystem root.
    #[cfg(feature = "services-fs")]
    pub fn new_fs(root: &str, prefix: &str) -> Result<Self> {
        let builder = opendal::services::Fs::default().root(root);
        let operator = Operator::new(builder)
            .map_err(|e| {
                FetchError::storage_from("object_store", "failed to create filesystem operator", e)
            })?
            .finish();
        Ok(Self::new(operator, prefix))
    }

    /// In-memory backend for tests.
    #[cfg(feature = "services-memory")]
    pub fn new_memory(prefix: &str) -> Result<Self> {
        let operator = Operator::new(opendal::services::Memory::default())
            .map_err(|e| {
                FetchError::storage_from("object_store", "failed to create memory operator", e)
            })?
            .finish();
        Ok(Self::new(operator, prefix))
    }

    pub fn operator(&self) -> &Operator {
        &self.operator
    }
}

#[async_trait]
impl BundleStorage for ObjectStoreStorage {
    fn bundle_found(&self, metadata: Value) -> Bid {
        let bid = Bid::mint();
        debug!(bid = %bid, metadata = %metadata, "BUNDLE_FOUND");
        bid
    }

    async fn start_bundle(
        &self,
        bundle_ref: BundleRef,
        _recipe: Arc<FetcherRecipe>,
    ) -> Result<Arc<dyn BundleStorageContext>> {
        debug!(bid = %bundle_ref.bid, "BUNDLE_STARTED");
        Ok(Arc::new(ObjectStoreBundleContext {
            operator: self.operator.clone(),
            prefix: self.prefix.clone(),
            state: Mutex::new(BundleState {
                bundle_ref,
                uploaded_keys: Vec::new(),
                completed: false,
            }),
        }))
    }
}

struct BundleState {
    bundle_ref: BundleRef,
    uploaded_keys: Vec<String>,
    completed: bool,
}

struct ObjectStoreBundleContext {
    operator: Operator,
    prefix: String,
    state: Mutex<BundleState>,
}

impl ObjectStoreBundleContext {
    /// Build the object key for one resource. The resource name is URL-ish;
    /// the basename of its path is used when present, otherwise a short
    /// content hash of the whole name keeps keys unique.
    fn object_key(&self, bid: &Bid, resource_name: &str) -> String {
        let path = url::Url::parse(resource_name)
            .map(|u| u.path().to_string())
            .unwrap_or_else(|_| resource_name.to_string());

        let basename = path.rsplit('/').next().unwrap_or("").to_string();
        let leaf = if basename.is_empty() {
            blake3::hash(resource_name.as_bytes()).to_hex()[..8].to_string()
        } else {
            basename
        };

        if self.prefix.is_empty() {
            format!("{bid}/{leaf}")
        } else {
            format!("{}/{bid}/{leaf}", self.prefix)
        }
    }

    fn metadata_key(&self, bid: &Bid) -> String {
        if self.prefix.is_empty() {
            format!("bundles/{bid}/metadata.json")
        } else {
            format!("{}/bundles/{bid}/metadata.json", self.prefix)
        }
    }
}

#[async_trait]
impl BundleStorageContext for ObjectStoreBundleContext {
    fn bundle_ref(&self) -> BundleRef {
        self.state.lock().bundle_ref.clone()
    }

    async fn add_resource(
        &self,
        resource_name: &str,
        metadata: ResourceMeta,
        mut stream: ByteStream,
    ) -> Result<()> {
        let bid = self.state.lock().bundle_ref.bid.clone();
        let key = self.object_key(&bid, resource_name);

        info!(
            key = %key,
            resource_name,
            url = %metadata.url,
            content_type = metadata.content_type.as_deref().unwrap_or(""),
            bundle_id = %bid,
            "S3_UPLOAD_STARTING"
        );

        let mut user_metadata = HashMap::new();
        user_metadata.insert("resource_name".to_string(), resource_name.to_string());
        user_metadata.insert("url".to_string(), metadata.url.clone());
        user_metadata.insert(
            "content_type".to_string(),
            metadata
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".to_string()),
        );
        user_metadata.insert(
            "status_code".to_string(),
            metadata.status.map(|s| s.to_string()).unwrap_or_default(),
        );

        let mut writer = self
            .operator
            .writer_with(&key)
            .chunk(CHUNK_SIZE)
            .content_type(
                metadata
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            )
            .user_metadata(user_metadata)
            .await
            .map_err(|e| {
                FetchError::storage_from("object_store", format!("open writer for {key} failed"), e)
            })?;

        let upload: Result<()> = async {
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| {
                    FetchError::storage_from("object_store", "resource stream failed", e)
                })?;
                writer.write(chunk).await.map_err(|e| {
                    FetchError::storage_from("object_store", format!("write to {key} failed"), e)
                })?;
            }
            writer.close().await.map_err(|e| {
                FetchError::storage_from("object_store", format!("close of {key} failed"), e)
            })?;
            Ok(())
        }
        .await;

        if let Err(err) = upload {
            error!(key = %key, url = %metadata.url, error = %err, "S3_UPLOAD_FAILED");
            let _ = writer.abort().await;
            return Err(err);
        }

        let mut state = self.state.lock();
        state.uploaded_keys.push(key);
        state.bundle_ref.resources_count += 1;
        Ok(())
    }

    async fn complete(&self, metadata: Value) -> Result<()> {
        let (bid, snapshot, uploaded_keys) = {
            let state = self.state.lock();
            if state.completed {
                return Ok(());
            }
            (
                state.bundle_ref.bid.clone(),
                state.bundle_ref.clone(),
                state.uploaded_keys.clone(),
            )
        };

        let bundle_key = self.metadata_key(&bid);
        let mut bundle_meta: serde_json::Map<String, Value> = snapshot
            .meta
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        if let Some(extra) = metadata.as_object() {
            for (k, v) in extra {
                bundle_meta.insert(k.clone(), v.clone());
            }
        }

        let body = json!({
            "bid": bid.as_str(),
            "primary_url": snapshot.primary_url,
            "resources_count": snapshot.resources_count,
            "storage_key": &bundle_key,
            "uploaded_keys": uploaded_keys,
            "meta": bundle_meta,
        });

        let payload = serde_json::to_vec_pretty(&body)
            .map_err(|e| FetchError::storage_from("object_store", "metadata encoding failed", e))?;
        self.operator
            .write_with(&bundle_key, payload)
            .content_type("application/json")
            .await
            .map_err(|e| {
                FetchError::storage_from(
                    "object_store",
                    format!("metadata write to {bundle_key} failed"),
                    e,
                )
            })?;

        let mut state = self.state.lock();
        state.bundle_ref.storage_key = Some(bundle_key);
        state.completed = true;
        debug!(bid = %bid, "BUNDLE_COMPLETED");
        Ok(())
    }
}
