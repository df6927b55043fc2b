//! Core value objects and run wiring.
//!
//! `RequestMeta` travels through the persistent queue; `BundleRef` travels
//! through the storage pipeline; `FetchRunContext` carries the per-run state
//! and the explicitly-passed application components (no hidden singletons).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bid::Bid;
use crate::error::{FetchError, Result};
use crate::kv::KeyValueStore;
use crate::locator::{BundleLoader, BundleLocator};
use crate::storage::BundleStorage;

const MIN_HTTP_STATUS: u16 = 100;
const MAX_HTTP_STATUS: u16 = 599;

/// Metadata for a single fetch request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMeta {
    pub url: String,
    #[serde(default)]
    pub depth: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referer: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub flags: HashMap<String, Value>,
}

impl RequestMeta {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let meta = RequestMeta {
            url: url.into(),
            depth: 0,
            referer: None,
            headers: HashMap::new(),
            flags: HashMap::new(),
        };
        meta.validate()?;
        Ok(meta)
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_flag(mut self, key: impl Into<String>, value: Value) -> Self {
        self.flags.insert(key.into(), value);
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(FetchError::validation("url", "url must be a non-empty string"));
        }
        if let Some(referer) = &self.referer {
            if referer.trim().is_empty() {
                return Err(FetchError::validation(
                    "referer",
                    "referer must be a non-empty string or absent",
                ));
            }
        }
        Ok(())
    }
}

/// Metadata attached to one fetched resource inside a bundle.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceMeta {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Name of the resource this one was derived from by a storage
    /// decorator, e.g. an archive member extracted from its container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub derived_from: Option<String>,
}

impl ResourceMeta {
    pub fn new(url: impl Into<String>) -> Self {
        ResourceMeta {
            url: url.into(),
            ..Default::default()
        }
    }

    pub fn with_status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.url.trim().is_empty() {
            return Err(FetchError::validation("url", "url must be a non-empty string"));
        }
        if let Some(status) = self.status {
            if !(MIN_HTTP_STATUS..=MAX_HTTP_STATUS).contains(&status) {
                return Err(FetchError::validation(
                    "status",
                    "status must be a valid HTTP status code (100-599) or absent",
                ));
            }
        }
        Ok(())
    }
}

/// Reference to a bundle of fetched resources.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRef {
    pub bid: Bid,
    pub primary_url: String,
    #[serde(default)]
    pub resources_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_key: Option<String>,
    #[serde(default)]
    pub meta: HashMap<String, Value>,
}

impl BundleRef {
    pub fn new(bid: Bid, primary_url: impl Into<String>) -> Self {
        BundleRef {
            bid,
            primary_url: primary_url.into(),
            resources_count: 0,
            storage_key: None,
            meta: HashMap::new(),
        }
    }

    /// Reconstruct a bundle reference from a persisted JSON value,
    /// validating the required fields.
    pub fn from_value(value: &Value) -> Result<Self> {
        let obj = value
            .as_object()
            .ok_or_else(|| FetchError::validation("bundle_ref", "data must be an object"))?;

        let bid_str = obj
            .get("bid")
            .and_then(Value::as_str)
            .ok_or_else(|| FetchError::validation("bundle_ref", "missing 'bid' field"))?;
        let bid = Bid::parse(bid_str)?;

        let primary_url = obj
            .get("primary_url")
            .and_then(Value::as_str)
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| {
                FetchError::validation("bundle_ref", "primary_url must be a non-empty string")
            })?;

        let resources_count = obj
            .get("resources_count")
            .and_then(Value::as_u64)
            .ok_or_else(|| {
                FetchError::validation(
                    "bundle_ref",
                    "resources_count must be a non-negative integer",
                )
            })?;

        let storage_key = obj
            .get("storage_key")
            .and_then(Value::as_str)
            .map(str::to_string);

        let meta = obj
            .get("meta")
            .and_then(Value::as_object)
            .map(|m| m.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default();

        Ok(BundleRef {
            bid,
            primary_url: primary_url.to_string(),
            resources_count,
            storage_key,
            meta,
        })
    }
}

/// Per-protocol credential lookup.
///
/// Implementations resolve named credentials from the environment or an
/// external secret store; the engine never persists secrets itself.
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Fetch one credential value for the given protocol configuration name.
    async fn get(&self, config_name: &str, key: &str) -> Result<String>;
}

/// Application components constructed by the config factory and passed
/// explicitly through the run context.
pub struct AppConfig {
    pub config_id: String,
    pub credential_provider: Arc<dyn CredentialProvider>,
    pub kv_store: Arc<dyn KeyValueStore>,
    pub storage: Arc<dyn BundleStorage>,
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("config_id", &self.config_id)
            .finish_non_exhaustive()
    }
}

/// Context for a single fetch run. Counters are guarded by dedicated locks
/// because workers update them concurrently.
pub struct FetchRunContext {
    pub run_id: String,
    pub app_config: Arc<AppConfig>,
    shared: Mutex<HashMap<String, Value>>,
    processed_count: Mutex<u64>,
    errors: Mutex<Vec<String>>,
}

impl FetchRunContext {
    pub fn new(run_id: impl Into<String>, app_config: Arc<AppConfig>) -> Self {
        FetchRunContext {
            run_id: run_id.into(),
            app_config,
            shared: Mutex::new(HashMap::new()),
            processed_count: Mutex::new(0),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub fn increment_processed(&self) {
        *self.processed_count.lock() += 1;
    }

    pub fn processed_count(&self) -> u64 {
        *self.processed_count.lock()
    }

    pub fn record_error(&self, message: String) {
        self.errors.lock().push(message);
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().clone()
    }

    pub fn shared_insert(&self, key: impl Into<String>, value: Value) {
        self.shared.lock().insert(key.into(), value);
    }

    pub fn shared_get(&self, key: &str) -> Option<Value> {
        self.shared.lock().get(key).cloned()
    }
}

impl std::fmt::Debug for FetchRunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchRunContext")
            .field("run_id", &self.run_id)
            .field("processed_count", &self.processed_count())
            .finish_non_exhaustive()
    }
}

/// Immutable description of one data source: an ordered list of locators
/// and exactly one loader.
pub struct FetcherRecipe {
    pub recipe_id: String,
    pub bundle_locators: Vec<Arc<dyn BundleLocator>>,
    pub bundle_loader: Arc<dyn BundleLoader>,
}

impl std::fmt::Debug for FetcherRecipe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetcherRecipe")
            .field("recipe_id", &self.recipe_id)
            .field("bundle_locators", &self.bundle_locators.len())
            .finish_non_exhaustive()
    }
}

/// Builder for [`FetcherRecipe`].
#[derive(Default)]
pub struct FetcherRecipeBuilder {
    recipe_id: Option<String>,
    bundle_locators: Vec<Arc<dyn BundleLocator>>,
    bundle_loader: Option<Arc<dyn BundleLoader>>,
}

impl FetcherRecipeBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn recipe_id(mut self, recipe_id: impl Into<String>) -> Self {
        self.recipe_id = Some(recipe_id.into());
        self
    }

    pub fn add_bundle_locator(mut self, locator: Arc<dyn BundleLocator>) -> Self {
        self.bundle_locators.push(locator);
        self
    }

    pub fn use_bundle_loader(mut self, loader: Arc<dyn BundleLoader>) -> Self {
        self.bundle_loader = Some(loader);
        self
    }

    pub fn build(self) -> Result<FetcherRecipe> {
        let bundle_loader = self.bundle_loader.ok_or_else(|| {
            FetchError::configuration("bundle_loader", "bundle loader is required")
        })?;
        Ok(FetcherRecipe {
            recipe_id: self.recipe_id.unwrap_or_else(|| "default".to_string()),
            bundle_locators: self.bundle_locators,
            bundle_loader,
        })
    }
}

/// Execution plan handed to the fetcher.
#[derive(Debug, Clone)]
pub struct FetchPlan {
    pub recipe: Arc<FetcherRecipe>,
    pub context: Arc<FetchRunContext>,
    pub concurrency: usize,
    pub target_queue_size: usize,
}

impl FetchPlan {
    pub fn new(recipe: Arc<FetcherRecipe>, context: Arc<FetchRunContext>) -> Self {
        FetchPlan {
            recipe,
            context,
            concurrency: 1,
            target_queue_size: 100,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency;
        self
    }

    pub fn with_target_queue_size(mut self, target: usize) -> Self {
        self.target_queue_size = target;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_meta_rejects_empty_url() {
        assert!(RequestMeta::new("").is_err());
        assert!(RequestMeta::new("   ").is_err());
        assert!(RequestMeta::new("https://example.com").is_ok());
    }

    #[test]
    fn request_meta_rejects_blank_referer() {
        let mut meta = RequestMeta::new("https://example.com").unwrap();
        meta.referer = Some("  ".to_string());
        assert!(meta.validate().is_err());
    }

    #[test]
    fn request_meta_json_round_trip() {
        let meta = RequestMeta::new("https://example.com/a")
            .unwrap()
            .with_flag("bid", Value::String("x".into()));
        let json = serde_json::to_string(&meta).unwrap();
        let back: RequestMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(meta, back);
    }

    #[test]
    fn resource_meta_status_bounds() {
        let ok = ResourceMeta::new("https://example.com").with_status(404);
        assert!(ok.validate().is_ok());

        let low = ResourceMeta::new("https://example.com").with_status(99);
        assert!(low.validate().is_err());

        let high = ResourceMeta::new("https://example.com").with_status(600);
        assert!(high.validate().is_err());
    }

    #[test]
    fn bundle_ref_from_value_validates_required_fields() {
        let bid = Bid::mint();
        let value = serde_json::json!({
            "bid": bid.as_str(),
            "primary_url": "https://example.com/data",
            "resources_count": 2,
            "meta": {"source": "test"},
        });
        let bundle = BundleRef::from_value(&value).unwrap();
        assert_eq!(bundle.bid, bid);
        assert_eq!(bundle.resources_count, 2);

        let missing_bid = serde_json::json!({"primary_url": "https://x", "resources_count": 0});
        assert!(BundleRef::from_value(&missing_bid).is_err());

        let bad_count = serde_json::json!({
            "bid": bid.as_str(),
            "primary_url": "https://x",
            "resources_count": -1,
        });
        assert!(BundleRef::from_value(&bad_count).is_err());
    }
}
