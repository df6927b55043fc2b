//! Pipeline storage: completion callbacks and crash-durable notifications.
//!
//! Wraps the decorator chain as the outermost storage layer. On `complete`
//! it finalizes the inner bundle, writes a durable pending-completion record,
//! fires the loader/locator completion hooks, publishes the completion event,
//! and only then deletes the pending record. `on_run_start` replays any
//! records left behind by a crash, which yields at-least-once delivery;
//! downstream consumers deduplicate by bundle id.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use datafetch_core::kv::{KeyValueStore, KeyValueStoreExt};
use datafetch_core::model::{BundleRef, FetchRunContext, FetcherRecipe, ResourceMeta};
use datafetch_core::storage::{BundleStorage, BundleStorageContext, ByteStream};
use datafetch_core::{Bid, Result};
use datafetch_notify::CompletionPublisher;

const PENDING_PREFIX: &str = "sqs_notifications:pending";

fn pending_key(recipe_id: &str, bid: &Bid) -> String {
    format!("{PENDING_PREFIX}:{recipe_id}:{bid}")
}

pub struct PipelineStorage {
    inner: Arc<dyn BundleStorage>,
    kv: Arc<dyn KeyValueStore>,
    publisher: Arc<dyn CompletionPublisher>,
}

impl PipelineStorage {
    pub fn new(
        inner: Arc<dyn BundleStorage>,
        kv: Arc<dyn KeyValueStore>,
        publisher: Arc<dyn CompletionPublisher>,
    ) -> Self {
        PipelineStorage { inner, kv, publisher }
    }

    async fn run_completion_hooks(recipe: &Arc<FetcherRecipe>, bundle_ref: &BundleRef) {
        if let Err(err) = recipe.bundle_loader.on_bundle_complete(bundle_ref).await {
            warn!(bid = %bundle_ref.bid, error = %err, "LOADER_COMPLETION_HOOK_FAILED");
        }
        for locator in &recipe.bundle_locators {
            if let Err(err) = locator.on_bundle_complete(bundle_ref).await {
                warn!(bid = %bundle_ref.bid, error = %err, "LOCATOR_COMPLETION_HOOK_FAILED");
            }
        }
    }

    /// Replay pending completion records for this recipe. Malformed records
    /// are skipped without deletion so they stay visible to operators.
    async fn process_pending_completions(
        &self,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<()> {
        let prefix = format!("{PENDING_PREFIX}:{}:", recipe.recipe_id);
        let keys = self.kv.scan(&prefix).await?;
        if keys.is_empty() {
            return Ok(());
        }
        info!(recipe_id = %recipe.recipe_id, count = keys.len(), "PENDING_COMPLETIONS_FOUND");

        for key in keys {
            let record: Value = match self.kv.get_json(&key).await {
                Ok(Some(record)) => record,
                Ok(None) => continue,
                Err(err) => {
                    warn!(key = %key, error = %err, "PENDING_COMPLETION_RECORD_MALFORMED");
                    continue;
                }
            };

            let bundle_ref = match BundleRef::from_value(&record["bundle_ref"]) {
                Ok(bundle_ref) => bundle_ref,
                Err(err) => {
                    warn!(key = %key, error = %err, "PENDING_COMPLETION_RECORD_MALFORMED");
                    continue;
                }
            };
            let metadata = record.get("metadata").cloned().unwrap_or(Value::Null);

            Self::run_completion_hooks(recipe, &bundle_ref).await;

            match self
                .publisher
                .publish_bundle_completion(&bundle_ref, &metadata, &recipe.recipe_id)
                .await
            {
                Ok(()) => {
                    self.kv.delete(&key).await?;
                    info!(bid = %bundle_ref.bid, "PENDING_COMPLETION_REPLAYED");
                }
                Err(err) => {
                    // Leave the record for the next run.
                    warn!(bid = %bundle_ref.bid, error = %err, "PENDING_COMPLETION_REPLAY_FAILED");
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl BundleStorage for PipelineStorage {
    fn bundle_found(&self, metadata: Value) -> Bid {
        self.inner.bundle_found(metadata)
    }

    async fn start_bundle(
        &self,
        bundle_ref: BundleRef,
        recipe: Arc<FetcherRecipe>,
    ) -> Result<Arc<dyn BundleStorageContext>> {
        let inner = self.inner.start_bundle(bundle_ref, recipe.clone()).await?;
        Ok(Arc::new(PipelineBundleContext {
            inner,
            recipe,
            kv: self.kv.clone(),
            publisher: self.publisher.clone(),
            progress: Mutex::new(CompletionProgress::default()),
        }))
    }

    async fn on_run_start(
        &self,
        ctx: &FetchRunContext,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<()> {
        self.inner.on_run_start(ctx, recipe).await?;
        self.process_pending_completions(recipe).await
    }
}

#[derive(Default)]
struct CompletionProgress {
    finalized: bool,
    pending_written: bool,
    hooks_done: bool,
    published: bool,
    done: bool,
}

struct PipelineBundleContext {
    inner: Arc<dyn BundleStorageContext>,
    recipe: Arc<FetcherRecipe>,
    kv: Arc<dyn KeyValueStore>,
    publisher: Arc<dyn CompletionPublisher>,
    progress: Mutex<CompletionProgress>,
}

#[async_trait]
impl BundleStorageContext for PipelineBundleContext {
    fn bundle_ref(&self) -> BundleRef {
        self.inner.bundle_ref()
    }

    async fn add_resource(
        &self,
        resource_name: &str,
        metadata: ResourceMeta,
        stream: ByteStream,
    ) -> Result<()> {
        self.inner.add_resource(resource_name, metadata, stream).await
    }

    async fn complete(&self, metadata: Value) -> Result<()> {
        let mut progress = self.progress.lock().await;
        if progress.done {
            return Ok(());
        }

        if !progress.finalized {
            self.inner.complete(metadata.clone()).await?;
            progress.finalized = true;
        }

        // Snapshot after finalization so the record carries the storage key
        // and final resource count.
        let bundle_ref = self.inner.bundle_ref();
        let key = pending_key(&self.recipe.recipe_id, &bundle_ref.bid);

        if !progress.pending_written {
            let record = json!({
                "bundle_ref": &bundle_ref,
                "metadata": &metadata,
                "timestamp": Utc::now().to_rfc3339(),
            });
            self.kv.put_json(&key, &record, None).await?;
            progress.pending_written = true;
            debug!(bid = %bundle_ref.bid, "PENDING_COMPLETION_RECORDED");
        }

        if !progress.hooks_done {
            PipelineStorage::run_completion_hooks(&self.recipe, &bundle_ref).await;
            progress.hooks_done = true;
        }

        if !progress.published {
            self.publisher
                .publish_bundle_completion(&bundle_ref, &metadata, &self.recipe.recipe_id)
                .await?;
            progress.published = true;
        }

        self.kv.delete(&key).await?;
        progress.done = true;
        debug!(bid = %bundle_ref.bid, "BUNDLE_COMPLETION_ACKNOWLEDGED");
        Ok(())
    }
}
