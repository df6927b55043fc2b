// Restart behavior: work left in the persistent queue is drained by the
// next run with the same run id, and pending completion records are
// replayed before any new work starts.

use std::sync::Arc;

use async_trait::async_trait;
use httpmock::prelude::*;
use parking_lot::Mutex;
use serde_json::{json, Value};

use datafetch_core::kv::{
    InMemoryKeyValueStore, KeyValueStore, KeyValueStoreExt, RequestMetaSerializer,
};
use datafetch_core::model::{AppConfig, BundleRef, CredentialProvider, FetcherRecipeBuilder};
use datafetch_core::storage::BundleStorage;
use datafetch_core::{
    Bid, FetchPlan, FetchRunContext, Fetcher, KvRequestQueue, RequestMeta,
    RequestParameterLocator, Result,
};
use datafetch_http::{HttpBundleLoader, HttpManager, HttpProtocolConfig};
use datafetch_notify::CompletionPublisher;
use datafetch_storage::{ObjectStoreStorage, PipelineStorage};

struct NullCredentials;

#[async_trait]
impl CredentialProvider for NullCredentials {
    async fn get(&self, _config_name: &str, _key: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<String>>,
}

#[async_trait]
impl CompletionPublisher for RecordingPublisher {
    async fn publish_bundle_completion(
        &self,
        bundle_ref: &BundleRef,
        _metadata: &Value,
        _recipe_id: &str,
    ) -> Result<()> {
        self.published.lock().push(bundle_ref.bid.to_string());
        Ok(())
    }
}

fn app_config(
    kv: Arc<dyn KeyValueStore>,
    publisher: Arc<RecordingPublisher>,
) -> (Arc<AppConfig>, ObjectStoreStorage) {
    let sink = ObjectStoreStorage::new_memory("data").unwrap();
    let storage: Arc<dyn BundleStorage> = Arc::new(PipelineStorage::new(
        Arc::new(sink.clone()),
        kv.clone(),
        publisher,
    ));
    (
        Arc::new(AppConfig {
            config_id: "resume".to_string(),
            credential_provider: Arc::new(NullCredentials),
            kv_store: kv,
            storage,
        }),
        sink,
    )
}

fn recipe_with_urls(urls: Vec<String>) -> Arc<datafetch_core::FetcherRecipe> {
    let requests: Vec<RequestMeta> = urls
        .into_iter()
        .map(|url| RequestMeta::new(url).unwrap())
        .collect();
    Arc::new(
        FetcherRecipeBuilder::new()
            .recipe_id("resume_recipe")
            .add_bundle_locator(Arc::new(RequestParameterLocator::new(requests)))
            .use_bundle_loader(Arc::new(HttpBundleLoader::new(
                Arc::new(HttpManager::new()),
                HttpProtocolConfig::new("resume")
                    .with_rate_limit(1000.0)
                    .with_max_retries(0),
            )))
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn queued_work_from_a_previous_run_is_drained() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/left-behind");
            then.status(200).body("recovered");
        })
        .await;

    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());

    // A previous process enqueued work under this run id and died before
    // processing it.
    let stale_queue = KvRequestQueue::new(
        kv.clone(),
        "fetch:run_resume",
        Box::new(RequestMetaSerializer),
    )
    .unwrap();
    stale_queue
        .enqueue(vec![RequestMeta::new(server.url("/left-behind")).unwrap()])
        .await
        .unwrap();

    // The next run brings no new work of its own.
    let publisher = Arc::new(RecordingPublisher::default());
    let (app_config, sink) = app_config(kv.clone(), publisher.clone());
    let recipe = recipe_with_urls(Vec::new());
    let context = Arc::new(FetchRunContext::new("run_resume", app_config));

    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();

    assert_eq!(result.processed_count, 1);
    assert!(result.errors.is_empty());
    assert_eq!(publisher.published.lock().len(), 1);

    // The recovered item made it all the way to storage.
    let entries = sink
        .operator()
        .list_with("")
        .recursive(true)
        .await
        .unwrap();
    assert!(entries
        .iter()
        .any(|entry| entry.path().ends_with("/left-behind")));

    // Queue counters are consistent and empty afterwards.
    assert_eq!(kv.get_u64("fetch:run_resume:size", 99).await.unwrap(), 0);
    assert!(kv.scan("fetch:run_resume:items:").await.unwrap().is_empty());
}

#[tokio::test]
async fn pending_completion_is_replayed_before_new_work() {
    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());

    // A bundle finished storing in a previous run, but the process died
    // before the completion notification went out.
    let mut stranded = BundleRef::new(Bid::mint(), "https://h/stranded");
    stranded.resources_count = 1;
    stranded.storage_key = Some("data/bundles/x/metadata.json".to_string());
    let pending_key = format!(
        "sqs_notifications:pending:resume_recipe:{}",
        stranded.bid
    );
    kv.put_json(
        &pending_key,
        &json!({
            "bundle_ref": &stranded,
            "metadata": {"source": "http"},
            "timestamp": "2023-01-01T00:00:00Z",
        }),
        None,
    )
    .await
    .unwrap();

    let publisher = Arc::new(RecordingPublisher::default());
    let (app_config, _sink) = app_config(kv.clone(), publisher.clone());
    let recipe = recipe_with_urls(Vec::new());
    let context = Arc::new(FetchRunContext::new("run_replay", app_config));

    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();

    // No new work, but the stranded completion was delivered exactly once
    // and its record removed.
    assert_eq!(result.processed_count, 0);
    assert_eq!(
        publisher.published.lock().clone(),
        vec![stranded.bid.to_string()]
    );
    assert!(!kv.exists(&pending_key).await.unwrap());
}

#[tokio::test]
async fn rerun_after_success_finds_nothing_pending() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/once");
            then.status(200).body("payload");
        })
        .await;

    let kv: Arc<dyn KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let publisher = Arc::new(RecordingPublisher::default());

    let (cfg, _sink) = app_config(kv.clone(), publisher.clone());
    let recipe = recipe_with_urls(vec![server.url("/once")]);
    let context = Arc::new(FetchRunContext::new("run_first", cfg));
    Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();
    assert_eq!(publisher.published.lock().len(), 1);

    // A second run over the same kv store replays nothing: the pending
    // record was deleted after the successful publish.
    let (cfg, _sink) = app_config(kv.clone(), publisher.clone());
    let recipe = recipe_with_urls(Vec::new());
    let context = Arc::new(FetchRunContext::new("run_second", cfg));
    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();

    assert_eq!(result.processed_count, 0);
    assert_eq!(publisher.published.lock().len(), 1);
}
