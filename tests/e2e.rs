// End-to-end tests for the fetch pipeline: locators -> queue -> loader ->
// storage decorators -> object store -> completion notifications, using an
// in-memory object store and a mock HTTP endpoint.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use httpmock::prelude::*;
use parking_lot::Mutex;
use serde_json::Value;

use datafetch_core::kv::{InMemoryKeyValueStore, KeyValueStore};
use datafetch_core::model::{AppConfig, BundleRef, CredentialProvider, FetcherRecipeBuilder};
use datafetch_core::storage::BundleStorage;
use datafetch_core::{
    FetchPlan, FetchRunContext, Fetcher, RequestMeta, RequestParameterLocator, Result,
};
use datafetch_http::{HttpBundleLoader, HttpManager, HttpProtocolConfig};
use datafetch_notify::CompletionPublisher;
use datafetch_storage::{ObjectStoreStorage, PipelineStorage, TarGzDecorator, UnzipDecorator};

struct NullCredentials;

#[async_trait]
impl CredentialProvider for NullCredentials {
    async fn get(&self, _config_name: &str, _key: &str) -> Result<String> {
        Ok(String::new())
    }
}

#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl CompletionPublisher for RecordingPublisher {
    async fn publish_bundle_completion(
        &self,
        bundle_ref: &BundleRef,
        _metadata: &Value,
        recipe_id: &str,
    ) -> Result<()> {
        self.published
            .lock()
            .push((bundle_ref.bid.to_string(), recipe_id.to_string()));
        Ok(())
    }
}

struct Harness {
    sink: ObjectStoreStorage,
    publisher: Arc<RecordingPublisher>,
    app_config: Arc<AppConfig>,
}

fn harness(use_unzip: bool) -> Harness {
    let sink = ObjectStoreStorage::new_memory("data").unwrap();
    let kv: Arc<dyn datafetch_core::kv::KeyValueStore> = Arc::new(InMemoryKeyValueStore::new());
    let publisher = Arc::new(RecordingPublisher::default());

    let mut chain: Arc<dyn BundleStorage> = Arc::new(sink.clone());
    if use_unzip {
        chain = Arc::new(UnzipDecorator::new(chain));
    }
    chain = Arc::new(TarGzDecorator::new(chain));
    let storage: Arc<dyn BundleStorage> = Arc::new(PipelineStorage::new(
        chain,
        kv.clone(),
        publisher.clone(),
    ));

    let app_config = Arc::new(AppConfig {
        config_id: "e2e".to_string(),
        credential_provider: Arc::new(NullCredentials),
        kv_store: kv,
        storage,
    });

    Harness {
        sink,
        publisher,
        app_config,
    }
}

async fn all_keys(sink: &ObjectStoreStorage) -> Vec<String> {
    let entries = sink
        .operator()
        .list_with("")
        .recursive(true)
        .await
        .unwrap();
    let mut keys: Vec<String> = entries
        .into_iter()
        .filter(|entry| !entry.path().ends_with('/'))
        .map(|entry| entry.path().to_string())
        .collect();
    keys.sort();
    keys
}

fn http_recipe(urls: Vec<String>) -> Arc<datafetch_core::FetcherRecipe> {
    let requests: Vec<RequestMeta> = urls
        .into_iter()
        .map(|url| RequestMeta::new(url).unwrap())
        .collect();
    Arc::new(
        FetcherRecipeBuilder::new()
            .recipe_id("e2e_recipe")
            .add_bundle_locator(Arc::new(RequestParameterLocator::new(requests)))
            .use_bundle_loader(Arc::new(HttpBundleLoader::new(
                Arc::new(HttpManager::new()),
                HttpProtocolConfig::new("e2e")
                    .with_rate_limit(1000.0)
                    .with_max_retries(0),
            )))
            .build()
            .unwrap(),
    )
}

#[tokio::test]
async fn two_urls_end_to_end() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/1");
            then.status(200).body("A");
        })
        .await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/2");
            then.status(200).body("B");
        })
        .await;

    let harness = harness(false);
    let recipe = http_recipe(vec![server.url("/1"), server.url("/2")]);
    let context = Arc::new(FetchRunContext::new("run_e2e_1", harness.app_config.clone()));

    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context).with_concurrency(2))
        .await
        .unwrap();

    assert_eq!(result.processed_count, 2);
    assert!(result.errors.is_empty());

    let keys = all_keys(&harness.sink).await;
    // One resource object and one metadata object per bundle.
    assert_eq!(keys.len(), 4);
    assert_eq!(keys.iter().filter(|k| k.ends_with("metadata.json")).count(), 2);

    let mut bodies = Vec::new();
    for key in keys.iter().filter(|k| !k.ends_with("metadata.json")) {
        bodies.push(harness.sink.operator().read(key).await.unwrap().to_vec());
    }
    bodies.sort();
    assert_eq!(bodies, vec![b"A".to_vec(), b"B".to_vec()]);

    // Completion notifications for both bundles, tagged with the recipe.
    let published = harness.publisher.published.lock().clone();
    assert_eq!(published.len(), 2);
    assert!(published.iter().all(|(_, recipe)| recipe == "e2e_recipe"));
    assert_ne!(published[0].0, published[1].0);

    // Queue namespace is drained after the run.
    let kv = harness.app_config.kv_store.clone();
    assert!(kv.scan("fetch:run_e2e_1:items:").await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_url_is_reported_and_rest_succeed() {
    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/ok");
            then.status(200).body("fine");
        })
        .await;

    let harness = harness(false);
    // The second URL points at a closed port.
    let recipe = http_recipe(vec![
        server.url("/ok"),
        "http://127.0.0.1:9/unreachable".to_string(),
    ]);
    let context = Arc::new(FetchRunContext::new("run_e2e_2", harness.app_config.clone()));

    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();

    // A request-level failure yields an empty bundle list, not an error.
    assert_eq!(result.processed_count, 2);
    assert_eq!(harness.publisher.published.lock().len(), 1);
}

fn tar_gz_fixture(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, name, *contents).unwrap();
    }
    let tar = builder.into_inner().unwrap();

    let mut encoder = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(&tar).unwrap();
    encoder.finish().unwrap()
}

#[tokio::test]
async fn archive_suffix_bypasses_extraction() {
    let server = MockServer::start_async().await;
    let payload = tar_gz_fixture(&[("x.txt", b"hello"), ("y.txt", b"world")]);
    server
        .mock_async(|when, then| {
            when.method(GET).path("/pkg.tar.gz");
            then.status(200)
                .header("content-type", "application/gzip")
                .body(payload.clone());
        })
        .await;

    let harness = harness(false);
    let recipe = http_recipe(vec![server.url("/pkg.tar.gz")]);
    let context = Arc::new(FetchRunContext::new("run_e2e_3", harness.app_config.clone()));

    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();
    assert_eq!(result.processed_count, 1);

    let keys = all_keys(&harness.sink).await;
    // Suffix stripped, no extracted members: one object plus metadata.
    assert_eq!(keys.len(), 2);
    let object_key = keys.iter().find(|k| !k.ends_with("metadata.json")).unwrap();
    assert!(object_key.ends_with("/pkg"));

    let stored = harness.sink.operator().read(object_key).await.unwrap().to_vec();
    assert_eq!(stored, payload);
}

#[tokio::test]
async fn unsuffixed_archive_fans_out_members() {
    let server = MockServer::start_async().await;
    let payload = tar_gz_fixture(&[("x.txt", b"hello"), ("y.txt", b"world")]);
    server
        .mock_async(|when, then| {
            when.method(GET).path("/pkg");
            then.status(200)
                .header("content-type", "application/octet-stream")
                .body(payload.clone());
        })
        .await;

    let harness = harness(false);
    let recipe = http_recipe(vec![server.url("/pkg")]);
    let context = Arc::new(FetchRunContext::new("run_e2e_4", harness.app_config.clone()));

    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();
    assert_eq!(result.processed_count, 1);

    let keys = all_keys(&harness.sink).await;
    // Original, two extracted members, one metadata object.
    assert_eq!(keys.len(), 4);

    let x_key = keys.iter().find(|k| k.ends_with("/pkg/x.txt")).unwrap();
    let y_key = keys.iter().find(|k| k.ends_with("/pkg/y.txt")).unwrap();
    assert_eq!(
        harness.sink.operator().read(x_key).await.unwrap().to_vec(),
        b"hello"
    );
    assert_eq!(
        harness.sink.operator().read(y_key).await.unwrap().to_vec(),
        b"world"
    );

    // The bundle metadata lists every uploaded key.
    let metadata_key = keys.iter().find(|k| k.ends_with("metadata.json")).unwrap();
    let metadata: Value = serde_json::from_slice(
        &harness.sink.operator().read(metadata_key).await.unwrap().to_vec(),
    )
    .unwrap();
    assert_eq!(metadata["resources_count"], 3);
    assert_eq!(metadata["uploaded_keys"].as_array().unwrap().len(), 3);
}

#[tokio::test]
async fn zip_decorator_in_the_chain_extracts_entries() {
    let server = MockServer::start_async().await;

    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    writer.start_file("inner.txt", options).unwrap();
    writer.write_all(b"zipped contents").unwrap();
    let payload = writer.finish().unwrap().into_inner();

    server
        .mock_async(|when, then| {
            when.method(GET).path("/bundle");
            then.status(200)
                .header("content-type", "application/octet-stream")
                .body(payload.clone());
        })
        .await;

    let harness = harness(true);
    let recipe = http_recipe(vec![server.url("/bundle")]);
    let context = Arc::new(FetchRunContext::new("run_e2e_5", harness.app_config.clone()));

    let result = Fetcher::new()
        .run(FetchPlan::new(recipe, context))
        .await
        .unwrap();
    assert_eq!(result.processed_count, 1);

    let keys = all_keys(&harness.sink).await;
    let entry_key = keys
        .iter()
        .find(|k| k.ends_with("/bundle/inner.txt"))
        .expect("extracted zip entry stored");
    assert_eq!(
        harness.sink.operator().read(entry_key).await.unwrap().to_vec(),
        b"zipped contents"
    );
}
