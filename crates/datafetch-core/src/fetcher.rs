//! The fetcher scheduler: one locator task feeding the persistent queue and
//! a pool of workers draining it through the loader and storage pipeline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{FetchError, Result};
use crate::kv::RequestMetaSerializer;
use crate::model::{FetchPlan, FetchRunContext, FetcherRecipe, RequestMeta};
use crate::queue::KvRequestQueue;

/// Sleep applied while the queue is full (locator side) or empty (workers).
const IDLE_SLEEP: Duration = Duration::from_millis(100);

/// Result of a fetch run. Partial runs succeed; the error list carries what
/// went wrong per work item.
#[derive(Debug)]
pub struct FetchResult {
    pub processed_count: u64,
    pub errors: Vec<String>,
    pub context: Arc<FetchRunContext>,
}

/// Orchestrates bundle locators, the loader, and storage for one run.
#[derive(Debug, Default)]
pub struct Fetcher;

impl Fetcher {
    pub fn new() -> Self {
        Fetcher
    }

    pub async fn run(&self, plan: FetchPlan) -> Result<FetchResult> {
        let run_ctx = plan.context.clone();
        let recipe = plan.recipe.clone();

        if run_ctx.run_id.trim().is_empty() {
            return Err(FetchError::configuration(
                "fetch_run_context",
                "run_id is required but was not provided",
            ));
        }
        if recipe.bundle_locators.is_empty() {
            return Err(FetchError::configuration(
                "bundle_locators",
                "no bundle locators configured in the fetcher recipe",
            ));
        }

        let storage = run_ctx.app_config.storage.clone();
        info!(storage = "on_run_start", "CALLING_STORAGE_ON_RUN_START_HOOK");
        storage.on_run_start(&run_ctx, &recipe).await?;

        info!(
            run_id = %run_ctx.run_id,
            concurrency = plan.concurrency,
            target_queue_size = plan.target_queue_size,
            bundle_locators = recipe.bundle_locators.len(),
            "FETCHER_RUN_STARTED"
        );

        let queue = Arc::new(KvRequestQueue::new(
            run_ctx.app_config.kv_store.clone(),
            format!("fetch:{}", run_ctx.run_id),
            Box::new(RequestMetaSerializer),
        )?);

        let completion_flag = Arc::new(AtomicBool::new(false));

        let locator_task = tokio::spawn(locator_thread(
            queue.clone(),
            completion_flag.clone(),
            plan.target_queue_size,
            recipe.clone(),
            run_ctx.clone(),
        ));

        let mut workers = Vec::with_capacity(plan.concurrency.max(1));
        for worker_id in 0..plan.concurrency.max(1) {
            workers.push(tokio::spawn(worker(
                worker_id,
                queue.clone(),
                recipe.clone(),
                run_ctx.clone(),
                completion_flag.clone(),
            )));
            debug!(worker_id, "WORKER_STARTED");
        }

        let initial_size = queue.size().await.unwrap_or(0);
        info!(queue_size = initial_size, "INITIAL_QUEUE_SIZE");

        if let Err(join_err) = locator_task.await {
            warn!(error = %join_err, "LOCATOR_TASK_PANICKED");
        }
        info!(run_id = %run_ctx.run_id, "LOCATOR_THREAD_COMPLETED");

        for worker_task in workers {
            if let Err(join_err) = worker_task.await {
                warn!(error = %join_err, "WORKER_TASK_PANICKED");
            }
        }
        info!(run_id = %run_ctx.run_id, "ALL_WORKERS_COMPLETED");

        queue.close().await?;

        Ok(FetchResult {
            processed_count: run_ctx.processed_count(),
            errors: run_ctx.errors(),
            context: run_ctx,
        })
    }
}

/// Keeps the queue near the target size by consulting locators in
/// declaration order, advancing to the next on exhaustion or error, and
/// raising the completion flag once all are spent.
async fn locator_thread(
    queue: Arc<KvRequestQueue<RequestMeta>>,
    completion_flag: Arc<AtomicBool>,
    target_queue_size: usize,
    recipe: Arc<FetcherRecipe>,
    run_ctx: Arc<FetchRunContext>,
) {
    info!(target_queue_size, "LOCATOR_THREAD_STARTED");

    enum Step {
        Exhausted,
        QueueFull,
        Enqueued,
    }

    let mut locator_index = 0;

    while !completion_flag.load(Ordering::SeqCst) {
        if locator_index >= recipe.bundle_locators.len() {
            let final_size = queue.size().await.unwrap_or(0);
            info!(queue_size = final_size, "ALL_LOCATORS_EXHAUSTED_SETTING_COMPLETION_FLAG");
            completion_flag.store(true, Ordering::SeqCst);
            break;
        }

        let iteration: Result<Step> = async {
            let current_size = queue.size().await?;
            if current_size as usize >= target_queue_size {
                return Ok(Step::QueueFull);
            }

            let needed = target_queue_size - current_size as usize;
            let locator = &recipe.bundle_locators[locator_index];
            debug!(
                locator_index,
                urls_needed = needed,
                current_queue_size = current_size,
                "REQUESTING_URLS_FROM_LOCATOR"
            );

            let requests = locator.next_requests(&run_ctx, needed).await?;
            debug!(locator_index, url_count = requests.len(), "RECEIVED_URLS_FROM_LOCATOR");

            if requests.is_empty() {
                return Ok(Step::Exhausted);
            }
            queue.enqueue(requests).await?;
            Ok(Step::Enqueued)
        }
        .await;

        match iteration {
            Ok(Step::Exhausted) => {
                locator_index += 1;
                debug!(
                    current_locator_index = locator_index,
                    total_locators = recipe.bundle_locators.len(),
                    "LOCATOR_EXHAUSTED_MOVING_TO_NEXT"
                );
            }
            Ok(Step::QueueFull) => {
                tokio::time::sleep(IDLE_SLEEP).await;
            }
            Ok(Step::Enqueued) => {}
            Err(err) => {
                if err.is_fatal() {
                    warn!(error = %err, locator_index, "LOCATOR_THREAD_FATAL_ERROR");
                } else {
                    warn!(error = %err, locator_index, "LOCATOR_THREAD_ERROR");
                }
                locator_index += 1;
            }
        }
    }

    if !completion_flag.load(Ordering::SeqCst) {
        completion_flag.store(true, Ordering::SeqCst);
    }
    info!("LOCATOR_THREAD_COMPLETED");
}

/// Drains the queue one request at a time until it is empty and the locator
/// thread has signalled completion.
async fn worker(
    worker_id: usize,
    queue: Arc<KvRequestQueue<RequestMeta>>,
    recipe: Arc<FetcherRecipe>,
    run_ctx: Arc<FetchRunContext>,
    completion_flag: Arc<AtomicBool>,
) {
    info!(worker_id, "WORKER_STARTED");

    loop {
        let requests = match queue.dequeue(1).await {
            Ok(requests) => requests,
            Err(err) => {
                warn!(worker_id, error = %err, "WORKER_DEQUEUE_ERROR");
                tokio::time::sleep(IDLE_SLEEP).await;
                continue;
            }
        };

        let Some(request) = requests.into_iter().next() else {
            if completion_flag.load(Ordering::SeqCst) {
                info!(worker_id, "NO_MORE_REQUESTS_WORKER_EXITING");
                break;
            }
            tokio::time::sleep(IDLE_SLEEP).await;
            continue;
        };

        debug!(worker_id, url = %request.url, "WORKER_PROCESS_URL");
        process_request(&request, &recipe, &run_ctx).await;
    }

    debug!(worker_id, "WORKER_COMPLETED");
}

/// Run one request through loader and post-processing hooks, converting any
/// failure into a recorded error so the run continues.
async fn process_request(
    request: &RequestMeta,
    recipe: &Arc<FetcherRecipe>,
    run_ctx: &Arc<FetchRunContext>,
) {
    let storage = run_ctx.app_config.storage.clone();

    let outcome: Result<()> = async {
        debug!(url = %request.url, "REQUEST_LOADING_WITH_LOADER");
        let bundle_refs = recipe
            .bundle_loader
            .load(request, &storage, run_ctx, recipe)
            .await?;
        debug!(url = %request.url, bundle_count = bundle_refs.len(), "REQUEST_LOADED_SUCCESSFULLY");

        for locator in &recipe.bundle_locators {
            locator
                .handle_request_processed(request, &bundle_refs, run_ctx)
                .await?;
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            debug!(url = %request.url, "REQUEST_PROCESSING_COMPLETED");
            run_ctx.increment_processed();
        }
        Err(err) => {
            for locator in &recipe.bundle_locators {
                if let Err(hook_err) = locator
                    .handle_bundle_error(request, &err.to_string(), run_ctx)
                    .await
                {
                    warn!(url = %request.url, error = %hook_err, "BUNDLE_ERROR_HOOK_FAILED");
                }
            }

            if err.is_fatal() {
                warn!(url = %request.url, error = %err, "REQUEST_PROCESSING_FATAL_ERROR");
            } else if err.is_transient() {
                warn!(url = %request.url, error = %err, "REQUEST_PROCESSING_NETWORK_ERROR");
            } else {
                warn!(url = %request.url, error = %err, "REQUEST_PROCESSING_ERROR");
            }
            run_ctx.record_error(format!("Error processing request {}: {}", request.url, err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bid::Bid;
    use crate::kv::InMemoryKeyValueStore;
    use crate::locator::{BundleLoader, RequestParameterLocator};
    use crate::model::{
        AppConfig, BundleRef, CredentialProvider, FetcherRecipeBuilder, ResourceMeta,
    };
    use crate::storage::{BundleStorage, BundleStorageContext, ByteStream};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::Value;

    struct RecordingStorage {
        run_start_calls: Mutex<u64>,
    }

    #[async_trait]
    impl BundleStorage for RecordingStorage {
        fn bundle_found(&self, _metadata: Value) -> Bid {
            Bid::mint()
        }

        async fn start_bundle(
            &self,
            bundle_ref: BundleRef,
            _recipe: Arc<FetcherRecipe>,
        ) -> Result<Arc<dyn BundleStorageContext>> {
            Ok(Arc::new(NullContext { bundle_ref }))
        }

        async fn on_run_start(
            &self,
            _ctx: &FetchRunContext,
            _recipe: &Arc<FetcherRecipe>,
        ) -> Result<()> {
            *self.run_start_calls.lock() += 1;
            Ok(())
        }
    }

    struct NullContext {
        bundle_ref: BundleRef,
    }

    #[async_trait]
    impl BundleStorageContext for NullContext {
        fn bundle_ref(&self) -> BundleRef {
            self.bundle_ref.clone()
        }

        async fn add_resource(
            &self,
            _resource_name: &str,
            _metadata: ResourceMeta,
            _stream: ByteStream,
        ) -> Result<()> {
            Ok(())
        }

        async fn complete(&self, _metadata: Value) -> Result<()> {
            Ok(())
        }
    }

    struct RecordingLoader {
        loaded: Mutex<Vec<String>>,
        fail_on: Option<String>,
    }

    #[async_trait]
    impl BundleLoader for RecordingLoader {
        async fn load(
            &self,
            request: &RequestMeta,
            storage: &Arc<dyn BundleStorage>,
            _ctx: &FetchRunContext,
            _recipe: &Arc<FetcherRecipe>,
        ) -> Result<Vec<BundleRef>> {
            if self.fail_on.as_deref() == Some(request.url.as_str()) {
                return Err(FetchError::network("connection refused"));
            }
            self.loaded.lock().push(request.url.clone());
            let bid = storage.bundle_found(Value::Null);
            Ok(vec![BundleRef::new(bid, request.url.clone())])
        }
    }

    struct NullCredentials;

    #[async_trait]
    impl CredentialProvider for NullCredentials {
        async fn get(&self, _config_name: &str, _key: &str) -> Result<String> {
            Ok(String::new())
        }
    }

    fn app_config(storage: Arc<dyn BundleStorage>) -> Arc<AppConfig> {
        Arc::new(AppConfig {
            config_id: "test".to_string(),
            credential_provider: Arc::new(NullCredentials),
            kv_store: Arc::new(InMemoryKeyValueStore::new()),
            storage,
        })
    }

    fn requests(urls: &[&str]) -> Vec<RequestMeta> {
        urls.iter().map(|u| RequestMeta::new(*u).unwrap()).collect()
    }

    #[tokio::test]
    async fn processes_all_requests() {
        let storage = Arc::new(RecordingStorage {
            run_start_calls: Mutex::new(0),
        });
        let loader = Arc::new(RecordingLoader {
            loaded: Mutex::new(Vec::new()),
            fail_on: None,
        });

        let recipe = Arc::new(
            FetcherRecipeBuilder::new()
                .recipe_id("test_recipe")
                .add_bundle_locator(Arc::new(RequestParameterLocator::new(requests(&[
                    "http://x/1",
                    "http://x/2",
                ]))))
                .use_bundle_loader(loader.clone())
                .build()
                .unwrap(),
        );

        let context = Arc::new(FetchRunContext::new("run_1", app_config(storage.clone())));
        let plan = FetchPlan::new(recipe, context).with_concurrency(2);

        let result = Fetcher::new().run(plan).await.unwrap();

        assert_eq!(result.processed_count, 2);
        assert!(result.errors.is_empty());
        assert_eq!(*storage.run_start_calls.lock(), 1);

        let mut loaded = loader.loaded.lock().clone();
        loaded.sort();
        assert_eq!(loaded, vec!["http://x/1".to_string(), "http://x/2".to_string()]);
    }

    #[tokio::test]
    async fn failed_request_is_recorded_and_run_continues() {
        let storage = Arc::new(RecordingStorage {
            run_start_calls: Mutex::new(0),
        });
        let loader = Arc::new(RecordingLoader {
            loaded: Mutex::new(Vec::new()),
            fail_on: Some("http://x/2".to_string()),
        });

        let recipe = Arc::new(
            FetcherRecipeBuilder::new()
                .add_bundle_locator(Arc::new(RequestParameterLocator::new(requests(&[
                    "http://x/1",
                    "http://x/2",
                    "http://x/3",
                ]))))
                .use_bundle_loader(loader)
                .build()
                .unwrap(),
        );

        let context = Arc::new(FetchRunContext::new("run_2", app_config(storage)));
        let result = Fetcher::new()
            .run(FetchPlan::new(recipe, context))
            .await
            .unwrap();

        assert_eq!(result.processed_count, 2);
        assert_eq!(result.errors.len(), 1);
        assert!(result.errors[0].starts_with("Error processing request http://x/2"));
    }

    #[tokio::test]
    async fn rejects_empty_run_id() {
        let storage = Arc::new(RecordingStorage {
            run_start_calls: Mutex::new(0),
        });
        let loader = Arc::new(RecordingLoader {
            loaded: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let recipe = Arc::new(
            FetcherRecipeBuilder::new()
                .add_bundle_locator(Arc::new(RequestParameterLocator::new(Vec::new())))
                .use_bundle_loader(loader)
                .build()
                .unwrap(),
        );
        let context = Arc::new(FetchRunContext::new("", app_config(storage)));

        let err = Fetcher::new()
            .run(FetchPlan::new(recipe, context))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Configuration { .. }));
    }

    #[tokio::test]
    async fn rejects_missing_locators() {
        let storage = Arc::new(RecordingStorage {
            run_start_calls: Mutex::new(0),
        });
        let loader = Arc::new(RecordingLoader {
            loaded: Mutex::new(Vec::new()),
            fail_on: None,
        });
        let recipe = Arc::new(
            FetcherRecipeBuilder::new()
                .use_bundle_loader(loader)
                .build()
                .unwrap(),
        );
        let context = Arc::new(FetchRunContext::new("run_3", app_config(storage)));

        let err = Fetcher::new()
            .run(FetchPlan::new(recipe, context))
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Configuration { .. }));
    }

    #[tokio::test]
    async fn consults_locators_in_declaration_order() {
        let storage = Arc::new(RecordingStorage {
            run_start_calls: Mutex::new(0),
        });
        let loader = Arc::new(RecordingLoader {
            loaded: Mutex::new(Vec::new()),
            fail_on: None,
        });

        let recipe = Arc::new(
            FetcherRecipeBuilder::new()
                .add_bundle_locator(Arc::new(RequestParameterLocator::new(requests(&[
                    "http://first/1",
                ]))))
                .add_bundle_locator(Arc::new(RequestParameterLocator::new(requests(&[
                    "http://second/1",
                ]))))
                .use_bundle_loader(loader.clone())
                .build()
                .unwrap(),
        );

        let context = Arc::new(FetchRunContext::new("run_4", app_config(storage)));
        let result = Fetcher::new()
            .run(FetchPlan::new(recipe, context))
            .await
            .unwrap();

        assert_eq!(result.processed_count, 2);
        let loaded = loader.loaded.lock().clone();
        assert_eq!(loaded.len(), 2);
    }
}
