// datafetch - configurable data-acquisition engine
//
// Long-lived worker pulling bundles of bytes from HTTP and SFTP sources into
// an object-store-backed pipeline, driven by declarative per-source recipes.
// This crate wires the engine together: settings from the environment,
// credential providers, the recipe registry, and the run/health commands
// behind the CLI.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{error, info};

use datafetch_core::kv::KeyValueStore;
use datafetch_core::model::{FetchPlan, FetchRunContext};
use datafetch_core::{FetchResult, Fetcher};

pub mod credentials;
pub mod registry;
pub mod settings;

pub use registry::RecipeRegistry;
pub use settings::{AppSettings, LogFormat};

/// Run identifier: `fetcher_{data_registry_id}_{YYYYMMDDHHMMSS}`.
pub fn generate_run_id(data_registry_id: &str) -> String {
    format!(
        "fetcher_{}_{}",
        data_registry_id,
        Utc::now().format("%Y%m%d%H%M%S")
    )
}

/// Install the global tracing subscriber.
pub fn init_logging(settings: &AppSettings) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(settings.log_level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    let result = match settings.log_format {
        LogFormat::Json => builder.json().try_init(),
        LogFormat::Text => builder.try_init(),
    };
    // A second init (tests, embedding) keeps the existing subscriber.
    let _ = result;
}

/// Execute one fetch run for `data_registry_id`.
pub async fn run_command(
    data_registry_id: &str,
    settings: &AppSettings,
    registry: &RecipeRegistry,
) -> Result<FetchResult> {
    let run_id = generate_run_id(data_registry_id);
    info!(run_id = %run_id, data_registry_id, "FETCH_RUN_PREPARING");

    let app_config = settings::build_app_config(settings, data_registry_id)
        .await
        .context("failed to build application components")?;
    let recipe = registry
        .build(data_registry_id, settings)
        .context("failed to build recipe")?;

    let context = Arc::new(FetchRunContext::new(run_id, app_config));
    let plan = FetchPlan::new(recipe, context)
        .with_concurrency(settings.concurrency)
        .with_target_queue_size(settings.target_queue_size);

    let result = Fetcher::new().run(plan).await?;

    info!(
        processed_count = result.processed_count,
        error_count = result.errors.len(),
        "FETCH_RUN_COMPLETED"
    );
    for error in &result.errors {
        error!(error = %error, "FETCH_RUN_ITEM_ERROR");
    }
    Ok(result)
}

/// Verify that the configured components are reachable.
pub async fn health_command(settings: &AppSettings) -> Result<()> {
    // Key-value store round-trip.
    let app_config = settings::build_app_config(settings, "health").await?;
    let probe_key = "health:probe";
    app_config
        .kv_store
        .put(probe_key, b"ok".to_vec(), None)
        .await
        .context("kv store write failed")?;
    let read_back = app_config
        .kv_store
        .get(probe_key)
        .await
        .context("kv store read failed")?;
    anyhow::ensure!(read_back.as_deref() == Some(b"ok".as_slice()), "kv store round-trip mismatch");
    app_config.kv_store.delete(probe_key).await.ok();

    // Storage operator reachability.
    let sink = settings::build_sink(settings)?;
    sink.operator()
        .check()
        .await
        .context("storage backend check failed")?;

    info!("HEALTH_CHECK_PASSED");
    println!("healthy");
    Ok(())
}
