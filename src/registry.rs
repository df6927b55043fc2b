//! Recipe registry: maps data-registry identifiers onto recipe builders.
//!
//! Per-source recipe definitions are deployment concerns; the binary ships
//! with one generic HTTP recipe driven by `DATA_FETCHER_APP_URLS`, and
//! embedding applications register their own builders.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{bail, Result};

use datafetch_core::model::{FetcherRecipe, FetcherRecipeBuilder};
use datafetch_core::{RequestMeta, RequestParameterLocator};
use datafetch_http::{HttpBundleLoader, HttpManager, HttpProtocolConfig};
use datafetch_sftp::{
    DirectorySftpBundleLocator, ModifiedTimeSort, RusshConnector, SftpBundleLoader, SftpManager,
    SftpProtocolConfig,
};

use crate::settings::AppSettings;

pub type RecipeFactory =
    Arc<dyn Fn(&AppSettings) -> Result<Arc<FetcherRecipe>> + Send + Sync>;

#[derive(Default)]
pub struct RecipeRegistry {
    factories: HashMap<String, RecipeFactory>,
}

impl RecipeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in recipes.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register("http", Arc::new(build_http_url_list_recipe));
        registry.register("sftp", Arc::new(build_sftp_directory_recipe));
        registry
    }

    pub fn register(&mut self, data_registry_id: impl Into<String>, factory: RecipeFactory) {
        self.factories.insert(data_registry_id.into(), factory);
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.factories.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn build(
        &self,
        data_registry_id: &str,
        settings: &AppSettings,
    ) -> Result<Arc<FetcherRecipe>> {
        let Some(factory) = self.factories.get(data_registry_id) else {
            bail!(
                "unknown data registry id '{}'. Known ids: {}",
                data_registry_id,
                self.ids().join(", ")
            );
        };
        factory(settings)
    }
}

/// Generic recipe: fetch every URL in `DATA_FETCHER_APP_URLS` once.
fn build_http_url_list_recipe(settings: &AppSettings) -> Result<Arc<FetcherRecipe>> {
    if settings.request_urls.is_empty() {
        bail!("the 'http' recipe requires DATA_FETCHER_APP_URLS to be set");
    }

    let requests: Result<Vec<RequestMeta>, _> = settings
        .request_urls
        .iter()
        .map(|url| RequestMeta::new(url.clone()))
        .collect();
    let requests = requests?;

    let http_manager = Arc::new(HttpManager::new());
    let http_config = HttpProtocolConfig::new("http");

    let recipe = FetcherRecipeBuilder::new()
        .recipe_id("http")
        .add_bundle_locator(Arc::new(RequestParameterLocator::new(requests)))
        .use_bundle_loader(Arc::new(HttpBundleLoader::new(http_manager, http_config)))
        .build()?;
    Ok(Arc::new(recipe))
}

/// Generic recipe: mirror one SFTP directory, oldest files first.
/// Connection credentials come from the credential provider under the
/// `sftp` configuration name.
fn build_sftp_directory_recipe(settings: &AppSettings) -> Result<Arc<FetcherRecipe>> {
    let Some(remote_dir) = settings.sftp_remote_dir.clone() else {
        bail!("the 'sftp' recipe requires DATA_FETCHER_APP_SFTP_REMOTE_DIR to be set");
    };

    let manager = Arc::new(SftpManager::new(Arc::new(RusshConnector)));
    let config = SftpProtocolConfig::new("sftp");

    let locator = DirectorySftpBundleLocator::new(
        manager.clone(),
        config.clone(),
        remote_dir,
        settings.sftp_filename_pattern.clone(),
    )
    .with_file_sort(Arc::new(ModifiedTimeSort { descending: false }));

    let recipe = FetcherRecipeBuilder::new()
        .recipe_id("sftp")
        .add_bundle_locator(Arc::new(locator))
        .use_bundle_loader(Arc::new(SftpBundleLoader::new(manager, config)))
        .build()?;
    Ok(Arc::new(recipe))
}
