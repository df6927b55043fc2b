//! SFTP bundle loader: streams one remote file into the storage pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use datafetch_core::locator::BID_FLAG;
use datafetch_core::model::{BundleRef, FetchRunContext, FetcherRecipe, RequestMeta, ResourceMeta};
use datafetch_core::storage::BundleStorage;
use datafetch_core::{Bid, BundleLoader, Result};

use crate::config::SftpProtocolConfig;
use crate::manager::SftpManager;

pub struct SftpBundleLoader {
    manager: Arc<SftpManager>,
    config: SftpProtocolConfig,
}

impl SftpBundleLoader {
    pub fn new(manager: Arc<SftpManager>, config: SftpProtocolConfig) -> Self {
        SftpBundleLoader { manager, config }
    }
}

#[async_trait]
impl BundleLoader for SftpBundleLoader {
    async fn load(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn BundleStorage>,
        ctx: &FetchRunContext,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>> {
        let remote_path = request
            .url
            .strip_prefix("sftp://")
            .unwrap_or(&request.url)
            .to_string();

        let bid = request
            .flags
            .get(BID_FLAG)
            .and_then(|value| value.as_str())
            .and_then(|raw| Bid::parse(raw).ok())
            .unwrap_or_else(|| {
                storage.bundle_found(json!({
                    "source": "sftp",
                    "primary_url": &request.url,
                }))
            });
        let bundle_ref = BundleRef::new(bid, request.url.clone());
        let context = storage.start_bundle(bundle_ref, recipe.clone()).await?;

        let stream = match self.manager.open(&self.config, ctx, &remote_path).await {
            Ok(stream) => stream,
            Err(err) => {
                // Open failed before any stream write: no partial bundle.
                warn!(path = %remote_path, error = %err, "SFTP_LOAD_OPEN_FAILED");
                return Ok(Vec::new());
            }
        };

        debug!(path = %remote_path, "SFTP_FILE_STREAMING");

        let metadata = ResourceMeta::new(request.url.clone())
            .with_content_type("application/octet-stream");
        context.add_resource(&request.url, metadata, stream).await?;
        context
            .complete(json!({
                "source": "sftp",
                "run_id": &ctx.run_id,
                "remote_path": remote_path,
            }))
            .await?;

        Ok(vec![context.bundle_ref()])
    }
}
