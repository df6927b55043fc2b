//! HTTP bundle loader: streams one response into the storage pipeline.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::Method;
use serde_json::json;
use tracing::{debug, warn};

use datafetch_core::locator::BID_FLAG;
use datafetch_core::model::{BundleRef, FetchRunContext, FetcherRecipe, RequestMeta, ResourceMeta};
use datafetch_core::storage::{BundleStorage, ByteStream};
use datafetch_core::{Bid, BundleLoader, Result};

use crate::config::HttpProtocolConfig;
use crate::manager::HttpManager;

pub struct HttpBundleLoader {
    http_manager: Arc<HttpManager>,
    http_config: HttpProtocolConfig,
}

impl HttpBundleLoader {
    pub fn new(http_manager: Arc<HttpManager>, http_config: HttpProtocolConfig) -> Self {
        HttpBundleLoader {
            http_manager,
            http_config,
        }
    }

    /// Adopt a bid carried by a bundle-flavor locator, or mint a fresh one
    /// through the storage layer.
    fn resolve_bid(request: &RequestMeta, storage: &Arc<dyn BundleStorage>) -> Bid {
        request
            .flags
            .get(BID_FLAG)
            .and_then(|value| value.as_str())
            .and_then(|raw| Bid::parse(raw).ok())
            .unwrap_or_else(|| {
                storage.bundle_found(json!({
                    "source": "http",
                    "primary_url": &request.url,
                }))
            })
    }
}

#[async_trait]
impl BundleLoader for HttpBundleLoader {
    async fn load(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn BundleStorage>,
        ctx: &FetchRunContext,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>> {
        let bid = Self::resolve_bid(request, storage);
        let bundle_ref = BundleRef::new(bid, request.url.clone());
        let context = storage.start_bundle(bundle_ref, recipe.clone()).await?;

        let response = match self
            .http_manager
            .request(
                &self.http_config,
                ctx,
                Method::GET,
                &request.url,
                Some(request.headers.clone()),
            )
            .await
        {
            Ok(response) => response,
            Err(err) => {
                // Request-level failure before any stream write: no partial
                // bundle is finalized.
                warn!(url = %request.url, error = %err, "HTTP_LOAD_REQUEST_FAILED");
                return Ok(Vec::new());
            }
        };

        let status = response.status().as_u16();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let response_headers: HashMap<String, String> = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.to_string(), v.to_string()))
            })
            .collect();

        debug!(url = %request.url, status, "HTTP_RESPONSE_STREAMING");

        let metadata = ResourceMeta {
            url: request.url.clone(),
            status: Some(status),
            content_type,
            headers: response_headers,
            note: None,
            derived_from: None,
        };

        let stream: ByteStream = Box::pin(
            response
                .bytes_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e)),
        );

        // Error statuses are stored too; dropping them is a recipe-level
        // decision, not the loader's.
        context.add_resource(&request.url, metadata, stream).await?;
        context
            .complete(json!({
                "source": "http",
                "run_id": &ctx.run_id,
                "url": &request.url,
                "status_code": status,
            }))
            .await?;

        Ok(vec![context.bundle_ref()])
    }
}
