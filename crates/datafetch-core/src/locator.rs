//! Locator and loader trait seams, plus the static request locator.
//!
//! A locator is a resumable generator of work items; a loader streams the
//! bytes for one work item into a bundle storage context. Locators that mint
//! bundle references up front (the SFTP family) carry the bid in
//! `RequestMeta.flags["bid"]` so only the request travels through the queue.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::Result;
use crate::model::{BundleRef, FetchRunContext, FetcherRecipe, RequestMeta};
use crate::storage::BundleStorage;

/// Flag key under which bundle-flavor locators carry a pre-minted bid.
pub const BID_FLAG: &str = "bid";

#[async_trait]
pub trait BundleLocator: Send + Sync {
    /// Produce up to `wanted` new work items. An empty return signals
    /// temporary exhaustion; the scheduler moves on to the next locator.
    async fn next_requests(
        &self,
        ctx: &FetchRunContext,
        wanted: usize,
    ) -> Result<Vec<RequestMeta>>;

    /// Called after a work item produced by any locator was loaded
    /// successfully.
    async fn handle_request_processed(
        &self,
        _request: &RequestMeta,
        _bundle_refs: &[BundleRef],
        _ctx: &FetchRunContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Called after a work item failed to load.
    async fn handle_bundle_error(
        &self,
        _request: &RequestMeta,
        _error: &str,
        _ctx: &FetchRunContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Fired after the completion notification for a bundle was handled.
    async fn on_bundle_complete(&self, _bundle_ref: &BundleRef) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait BundleLoader: Send + Sync {
    /// Stream the bytes for one work item into the storage pipeline and
    /// return the bundle references that were produced.
    async fn load(
        &self,
        request: &RequestMeta,
        storage: &Arc<dyn BundleStorage>,
        ctx: &FetchRunContext,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<Vec<BundleRef>>;

    /// Fired after the completion notification for a bundle was handled.
    async fn on_bundle_complete(&self, _bundle_ref: &BundleRef) -> Result<()> {
        Ok(())
    }
}

const REQUEST_BATCH_SIZE: usize = 10;

/// Locator that serves a pre-defined request list, batched up to ten per
/// call, and reports exhaustion once the list is drained.
pub struct RequestParameterLocator {
    queue: Mutex<VecDeque<RequestMeta>>,
    exhausted: Mutex<bool>,
}

impl RequestParameterLocator {
    pub fn new(requests: Vec<RequestMeta>) -> Self {
        RequestParameterLocator {
            queue: Mutex::new(requests.into()),
            exhausted: Mutex::new(false),
        }
    }
}

#[async_trait]
impl BundleLocator for RequestParameterLocator {
    async fn next_requests(
        &self,
        _ctx: &FetchRunContext,
        wanted: usize,
    ) -> Result<Vec<RequestMeta>> {
        if *self.exhausted.lock() {
            return Ok(Vec::new());
        }

        let batch_size = wanted.min(REQUEST_BATCH_SIZE);
        let mut queue = self.queue.lock();
        let mut batch = Vec::with_capacity(batch_size);
        while batch.len() < batch_size {
            match queue.pop_front() {
                Some(request) => batch.push(request),
                None => break,
            }
        }

        if queue.is_empty() {
            *self.exhausted.lock() = true;
        }
        Ok(batch)
    }
}
