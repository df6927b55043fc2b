//! Bundle storage trait seams and the byte-stream type that flows through
//! the decorator chain.
//!
//! Implementations live in `datafetch-storage`; the traits are defined here
//! so loaders and the scheduler can depend on them without pulling in any
//! storage backend.

use std::io;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

use crate::bid::Bid;
use crate::error::Result;
use crate::model::{BundleRef, FetchRunContext, FetcherRecipe, ResourceMeta};

/// Stream of resource bytes. Producers yield bounded chunks; consumers must
/// never need the whole payload in memory.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

/// Wrap a fully materialized payload as a single-chunk stream.
pub fn stream_from_bytes(data: impl Into<Bytes>) -> ByteStream {
    Box::pin(futures_util::stream::iter([Ok(data.into())]))
}

/// Drain a stream into memory. Test and inspection helper; production paths
/// stay streaming.
pub async fn collect_stream(mut stream: ByteStream) -> io::Result<Vec<u8>> {
    let mut collected = Vec::new();
    while let Some(chunk) = stream.next().await {
        collected.extend_from_slice(&chunk?);
    }
    Ok(collected)
}

/// A storage backend (or decorator wrapping one).
#[async_trait]
pub trait BundleStorage: Send + Sync {
    /// Mint a bundle identifier for a newly discovered bundle. Decorators
    /// pass this through to the terminal storage.
    fn bundle_found(&self, metadata: Value) -> Bid;

    /// Open a bundle for writing and return the context that manages its
    /// lifecycle.
    async fn start_bundle(
        &self,
        bundle_ref: BundleRef,
        recipe: Arc<FetcherRecipe>,
    ) -> Result<Arc<dyn BundleStorageContext>>;

    /// Invoked once per run before any work; used for crash recovery.
    async fn on_run_start(
        &self,
        _ctx: &FetchRunContext,
        _recipe: &Arc<FetcherRecipe>,
    ) -> Result<()> {
        Ok(())
    }
}

/// Per-bundle write handle. `add_resource` calls within one bundle are
/// serialized by the caller; decorators may fork sub-streams but every
/// sub-stream completes before `complete` returns.
#[async_trait]
pub trait BundleStorageContext: Send + Sync {
    /// Snapshot of the bundle reference, including the current resource
    /// count and the storage key once assigned.
    fn bundle_ref(&self) -> BundleRef;

    async fn add_resource(
        &self,
        resource_name: &str,
        metadata: ResourceMeta,
        stream: ByteStream,
    ) -> Result<()>;

    /// Finalize the bundle. Idempotent: a second call after success is a
    /// no-op; after a failure it resumes from the failed step.
    async fn complete(&self, metadata: Value) -> Result<()>;
}
