//! ZIP extraction decorator.
//!
//! Same skeleton as the tar/gz decorator: bypass for intentional archive
//! artifacts, tee otherwise, extract one derived resource per entry. The
//! bypass content-type table mirrors the tar/gz decorator and intentionally
//! does not list `application/zip`; only the `.zip` path suffix triggers a
//! bypass for zip payloads.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use datafetch_core::model::{BundleRef, FetcherRecipe, ResourceMeta};
use datafetch_core::storage::{BundleStorage, BundleStorageContext, ByteStream};
use datafetch_core::{Bid, FetchError, Result};

use crate::targz::strip_suffix;
use crate::tee::{channel_stream, tee_pair, DEFAULT_HIGH_WATER_CHUNKS};

const ZIP_MAGIC: [u8; 4] = [0x50, 0x4b, 0x03, 0x04];
const EXTRACT_CHUNK: usize = 8 * 1024;

const ZIP_SUFFIXES: [&str; 1] = [".zip"];
const BYPASS_CONTENT_TYPES: [&str; 3] =
    ["application/gzip", "application/x-tar", "application/x-gtar"];

/// Decorator that extracts ZIP archives into derived resources.
pub struct UnzipDecorator {
    inner: Arc<dyn BundleStorage>,
}

impl UnzipDecorator {
    pub fn new(inner: Arc<dyn BundleStorage>) -> Self {
        UnzipDecorator { inner }
    }
}

#[async_trait]
impl BundleStorage for UnzipDecorator {
    fn bundle_found(&self, metadata: Value) -> Bid {
        self.inner.bundle_found(metadata)
    }

    async fn start_bundle(
        &self,
        bundle_ref: BundleRef,
        recipe: Arc<FetcherRecipe>,
    ) -> Result<Arc<dyn BundleStorageContext>> {
        let inner = self.inner.start_bundle(bundle_ref, recipe).await?;
        Ok(Arc::new(UnzipBundleContext { inner }))
    }

    async fn on_run_start(
        &self,
        ctx: &datafetch_core::FetchRunContext,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<()> {
        self.inner.on_run_start(ctx, recipe).await
    }
}

fn should_bypass(url: &str, content_type: Option<&str>) -> bool {
    let path = url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string());
    if ZIP_SUFFIXES.iter().any(|s| path.ends_with(s)) {
        return true;
    }
    if let Some(ct) = content_type {
        if BYPASS_CONTENT_TYPES.iter().any(|known| ct.contains(known)) {
            return true;
        }
    }
    false
}

struct UnzipBundleContext {
    inner: Arc<dyn BundleStorageContext>,
}

#[async_trait]
impl BundleStorageContext for UnzipBundleContext {
    fn bundle_ref(&self) -> BundleRef {
        self.inner.bundle_ref()
    }

    async fn add_resource(
        &self,
        resource_name: &str,
        metadata: ResourceMeta,
        stream: ByteStream,
    ) -> Result<()> {
        let stripped = strip_suffix(resource_name, &ZIP_SUFFIXES);

        if should_bypass(&metadata.url, metadata.content_type.as_deref()) {
            debug!(resource_name, "ZIP_BYPASS");
            return self.inner.add_resource(&stripped, metadata, stream).await;
        }

        let (passthrough, inspect) = tee_pair(stream, DEFAULT_HIGH_WATER_CHUNKS);

        let inner = self.inner.clone();
        let passthrough_name = stripped.clone();
        let passthrough_meta = metadata.clone();
        let passthrough_task = tokio::spawn(async move {
            inner
                .add_resource(&passthrough_name, passthrough_meta, passthrough)
                .await
        });

        if let Err(err) = self
            .process_for_zip(resource_name, &stripped, &metadata, inspect)
            .await
        {
            warn!(resource_name, error = %err, "ZIP_EXTRACTION_ERROR");
        }

        passthrough_task
            .await
            .map_err(|e| FetchError::storage_from("unzip_decorator", "passthrough task failed", e))?
    }

    async fn complete(&self, metadata: Value) -> Result<()> {
        self.inner.complete(metadata).await
    }
}

impl UnzipBundleContext {
    async fn process_for_zip(
        &self,
        resource_name: &str,
        stripped: &str,
        metadata: &ResourceMeta,
        mut stream: ByteStream,
    ) -> Result<()> {
        let mut sniff = Vec::with_capacity(ZIP_MAGIC.len());
        let mut buffered: Vec<Bytes> = Vec::new();
        while sniff.len() < ZIP_MAGIC.len() {
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| {
                        FetchError::storage_from("unzip_decorator", "inspection stream failed", e)
                    })?;
                    sniff.extend_from_slice(&chunk);
                    buffered.push(chunk);
                }
                None => break,
            }
        }

        if sniff.len() < ZIP_MAGIC.len() || sniff[..ZIP_MAGIC.len()] != ZIP_MAGIC {
            debug!(resource_name, "FILE_NOT_A_ZIP_ARCHIVE");
            return Ok(());
        }

        // The central directory lives at the end of the file, so extraction
        // needs a seekable handle.
        let spool = crate::targz::spool_for_inspection(buffered, stream).await?;

        let (tx, mut rx) = mpsc::channel::<DerivedZipEntry>(2);
        let spool_path = spool.to_path_buf();
        let original_name = resource_name.to_string();
        let stripped_name = stripped.to_string();
        let base_meta = metadata.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            extract_zip_blocking(&spool_path, &original_name, &stripped_name, &base_meta, &tx)
        });

        while let Some(derived) = rx.recv().await {
            debug!(name = %derived.name, derived_from = resource_name, "DERIVED_RESOURCE_EMITTED");
            self.inner
                .add_resource(&derived.name, derived.metadata, derived.stream)
                .await?;
        }

        let result = extraction
            .await
            .map_err(|e| FetchError::storage_from("unzip_decorator", "extraction task failed", e))?;
        drop(spool);
        result
    }
}

struct DerivedZipEntry {
    name: String,
    metadata: ResourceMeta,
    stream: ByteStream,
}

fn extract_zip_blocking(
    spool: &Path,
    original_name: &str,
    stripped_name: &str,
    base_meta: &ResourceMeta,
    tx: &mpsc::Sender<DerivedZipEntry>,
) -> Result<()> {
    let file = std::fs::File::open(spool)
        .map_err(|e| FetchError::storage_from("unzip_decorator", "spool open failed", e))?;
    let mut archive = zip::ZipArchive::new(file)
        .map_err(|e| FetchError::storage_from("unzip_decorator", "zip parse failed", e))?;

    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|e| FetchError::storage_from("unzip_decorator", "zip entry failed", e))?;
        if !entry.is_file() {
            continue;
        }

        let derived_name = format!("{stripped_name}/{}", entry.name());
        let metadata = ResourceMeta {
            url: derived_name.clone(),
            status: base_meta.status,
            content_type: Some("application/octet-stream".to_string()),
            headers: base_meta.headers.clone(),
            note: None,
            derived_from: Some(original_name.to_string()),
        };

        let (chunk_tx, stream) = channel_stream(8);
        if tx
            .blocking_send(DerivedZipEntry {
                name: derived_name,
                metadata,
                stream,
            })
            .is_err()
        {
            return Ok(());
        }

        let mut buffer = vec![0u8; EXTRACT_CHUNK];
        loop {
            let read = entry.read(&mut buffer).map_err(|e| {
                FetchError::storage_from("unzip_decorator", "zip decompression failed", e)
            })?;
            if read == 0 {
                break;
            }
            if chunk_tx
                .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..read])))
                .is_err()
            {
                return Ok(());
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{zip_bytes, RecordingStorage};
    use datafetch_core::model::FetcherRecipeBuilder;
    use datafetch_core::storage::stream_from_bytes;

    fn recipe() -> Arc<FetcherRecipe> {
        struct NoopLoader;

        #[async_trait]
        impl datafetch_core::BundleLoader for NoopLoader {
            async fn load(
                &self,
                _request: &datafetch_core::RequestMeta,
                _storage: &Arc<dyn BundleStorage>,
                _ctx: &datafetch_core::FetchRunContext,
                _recipe: &Arc<FetcherRecipe>,
            ) -> Result<Vec<BundleRef>> {
                Ok(Vec::new())
            }
        }

        Arc::new(
            FetcherRecipeBuilder::new()
                .use_bundle_loader(Arc::new(NoopLoader))
                .build()
                .unwrap(),
        )
    }

    async fn run_add(
        inner: Arc<RecordingStorage>,
        resource_name: &str,
        metadata: ResourceMeta,
        payload: Vec<u8>,
    ) {
        let decorator = UnzipDecorator::new(inner);
        let bundle = BundleRef::new(Bid::mint(), resource_name);
        let context = decorator.start_bundle(bundle, recipe()).await.unwrap();
        context
            .add_resource(resource_name, metadata, stream_from_bytes(payload))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn zip_suffix_bypasses_and_strips() {
        let inner = Arc::new(RecordingStorage::new());
        let payload = zip_bytes(&[("doc.txt", b"contents")]);

        run_add(
            inner.clone(),
            "https://example.com/test.zip",
            ResourceMeta::new("https://example.com/test.zip")
                .with_content_type("application/zip"),
            payload.clone(),
        )
        .await;

        let resources = inner.resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].name, "https://example.com/test");
        assert_eq!(resources[0].body, payload);
    }

    #[tokio::test]
    async fn zip_content_type_alone_does_not_bypass() {
        // The bypass table mirrors the tar/gz decorator and does not list
        // application/zip, so a zip payload without the .zip suffix is
        // extracted rather than bypassed.
        let inner = Arc::new(RecordingStorage::new());
        let payload = zip_bytes(&[("a.txt", b"alpha")]);

        run_add(
            inner.clone(),
            "https://example.com/archive",
            ResourceMeta::new("https://example.com/archive")
                .with_content_type("application/zip"),
            payload,
        )
        .await;

        let resources = inner.resources();
        assert_eq!(resources.len(), 2);
        assert!(resources
            .iter()
            .any(|r| r.name == "https://example.com/archive/a.txt" && r.body == b"alpha"));
    }

    #[tokio::test]
    async fn zip_fan_out_per_entry() {
        let inner = Arc::new(RecordingStorage::new());
        let payload = zip_bytes(&[("x.txt", b"hello"), ("y.txt", b"world")]);

        run_add(
            inner.clone(),
            "https://h/pkg",
            ResourceMeta::new("https://h/pkg")
                .with_status(200)
                .with_content_type("application/octet-stream"),
            payload.clone(),
        )
        .await;

        let resources = inner.resources();
        assert_eq!(resources.len(), 3);

        let original = resources.iter().find(|r| r.name == "https://h/pkg").unwrap();
        assert_eq!(original.body, payload);

        let x = resources.iter().find(|r| r.name == "https://h/pkg/x.txt").unwrap();
        assert_eq!(x.body, b"hello");
        assert_eq!(x.metadata.derived_from.as_deref(), Some("https://h/pkg"));

        let y = resources.iter().find(|r| r.name == "https://h/pkg/y.txt").unwrap();
        assert_eq!(y.body, b"world");
    }

    #[tokio::test]
    async fn non_zip_payload_is_left_alone() {
        let inner = Arc::new(RecordingStorage::new());

        run_add(
            inner.clone(),
            "https://h/file",
            ResourceMeta::new("https://h/file"),
            b"plain bytes".to_vec(),
        )
        .await;

        let resources = inner.resources();
        assert_eq!(resources.len(), 1);
        assert_eq!(resources[0].body, b"plain bytes");
    }
}
