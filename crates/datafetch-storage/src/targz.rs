//! Tar and gzip decompression/extraction decorator.
//!
//! Resources that look like intentional archive artifacts (archive suffix on
//! the URL path, or an archive content type) bypass processing and are
//! stored under a suffix-stripped name. Everything else is teed: one copy
//! streams to the underlying storage unchanged (under the stripped name),
//! the second copy is sniffed and, when it turns out to be gzip and/or tar,
//! decompressed or extracted into derived resources.
//!
//! Decompression is streaming; a temporary spool file is used only because
//! tar detection needs a seekable handle, and it is removed on every exit
//! path.

use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use flate2::read::GzDecoder;
use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use datafetch_core::model::{BundleRef, FetcherRecipe, ResourceMeta};
use datafetch_core::storage::{BundleStorage, BundleStorageContext, ByteStream};
use datafetch_core::{Bid, FetchError, Result};

use crate::tee::{channel_stream, tee_pair, DEFAULT_HIGH_WATER_CHUNKS};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const TAR_MAGIC: &[u8] = b"ustar";
const TAR_MAGIC_OFFSET: usize = 257;
const SNIFF_LEN: usize = TAR_MAGIC_OFFSET + TAR_MAGIC.len();
const EXTRACT_CHUNK: usize = 8 * 1024;

const ARCHIVE_SUFFIXES: [&str; 4] = [".tar.gz", ".tgz", ".gz", ".tar"];
const ARCHIVE_CONTENT_TYPES: [&str; 3] =
    ["application/gzip", "application/x-tar", "application/x-gtar"];

/// Decorator that decompresses and extracts tar and gzip resources.
pub struct TarGzDecorator {
    inner: Arc<dyn BundleStorage>,
}

impl TarGzDecorator {
    pub fn new(inner: Arc<dyn BundleStorage>) -> Self {
        TarGzDecorator { inner }
    }
}

#[async_trait]
impl BundleStorage for TarGzDecorator {
    fn bundle_found(&self, metadata: Value) -> Bid {
        self.inner.bundle_found(metadata)
    }

    async fn start_bundle(
        &self,
        bundle_ref: BundleRef,
        recipe: Arc<FetcherRecipe>,
    ) -> Result<Arc<dyn BundleStorageContext>> {
        let inner = self.inner.start_bundle(bundle_ref, recipe).await?;
        Ok(Arc::new(TarGzBundleContext { inner }))
    }

    async fn on_run_start(
        &self,
        ctx: &datafetch_core::FetchRunContext,
        recipe: &Arc<FetcherRecipe>,
    ) -> Result<()> {
        self.inner.on_run_start(ctx, recipe).await
    }
}

/// Strip a trailing archive suffix from a URL-ish resource name; only the
/// path portion is examined when the name parses as a URL.
pub(crate) fn strip_suffix(name: &str, suffixes: &[&str]) -> String {
    if let Ok(mut parsed) = url::Url::parse(name) {
        let path = parsed.path().to_string();
        for suffix in suffixes {
            if let Some(stripped) = path.strip_suffix(suffix) {
                let stripped = stripped.to_string();
                parsed.set_path(&stripped);
                return parsed.to_string();
            }
        }
        return name.to_string();
    }
    for suffix in suffixes {
        if let Some(stripped) = name.strip_suffix(suffix) {
            return stripped.to_string();
        }
    }
    name.to_string()
}

fn url_path(url: &str) -> String {
    url::Url::parse(url)
        .map(|u| u.path().to_string())
        .unwrap_or_else(|_| url.to_string())
}

fn should_bypass(url: &str, content_type: Option<&str>) -> bool {
    let path = url_path(url);
    if ARCHIVE_SUFFIXES.iter().any(|s| path.ends_with(s)) {
        return true;
    }
    if let Some(ct) = content_type {
        if ARCHIVE_CONTENT_TYPES.iter().any(|known| ct.contains(known)) {
            return true;
        }
    }
    false
}

struct TarGzBundleContext {
    inner: Arc<dyn BundleStorageContext>,
}

#[async_trait]
impl BundleStorageContext for TarGzBundleContext {
    fn bundle_ref(&self) -> BundleRef {
        self.inner.bundle_ref()
    }

    async fn add_resource(
        &self,
        resource_name: &str,
        metadata: ResourceMeta,
        stream: ByteStream,
    ) -> Result<()> {
        let stripped = strip_suffix(resource_name, &ARCHIVE_SUFFIXES);

        if should_bypass(&metadata.url, metadata.content_type.as_deref()) {
            debug!(resource_name, "ARCHIVE_BYPASS");
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

        // Extraction failures never fail the upload; the original content is
        // already on its way to storage through the other branch.
        if let Err(err) = self
            .process_for_archives(resource_name, &stripped, &metadata, inspect)
            .await
        {
            warn!(resource_name, error = %err, "TAR_EXTRACTION_ERROR");
        }

        passthrough_task
            .await
            .map_err(|e| FetchError::storage_from("tar_gz_decorator", "passthrough task failed", e))?
    }

    async fn complete(&self, metadata: Value) -> Result<()> {
        self.inner.complete(metadata).await
    }
}

impl TarGzBundleContext {
    async fn process_for_archives(
        &self,
        resource_name: &str,
        stripped: &str,
        metadata: &ResourceMeta,
        mut stream: ByteStream,
    ) -> Result<()> {
        let mut sniff = Vec::with_capacity(SNIFF_LEN);
        let mut buffered: Vec<Bytes> = Vec::new();
        while sniff.len() < SNIFF_LEN {
            match stream.next().await {
                Some(chunk) => {
                    let chunk = chunk.map_err(|e| {
                        FetchError::storage_from("tar_gz_decorator", "inspection stream failed", e)
                    })?;
                    sniff.extend_from_slice(&chunk);
                    buffered.push(chunk);
                }
                None => break,
            }
        }

        let is_gzip = sniff.len() >= 2 && sniff[..2] == GZIP_MAGIC;
        let is_tar = sniff.len() >= SNIFF_LEN
            && &sniff[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC;
        if !is_gzip && !is_tar {
            debug!(resource_name, "FILE_NOT_COMPRESSED_OR_ARCHIVED");
            return Ok(());
        }

        let spool = spool_for_inspection(buffered, stream).await?;

        let (tx, mut rx) = mpsc::channel::<DerivedResource>(2);
        let spool_path = spool.to_path_buf();
        let original_name = resource_name.to_string();
        let stripped_name = stripped.to_string();
        let base_meta = metadata.clone();
        let extraction = tokio::task::spawn_blocking(move || {
            extract_blocking(&spool_path, &original_name, &stripped_name, &base_meta, &tx)
        });

        while let Some(derived) = rx.recv().await {
            debug!(name = %derived.name, derived_from = resource_name, "DERIVED_RESOURCE_EMITTED");
            self.inner
                .add_resource(&derived.name, derived.metadata, derived.stream)
                .await?;
        }

        let result = extraction
            .await
            .map_err(|e| FetchError::storage_from("tar_gz_decorator", "extraction task failed", e))?;
        drop(spool);
        result
    }
}

struct DerivedResource {
    name: String,
    metadata: ResourceMeta,
    stream: ByteStream,
}

/// Write the already-read chunks plus the remaining stream to a temp file
/// that deletes itself when dropped.
pub(crate) async fn spool_for_inspection(
    buffered: Vec<Bytes>,
    mut rest: ByteStream,
) -> Result<tempfile::TempPath> {
    let temp = tempfile::NamedTempFile::new()
        .map_err(|e| FetchError::storage_from("tar_gz_decorator", "temp file creation failed", e))?;
    let path = temp.into_temp_path();

    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(|e| FetchError::storage_from("tar_gz_decorator", "temp file open failed", e))?;
    for chunk in buffered {
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::storage_from("tar_gz_decorator", "temp file write failed", e))?;
    }
    while let Some(chunk) = rest.next().await {
        let chunk = chunk.map_err(|e| {
            FetchError::storage_from("tar_gz_decorator", "inspection stream failed", e)
        })?;
        file.write_all(&chunk)
            .await
            .map_err(|e| FetchError::storage_from("tar_gz_decorator", "temp file write failed", e))?;
    }
    file.flush()
        .await
        .map_err(|e| FetchError::storage_from("tar_gz_decorator", "temp file flush failed", e))?;
    Ok(path)
}

/// Runs on a blocking thread: decide gzip / tar.gz / tar, then push derived
/// resources through the channel. A closed channel means the async side gave
/// up; treat it as cancellation, not an error.
fn extract_blocking(
    spool: &Path,
    original_name: &str,
    stripped_name: &str,
    base_meta: &ResourceMeta,
    tx: &mpsc::Sender<DerivedResource>,
) -> Result<()> {
    let open = |path: &Path| {
        std::fs::File::open(path)
            .map_err(|e| FetchError::storage_from("tar_gz_decorator", "spool open failed", e))
    };

    let mut magic = [0u8; 2];
    let gzipped = {
        let mut file = open(spool)?;
        file.read_exact(&mut magic).is_ok() && magic == GZIP_MAGIC
    };

    if gzipped {
        let contains_tar = {
            let mut decoder = GzDecoder::new(open(spool)?);
            let mut head = vec![0u8; SNIFF_LEN];
            read_up_to(&mut decoder, &mut head)? >= SNIFF_LEN
                && &head[TAR_MAGIC_OFFSET..TAR_MAGIC_OFFSET + TAR_MAGIC.len()] == TAR_MAGIC
        };

        if contains_tar {
            debug!("DETECTED_TAR_GZ_FILE_PROCESSING");
            let decoder = GzDecoder::new(open(spool)?);
            return extract_tar_members(decoder, original_name, stripped_name, base_meta, tx);
        }

        debug!("GZ_FILE_DECOMPRESSED_AND_STREAMED");
        let mut derived_meta = base_meta.clone();
        derived_meta.derived_from = Some(original_name.to_string());
        let (chunk_tx, stream) = channel_stream(8);
        if tx
            .blocking_send(DerivedResource {
                name: stripped_name.to_string(),
                metadata: derived_meta,
                stream,
            })
            .is_err()
        {
            return Ok(());
        }
        let decoder = GzDecoder::new(open(spool)?);
        return pump_reader(decoder, &chunk_tx);
    }

    debug!("DETECTED_TAR_FILE_PROCESSING");
    extract_tar_members(open(spool)?, original_name, stripped_name, base_meta, tx)
}

fn extract_tar_members<R: Read>(
    reader: R,
    original_name: &str,
    stripped_name: &str,
    base_meta: &ResourceMeta,
    tx: &mpsc::Sender<DerivedResource>,
) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let entries = archive
        .entries()
        .map_err(|e| FetchError::storage_from("tar_gz_decorator", "tar listing failed", e))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| FetchError::storage_from("tar_gz_decorator", "tar entry failed", e))?;
        if !entry.header().entry_type().is_file() {
            continue;
        }

        let member = entry
            .path()
            .map_err(|e| FetchError::storage_from("tar_gz_decorator", "tar path failed", e))?
            .to_string_lossy()
            .to_string();
        let derived_name = format!("{stripped_name}/{member}");

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
            .blocking_send(DerivedResource {
                name: derived_name,
                metadata,
                stream,
            })
            .is_err()
        {
            return Ok(());
        }
        pump_reader(&mut entry, &chunk_tx)?;
    }
    Ok(())
}

fn pump_reader<R: Read>(
    mut reader: R,
    tx: &mpsc::Sender<std::io::Result<Bytes>>,
) -> Result<()> {
    let mut buffer = vec![0u8; EXTRACT_CHUNK];
    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|e| FetchError::storage_from("tar_gz_decorator", "decompression failed", e))?;
        if read == 0 {
            return Ok(());
        }
        if tx
            .blocking_send(Ok(Bytes::copy_from_slice(&buffer[..read])))
            .is_err()
        {
            // Receiver dropped; stop extracting this member.
            return Ok(());
        }
    }
}

fn read_up_to<R: Read>(reader: &mut R, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        match reader.read(&mut buffer[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) => {
                return Err(FetchError::storage_from(
                    "tar_gz_decorator",
                    "decompression failed",
                    e,
                ))
            }
        }
    }
    Ok(filled)
}
