//! Test doubles and archive fixtures shared by the decorator and pipeline
//! tests.

use std::io::Write;
use std::sync::Arc;

use async_trait::async_trait;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde_json::Value;

use datafetch_core::model::{BundleRef, FetcherRecipe, ResourceMeta};
use datafetch_core::storage::{
    collect_stream, BundleStorage, BundleStorageContext, ByteStream,
};
use datafetch_core::{Bid, Result};

#[derive(Debug, Clone)]
pub struct RecordedResource {
    pub name: String,
    pub metadata: ResourceMeta,
    pub body: Vec<u8>,
}

#[derive(Default)]
struct Recorded {
    resources: Vec<RecordedResource>,
    completions: Vec<Value>,
}

/// Inner storage that records every call and drains every stream.
#[derive(Default)]
pub struct RecordingStorage {
    recorded: Arc<Mutex<Recorded>>,
}

impl RecordingStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resources(&self) -> Vec<RecordedResource> {
        self.recorded.lock().resources.clone()
    }

    pub fn completions(&self) -> Vec<Value> {
        self.recorded.lock().completions.clone()
    }
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
        Ok(Arc::new(RecordingContext {
            recorded: self.recorded.clone(),
            bundle_ref: Mutex::new(bundle_ref),
        }))
    }
}

struct RecordingContext {
    recorded: Arc<Mutex<Recorded>>,
    bundle_ref: Mutex<BundleRef>,
}

#[async_trait]
impl BundleStorageContext for RecordingContext {
    fn bundle_ref(&self) -> BundleRef {
        self.bundle_ref.lock().clone()
    }

    async fn add_resource(
        &self,
        resource_name: &str,
        metadata: ResourceMeta,
        stream: ByteStream,
    ) -> Result<()> {
        let body = collect_stream(stream).await.map_err(|e| {
            datafetch_core::FetchError::storage_from("recording", "stream failed", e)
        })?;
        self.recorded.lock().resources.push(RecordedResource {
            name: resource_name.to_string(),
            metadata,
            body,
        });
        self.bundle_ref.lock().resources_count += 1;
        Ok(())
    }

    async fn complete(&self, metadata: Value) -> Result<()> {
        let key = format!("recorded/bundles/{}/metadata.json", self.bundle_ref.lock().bid);
        self.bundle_ref.lock().storage_key = Some(key);
        self.recorded.lock().completions.push(metadata);
        Ok(())
    }
}

/// Build a tar archive compressed with gzip from `(name, contents)` pairs.
pub fn tar_gz_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let tar = tar_bytes(files);
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

/// Build a plain tar archive from `(name, contents)` pairs.
pub fn tar_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    for (name, contents) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, name, *contents)
            .expect("tar append");
    }
    builder.into_inner().expect("tar finish")
}

/// Build a zip archive from `(name, contents)` pairs.
pub fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut writer = zip::ZipWriter::new(std::io::Cursor::new(Vec::new()));
    let options = zip::write::SimpleFileOptions::default()
        .compression_method(zip::CompressionMethod::Deflated);
    for (name, contents) in files {
        writer.start_file(*name, options).expect("zip entry");
        writer.write_all(contents).expect("zip write");
    }
    writer.finish().expect("zip finish").into_inner()
}
