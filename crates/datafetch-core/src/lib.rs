// datafetch-core - orchestration core for the data-acquisition engine
//
// This crate carries everything the pipeline itself needs and nothing
// protocol-specific:
// - Data model (Bid, RequestMeta, ResourceMeta, BundleRef, recipes, run context)
// - Error taxonomy shared by every component
// - Retry engine with exponential backoff and jitter
// - Wall-clock and interval gates
// - Key-value stores (in-memory, Redis) and the persistent request queue
// - The locator/loader/storage trait seams
// - The fetcher scheduler (locator task + worker pool)
//
// Protocol managers live in datafetch-http / datafetch-sftp; storage
// implementations live in datafetch-storage.

pub mod bid;
pub mod error;
pub mod fetcher;
pub mod gates;
pub mod kv;
pub mod locator;
pub mod model;
pub mod queue;
pub mod retry;
pub mod storage;

pub use bid::Bid;
pub use error::{FetchError, Result};
pub use fetcher::{FetchResult, Fetcher};
pub use locator::{BundleLoader, BundleLocator, RequestParameterLocator};
pub use model::{
    AppConfig, BundleRef, CredentialProvider, FetchPlan, FetchRunContext, FetcherRecipe,
    FetcherRecipeBuilder, RequestMeta, ResourceMeta,
};
pub use queue::KvRequestQueue;
pub use retry::{RetryConfig, RetryEngine};
pub use storage::{BundleStorage, BundleStorageContext, ByteStream};
