//! API bundle locators.
//!
//! `SingleHttpBundleLocator` serves a static URL list and remembers what it
//! already handed out across runs. `PaginationHttpBundleLocator` walks a
//! date range, emitting one page request at a time; the next page is decided
//! by a cursor pagination strategy applied to the bundles the loader
//! produced, and a steady (or absent) cursor rolls the walk to the next day.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info};

use datafetch_core::kv::{KeyValueStore, KeyValueStoreExt};
use datafetch_core::model::{BundleRef, FetchRunContext, RequestMeta};
use datafetch_core::{BundleLocator, Result, RetryConfig, RetryEngine};

const DEFAULT_PROCESSED_TTL: Duration = Duration::from_secs(7 * 24 * 3600);
const DEFAULT_RESULTS_TTL: Duration = Duration::from_secs(30 * 24 * 3600);
const DEFAULT_ERRORS_TTL: Duration = Duration::from_secs(24 * 3600);

fn key_hash(value: &str) -> String {
    blake3::hash(value.as_bytes()).to_hex()[..16].to_string()
}

async fn save_result_record(
    kv: &dyn KeyValueStore,
    key: &str,
    url: &str,
    bundle_refs: &[BundleRef],
    ttl: Duration,
) -> Result<()> {
    let record = json!({
        "url": url,
        "timestamp": Utc::now().to_rfc3339(),
        "success": true,
        "bundle_count": bundle_refs.len(),
        "bundle_refs": bundle_refs.iter().map(|b| b.bid.to_string()).collect::<Vec<_>>(),
    });
    kv.put_json(key, &record, Some(ttl)).await
}

async fn save_error_record(
    kv: &dyn KeyValueStore,
    key: &str,
    url: &str,
    error: &str,
    ttl: Duration,
) -> Result<()> {
    let record = json!({
        "url": url,
        "error": error,
        "timestamp": Utc::now().to_rfc3339(),
        "retry_count": 0,
    });
    kv.put_json(key, &record, Some(ttl)).await
}

/// Locator for a fixed list of API endpoints with durable dedup.
pub struct SingleHttpBundleLocator {
    headers: HashMap<String, String>,
    persistence_prefix: String,
    processed_ttl: Duration,
    results_ttl: Duration,
    errors_ttl: Duration,
    state: tokio::sync::Mutex<SingleState>,
}

struct SingleState {
    queue: VecDeque<String>,
    processed: HashSet<String>,
    loaded: bool,
}

impl SingleHttpBundleLocator {
    pub fn new(urls: Vec<String>, headers: HashMap<String, String>) -> Self {
        Self::with_prefix(urls, headers, "single_api_provider")
    }

    pub fn with_prefix(
        urls: Vec<String>,
        headers: HashMap<String, String>,
        persistence_prefix: impl Into<String>,
    ) -> Self {
        SingleHttpBundleLocator {
            headers,
            persistence_prefix: persistence_prefix.into(),
            processed_ttl: DEFAULT_PROCESSED_TTL,
            results_ttl: DEFAULT_RESULTS_TTL,
            errors_ttl: DEFAULT_ERRORS_TTL,
            state: tokio::sync::Mutex::new(SingleState {
                queue: urls.into(),
                processed: HashSet::new(),
                loaded: false,
            }),
        }
    }

    fn processed_urls_key(&self) -> String {
        format!("{}:processed_urls", self.persistence_prefix)
    }

    async fn save_processed(&self, kv: &dyn KeyValueStore, state: &SingleState) -> Result<()> {
        let processed: Vec<&String> = state.processed.iter().collect();
        kv.put_json(&self.processed_urls_key(), &processed, Some(self.processed_ttl))
            .await
    }
}

#[async_trait]
impl BundleLocator for SingleHttpBundleLocator {
    async fn next_requests(
        &self,
        ctx: &FetchRunContext,
        wanted: usize,
    ) -> Result<Vec<RequestMeta>> {
        let kv = ctx.app_config.kv_store.clone();
        let mut state = self.state.lock().await;

        if !state.loaded {
            let persisted: Option<Vec<String>> = kv.get_json(&self.processed_urls_key()).await?;
            state.processed = persisted.unwrap_or_default().into_iter().collect();
            let processed = state.processed.clone();
            state.queue.retain(|url| !processed.contains(url));
            state.loaded = true;
        }

        let mut requests = Vec::new();
        while requests.len() < wanted {
            let Some(url) = state.queue.pop_front() else {
                break;
            };
            if state.processed.contains(&url) {
                continue;
            }
            state.processed.insert(url.clone());
            requests.push(RequestMeta::new(url)?.with_headers(self.headers.clone()));
        }

        self.save_processed(kv.as_ref(), &state).await?;
        Ok(requests)
    }

    async fn handle_request_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        ctx: &FetchRunContext,
    ) -> Result<()> {
        let kv = ctx.app_config.kv_store.clone();
        let mut state = self.state.lock().await;
        state.processed.insert(request.url.clone());

        let result_key = format!(
            "{}:results:{}",
            self.persistence_prefix,
            key_hash(&request.url)
        );
        save_result_record(kv.as_ref(), &result_key, &request.url, bundle_refs, self.results_ttl)
            .await?;
        self.save_processed(kv.as_ref(), &state).await
    }

    async fn handle_bundle_error(
        &self,
        request: &RequestMeta,
        error: &str,
        ctx: &FetchRunContext,
    ) -> Result<()> {
        let error_key = format!(
            "{}:errors:{}",
            self.persistence_prefix,
            key_hash(&request.url)
        );
        save_error_record(
            ctx.app_config.kv_store.as_ref(),
            &error_key,
            &request.url,
            error,
            self.errors_ttl,
        )
        .await
    }
}

/// Builds the `q` parameter for one day of a paginated walk.
pub trait QueryBuilder: Send + Sync {
    fn build(&self, date: &str) -> String;
}

/// Whole-day time-range query.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultQueryBuilder;

impl QueryBuilder for DefaultQueryBuilder {
    fn build(&self, date: &str) -> String {
        format!("date:[{date}T00:00:00%20TO%20{date}T23:59:59]")
    }
}

/// Decides how a page's results drive the next page request.
pub trait CursorPaginationStrategy: Send + Sync {
    /// Cursor for the next page, if the response carried one.
    fn next_cursor(&self, bundle_refs: &[BundleRef]) -> Option<String>;
    /// Number of records the page contained.
    fn records_count(&self, bundle_refs: &[BundleRef]) -> u64;
}

/// Cursor strategy reading the loader-provided bundle metadata.
#[derive(Debug, Clone)]
pub struct MetaCursorPagination {
    pub cursor_key: String,
    pub records_key: String,
}

impl Default for MetaCursorPagination {
    fn default() -> Self {
        MetaCursorPagination {
            cursor_key: "next_cursor".to_string(),
            records_key: "records_count".to_string(),
        }
    }
}

impl CursorPaginationStrategy for MetaCursorPagination {
    fn next_cursor(&self, bundle_refs: &[BundleRef]) -> Option<String> {
        bundle_refs
            .iter()
            .find_map(|b| b.meta.get(&self.cursor_key))
            .and_then(|v| v.as_str())
            .map(str::to_string)
    }

    fn records_count(&self, bundle_refs: &[BundleRef]) -> u64 {
        bundle_refs
            .iter()
            .find_map(|b| b.meta.get(&self.records_key))
            .and_then(|v| v.as_u64())
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct PaginationConfig {
    pub base_url: String,
    pub date_start: NaiveDate,
    pub date_end: Option<NaiveDate>,
    pub max_records_per_page: u32,
    pub headers: HashMap<String, String>,
    pub state_management_prefix: String,
}

impl PaginationConfig {
    pub fn new(base_url: impl Into<String>, date_start: NaiveDate) -> Self {
        PaginationConfig {
            base_url: base_url.into(),
            date_start,
            date_end: None,
            max_records_per_page: 1000,
            headers: HashMap::new(),
            state_management_prefix: "api_provider".to_string(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedPaginationState {
    current_date: String,
    current_cursor: String,
    initialized: bool,
    last_request_time: f64,
    last_updated: String,
}

/// Initial cursor for every new day.
const INITIAL_CURSOR: &str = "*";

pub struct PaginationHttpBundleLocator {
    config: PaginationConfig,
    query_builder: Arc<dyn QueryBuilder>,
    pagination: Arc<dyn CursorPaginationStrategy>,
    retry: RetryEngine,
    processed_ttl: Duration,
    results_ttl: Duration,
    errors_ttl: Duration,
    state: tokio::sync::Mutex<PaginationState>,
}

struct PaginationState {
    url_queue: VecDeque<String>,
    processed: HashSet<String>,
    current_date: Option<NaiveDate>,
    current_cursor: String,
    initialized: bool,
    last_request_time: f64,
}

impl PaginationHttpBundleLocator {
    pub fn new(
        config: PaginationConfig,
        query_builder: Arc<dyn QueryBuilder>,
        pagination: Arc<dyn CursorPaginationStrategy>,
    ) -> Self {
        PaginationHttpBundleLocator {
            config,
            query_builder,
            pagination,
            retry: RetryEngine::new(RetryConfig::operation()),
            processed_ttl: DEFAULT_PROCESSED_TTL,
            results_ttl: DEFAULT_RESULTS_TTL,
            errors_ttl: DEFAULT_ERRORS_TTL,
            state: tokio::sync::Mutex::new(PaginationState {
                url_queue: VecDeque::new(),
                processed: HashSet::new(),
                current_date: None,
                current_cursor: INITIAL_CURSOR.to_string(),
                initialized: false,
                last_request_time: 0.0,
            }),
        }
    }

    fn state_key(&self) -> String {
        format!(
            "{}:state:{}",
            self.config.state_management_prefix, self.config.base_url
        )
    }

    fn processed_urls_key(&self) -> String {
        format!(
            "{}:processed_urls:{}",
            self.config.state_management_prefix, self.config.base_url
        )
    }

    fn effective_end(&self) -> NaiveDate {
        self.config
            .date_end
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    fn page_url(&self, date: NaiveDate, cursor: &str) -> String {
        let date_str = date.format("%Y-%m-%d").to_string();
        let query = self.query_builder.build(&date_str);
        format!(
            "{}?nombre={}&curseur={}&q={}",
            self.config.base_url, self.config.max_records_per_page, cursor, query
        )
    }

    fn generate_page_for_current(&self, state: &mut PaginationState) {
        if let Some(date) = state.current_date {
            let url = self.page_url(date, &state.current_cursor);
            debug!(url = %url, "PAGINATION_PAGE_GENERATED");
            state.url_queue.push_back(url);
        }
    }

    async fn load_persisted(
        &self,
        kv: &Arc<dyn KeyValueStore>,
        state: &mut PaginationState,
    ) -> Result<()> {
        let processed: Option<Vec<String>> = self
            .retry
            .execute(|| async { kv.get_json(&self.processed_urls_key()).await })
            .await?;
        state.processed = processed.unwrap_or_default().into_iter().collect();

        let persisted: Option<PersistedPaginationState> = self
            .retry
            .execute(|| async { kv.get_json(&self.state_key()).await })
            .await?;
        if let Some(persisted) = persisted {
            state.current_date = NaiveDate::parse_from_str(&persisted.current_date, "%Y-%m-%d")
                .ok()
                .or(Some(self.config.date_start));
            state.current_cursor = persisted.current_cursor;
            state.last_request_time = persisted.last_request_time;
        }
        Ok(())
    }

    async fn save_persisted(
        &self,
        kv: &Arc<dyn KeyValueStore>,
        state: &PaginationState,
    ) -> Result<()> {
        let processed: Vec<&String> = state.processed.iter().collect();
        self.retry
            .execute(|| async {
                kv.put_json(&self.processed_urls_key(), &processed, Some(self.processed_ttl))
                    .await
            })
            .await?;

        let persisted = PersistedPaginationState {
            current_date: state
                .current_date
                .unwrap_or(self.config.date_start)
                .format("%Y-%m-%d")
                .to_string(),
            current_cursor: state.current_cursor.clone(),
            initialized: state.initialized,
            last_request_time: state.last_request_time,
            last_updated: Utc::now().to_rfc3339(),
        };
        self.retry
            .execute(|| async {
                kv.put_json(&self.state_key(), &persisted, Some(self.processed_ttl))
                    .await
            })
            .await
    }
}

#[async_trait]
impl BundleLocator for PaginationHttpBundleLocator {
    async fn next_requests(
        &self,
        ctx: &FetchRunContext,
        wanted: usize,
    ) -> Result<Vec<RequestMeta>> {
        let kv = ctx.app_config.kv_store.clone();
        let mut state = self.state.lock().await;

        if !state.initialized {
            self.load_persisted(&kv, &mut state).await?;
            if state.current_date.is_none() {
                state.current_date = Some(self.config.date_start);
            }
            self.generate_page_for_current(&mut state);
            state.initialized = true;
            info!(
                base_url = %self.config.base_url,
                date_start = %self.config.date_start,
                date_end = %self.effective_end(),
                "API_PROVIDER_INITIALIZED"
            );
            self.save_persisted(&kv, &state).await?;
        }

        let mut requests = Vec::new();
        while requests.len() < wanted {
            let Some(url) = state.url_queue.pop_front() else {
                break;
            };
            if state.processed.contains(&url) {
                continue;
            }
            state.processed.insert(url.clone());
            requests.push(RequestMeta::new(url)?.with_headers(self.config.headers.clone()));
        }

        if !requests.is_empty() {
            state.last_request_time = Utc::now().timestamp_millis() as f64 / 1000.0;
            self.save_persisted(&kv, &state).await?;
        }
        Ok(requests)
    }

    async fn handle_request_processed(
        &self,
        request: &RequestMeta,
        bundle_refs: &[BundleRef],
        ctx: &FetchRunContext,
    ) -> Result<()> {
        // Requests from other locators are not ours to advance on.
        if !request.url.starts_with(&self.config.base_url) {
            return Ok(());
        }

        let kv = ctx.app_config.kv_store.clone();
        let mut state = self.state.lock().await;
        state.processed.insert(request.url.clone());

        let result_key = format!(
            "{}:results:{}:{}",
            self.config.state_management_prefix,
            self.config.base_url,
            key_hash(&request.url)
        );
        save_result_record(kv.as_ref(), &result_key, &request.url, bundle_refs, self.results_ttl)
            .await?;

        let records = self.pagination.records_count(bundle_refs);
        let next_cursor = self.pagination.next_cursor(bundle_refs);
        let steady = next_cursor
            .as_deref()
            .map(|next| next == state.current_cursor)
            .unwrap_or(true);

        if records == 0 || steady {
            // Exhausted cursor for this day: roll forward to the next date.
            if let Some(current) = state.current_date {
                if current < self.effective_end() {
                    let next_date = current
                        .checked_add_days(Days::new(1))
                        .unwrap_or(current);
                    debug!(date = %next_date, "PAGINATION_DATE_ADVANCED");
                    state.current_date = Some(next_date);
                    state.current_cursor = INITIAL_CURSOR.to_string();
                    self.generate_page_for_current(&mut state);
                }
            }
        } else if let Some(next) = next_cursor {
            state.current_cursor = next;
            self.generate_page_for_current(&mut state);
        }

        self.save_persisted(&kv, &state).await
    }

    async fn handle_bundle_error(
        &self,
        request: &RequestMeta,
        error: &str,
        ctx: &FetchRunContext,
    ) -> Result<()> {
        let error_key = format!(
            "{}:errors:{}:{}",
            self.config.state_management_prefix,
            self.config.base_url,
            key_hash(&request.url)
        );
        save_error_record(
            ctx.app_config.kv_store.as_ref(),
            &error_key,
            &request.url,
            error,
            self.errors_ttl,
        )
        .await
    }
}
