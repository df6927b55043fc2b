// datafetch-http - HTTP/REST side of the data-acquisition engine
//
// Keyed connection pools with unified gating, rate limiting, and retries;
// pluggable authentication (none/basic/bearer/OAuth with token caching); a
// streaming bundle loader; and the API bundle locators (static URL lists and
// cursor-paginated date walks).

pub mod auth;
pub mod config;
pub mod loader;
pub mod locators;
pub mod manager;

pub use auth::AuthMechanism;
pub use config::HttpProtocolConfig;
pub use loader::HttpBundleLoader;
pub use locators::{
    CursorPaginationStrategy, DefaultQueryBuilder, MetaCursorPagination, PaginationConfig,
    PaginationHttpBundleLocator, QueryBuilder, SingleHttpBundleLocator,
};
pub use manager::HttpManager;
