//! Folder Mock Server
//!
//! A programmable HTTP mock server. Mocks are organized in a two-level folder
//! namespace addressed by path prefix; requests no mock answers can fall back
//! to an upstream origin configured on the folder, and the captured exchange
//! can later be turned into a mock.
//!
//! # Features
//!
//! - **Folder Namespaces**: `/<root>/<subfolder>/...` selects the mock set
//! - **Request Matching**: method, path, query (order-independent), headers, body probe
//! - **Dynamic Responses**: `{method}`, `{query_<name>}`, `{header_<name>}` placeholders
//! - **File Payloads**: base64 bodies served with their MIME type and filename
//! - **Response Cache**: per-mock TTL cache of rendered responses
//! - **Latency and Faults**: fixed or ranged delays, probabilistic error responses
//! - **Rate Limiting**: per-client fixed window
//! - **Proxy Fallback**: upstream forwarding with capture into the request log
//!
//! # Example Catalog
//!
//! ```yaml
//! folders:
//!   - name: api
//!   - name: up
//!     proxy_enabled: true
//!     proxy_base_url: http://origin/
//! mocks:
//!   - folder_name: api
//!     method: GET
//!     path: /users?x=1
//!     response_body:
//!       ok: true
//! ```

pub mod behavior;
pub mod cache;
pub mod config;
pub mod matcher;
pub mod metrics;
pub mod model;
pub mod proxy;
pub mod rate_limit;
pub mod request_log;
pub mod resolver;
pub mod response;
pub mod server;
pub mod store;
pub mod template;

pub use config::ServerConfig;
pub use server::{router, MockServer};
pub use store::{CatalogStore, MemoryCatalog, PgCatalog, RequestLogSink};
