//! Request pipeline and HTTP surface.
//!
//! Every inbound request that is not a probe runs through [`MockServer::handle`]:
//! rate limit, body admission, folder resolution, matching, then either a
//! mock response (cached, simulated error or rendered) or the upstream
//! fallback. Each terminal state counts one metric sample and, except for
//! rejections before resolution, writes one request-log record.

use crate::behavior::{draw_delay, should_simulate_error, sleep_ms};
use crate::cache::{CacheKey, ResponseCache};
use crate::config::ServerConfig;
use crate::matcher::{find_match, RequestView};
use crate::metrics::{self, Outcome, RequestLabels};
use crate::model::{Mock, ResponseBody};
use crate::proxy::{ForwardRequest, ProxyError, Upstream};
use crate::rate_limit::RateLimiter;
use crate::request_log::{
    capture_headers, CapturedBody, CapturedExchange, RequestLogRecord, RequestLogWriter,
};
use crate::resolver::{resolve, Resolution};
use crate::response::RenderedResponse;
use crate::store::{CatalogStore, RequestLogSink};
use crate::template::TemplateContext;
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const NOT_FOUND_BODY: &str = "No matching mock found";

/// The inbound request, read and split.
struct Exchange {
    method: Method,
    raw_path: String,
    query: String,
    headers: HeaderMap,
    body: Bytes,
    started: Instant,
}

/// What a terminal state contributes to metrics and the request log.
struct Completion {
    outcome: Outcome,
    status: u16,
    is_proxied: bool,
    cache_ttl_seconds: Option<u64>,
    cache_key: Option<String>,
    capture: Option<CapturedExchange>,
}

impl Completion {
    fn new(outcome: Outcome, status: u16) -> Self {
        Self {
            outcome,
            status,
            is_proxied: false,
            cache_ttl_seconds: None,
            cache_key: None,
            capture: None,
        }
    }
}

enum BodyError {
    TooLarge,
    Read(String),
}

/// Shared state of the mock server.
pub struct MockServer {
    config: ServerConfig,
    catalog: Arc<dyn CatalogStore>,
    cache: ResponseCache,
    limiter: RateLimiter,
    upstream: Upstream,
    log_writer: RequestLogWriter,
    /// Requests that entered the pipeline.
    requests_total: AtomicU64,
    /// Requests answered by a mock (including cache hits and simulated errors).
    requests_matched: AtomicU64,
    /// Requests no mock answered.
    requests_unmatched: AtomicU64,
}

impl MockServer {
    pub fn new(
        config: ServerConfig,
        catalog: Arc<dyn CatalogStore>,
        log_sink: Arc<dyn RequestLogSink>,
    ) -> Result<Self, ProxyError> {
        let upstream = Upstream::new(config.upstream_timeout(), config.allowed_proxy_hosts.clone())?;
        let limiter = RateLimiter::new(config.rate_limit_requests, config.rate_limit_window());

        info!(
            default_cache_ttl_seconds = config.default_cache_ttl_seconds,
            rate_limit_requests = config.rate_limit_requests,
            allowed_proxy_hosts = config.allowed_proxy_hosts.len(),
            "Mock server initialized"
        );

        Ok(Self {
            config,
            catalog,
            cache: ResponseCache::new(),
            limiter,
            upstream,
            log_writer: RequestLogWriter::new(log_sink),
            requests_total: AtomicU64::new(0),
            requests_matched: AtomicU64::new(0),
            requests_unmatched: AtomicU64::new(0),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn total_requests(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn total_matched(&self) -> u64 {
        self.requests_matched.load(Ordering::Relaxed)
    }

    pub fn total_unmatched(&self) -> u64 {
        self.requests_unmatched.load(Ordering::Relaxed)
    }

    pub fn total_rate_limited(&self) -> u64 {
        self.limiter.rejected()
    }

    /// Run the pipeline for one request from `client`.
    pub async fn handle(&self, client: IpAddr, request: Request) -> Response {
        let started = Instant::now();
        self.requests_total.fetch_add(1, Ordering::Relaxed);

        let (parts, body) = request.into_parts();
        let method = parts.method;
        let raw_path = parts.uri.path().to_string();
        let query = parts.uri.query().unwrap_or_default().to_string();

        if !self.limiter.check(client) {
            debug!(client = %client, "Rate limit exceeded");
            self.record_early(&method, &raw_path, Outcome::RateLimited, 429, started);
            return RenderedResponse::text(429, "Too Many Requests").into_response();
        }

        let body = match read_body(body, self.config.body_limit()).await {
            Ok(body) => body,
            Err(BodyError::TooLarge) => {
                debug!(path = %raw_path, "Request body exceeds limit");
                self.record_early(&method, &raw_path, Outcome::TooLarge, 413, started);
                return RenderedResponse::text(413, "Payload Too Large").into_response();
            }
            Err(BodyError::Read(e)) => {
                debug!(error = %e, path = %raw_path, "Failed to read request body");
                return StatusCode::BAD_REQUEST.into_response();
            }
        };

        let exchange = Exchange {
            method,
            raw_path,
            query,
            headers: parts.headers,
            body,
            started,
        };

        let resolution = match resolve(
            self.catalog.as_ref(),
            &exchange.raw_path,
            Some(&exchange.query),
        )
        .await
        {
            Ok(resolution) => resolution,
            Err(e) => return self.catalog_unavailable(&exchange, "", &e),
        };
        let folder_label = resolution.folder_key().to_string();

        debug!(
            folder = %folder_label,
            inner_path = %resolution.inner_full_path,
            "Resolved folder"
        );

        let candidates = match self.catalog.active_mocks(&resolution.folder_key()).await {
            Ok(candidates) => candidates,
            Err(e) => return self.catalog_unavailable(&exchange, &folder_label, &e),
        };

        let view = RequestView {
            method: exchange.method.as_str(),
            inner_full_path: &resolution.inner_full_path,
            headers: &exchange.headers,
            body: &exchange.body,
        };

        match find_match(&candidates, &view) {
            Some(mock) => {
                self.requests_matched.fetch_add(1, Ordering::Relaxed);
                self.serve_mock(&exchange, &resolution, mock).await
            }
            None => {
                self.requests_unmatched.fetch_add(1, Ordering::Relaxed);
                self.fallback(&exchange, &resolution).await
            }
        }
    }

    async fn serve_mock(&self, exchange: &Exchange, resolution: &Resolution, mock: &Mock) -> Response {
        debug!(mock_id = %mock.id, folder = %resolution.folder_key(), "Matched mock");

        let ttl = mock.effective_cache_ttl(self.config.default_cache_ttl_seconds);
        let cache_key = CacheKey::new(mock.id, exchange.method.as_str(), &resolution.inner_full_path);

        if ttl > 0 {
            if let Some(cached) = self.cache.get(&cache_key) {
                debug!(mock_id = %mock.id, cache_key = %cache_key, "Serving cached response");
                let mut done = Completion::new(Outcome::CacheHit, cached.status);
                done.cache_ttl_seconds = Some(ttl);
                done.cache_key = Some(cache_key.to_string());
                self.complete(exchange, resolution, done).await;
                return cached.into_response();
            }
        }

        let (simulate_error, delay_ms) = {
            let mut rng = rand::thread_rng();
            (
                should_simulate_error(&mock.error_simulation, &mut rng),
                draw_delay(mock, &mut rng),
            )
        };

        let ctx = TemplateContext::from_request(
            exchange.method.as_str(),
            &exchange.raw_path,
            &resolution.inner_full_path,
            &exchange.query,
            &exchange.headers,
        );

        if simulate_error {
            let simulation = &mock.error_simulation;
            info!(
                mock_id = %mock.id,
                status = simulation.status(),
                delay_ms = simulation.delay_ms,
                "Simulating error"
            );
            sleep_ms(simulation.delay_ms).await;

            let rendered = RenderedResponse::render(
                simulation.status(),
                &ResponseBody::from(simulation.body()),
                &BTreeMap::new(),
                &ctx,
            );
            self.complete(
                exchange,
                resolution,
                Completion::new(Outcome::ErrorSimulated, rendered.status),
            )
            .await;
            return rendered.into_response();
        }

        if delay_ms > 0 {
            debug!(mock_id = %mock.id, delay_ms, "Applying delay");
            sleep_ms(delay_ms).await;
        }

        let rendered = RenderedResponse::render(
            mock.status_code,
            &mock.response_body,
            &mock.response_headers,
            &ctx,
        );

        let mut done = Completion::new(Outcome::MockHit, rendered.status);
        if ttl > 0 {
            self.cache.put(cache_key.clone(), rendered.clone(), ttl);
            done.cache_ttl_seconds = Some(ttl);
            done.cache_key = Some(cache_key.to_string());
        }

        info!(
            mock_id = %mock.id,
            status = rendered.status,
            path = %resolution.inner_path,
            "Mock hit"
        );
        self.complete(exchange, resolution, done).await;
        rendered.into_response()
    }

    async fn fallback(&self, exchange: &Exchange, resolution: &Resolution) -> Response {
        let Some(base_url) = resolution.folder.upstream_base() else {
            warn!(
                method = %exchange.method,
                folder = %resolution.folder_key(),
                path = %resolution.inner_full_path,
                "No matching mock found"
            );
            self.complete(exchange, resolution, Completion::new(Outcome::NotFound, 404))
                .await;
            return RenderedResponse::text(404, NOT_FOUND_BODY).into_response();
        };

        let forward = match ForwardRequest::new(
            exchange.method.clone(),
            base_url,
            &resolution.upstream_path,
            &exchange.headers,
            exchange.body.clone(),
        ) {
            Ok(forward) => forward,
            Err(e) => {
                warn!(error = %e, folder = %resolution.folder_key(), "Cannot build upstream request");
                let mut done = Completion::new(Outcome::Proxied, 502);
                done.is_proxied = true;
                self.complete(exchange, resolution, done).await;
                return RenderedResponse::text(502, "Bad Gateway").into_response();
            }
        };

        let listener_base = self.listener_base(&exchange.headers);
        let mut capture = forward.capture(&resolution.inner_full_path);
        let upstream_started = Instant::now();

        match self.upstream.forward(&forward, &listener_base).await {
            Ok(proxied) => {
                let folder_label = resolution.folder_key().to_string();
                metrics::record_proxy_time(
                    exchange.method.as_str(),
                    &folder_label,
                    upstream_started.elapsed(),
                );
                info!(
                    url = %forward.url,
                    status = proxied.status.as_u16(),
                    folder = %folder_label,
                    "Proxied request"
                );

                capture.response_headers = Some(capture_headers(&proxied.headers));
                capture.response_body = Some(CapturedBody::capture(&proxied.body));

                let mut done = Completion::new(Outcome::Proxied, proxied.status.as_u16());
                done.is_proxied = true;
                done.capture = Some(capture);
                self.complete(exchange, resolution, done).await;
                proxied.into_response()
            }
            Err(ProxyError::HostNotAllowed(host)) => {
                warn!(host = %host, folder = %resolution.folder_key(), "Upstream host not allowed");
                self.complete(exchange, resolution, Completion::new(Outcome::Proxied, 403))
                    .await;
                RenderedResponse::text(403, "Upstream host not allowed").into_response()
            }
            Err(e) => {
                warn!(error = %e, url = %forward.url, "Upstream request failed");
                let mut done = Completion::new(Outcome::Proxied, 502);
                done.is_proxied = true;
                done.capture = Some(capture);
                self.complete(exchange, resolution, done).await;
                RenderedResponse::text(502, "Bad Gateway").into_response()
            }
        }
    }

    /// Count a terminal state and append its log record.
    async fn complete(&self, exchange: &Exchange, resolution: &Resolution, done: Completion) {
        let elapsed = exchange.started.elapsed();
        let folder = resolution.folder_key();
        let folder_label = folder.to_string();

        metrics::record_request(
            RequestLabels {
                method: exchange.method.as_str(),
                path: &resolution.inner_path,
                folder: &folder_label,
            },
            done.outcome,
            done.status,
            elapsed,
        );

        let mut record = RequestLogRecord::new(
            folder,
            exchange.method.as_str(),
            &resolution.inner_path,
            done.status,
        );
        record.is_proxied = done.is_proxied;
        record.response_time_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        record.cache_ttl_seconds = done.cache_ttl_seconds;
        record.cache_key = done.cache_key;
        record.capture = done.capture;
        self.log_writer.write(record).await;
    }

    /// Count a rejection that happened before folder resolution.
    fn record_early(&self, method: &Method, raw_path: &str, outcome: Outcome, status: u16, started: Instant) {
        metrics::record_request(
            RequestLabels {
                method: method.as_str(),
                path: raw_path,
                folder: "",
            },
            outcome,
            status,
            started.elapsed(),
        );
    }

    fn catalog_unavailable(&self, exchange: &Exchange, folder: &str, e: &dyn std::error::Error) -> Response {
        error!(error = %e, path = %exchange.raw_path, "Catalog lookup failed");
        metrics::record_request(
            RequestLabels {
                method: exchange.method.as_str(),
                path: &exchange.raw_path,
                folder,
            },
            Outcome::CatalogError,
            500,
            exchange.started.elapsed(),
        );
        RenderedResponse::text(500, "Catalog unavailable").into_response()
    }

    /// Base URL clients used to reach this server.
    fn listener_base(&self, headers: &HeaderMap) -> String {
        if let Some(url) = &self.config.public_url {
            return url.trim_end_matches('/').to_string();
        }
        let host = headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("localhost");
        format!("http://{}", host)
    }

    /// Whether the catalog currently answers.
    pub async fn is_ready(&self) -> bool {
        self.catalog.ping().await.is_ok()
    }
}

async fn read_body(body: Body, limit: Option<usize>) -> Result<Bytes, BodyError> {
    match limit {
        Some(limit) => match Limited::new(body, limit).collect().await {
            Ok(collected) => Ok(collected.to_bytes()),
            Err(e) if e.is::<LengthLimitError>() => Err(BodyError::TooLarge),
            Err(e) => Err(BodyError::Read(e.to_string())),
        },
        None => body
            .collect()
            .await
            .map(|collected| collected.to_bytes())
            .map_err(|e| BodyError::Read(e.to_string())),
    }
}

/// Build the HTTP router: probes plus the mock pipeline on every other path.
pub fn router(server: Arc<MockServer>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics_text))
        .fallback(runtime)
        .with_state(server)
}

async fn runtime(State(server): State<Arc<MockServer>>, request: Request) -> Response {
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));

    match server.config.request_timeout() {
        Some(deadline) => match tokio::time::timeout(deadline, server.handle(client, request)).await {
            Ok(response) => response,
            Err(_) => {
                warn!(timeout_secs = deadline.as_secs(), "Request deadline exceeded");
                RenderedResponse::text(504, "Gateway Timeout").into_response()
            }
        },
        None => server.handle(client, request).await,
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(State(server): State<Arc<MockServer>>) -> Response {
    if server.is_ready().await {
        (StatusCode::OK, "ready").into_response()
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "catalog unavailable").into_response()
    }
}

async fn metrics_text() -> Response {
    match metrics::render() {
        Ok(text) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            text,
        )
            .into_response(),
        Err(e) => {
            error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
