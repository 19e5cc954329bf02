//! Prometheus metrics for the request pipeline.

use lazy_static::lazy_static;
use prometheus::{
    histogram_opts, opts, register_counter_vec_with_registry,
    register_histogram_vec_with_registry, register_int_counter_with_registry, CounterVec,
    Encoder, HistogramVec, IntCounter, Registry, TextEncoder,
};
use std::fmt;
use std::time::Duration;

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();
    pub static ref REQUESTS_TOTAL: CounterVec = register_counter_vec_with_registry!(
        opts!(
            "mock_server_requests_total",
            "Total number of requests by terminal outcome"
        ),
        &["method", "path", "folder", "outcome", "status_code"],
        REGISTRY
    )
    .expect("requests counter registers once");
    pub static ref RESPONSE_TIME: HistogramVec = register_histogram_vec_with_registry!(
        histogram_opts!(
            "mock_server_response_time_seconds",
            "Time from admission to response in seconds"
        ),
        &["method", "path", "folder", "outcome"],
        REGISTRY
    )
    .expect("response time histogram registers once");
    pub static ref PROXY_RESPONSE_TIME: HistogramVec = register_histogram_vec_with_registry!(
        histogram_opts!(
            "mock_server_proxy_response_time_seconds",
            "Upstream round-trip time for proxied requests in seconds"
        ),
        &["method", "folder"],
        REGISTRY
    )
    .expect("proxy histogram registers once");
    pub static ref RATE_LIMITED_TOTAL: IntCounter = register_int_counter_with_registry!(
        opts!(
            "mock_server_rate_limited_total",
            "Requests rejected by the per-client rate limiter"
        ),
        REGISTRY
    )
    .expect("rate limit counter registers once");
}

/// Terminal label of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    MockHit,
    CacheHit,
    ErrorSimulated,
    Proxied,
    NotFound,
    RateLimited,
    TooLarge,
    CatalogError,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::MockHit => "mock_hit",
            Outcome::CacheHit => "cache_hit",
            Outcome::ErrorSimulated => "error_simulated",
            Outcome::Proxied => "proxied",
            Outcome::NotFound => "not_found",
            Outcome::RateLimited => "rate_limited",
            Outcome::TooLarge => "too_large",
            Outcome::CatalogError => "catalog_error",
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Labels shared by the per-request series.
#[derive(Debug, Clone, Copy)]
pub struct RequestLabels<'a> {
    pub method: &'a str,
    pub path: &'a str,
    pub folder: &'a str,
}

/// Count one terminal outcome and observe its latency.
pub fn record_request(labels: RequestLabels<'_>, outcome: Outcome, status: u16, elapsed: Duration) {
    let status = status.to_string();
    REQUESTS_TOTAL
        .with_label_values(&[labels.method, labels.path, labels.folder, outcome.as_str(), &status])
        .inc();
    RESPONSE_TIME
        .with_label_values(&[labels.method, labels.path, labels.folder, outcome.as_str()])
        .observe(elapsed.as_secs_f64());
    if outcome == Outcome::RateLimited {
        RATE_LIMITED_TOTAL.inc();
    }
}

pub fn record_proxy_time(method: &str, folder: &str, elapsed: Duration) {
    PROXY_RESPONSE_TIME
        .with_label_values(&[method, folder])
        .observe(elapsed.as_secs_f64());
}

/// Current count for one label set; zero when never recorded.
pub fn request_count(labels: RequestLabels<'_>, outcome: Outcome, status: u16) -> f64 {
    REQUESTS_TOTAL
        .get_metric_with_label_values(&[
            labels.method,
            labels.path,
            labels.folder,
            outcome.as_str(),
            &status.to_string(),
        ])
        .map(|c| c.get())
        .unwrap_or_default()
}

pub fn register_process_metrics() {
    #[cfg(target_os = "linux")]
    {
        let process_collector = prometheus::process_collector::ProcessCollector::for_self();
        if let Err(e) = REGISTRY.register(Box::new(process_collector)) {
            tracing::warn!(error = %e, "Failed to register process metrics");
        }
    }
}

/// Text exposition of every registered metric.
pub fn render() -> Result<String, prometheus::Error> {
    let mut buffer = Vec::new();
    TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer)?;
    String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
}
