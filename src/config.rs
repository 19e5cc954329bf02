//! Runtime configuration for the mock server.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings consumed by the request pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    /// TTL for mocks without their own, in seconds (0 = no caching)
    #[serde(default)]
    pub default_cache_ttl_seconds: u64,

    /// Requests allowed per client per window (0 = unlimited)
    #[serde(default)]
    pub rate_limit_requests: u64,

    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u64,

    /// Inbound body cap in bytes (0 = unlimited)
    #[serde(default = "default_max_body")]
    pub max_request_body_bytes: usize,

    /// Upstream hosts the proxy may contact; empty allows any
    #[serde(default)]
    pub allowed_proxy_hosts: Vec<String>,

    #[serde(default = "default_upstream_timeout")]
    pub upstream_timeout_seconds: u64,

    /// Whole-request deadline in seconds (0 = none)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_seconds: u64,

    /// Base URL clients use to reach this server
    #[serde(default)]
    pub public_url: Option<String>,
}

fn default_rate_limit_window() -> u64 {
    60
}

fn default_max_body() -> usize {
    10 * 1024 * 1024
}

fn default_upstream_timeout() -> u64 {
    30
}

fn default_request_timeout() -> u64 {
    120
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            default_cache_ttl_seconds: 0,
            rate_limit_requests: 0,
            rate_limit_window_seconds: default_rate_limit_window(),
            max_request_body_bytes: default_max_body(),
            allowed_proxy_hosts: Vec::new(),
            upstream_timeout_seconds: default_upstream_timeout(),
            request_timeout_seconds: default_request_timeout(),
            public_url: None,
        }
    }
}

impl ServerConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit_requests > 0 && self.rate_limit_window_seconds == 0 {
            anyhow::bail!("rate_limit_window_seconds must be positive when rate limiting is enabled");
        }
        if self.upstream_timeout_seconds == 0 {
            anyhow::bail!("upstream_timeout_seconds must be positive");
        }
        if let Some(url) = &self.public_url {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| anyhow::anyhow!("public_url `{}`: {}", url, e))?;
            if !parsed.has_host() {
                anyhow::bail!("public_url `{}` has no host", url);
            }
        }
        Ok(())
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_seconds)
    }

    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        (self.request_timeout_seconds > 0).then(|| Duration::from_secs(self.request_timeout_seconds))
    }

    pub fn body_limit(&self) -> Option<usize> {
        (self.max_request_body_bytes > 0).then_some(self.max_request_body_bytes)
    }
}

/// Split a comma-separated host list, dropping blanks.
pub fn parse_host_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|h| h.trim().to_ascii_lowercase())
        .filter(|h| !h.is_empty())
        .collect()
}
