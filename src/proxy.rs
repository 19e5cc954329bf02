//! Upstream forwarding for requests no mock answers.

use crate::request_log::{capture_headers, CapturedBody, CapturedExchange};
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use reqwest::{redirect, Client, Url};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("upstream host `{0}` is not allowed")]
    HostNotAllowed(String),
    #[error("invalid upstream url `{url}`: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// An upstream response ready to relay.
#[derive(Debug, Clone)]
pub struct ProxiedResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl IntoResponse for ProxiedResponse {
    fn into_response(self) -> Response {
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = self.status;
        *response.headers_mut() = self.headers;
        response
    }
}

/// A request about to be forwarded.
#[derive(Debug, Clone)]
pub struct ForwardRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ForwardRequest {
    /// Prepare a forward of an inbound request.
    ///
    /// `Host` is dropped. `Accept-Encoding` is dropped too, so the client
    /// negotiates only encodings it can decode and the relayed and captured
    /// bodies are always plain.
    pub fn new(
        method: Method,
        base_url: &str,
        inner_full_path: &str,
        inbound_headers: &HeaderMap,
        body: Bytes,
    ) -> Result<Self, ProxyError> {
        let target = target_url(base_url, inner_full_path);
        let url = Url::parse(&target).map_err(|e| ProxyError::InvalidUrl {
            url: target.clone(),
            reason: e.to_string(),
        })?;

        let mut headers = inbound_headers.clone();
        headers.remove(header::HOST);
        headers.remove(header::ACCEPT_ENCODING);

        Ok(Self {
            method,
            url,
            headers,
            body,
        })
    }

    /// Capture of this request, without a response yet.
    pub fn capture(&self, inner_full_path: &str) -> CapturedExchange {
        CapturedExchange {
            inner_full_path: inner_full_path.to_string(),
            upstream_url: self.url.to_string(),
            request_headers: capture_headers(&self.headers),
            request_body: CapturedBody::capture(&self.body),
            response_headers: None,
            response_body: None,
        }
    }
}

/// `base` without trailing slashes, followed by the inner path.
pub fn target_url(base: &str, inner_full_path: &str) -> String {
    let base = base.trim().trim_end_matches('/');
    if inner_full_path.starts_with('/') {
        format!("{}{}", base, inner_full_path)
    } else {
        format!("{}/{}", base, inner_full_path)
    }
}

/// Point an absolute `Location` at the listener, keeping path and query.
/// Relative values are returned unchanged.
pub fn rewrite_location(location: &str, listener_base: &str) -> String {
    match Url::parse(location) {
        Ok(url) if url.has_host() => {
            let mut rewritten = format!("{}{}", listener_base.trim_end_matches('/'), url.path());
            if let Some(query) = url.query() {
                rewritten.push('?');
                rewritten.push_str(query);
            }
            rewritten
        }
        _ => location.to_string(),
    }
}

/// HTTP client for upstream origins.
#[derive(Debug, Clone)]
pub struct Upstream {
    client: Client,
    allowed_hosts: Vec<String>,
}

impl Upstream {
    /// Redirects are relayed to the caller, never followed.
    pub fn new(timeout: Duration, allowed_hosts: Vec<String>) -> Result<Self, ProxyError> {
        let client = Client::builder()
            .redirect(redirect::Policy::none())
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            allowed_hosts: allowed_hosts
                .into_iter()
                .map(|h| h.trim().to_ascii_lowercase())
                .filter(|h| !h.is_empty())
                .collect(),
        })
    }

    /// Whether `url` may be contacted. An empty allow-list admits everything.
    pub fn is_allowed(&self, url: &Url) -> bool {
        if self.allowed_hosts.is_empty() {
            return true;
        }
        url.host_str()
            .map(|host| host.to_ascii_lowercase())
            .is_some_and(|host| self.allowed_hosts.iter().any(|allowed| *allowed == host))
    }

    /// Send `request` upstream and prepare the response for relaying.
    pub async fn forward(
        &self,
        request: &ForwardRequest,
        listener_base: &str,
    ) -> Result<ProxiedResponse, ProxyError> {
        if !self.is_allowed(&request.url) {
            return Err(ProxyError::HostNotAllowed(
                request.url.host_str().unwrap_or_default().to_string(),
            ));
        }

        debug!(method = %request.method, url = %request.url, "Forwarding request upstream");

        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let mut headers = response.headers().clone();
        let body = response.bytes().await?;

        for name in [header::CONTENT_LENGTH, header::TRANSFER_ENCODING, header::CONNECTION] {
            headers.remove(name);
        }
        if let Some(location) = headers
            .get(header::LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(|v| rewrite_location(v, listener_base))
        {
            if let Ok(value) = location.parse() {
                headers.insert(header::LOCATION, value);
            }
        }

        Ok(ProxiedResponse {
            status,
            headers,
            body,
        })
    }
}
