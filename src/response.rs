//! Response synthesis for matched mocks.

use crate::model::{strip_keys, FilePayload, ResponseBody};
use crate::template::TemplateContext;
use axum::body::{Body, Bytes};
use axum::http::{header, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use base64::Engine;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Keys reserved for internal bookkeeping, removed from bodies before emission.
pub const RESERVED_BODY_MARKERS: &[&str] =
    &["__cache_ttl__", "__delay_range_ms__", "__error_simulation__"];

/// Headers computed by the HTTP layer; user-declared values are dropped.
const AUTO_COMPUTED_HEADERS: &[&str] = &[
    "content-length",
    "connection",
    "date",
    "server",
    "transfer-encoding",
    "content-encoding",
];

pub const TEXT_PLAIN: &str = "text/plain; charset=utf-8";
pub const APPLICATION_JSON: &str = "application/json";

// RFC 5987 attr-char
const FILENAME_ENCODE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'!')
    .remove(b'#')
    .remove(b'$')
    .remove(b'&')
    .remove(b'+')
    .remove(b'-')
    .remove(b'.')
    .remove(b'^')
    .remove(b'_')
    .remove(b'`')
    .remove(b'|')
    .remove(b'~');

pub fn is_auto_computed_header(name: &str) -> bool {
    AUTO_COMPUTED_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}

/// A fully materialized response, as served and as cached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedResponse {
    pub status: u16,
    pub body: Bytes,
    pub media_type: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl RenderedResponse {
    /// Plain-text response.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: Bytes::from(body.into()),
            media_type: Some(TEXT_PLAIN.to_string()),
            headers: Vec::new(),
        }
    }

    /// Render a mock body with its headers for the current request.
    pub fn render(
        status: u16,
        body: &ResponseBody,
        headers: &BTreeMap<String, String>,
        ctx: &TemplateContext,
    ) -> Self {
        let mut response = match body {
            ResponseBody::File(file) => Self::file(status, file),
            ResponseBody::Json(value) => Self::json(status, value, ctx),
        };

        response.headers.extend(
            headers
                .iter()
                .filter(|(name, _)| !is_auto_computed_header(name))
                .map(|(name, value)| (name.clone(), ctx.render(value))),
        );
        response
    }

    fn json(status: u16, value: &Value, ctx: &TemplateContext) -> Self {
        let mut value = value.clone();
        strip_keys(&mut value, RESERVED_BODY_MARKERS);

        match ctx.render_json(&value) {
            Value::String(text) => Self::text(status, text),
            rendered => Self {
                status,
                body: Bytes::from(rendered.to_string()),
                media_type: Some(APPLICATION_JSON.to_string()),
                headers: Vec::new(),
            },
        }
    }

    fn file(status: u16, file: &FilePayload) -> Self {
        let content = base64::engine::general_purpose::STANDARD
            .decode(file.content_base64.trim())
            .unwrap_or_else(|e| {
                warn!(error = %e, filename = %file.filename, "Invalid base64 file payload");
                Vec::new()
            });

        Self {
            status,
            body: Bytes::from(content),
            media_type: Some(file.mime_type.clone()),
            headers: vec![(
                header::CONTENT_DISPOSITION.to_string(),
                content_disposition(&file.filename),
            )],
        }
    }

    fn has_header(&self, name: &HeaderName) -> bool {
        self.headers
            .iter()
            .any(|(n, _)| n.eq_ignore_ascii_case(name.as_str()))
    }
}

/// `Content-Disposition` value for a download named `filename`.
pub fn content_disposition(filename: &str) -> String {
    if filename.is_ascii() {
        let escaped = filename.replace('\\', "\\\\").replace('"', "\\\"");
        format!("attachment; filename=\"{}\"", escaped)
    } else {
        format!(
            "attachment; filename*=UTF-8''{}",
            utf8_percent_encode(filename, FILENAME_ENCODE_SET)
        )
    }
}

impl IntoResponse for RenderedResponse {
    fn into_response(self) -> Response {
        let status = StatusCode::from_u16(self.status).unwrap_or_else(|_| {
            warn!(status = self.status, "Invalid status code, using 500");
            StatusCode::INTERNAL_SERVER_ERROR
        });

        let set_media_type = !self.has_header(&header::CONTENT_TYPE);
        let mut response = Response::new(Body::from(self.body));
        *response.status_mut() = status;

        let headers = response.headers_mut();
        if set_media_type {
            if let Some(value) = self
                .media_type
                .as_deref()
                .and_then(|m| HeaderValue::from_str(m).ok())
            {
                headers.insert(header::CONTENT_TYPE, value);
            }
        }

        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value.as_bytes()),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.append(name, value);
                }
                _ => debug!(header = %name, "Skipping invalid response header"),
            }
        }

        response
    }
}
