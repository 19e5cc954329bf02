//! Request log records and their writer.
//!
//! One record is appended per completed request. Proxied requests carry the
//! captured exchange so a mock can later be synthesized from it.

use crate::model::{FilePayload, FolderKey, Mock, ResponseBody};
use crate::store::RequestLogSink;
use axum::http::HeaderMap;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

/// Captured body: UTF-8 text, or base64 when the bytes are not UTF-8.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "encoding", content = "data", rename_all = "snake_case")]
pub enum CapturedBody {
    Text(String),
    Base64(String),
}

impl CapturedBody {
    pub fn capture(bytes: &[u8]) -> Self {
        match std::str::from_utf8(bytes) {
            Ok(text) => CapturedBody::Text(strip_nul(text)),
            Err(_) => CapturedBody::Base64(base64::engine::general_purpose::STANDARD.encode(bytes)),
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            CapturedBody::Text(text) => text.is_empty(),
            CapturedBody::Base64(data) => data.is_empty(),
        }
    }
}

/// Both directions of a proxied exchange.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapturedExchange {
    /// Request path relative to the folder, with query
    pub inner_full_path: String,
    pub upstream_url: String,
    pub request_headers: BTreeMap<String, String>,
    pub request_body: CapturedBody,
    /// Absent when the upstream could not be reached
    pub response_headers: Option<BTreeMap<String, String>>,
    pub response_body: Option<CapturedBody>,
}

/// Copy headers into a string map, dropping NUL bytes. Repeated headers are
/// joined with `, `.
pub fn capture_headers(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut captured: BTreeMap<String, String> = BTreeMap::new();
    for (name, value) in headers {
        let value = strip_nul(&String::from_utf8_lossy(value.as_bytes()));
        captured
            .entry(strip_nul(name.as_str()))
            .and_modify(|existing| {
                existing.push_str(", ");
                existing.push_str(&value);
            })
            .or_insert(value);
    }
    captured
}

fn strip_nul(text: &str) -> String {
    text.replace('\0', "")
}

/// A persisted request-log entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestLogRecord {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub folder: FolderKey,
    pub method: String,
    /// Inner path without query
    pub path: String,
    pub is_proxied: bool,
    pub response_time_ms: u64,
    pub status_code: u16,
    pub cache_ttl_seconds: Option<u64>,
    pub cache_key: Option<String>,
    pub capture: Option<CapturedExchange>,
}

impl RequestLogRecord {
    pub fn new(folder: FolderKey, method: &str, path: &str, status_code: u16) -> Self {
        Self {
            id: Uuid::new_v4(),
            timestamp: Utc::now(),
            folder,
            method: method.to_string(),
            path: path.to_string(),
            is_proxied: false,
            response_time_ms: 0,
            status_code,
            cache_ttl_seconds: None,
            cache_key: None,
            capture: None,
        }
    }

    /// Build a mock that replays this record's upstream response.
    ///
    /// Only proxied records with a captured response qualify.
    pub fn synthesize_mock(&self) -> Option<Mock> {
        let capture = self.capture.as_ref()?;
        let response_body = capture.response_body.as_ref()?;
        let response_headers = capture.response_headers.clone().unwrap_or_default();

        let content_type = response_headers
            .iter()
            .find(|(name, _)| name.eq_ignore_ascii_case("content-type"))
            .map(|(_, value)| value.clone());

        let body = match response_body {
            CapturedBody::Text(text) => match serde_json::from_str(text) {
                Ok(json) => ResponseBody::Json(json),
                Err(_) => ResponseBody::Json(serde_json::Value::String(text.clone())),
            },
            CapturedBody::Base64(data) => ResponseBody::File(FilePayload {
                content_base64: data.clone(),
                mime_type: content_type
                    .clone()
                    .unwrap_or_else(|| "application/octet-stream".to_string()),
                filename: file_name_for(&self.path),
            }),
        };

        let mut mock = Mock::new(
            &self.folder,
            &self.method,
            &capture.inner_full_path,
            self.status_code,
            body,
        );
        mock.response_headers = response_headers
            .into_iter()
            .filter(|(name, _)| !crate::response::is_auto_computed_header(name))
            .collect();
        Some(mock)
    }
}

fn file_name_for(path: &str) -> String {
    path.rsplit('/')
        .find(|segment| !segment.is_empty())
        .unwrap_or("download")
        .to_string()
}

/// Appends records to a sink without ever failing the request.
#[derive(Clone)]
pub struct RequestLogWriter {
    sink: Arc<dyn RequestLogSink>,
}

impl RequestLogWriter {
    pub fn new(sink: Arc<dyn RequestLogSink>) -> Self {
        Self { sink }
    }

    pub async fn write(&self, record: RequestLogRecord) {
        if let Err(e) = self.sink.append(&record).await {
            warn!(
                error = %e,
                folder = %record.folder,
                method = %record.method,
                path = %record.path,
                "Failed to write request log"
            );
        }
    }
}
