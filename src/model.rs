//! Catalog data model.
//!
//! Folders group mocks under a two-level namespace; mocks carry a match
//! condition, a response and behavior knobs (delay, cache, fault injection).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Name of the mandatory root folder.
pub const DEFAULT_FOLDER: &str = "default";

/// Object key that tags a response body as a file payload.
pub const FILE_PAYLOAD_TAG: &str = "__file__";

/// Status returned by a simulated error when none is configured.
pub const DEFAULT_ERROR_STATUS: u16 = 500;

/// Folder identity: `(name, parent)`, with an empty parent for roots.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FolderKey {
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub parent: String,
}

impl FolderKey {
    pub fn root(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: String::new(),
        }
    }

    pub fn child(name: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            parent: parent.into(),
        }
    }

    pub fn default_root() -> Self {
        Self::root(DEFAULT_FOLDER)
    }

    pub fn is_root(&self) -> bool {
        self.parent.is_empty()
    }

    pub fn is_default_root(&self) -> bool {
        self.is_root() && self.name == DEFAULT_FOLDER
    }
}

impl fmt::Display for FolderKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_root() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{}/{}", self.parent, self.name)
        }
    }
}

/// A folder and its upstream settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub name: String,

    /// Parent folder name; empty for roots
    #[serde(default, deserialize_with = "null_as_default")]
    pub parent_name: String,

    #[serde(default)]
    pub proxy_enabled: bool,

    #[serde(default)]
    pub proxy_base_url: Option<String>,

    #[serde(default)]
    pub display_order: i32,
}

impl Folder {
    pub fn new(key: FolderKey) -> Self {
        Self {
            name: key.name,
            parent_name: key.parent,
            proxy_enabled: false,
            proxy_base_url: None,
            display_order: 0,
        }
    }

    pub fn key(&self) -> FolderKey {
        FolderKey::child(self.name.clone(), self.parent_name.clone())
    }

    /// Upstream base URL when proxying is enabled and a URL is configured.
    pub fn upstream_base(&self) -> Option<&str> {
        if !self.proxy_enabled {
            return None;
        }
        self.proxy_base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }
}

/// Header constraint: a bare literal, or a value with an optional flag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HeaderRequirement {
    Literal(String),
    Detailed {
        #[serde(default)]
        value: String,
        #[serde(default)]
        optional: bool,
    },
}

impl HeaderRequirement {
    pub fn value(&self) -> &str {
        match self {
            HeaderRequirement::Literal(value) => value,
            HeaderRequirement::Detailed { value, .. } => value,
        }
    }

    pub fn is_optional(&self) -> bool {
        matches!(self, HeaderRequirement::Detailed { optional: true, .. })
    }
}

/// Binary response payload carried inline as base64.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePayload {
    pub content_base64: String,
    pub mime_type: String,
    pub filename: String,
}

/// Response body: a JSON document or a file payload.
///
/// On the wire a file payload is an object tagged with `"__file__": true`;
/// everything else is kept as JSON.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "Value", into = "Value")]
pub enum ResponseBody {
    Json(Value),
    File(FilePayload),
}

impl Default for ResponseBody {
    fn default() -> Self {
        ResponseBody::Json(Value::String(String::new()))
    }
}

impl From<Value> for ResponseBody {
    fn from(value: Value) -> Self {
        if let Value::Object(obj) = &value {
            let tagged = obj.get(FILE_PAYLOAD_TAG).and_then(Value::as_bool) == Some(true);
            if let (true, Some(content)) = (tagged, obj.get("content_base64").and_then(Value::as_str)) {
                let text = |key: &str, default: &str| {
                    obj.get(key)
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .unwrap_or(default)
                        .to_string()
                };
                return ResponseBody::File(FilePayload {
                    content_base64: content.to_string(),
                    mime_type: text("mime_type", "application/octet-stream"),
                    filename: text("filename", "file"),
                });
            }
        }
        ResponseBody::Json(value)
    }
}

impl From<ResponseBody> for Value {
    fn from(body: ResponseBody) -> Self {
        match body {
            ResponseBody::Json(value) => value,
            ResponseBody::File(file) => json!({
                FILE_PAYLOAD_TAG: true,
                "content_base64": file.content_base64,
                "mime_type": file.mime_type,
                "filename": file.filename,
            }),
        }
    }
}

/// Probabilistic error substitution.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ErrorSimulation {
    #[serde(default)]
    pub enabled: bool,

    /// Probability in `[0, 1]`
    #[serde(default)]
    pub probability: f64,

    #[serde(default)]
    pub status_code: Option<u16>,

    #[serde(default)]
    pub body: Option<Value>,

    #[serde(default)]
    pub delay_ms: u64,
}

impl ErrorSimulation {
    pub fn status(&self) -> u16 {
        self.status_code.unwrap_or(DEFAULT_ERROR_STATUS)
    }

    pub fn body(&self) -> Value {
        self.body
            .clone()
            .unwrap_or_else(|| json!({"error": "simulated error"}))
    }

    /// Whether a fault draw should happen at all.
    pub fn is_armed(&self) -> bool {
        self.enabled && self.probability > 0.0 && self.probability <= 1.0
    }
}

/// A mock definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mock {
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    #[serde(default = "default_folder_name")]
    pub folder_name: String,

    /// Parent of the owning folder; `None` on legacy records
    #[serde(default)]
    pub parent_name: Option<String>,

    pub method: String,

    pub path: String,

    #[serde(default, deserialize_with = "null_as_default")]
    pub headers: BTreeMap<String, HeaderRequirement>,

    #[serde(default)]
    pub body_contains: Option<String>,

    #[serde(default)]
    pub body_contains_required: bool,

    #[serde(default = "default_status")]
    pub status_code: u16,

    #[serde(default, deserialize_with = "null_as_default")]
    pub response_headers: BTreeMap<String, String>,

    #[serde(default)]
    pub response_body: ResponseBody,

    #[serde(default = "default_true")]
    pub active: bool,

    #[serde(default)]
    pub delay_ms: u64,

    #[serde(default)]
    pub delay_range_min_ms: Option<u64>,

    #[serde(default)]
    pub delay_range_max_ms: Option<u64>,

    #[serde(default)]
    pub cache_enabled: bool,

    #[serde(default)]
    pub cache_ttl_seconds: Option<u64>,

    #[serde(default)]
    pub error_simulation: ErrorSimulation,

    #[serde(default)]
    pub display_order: i32,
}

fn default_folder_name() -> String {
    DEFAULT_FOLDER.to_string()
}

fn default_status() -> u16 {
    200
}

fn default_true() -> bool {
    true
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl Mock {
    /// Create an active mock in `folder` answering `status` with `body`.
    pub fn new(
        folder: &FolderKey,
        method: &str,
        path: &str,
        status_code: u16,
        response_body: ResponseBody,
    ) -> Self {
        let mut mock = Self {
            id: Uuid::new_v4(),
            folder_name: folder.name.clone(),
            parent_name: Some(folder.parent.clone()),
            method: method.to_string(),
            path: path.to_string(),
            headers: BTreeMap::new(),
            body_contains: None,
            body_contains_required: false,
            status_code,
            response_headers: BTreeMap::new(),
            response_body,
            active: true,
            delay_ms: 0,
            delay_range_min_ms: None,
            delay_range_max_ms: None,
            cache_enabled: false,
            cache_ttl_seconds: None,
            error_simulation: ErrorSimulation::default(),
            display_order: 0,
        };
        mock.normalize();
        mock
    }

    /// Owning folder; a missing parent reads as a root.
    pub fn folder_key(&self) -> FolderKey {
        FolderKey::child(
            self.folder_name.clone(),
            self.parent_name.clone().unwrap_or_default(),
        )
    }

    /// Bring stored fields into canonical form. Idempotent.
    pub fn normalize(&mut self) {
        self.method = self.method.trim().to_uppercase();
        self.path = normalize_path(&self.path);
        if let Some(probe) = self.body_contains.take() {
            self.body_contains = Some(canonicalize_json(&probe));
        }
        if self.parent_name.is_none() {
            self.parent_name = Some(String::new());
        }
    }

    /// TTL applied to this mock's responses, in seconds (0 = uncached).
    pub fn effective_cache_ttl(&self, default_ttl_seconds: u64) -> u64 {
        match self.cache_ttl_seconds {
            Some(ttl) if self.cache_enabled && ttl > 0 => ttl,
            _ => default_ttl_seconds,
        }
    }
}

/// Split `path?query` into its base and optional query.
pub fn split_path_query(path: &str) -> (&str, Option<&str>) {
    match path.split_once('?') {
        Some((base, query)) => (base, Some(query)),
        None => (path, None),
    }
}

/// Strip trailing slashes from a base path, keeping `/` for the root.
pub fn normalize_base(base: &str) -> String {
    let base = base.trim();
    let trimmed = base.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Normalize a stored mock path: leading slash, no trailing slashes, query kept.
pub fn normalize_path(path: &str) -> String {
    let (base, query) = split_path_query(path.trim());
    let base = normalize_base(base);
    match query {
        Some(query) if !query.is_empty() => format!("{}?{}", base, query),
        _ => base,
    }
}

/// Re-serialize `text` as compact JSON, preserving key order.
/// Text that is not a JSON document is returned unchanged.
pub fn canonicalize_json(text: &str) -> String {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => value.to_string(),
        Err(_) => text.to_string(),
    }
}

/// Drop the given keys from a top-level JSON object.
pub fn strip_keys(value: &mut Value, keys: &[&str]) {
    if let Value::Object(obj) = value {
        for key in keys {
            obj.remove(*key);
        }
    }
}
