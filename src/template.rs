//! Placeholder substitution for dynamic responses.
//!
//! Templates use single-brace placeholders such as `{method}` or
//! `{query_page}`. `{{` and `}}` produce literal braces. Unknown names render
//! as the empty string and a malformed template is returned unchanged.

use crate::matcher::parse_query_string;
use axum::http::HeaderMap;
use serde_json::Value;
use std::collections::HashMap;

/// Values available to placeholders for one request.
#[derive(Debug, Clone, Default)]
pub struct TemplateContext {
    values: HashMap<String, String>,
}

impl TemplateContext {
    /// Build the context for a request.
    ///
    /// `raw_path` is the path as received, before folder stripping;
    /// `inner_full_path` is the folder-relative path with query.
    pub fn from_request(
        method: &str,
        raw_path: &str,
        inner_full_path: &str,
        query: &str,
        headers: &HeaderMap,
    ) -> Self {
        let mut values = HashMap::new();
        values.insert("method".to_string(), method.to_string());
        values.insert("path".to_string(), raw_path.to_string());
        values.insert("full_path".to_string(), inner_full_path.to_string());
        values.insert("query".to_string(), query.to_string());

        for (name, value) in headers {
            let key = format!("header_{}", name.as_str().replace('-', "_"));
            values
                .entry(key)
                .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
        }

        // Last occurrence wins for repeated parameters.
        for (name, value) in parse_query_string(query) {
            values.insert(format!("query_{}", name), value);
        }

        Self { values }
    }

    /// Value for a placeholder name. Header names are case-insensitive.
    pub fn lookup(&self, name: &str) -> &str {
        let name = name
            .split(|c| c == ':' || c == '!')
            .next()
            .unwrap_or_default()
            .trim();

        if let Some(header) = name.strip_prefix("header_") {
            let key = format!("header_{}", header.to_ascii_lowercase());
            return self.values.get(&key).map(String::as_str).unwrap_or("");
        }
        self.values.get(name).map(String::as_str).unwrap_or("")
    }

    /// Render a template string.
    pub fn render(&self, template: &str) -> String {
        if !template.contains(['{', '}']) {
            return template.to_string();
        }

        let mut out = String::with_capacity(template.len());
        let mut chars = template.chars().peekable();

        while let Some(ch) = chars.next() {
            match ch {
                '{' if chars.peek() == Some(&'{') => {
                    chars.next();
                    out.push('{');
                }
                '{' => {
                    let mut name = String::new();
                    let mut closed = false;
                    for c in chars.by_ref() {
                        match c {
                            '}' => {
                                closed = true;
                                break;
                            }
                            '{' => return template.to_string(),
                            _ => name.push(c),
                        }
                    }
                    if !closed {
                        return template.to_string();
                    }
                    out.push_str(self.lookup(&name));
                }
                '}' if chars.peek() == Some(&'}') => {
                    chars.next();
                    out.push('}');
                }
                '}' => return template.to_string(),
                _ => out.push(ch),
            }
        }

        out
    }

    /// Render every string leaf of a JSON value. Keys are left alone.
    pub fn render_json(&self, value: &Value) -> Value {
        match value {
            Value::String(s) => Value::String(self.render(s)),
            Value::Array(arr) => Value::Array(arr.iter().map(|v| self.render_json(v)).collect()),
            Value::Object(obj) => Value::Object(
                obj.iter()
                    .map(|(k, v)| (k.clone(), self.render_json(v)))
                    .collect(),
            ),
            _ => value.clone(),
        }
    }
}
