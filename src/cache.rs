//! Per-mock response cache.
//!
//! Entries are evicted lazily: an expired entry is removed by the read that
//! finds it. Concurrent writers for the same key are last-writer-wins.

use crate::response::RenderedResponse;
use dashmap::DashMap;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub mock_id: Uuid,
    pub method: String,
    pub inner_full_path: String,
}

impl CacheKey {
    pub fn new(mock_id: Uuid, method: &str, inner_full_path: &str) -> Self {
        Self {
            mock_id,
            method: method.to_ascii_uppercase(),
            inner_full_path: inner_full_path.to_string(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.mock_id, self.method, self.inner_full_path)
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    response: RenderedResponse,
    expires_at: Instant,
}

#[derive(Debug, Default)]
pub struct ResponseCache {
    entries: DashMap<CacheKey, CacheEntry>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached response for `key`, unless missing or expired.
    pub fn get(&self, key: &CacheKey) -> Option<RenderedResponse> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Some(entry.response.clone());
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        None
    }

    /// Store a response for `ttl_seconds`. A zero TTL stores nothing.
    pub fn put(&self, key: CacheKey, response: RenderedResponse, ttl_seconds: u64) {
        if ttl_seconds == 0 {
            return;
        }
        let expires_at = Instant::now() + Duration::from_secs(ttl_seconds);
        self.entries.insert(
            key,
            CacheEntry {
                response,
                expires_at,
            },
        );
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
