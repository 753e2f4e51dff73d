//! Stored request/response pairs and the metadata carried with them.
//!
//! Cache metadata travels inside the stored request headers so that it
//! survives a round trip through the store unchanged:
//!
//! | header             | meaning                                   |
//! |--------------------|-------------------------------------------|
//! | `cache-entry`      | optional entry name (secondary key)       |
//! | `cache-group`      | optional canonical group key              |
//! | `cache-created-at` | epoch milliseconds of the last write      |
//! | `cache-ttl`        | lifetime in milliseconds, `0` = no expiry |
//!
//! Header names are stored lowercase. Metadata headers are stripped before a
//! request goes over the wire (see [`CachedRequest::network_headers`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::GroupKey;

pub const HEADER_ENTRY: &str = "cache-entry";
pub const HEADER_GROUP: &str = "cache-group";
pub const HEADER_CREATED_AT: &str = "cache-created-at";
pub const HEADER_TTL: &str = "cache-ttl";

const META_HEADERS: [&str; 4] = [HEADER_ENTRY, HEADER_GROUP, HEADER_CREATED_AT, HEADER_TTL];

/// Header map with lowercase names.
pub type Headers = BTreeMap<String, String>;

/// Cache bookkeeping attached to one entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub name: Option<String>,
    pub group: Option<GroupKey>,
    pub ttl_ms: u64,
    pub created_at: i64,
}

impl EntryMeta {
    pub fn new(created_at: i64, ttl_ms: u64) -> Self {
        Self { name: None, group: None, ttl_ms, created_at }
    }

    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name.filter(|n| !n.is_empty());
        self
    }

    pub fn with_group(mut self, group: Option<GroupKey>) -> Self {
        self.group = group;
        self
    }

    /// TTL expiry check. A TTL of `0` never expires.
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.ttl_ms > 0 && now_millis - self.created_at >= self.ttl_ms as i64
    }

    /// Decode metadata from stored request headers.
    ///
    /// Missing or malformed `cache-created-at` falls back to `fallback_created_at`;
    /// a missing `cache-ttl` falls back to `default_ttl_ms`.
    pub fn from_headers(headers: &Headers, fallback_created_at: i64, default_ttl_ms: u64) -> Self {
        let created_at = headers
            .get(HEADER_CREATED_AT)
            .and_then(|v| v.trim().parse::<i64>().ok())
            .unwrap_or(fallback_created_at);
        let ttl_ms = headers
            .get(HEADER_TTL)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .unwrap_or(default_ttl_ms);
        Self {
            name: headers.get(HEADER_ENTRY).filter(|v| !v.is_empty()).cloned(),
            group: headers.get(HEADER_GROUP).filter(|v| !v.is_empty()).map(|v| GroupKey::parse(v)),
            ttl_ms,
            created_at,
        }
    }

    /// Write the metadata headers into `headers`, replacing previous values.
    pub fn apply_to(&self, headers: &mut Headers) {
        for name in META_HEADERS {
            headers.remove(name);
        }
        if let Some(name) = &self.name {
            headers.insert(HEADER_ENTRY.to_string(), name.clone());
        }
        if let Some(group) = &self.group {
            headers.insert(HEADER_GROUP.to_string(), group.to_string());
        }
        headers.insert(HEADER_CREATED_AT.to_string(), self.created_at.to_string());
        headers.insert(HEADER_TTL.to_string(), self.ttl_ms.to_string());
    }
}

/// A request as kept in the store: URL plus headers (metadata included).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedRequest {
    pub url: String,
    pub headers: Headers,
}

impl CachedRequest {
    /// Build a stored request from caller headers and cache metadata.
    pub fn new(url: impl Into<String>, headers: &Headers, meta: &EntryMeta) -> Self {
        let mut normalized: Headers = headers
            .iter()
            .map(|(k, v)| (k.to_ascii_lowercase(), v.clone()))
            .collect();
        meta.apply_to(&mut normalized);
        Self { url: url.into(), headers: normalized }
    }

    /// Metadata decoded from the stored headers.
    pub fn meta(&self, fallback_created_at: i64, default_ttl_ms: u64) -> EntryMeta {
        EntryMeta::from_headers(&self.headers, fallback_created_at, default_ttl_ms)
    }

    /// Headers to send over the network: everything except cache metadata.
    pub fn network_headers(&self) -> Headers {
        self.headers
            .iter()
            .filter(|(k, _)| !META_HEADERS.contains(&k.as_str()))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Copy of this request with metadata replaced.
    pub fn with_meta(&self, meta: &EntryMeta) -> Self {
        let mut headers = self.headers.clone();
        meta.apply_to(&mut headers);
        Self { url: self.url.clone(), headers }
    }
}

/// A response as kept in the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: Headers,
    pub body: Vec<u8>,
}

impl CachedResponse {
    pub fn new(status: u16, status_text: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self { status, status_text: status_text.into(), headers: Headers::new(), body: body.into() }
    }

    /// Status in the 400-599 range.
    pub fn is_error(&self) -> bool {
        (400..600).contains(&self.status)
    }

    /// Whether the response may be served from cache.
    ///
    /// Opaque responses (status `0`) and error statuses never are.
    pub fn is_servable(&self) -> bool {
        self.status != 0 && !self.is_error()
    }

    /// Decode the body as JSON.
    pub fn json<T: serde::de::DeserializeOwned>(&self) -> Result<T, crate::Error> {
        serde_json::from_slice(&self.body).map_err(|e| crate::Error::Decode(e.to_string()))
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

/// Immutable view over one cached entry.
///
/// `response` is `None` when the snapshot was taken without loading bodies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub request: CachedRequest,
    pub response: Option<CachedResponse>,
    pub meta: EntryMeta,
}

impl CacheEntry {
    pub fn url(&self) -> &str {
        &self.request.url
    }

    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.meta.is_expired(now_millis)
    }
}
