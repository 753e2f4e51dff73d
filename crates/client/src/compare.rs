//! Structural comparison of response payloads.

use serde_json::Value;
use synccache_core::CachedResponse;

/// Whether two payloads carry the same JSON document.
///
/// Object key order and whitespace are ignored. A body that does not parse as
/// JSON never compares equal, so an undecodable refresh always counts as a
/// change.
pub fn same_payload(old: &CachedResponse, new: &CachedResponse) -> bool {
    match (parse(&old.body), parse(&new.body)) {
        (Some(a), Some(b)) => {
            let equal = a == b;
            tracing::debug!(equal, "compared cached payloads");
            equal
        }
        _ => {
            tracing::debug!("payload not decodable as JSON, treating as changed");
            false
        }
    }
}

fn parse(body: &[u8]) -> Option<Value> {
    serde_json::from_slice(body).ok()
}
