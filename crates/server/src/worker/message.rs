//! Worker wire protocol.
//!
//! Both directions carry owned [`WorkerMessage`] values of the form
//! `{"type": string, "data": any}`. Inbound messages are parsed into a
//! [`WorkerRequest`]; outbound ones are built with the constructors on
//! [`WorkerMessage`] and decoded by the foreground into [`WorkerNotice`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use synccache_core::{CacheEntry, GroupKey};

pub const SYNC: &str = "sync";
pub const DELETE: &str = "delete";
pub const REFRESH: &str = "refresh";
pub const START: &str = "start";
pub const STOP: &str = "stop";

pub const GROUP_CREATED: &str = "cacheEntriesGroupCreated";
pub const GROUP_UPDATED: &str = "cacheEntriesGroupUpdated";
pub const GROUP_DELETED: &str = "cacheEntriesGroupDeleted";
pub const ENTRY_CREATED: &str = "cacheEntryCreated";
pub const ENTRY_UPDATED: &str = "cacheEntryUpdated";
pub const ENTRY_DELETED: &str = "cacheEntryDeleted";

/// Envelope exchanged with the worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerMessage {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub data: Value,
}

impl WorkerMessage {
    pub fn new(kind: impl Into<String>, data: Value) -> Self {
        Self { kind: kind.into(), data }
    }

    pub fn sync(events: &[SyncEvent]) -> Self {
        Self::new(SYNC, json!(events))
    }

    pub fn delete(events: &[SyncEvent]) -> Self {
        Self::new(DELETE, json!(events))
    }

    pub fn refresh() -> Self {
        Self::new(REFRESH, Value::Null)
    }

    pub fn start(interval_ms: u64) -> Self {
        Self::new(START, json!({ "interval": interval_ms }))
    }

    pub fn stop() -> Self {
        Self::new(STOP, Value::Null)
    }

    pub fn group_created(group: &GroupKey, members: &[CacheEntry]) -> Self {
        Self::new(GROUP_CREATED, json!({ "groupName": group.as_str(), "entries": entries_json(members) }))
    }

    pub fn group_updated(group: &GroupKey, members: &[CacheEntry]) -> Self {
        Self::new(GROUP_UPDATED, json!({ "groupName": group.as_str(), "entries": entries_json(members) }))
    }

    pub fn group_deleted(group: &GroupKey, urls: &[String]) -> Self {
        Self::new(GROUP_DELETED, json!({ "groupName": group.as_str(), "entries": urls }))
    }

    pub fn entry_created(entry: &CacheEntry) -> Self {
        Self::new(ENTRY_CREATED, entry_json(entry))
    }

    pub fn entry_updated(entry: &CacheEntry) -> Self {
        Self::new(ENTRY_UPDATED, entry_json(entry))
    }

    pub fn entry_deleted(url: &str, name: Option<&str>) -> Self {
        Self::new(ENTRY_DELETED, json!({ "request": url, "cacheEntry": name }))
    }
}

/// Server-side change notice for one resource version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncEvent {
    pub id: Value,
    pub version: Value,
    /// Epoch milliseconds of the last server-side change.
    #[serde(rename = "lastUpdate", alias = "last_update")]
    pub last_update: i64,
}

impl SyncEvent {
    pub fn new(id: impl Into<Value>, version: impl Into<Value>, last_update: i64) -> Self {
        Self { id: id.into(), version: version.into(), last_update }
    }

    /// Group of this resource version.
    pub fn group_key(&self) -> GroupKey {
        GroupKey::from_value(&json!({ "id": self.id, "version": self.version }))
    }

    /// Group of the resource across all versions.
    pub fn parent_key(&self) -> GroupKey {
        GroupKey::from_value(&json!({ "id": self.id }))
    }
}

/// Why an inbound message was not dispatched.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("unknown message type: {0}")]
    UnknownType(String),

    #[error("malformed {kind} message: {reason}")]
    Malformed { kind: String, reason: String },
}

/// Inbound messages the worker knows how to handle.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerRequest {
    Sync(Vec<SyncEvent>),
    Delete(Vec<SyncEvent>),
    Refresh,
    Start { interval_ms: u64 },
    Stop,
}

impl TryFrom<&WorkerMessage> for WorkerRequest {
    type Error = DispatchError;

    fn try_from(message: &WorkerMessage) -> Result<Self, Self::Error> {
        match message.kind.as_str() {
            SYNC => Ok(Self::Sync(parse_events(message)?)),
            DELETE => Ok(Self::Delete(parse_events(message)?)),
            REFRESH => Ok(Self::Refresh),
            START => {
                let interval_ms = message
                    .data
                    .get("interval")
                    .and_then(Value::as_u64)
                    .filter(|ms| *ms > 0)
                    .ok_or_else(|| malformed(message, "expected a positive `interval` in milliseconds"))?;
                Ok(Self::Start { interval_ms })
            }
            STOP => Ok(Self::Stop),
            other => Err(DispatchError::UnknownType(other.to_string())),
        }
    }
}

/// Events are accepted as an array or as a single object.
fn parse_events(message: &WorkerMessage) -> Result<Vec<SyncEvent>, DispatchError> {
    let parsed: Result<Vec<SyncEvent>, serde_json::Error> = match &message.data {
        Value::Array(_) => serde_json::from_value(message.data.clone()),
        Value::Object(_) => serde_json::from_value(message.data.clone()).map(|event| vec![event]),
        Value::Null => Ok(Vec::new()),
        _ => return Err(malformed(message, "expected an event or a list of events")),
    };
    parsed.map_err(|e| malformed(message, &e.to_string()))
}

fn malformed(message: &WorkerMessage, reason: &str) -> DispatchError {
    DispatchError::Malformed { kind: message.kind.clone(), reason: reason.to_string() }
}

/// Worker output as seen by the foreground.
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerNotice {
    GroupCreated { group: GroupKey, members: Vec<String> },
    GroupUpdated { group: GroupKey, members: Vec<String> },
    GroupDeleted { group: GroupKey, members: Vec<String> },
    EntryCreated { url: String },
    EntryUpdated { url: String },
    EntryDeleted { url: String },
}

impl TryFrom<&WorkerMessage> for WorkerNotice {
    type Error = DispatchError;

    fn try_from(message: &WorkerMessage) -> Result<Self, Self::Error> {
        match message.kind.as_str() {
            GROUP_CREATED => {
                let (group, members) = group_payload(message)?;
                Ok(Self::GroupCreated { group, members })
            }
            GROUP_UPDATED => {
                let (group, members) = group_payload(message)?;
                Ok(Self::GroupUpdated { group, members })
            }
            GROUP_DELETED => {
                let (group, members) = group_payload(message)?;
                Ok(Self::GroupDeleted { group, members })
            }
            ENTRY_CREATED => Ok(Self::EntryCreated { url: request_url(message)? }),
            ENTRY_UPDATED => Ok(Self::EntryUpdated { url: request_url(message)? }),
            ENTRY_DELETED => Ok(Self::EntryDeleted { url: request_url(message)? }),
            other => Err(DispatchError::UnknownType(other.to_string())),
        }
    }
}

/// `groupName` plus member URLs; `entries` is either a URL list or a map keyed by URL.
fn group_payload(message: &WorkerMessage) -> Result<(GroupKey, Vec<String>), DispatchError> {
    let group = message
        .data
        .get("groupName")
        .and_then(Value::as_str)
        .map(GroupKey::parse)
        .ok_or_else(|| malformed(message, "missing `groupName`"))?;

    let members = match message.data.get("entries") {
        Some(Value::Array(urls)) => urls.iter().filter_map(Value::as_str).map(String::from).collect(),
        Some(Value::Object(map)) => map.keys().cloned().collect(),
        _ => Vec::new(),
    };
    Ok((group, members))
}

fn request_url(message: &WorkerMessage) -> Result<String, DispatchError> {
    message
        .data
        .get("request")
        .and_then(Value::as_str)
        .map(String::from)
        .ok_or_else(|| malformed(message, "missing `request`"))
}

fn entries_json(members: &[CacheEntry]) -> Value {
    let entries: BTreeMap<&str, Value> = members
        .iter()
        .map(|entry| {
            let response = entry
                .response
                .as_ref()
                .and_then(|r| r.json::<Value>().ok())
                .unwrap_or(Value::Null);
            (entry.url(), json!({ "request": entry.url(), "response": response }))
        })
        .collect();
    json!(entries)
}

fn entry_json(entry: &CacheEntry) -> Value {
    let data = entry
        .response
        .as_ref()
        .and_then(|r| r.json::<Value>().ok())
        .unwrap_or(Value::Null);
    json!({
        "request": entry.url(),
        "cacheEntry": entry.meta.name,
        "cacheGroup": entry.meta.group,
        "cacheTTL": entry.meta.ttl_ms,
        "cacheCreatedAt": entry.meta.created_at,
        "data": data,
    })
}
