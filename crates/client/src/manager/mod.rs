//! Read-through/write-through cache over a named [`CacheStore`].
//!
//! The manager decides when a stored response may be served, goes to the
//! network otherwise, and keeps entry names and groups consistent. Every
//! change is published as a [`CacheEvent`].
//!
//! ### Serving rules
//! - A stored response is served when its status is neither `0` nor in the
//!   400-599 range and its TTL has not elapsed (TTL `0` never elapses).
//! - Otherwise up to `fetch_attempts` network attempts are made, back to back.
//!   Transport failures and error statuses are retried, except `404` which
//!   ends the attempts and evicts the entry.
//! - If every attempt failed without a response and a servable entry exists,
//!   that entry is served stale.
//!
//! ### Change suppression
//! A write replaces the stored pair and resets `created_at`, but an
//! `EntryUpdated` event only fires when the new JSON payload differs from the
//! old one.

pub mod events;
pub mod snapshot;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

use synccache_core::clock::system_clock;
use synccache_core::{
    AppConfig, CacheEntry, CacheStore, CachedRequest, CachedResponse, EntryMeta, Error, GroupKey, Headers,
    SharedClock,
};

use crate::compare::same_payload;
use crate::fetch::{HttpTransport, OutgoingRequest, canonicalize};

pub use events::{CacheEvent, EventBroadcaster};
pub use snapshot::CacheEntriesSnapshot;

/// Tunables of a [`CacheManager`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManagerConfig {
    /// Network attempts per fetch or refresh.
    pub fetch_attempts: u32,
    /// TTL for requests that do not set one. `0` = never expires.
    pub default_ttl_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self { fetch_attempts: 3, default_ttl_ms: 0 }
    }
}

impl From<&AppConfig> for ManagerConfig {
    fn from(config: &AppConfig) -> Self {
        Self { fetch_attempts: config.fetch_attempts, default_ttl_ms: config.default_ttl_ms }
    }
}

/// Per-request cache options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub headers: Headers,
    pub name: Option<String>,
    pub group: Option<GroupKey>,
    pub ttl_ms: Option<u64>,
}

impl FetchOptions {
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into().to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_group(mut self, group: GroupKey) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_ttl(mut self, ttl_ms: u64) -> Self {
        self.ttl_ms = Some(ttl_ms);
        self
    }
}

/// Options for [`CacheManager::refresh_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshOptions {
    /// Refresh even if the TTL has not elapsed.
    pub ignore_ttl: bool,
    /// Publish entry-level update events.
    pub notify_updates: bool,
}

impl Default for RefreshOptions {
    fn default() -> Self {
        Self { ignore_ttl: false, notify_updates: true }
    }
}

/// Result of refreshing one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    /// TTL not elapsed; nothing was sent.
    Skipped,
    /// Refetched; payload identical, only `created_at` moved.
    Unchanged,
    /// Refetched; payload differs.
    Updated,
    /// Refetch failed; the entry was removed.
    Evicted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteChange {
    Created,
    Updated,
    Unchanged,
}

/// Cache manager bound to one named store.
///
/// Cloning is cheap and shares the store, transport and event channel.
#[derive(Clone)]
pub struct CacheManager {
    store: CacheStore,
    transport: Arc<dyn HttpTransport>,
    clock: SharedClock,
    config: ManagerConfig,
    events: EventBroadcaster,
}

impl fmt::Debug for CacheManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheManager")
            .field("cache_name", &self.store.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl CacheManager {
    pub fn new(store: CacheStore, transport: Arc<dyn HttpTransport>) -> Self {
        Self {
            store,
            transport,
            clock: system_clock(),
            config: ManagerConfig::default(),
            events: EventBroadcaster::new(),
        }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Deliver every event to `sink` as well, without loss.
    pub fn with_event_sink(mut self, sink: mpsc::UnboundedSender<CacheEvent>) -> Self {
        self.events = self.events.with_sink(sink);
        self
    }

    pub fn cache_name(&self) -> &str {
        self.store.name()
    }

    pub fn store(&self) -> &CacheStore {
        &self.store
    }

    pub fn config(&self) -> ManagerConfig {
        self.config
    }

    /// Subscribe to lifecycle events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Serve `url` from cache when possible, otherwise fetch and write through.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidUrl` / `Error::InvalidInput` for an unusable URL
    /// - `Error::Http` when the last attempt got an error status
    /// - `Error::Transport` when no attempt got a response and nothing is cached
    pub async fn fetch(&self, url: &str, options: FetchOptions) -> Result<CachedResponse, Error> {
        let url = canonicalize(url)?.to_string();
        let now = self.clock.now_millis();
        let cached = self.store.match_url(&url).await?;

        match &cached {
            Some((request, response)) => {
                let expired = request.meta(now, self.config.default_ttl_ms).is_expired(now);
                if response.is_servable() && !expired {
                    tracing::debug!(url = %url, "cache hit");
                    return Ok(response.clone());
                }
                tracing::debug!(url = %url, status = response.status, expired, "cache stale");
            }
            None => tracing::debug!(url = %url, "cache miss"),
        }

        let meta = EntryMeta::new(now, options.ttl_ms.unwrap_or(self.config.default_ttl_ms))
            .with_name(options.name)
            .with_group(options.group);
        let request = CachedRequest::new(url.clone(), &options.headers, &meta);
        let stored_name = cached.as_ref().and_then(|(request, _)| request.meta(now, 0).name);
        let previous = cached.map(|(_, response)| response);

        match self.send(&request).await {
            Ok(response) => {
                self.write_through(&request, &response, previous.as_ref(), true).await?;
                Ok(response)
            }
            Err(err) if err.is_not_found() => {
                self.evict(&url, stored_name).await?;
                Err(err)
            }
            Err(err @ Error::Transport(_)) => match previous.filter(CachedResponse::is_servable) {
                Some(stale) => {
                    tracing::warn!(url = %url, error = %err, "network unavailable, serving stale entry");
                    Ok(stale)
                }
                None => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// Snapshot every entry of the cache.
    ///
    /// With `fetch_response` false only requests and metadata are loaded.
    pub async fn get_entries(&self, fetch_response: bool) -> Result<CacheEntriesSnapshot, Error> {
        let now = self.clock.now_millis();
        let requests = self.store.keys().await?;
        let mut entries = Vec::with_capacity(requests.len());

        for request in requests {
            let response = if fetch_response {
                match self.store.match_url(&request.url).await? {
                    Some((_, response)) => Some(response),
                    // Deleted since keys() ran.
                    None => continue,
                }
            } else {
                None
            };
            let meta = request.meta(now, self.config.default_ttl_ms);
            entries.push(CacheEntry { request, response, meta });
        }

        Ok(CacheEntriesSnapshot::from_entries(entries))
    }

    /// Refetch one entry.
    ///
    /// Skipped while the TTL has not elapsed unless `ignore_ttl` is set. A
    /// failed refetch evicts the entry instead of returning an error; only
    /// store failures surface as `Err`.
    pub async fn refresh_entry(&self, entry: &CacheEntry, options: RefreshOptions) -> Result<RefreshOutcome, Error> {
        self.refresh_one(entry, options).await.map(|(outcome, _)| outcome)
    }

    /// Refresh the entry named `name`, ignoring its TTL.
    ///
    /// Returns `None` when no entry carries that name.
    pub async fn refresh_cache_entry_by_key(&self, name: &str) -> Result<Option<RefreshOutcome>, Error> {
        let snapshot = self.get_entries(true).await?;
        let Some(entry) = snapshot.by_name(name) else {
            tracing::debug!(name, "no entry with that name");
            return Ok(None);
        };
        let outcome = self
            .refresh_entry(entry, RefreshOptions { ignore_ttl: true, notify_updates: true })
            .await?;
        Ok(Some(outcome))
    }

    /// Refresh every member of `group`, ignoring TTLs.
    ///
    /// Member updates are not published individually; when
    /// `notify_group_update` is set one `GroupUpdated` carries the surviving
    /// members. Returns `false` if the group is unknown.
    pub async fn refresh_cache_entries_group(&self, group: &GroupKey, notify_group_update: bool) -> Result<bool, Error> {
        let snapshot = self.get_entries(true).await?;
        let members = snapshot.group_members(group);
        if members.is_empty() {
            tracing::debug!(group = %group, "group not found");
            return Ok(false);
        }

        let options = RefreshOptions { ignore_ttl: true, notify_updates: false };
        let mut current = Vec::with_capacity(members.len());
        for entry in members {
            match self.refresh_one(entry, options).await {
                Ok((_, Some(refreshed))) => current.push(refreshed),
                Ok((_, None)) => {}
                Err(err) => tracing::warn!(group = %group, url = %entry.url(), error = %err, "group member refresh failed"),
            }
        }

        tracing::info!(group = %group, members = current.len(), "refreshed group");
        if notify_group_update {
            self.events.send(CacheEvent::GroupUpdated { group: group.clone(), members: current });
        }
        Ok(true)
    }

    /// Refresh every expired entry.
    ///
    /// Grouped entries go first, group by group; a group with at least one
    /// changed member publishes one `GroupUpdated`. Ungrouped entries follow
    /// and publish their own updates. Returns the outcome per URL; entries
    /// whose refresh hit a store error are logged and left out.
    pub async fn refresh(&self) -> Result<BTreeMap<String, RefreshOutcome>, Error> {
        let snapshot = self.get_entries(true).await?;
        let mut outcomes = BTreeMap::new();

        let grouped = RefreshOptions { ignore_ttl: false, notify_updates: false };
        for group in snapshot.groups() {
            let mut members = Vec::new();
            let mut changed = false;
            for entry in snapshot.group_members(group) {
                match self.refresh_one(entry, grouped).await {
                    Ok((outcome, current)) => {
                        changed |= outcome == RefreshOutcome::Updated;
                        outcomes.insert(entry.url().to_string(), outcome);
                        members.extend(current);
                    }
                    Err(err) => tracing::warn!(group = %group, url = %entry.url(), error = %err, "refresh failed"),
                }
            }
            if changed {
                tracing::info!(group = %group, "group changed");
                self.events.send(CacheEvent::GroupUpdated { group: group.clone(), members });
            } else {
                tracing::debug!(group = %group, "group unchanged");
            }
        }

        for entry in snapshot.ungrouped() {
            match self.refresh_entry(entry, RefreshOptions::default()).await {
                Ok(outcome) => {
                    outcomes.insert(entry.url().to_string(), outcome);
                }
                Err(err) => tracing::warn!(url = %entry.url(), error = %err, "refresh failed"),
            }
        }

        Ok(outcomes)
    }

    /// Remove the entry stored under `url`.
    pub async fn delete_cache_entry_by_url(&self, url: &str) -> Result<bool, Error> {
        let url = canonicalize(url)?.to_string();
        let name = self
            .store
            .match_url(&url)
            .await?
            .and_then(|(request, _)| request.meta(0, 0).name);
        self.evict(&url, name).await
    }

    /// Remove the entry named `name`.
    pub async fn delete_cache_entry_by_key(&self, name: &str) -> Result<bool, Error> {
        let snapshot = self.get_entries(false).await?;
        match snapshot.by_name(name) {
            Some(entry) => self.evict(entry.url(), Some(name.to_string())).await,
            None => {
                tracing::debug!(name, "no entry with that name");
                Ok(false)
            }
        }
    }

    /// Remove every member of `group` and publish one `GroupDeleted`.
    ///
    /// Per-member `EntryDeleted` events are published only when
    /// `notify_entry_deletion` is set. A member that cannot be deleted is
    /// logged and left out of `GroupDeleted`. Returns `false` if the group is
    /// unknown.
    pub async fn delete_cache_entries_group(&self, group: &GroupKey, notify_entry_deletion: bool) -> Result<bool, Error> {
        let snapshot = self.get_entries(false).await?;
        let members = snapshot.group_members(group);
        if members.is_empty() {
            tracing::debug!(group = %group, "group not found");
            return Ok(false);
        }

        let mut urls = Vec::with_capacity(members.len());
        for entry in members {
            if let Err(err) = self.store.delete(entry.url()).await {
                tracing::warn!(group = %group, url = %entry.url(), error = %err, "group member deletion failed");
                continue;
            }
            if notify_entry_deletion {
                self.events.send(CacheEvent::EntryDeleted {
                    url: entry.url().to_string(),
                    name: entry.meta.name.clone(),
                });
            }
            urls.push(entry.url().to_string());
        }

        tracing::info!(group = %group, members = urls.len(), "deleted group");
        self.events.send(CacheEvent::GroupDeleted { group: group.clone(), members: urls });
        Ok(true)
    }

    /// Refresh one entry; also returns the entry as it now stands, `None` if evicted.
    async fn refresh_one(
        &self,
        entry: &CacheEntry,
        options: RefreshOptions,
    ) -> Result<(RefreshOutcome, Option<CacheEntry>), Error> {
        let now = self.clock.now_millis();
        if !options.ignore_ttl && !entry.is_expired(now) {
            tracing::debug!(url = %entry.url(), "ttl not expired, skipping refresh");
            return Ok((RefreshOutcome::Skipped, Some(entry.clone())));
        }

        let meta = EntryMeta { created_at: now, ..entry.meta.clone() };
        let request = entry.request.with_meta(&meta);

        match self.send(&request).await {
            Ok(response) => {
                let previous = match &entry.response {
                    Some(response) => Some(response.clone()),
                    None => self.store.match_url(entry.url()).await?.map(|(_, response)| response),
                };
                let change = self
                    .write_through(&request, &response, previous.as_ref(), options.notify_updates)
                    .await?;
                let outcome = match change {
                    WriteChange::Unchanged => RefreshOutcome::Unchanged,
                    WriteChange::Created | WriteChange::Updated => RefreshOutcome::Updated,
                };
                Ok((outcome, Some(CacheEntry { request, response: Some(response), meta })))
            }
            Err(err) => {
                tracing::warn!(url = %entry.url(), error = %err, "refresh failed, evicting entry");
                self.evict(entry.url(), entry.meta.name.clone()).await?;
                Ok((RefreshOutcome::Evicted, None))
            }
        }
    }

    /// Up to `fetch_attempts` network attempts for `request`.
    async fn send(&self, request: &CachedRequest) -> Result<CachedResponse, Error> {
        let outgoing = OutgoingRequest::from(request);
        let attempts = self.config.fetch_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.transport.send(&outgoing).await {
                Ok(response) if !response.is_error() => return Ok(response),
                Ok(response) => {
                    let err = Error::Http { status: response.status, status_text: response.status_text };
                    if err.is_not_found() {
                        return Err(err);
                    }
                    tracing::warn!(url = %outgoing.url, attempt, error = %err, "fetch attempt failed");
                    last_error = Some(err);
                }
                Err(err) => {
                    tracing::warn!(url = %outgoing.url, attempt, error = %err, "fetch attempt failed");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or_else(|| Error::Transport(format!("no attempt made for {}", outgoing.url))))
    }

    /// Store a fresh response and publish what changed.
    async fn write_through(
        &self,
        request: &CachedRequest,
        response: &CachedResponse,
        previous: Option<&CachedResponse>,
        notify: bool,
    ) -> Result<WriteChange, Error> {
        let meta = request.meta(self.clock.now_millis(), self.config.default_ttl_ms);
        let mut group_is_new = meta.group.is_some() && previous.is_none();

        if meta.name.is_some() || group_is_new {
            for other in self.store.keys().await? {
                if other.url == request.url {
                    continue;
                }
                let other_meta = other.meta(0, 0);
                if meta.name.is_some() && other_meta.name == meta.name {
                    tracing::info!(url = %other.url, name = ?meta.name, "entry name taken over, evicting previous holder");
                    self.evict(&other.url, other_meta.name).await?;
                    continue;
                }
                if other_meta.group == meta.group {
                    group_is_new = false;
                }
            }
        }

        self.store.put(request, response).await?;

        let change = match previous {
            None => WriteChange::Created,
            Some(old) if same_payload(old, response) => WriteChange::Unchanged,
            Some(_) => WriteChange::Updated,
        };

        let entry = CacheEntry { request: request.clone(), response: Some(response.clone()), meta };
        match change {
            WriteChange::Unchanged => tracing::debug!(url = %request.url, "entry unchanged"),
            WriteChange::Created => {
                tracing::debug!(url = %request.url, "entry created");
                if notify {
                    if group_is_new && let Some(group) = entry.meta.group.clone() {
                        self.events.send(CacheEvent::GroupCreated { group, members: vec![entry.clone()] });
                    }
                    self.events.send(CacheEvent::EntryCreated { entry });
                }
            }
            WriteChange::Updated => {
                tracing::debug!(url = %request.url, "entry updated");
                if notify {
                    self.events.send(CacheEvent::EntryUpdated { entry });
                }
            }
        }

        Ok(change)
    }

    /// Delete `url` and publish `EntryDeleted` if something was removed.
    async fn evict(&self, url: &str, name: Option<String>) -> Result<bool, Error> {
        let removed = self.store.delete(url).await?;
        if removed {
            tracing::info!(url, "cache entry removed");
            self.events.send(CacheEvent::EntryDeleted { url: url.to_string(), name });
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::ScriptedTransport;
    use serde_json::json;
    use synccache_core::CacheDb;
    use synccache_core::clock::ManualClock;

    const T0: i64 = 1_700_000_000_000;
    const URL: &str = "https://api.example.com/workflows";

    struct Harness {
        manager: CacheManager,
        transport: Arc<ScriptedTransport>,
        clock: ManualClock,
        events: broadcast::Receiver<CacheEvent>,
    }

    async fn harness() -> Harness {
        let store = CacheStore::new(CacheDb::open_in_memory().await.unwrap(), "api:lm");
        let transport = Arc::new(ScriptedTransport::new());
        let clock = ManualClock::new(T0);
        let manager = CacheManager::new(store, transport.clone()).with_clock(Arc::new(clock.clone()));
        let events = manager.subscribe();
        Harness { manager, transport, clock, events }
    }

    fn drain(rx: &mut broadcast::Receiver<CacheEvent>) -> Vec<CacheEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn kinds(events: &[CacheEvent]) -> Vec<&'static str> {
        events.iter().map(CacheEvent::kind).collect()
    }

    async fn entry(manager: &CacheManager, url: &str) -> CacheEntry {
        manager.get_entries(true).await.unwrap().get(url).cloned().unwrap()
    }

    #[tokio::test]
    async fn test_cold_cache_fetch() {
        let mut h = harness().await;
        h.transport.set_json(URL, &json!({"items": [1, 2]}));

        let response = h.manager.fetch(URL, FetchOptions::default()).await.unwrap();

        assert_eq!(response.json::<serde_json::Value>().unwrap(), json!({"items": [1, 2]}));
        assert_eq!(h.transport.total_requests(), 1);
        let snapshot = h.manager.get_entries(false).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get(URL).unwrap().meta.created_at, T0);
        assert_eq!(kinds(&drain(&mut h.events)), vec!["entry_created"]);
    }

    #[tokio::test]
    async fn test_hit_within_ttl() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1}));
        let options = FetchOptions::default().with_ttl(60_000);

        h.manager.fetch(URL, options.clone()).await.unwrap();
        h.clock.advance(30_000);
        h.manager.fetch(URL, options).await.unwrap();

        assert_eq!(h.transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_expired_entry_is_refetched() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1}));
        let options = FetchOptions::default().with_ttl(60_000);

        h.manager.fetch(URL, options.clone()).await.unwrap();
        h.clock.advance(70_000);
        h.manager.fetch(URL, options).await.unwrap();

        assert_eq!(h.transport.total_requests(), 2);
        assert_eq!(entry(&h.manager, URL).await.meta.created_at, T0 + 70_000);
    }

    #[tokio::test]
    async fn test_zero_ttl_never_expires() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1}));

        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();
        h.clock.advance(365 * 24 * 3_600_000);
        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();

        assert_eq!(h.transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_refresh_suppresses_identical_payload() {
        let mut h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1, "b": 2}));
        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();
        drain(&mut h.events);

        h.clock.advance(1_000);
        h.transport.set(URL, CachedResponse::new(200, "OK", r#"{ "b": 2, "a": 1 }"#));
        let current = entry(&h.manager, URL).await;
        let outcome = h
            .manager
            .refresh_entry(&current, RefreshOptions { ignore_ttl: true, notify_updates: true })
            .await
            .unwrap();

        assert_eq!(outcome, RefreshOutcome::Unchanged);
        assert!(drain(&mut h.events).is_empty());
        assert_eq!(entry(&h.manager, URL).await.meta.created_at, T0 + 1_000);

        h.transport.set_json(URL, &json!({"a": 1, "b": 3}));
        let current = entry(&h.manager, URL).await;
        let outcome = h
            .manager
            .refresh_entry(&current, RefreshOptions { ignore_ttl: true, notify_updates: true })
            .await
            .unwrap();

        assert_eq!(outcome, RefreshOutcome::Updated);
        assert_eq!(kinds(&drain(&mut h.events)), vec!["entry_updated"]);
    }

    #[tokio::test]
    async fn test_refresh_skipped_within_ttl() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1}));
        h.manager.fetch(URL, FetchOptions::default().with_ttl(60_000)).await.unwrap();

        let current = entry(&h.manager, URL).await;
        let outcome = h.manager.refresh_entry(&current, RefreshOptions::default()).await.unwrap();

        assert_eq!(outcome, RefreshOutcome::Skipped);
        assert_eq!(h.transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_group_refresh_publishes_once() {
        let mut h = harness().await;
        let group = GroupKey::resource_version("w1", "1");
        let urls = ["https://api.example.com/a", "https://api.example.com/b", "https://api.example.com/c"];
        for url in urls {
            h.transport.set_json(url, &json!({"url": url}));
            let options = FetchOptions::default().with_group(group.clone()).with_ttl(1_000);
            h.manager.fetch(url, options).await.unwrap();
        }
        drain(&mut h.events);

        h.clock.advance(2_000);
        h.transport.set_json(urls[1], &json!({"url": urls[1], "changed": true}));
        let outcomes = h.manager.refresh().await.unwrap();

        assert_eq!(outcomes.get(urls[0]), Some(&RefreshOutcome::Unchanged));
        assert_eq!(outcomes.get(urls[1]), Some(&RefreshOutcome::Updated));
        let events = drain(&mut h.events);
        assert_eq!(events.len(), 1);
        match &events[0] {
            CacheEvent::GroupUpdated { group: g, members } => {
                assert_eq!(g, &group);
                assert_eq!(members.iter().map(CacheEntry::url).collect::<Vec<_>>(), urls.to_vec());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_refresh_unchanged_group_is_silent() {
        let mut h = harness().await;
        let group = GroupKey::resource("w1");
        h.transport.set_json(URL, &json!({"a": 1}));
        h.manager
            .fetch(URL, FetchOptions::default().with_group(group).with_ttl(1_000))
            .await
            .unwrap();
        drain(&mut h.events);

        h.clock.advance(5_000);
        h.manager.refresh().await.unwrap();

        assert!(drain(&mut h.events).is_empty());
        assert_eq!(h.transport.total_requests(), 2);
    }

    #[tokio::test]
    async fn test_refresh_404_evicts_then_cold_fetch() {
        let mut h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1}));
        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();
        drain(&mut h.events);

        h.transport.set(URL, CachedResponse::new(404, "Not Found", ""));
        let current = entry(&h.manager, URL).await;
        let outcome = h
            .manager
            .refresh_entry(&current, RefreshOptions { ignore_ttl: true, notify_updates: true })
            .await
            .unwrap();

        assert_eq!(outcome, RefreshOutcome::Evicted);
        assert_eq!(h.transport.total_requests(), 2);
        assert!(h.manager.get_entries(false).await.unwrap().is_empty());
        assert_eq!(kinds(&drain(&mut h.events)), vec!["entry_deleted"]);

        h.transport.set_json(URL, &json!({"a": 2}));
        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();
        assert_eq!(h.transport.total_requests(), 3);
        assert_eq!(kinds(&drain(&mut h.events)), vec!["entry_created"]);
    }

    #[tokio::test]
    async fn test_fetch_404_returns_http_error_and_evicts() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1}));
        h.manager.fetch(URL, FetchOptions::default().with_ttl(10)).await.unwrap();
        h.clock.advance(20);

        h.transport.set(URL, CachedResponse::new(404, "Not Found", ""));
        let err = h.manager.fetch(URL, FetchOptions::default()).await.unwrap_err();

        assert!(matches!(err, Error::Http { status: 404, .. }));
        assert_eq!(h.transport.request_count(URL), 2);
        assert!(h.manager.store().match_url(URL).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_server_error_retried_then_reported() {
        let h = harness().await;
        h.transport.set(URL, CachedResponse::new(503, "Service Unavailable", ""));

        let err = h.manager.fetch(URL, FetchOptions::default()).await.unwrap_err();

        assert_eq!(err.status(), Some(503));
        assert_eq!(h.transport.total_requests(), 3);
        assert!(h.manager.get_entries(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_transport_failures_retried() {
        let h = harness().await;
        h.transport.push_failure(URL);
        h.transport.push_failure(URL);
        h.transport.set_json(URL, &json!({"ok": true}));

        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();

        assert_eq!(h.transport.total_requests(), 3);
    }

    #[tokio::test]
    async fn test_offline_serves_stale_entry() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({"a": 1}));
        h.manager.fetch(URL, FetchOptions::default().with_ttl(100)).await.unwrap();

        h.clock.advance(1_000);
        h.transport.clear(URL);
        let response = h.manager.fetch(URL, FetchOptions::default().with_ttl(100)).await.unwrap();

        assert_eq!(response.json::<serde_json::Value>().unwrap(), json!({"a": 1}));
        assert_eq!(h.transport.total_requests(), 4);
    }

    #[tokio::test]
    async fn test_offline_without_entry_fails() {
        let h = harness().await;
        let err = h.manager.fetch(URL, FetchOptions::default()).await.unwrap_err();
        assert!(matches!(err, Error::Transport(_)));
    }

    #[tokio::test]
    async fn test_unservable_status_is_refetched() {
        let h = harness().await;
        let meta = EntryMeta::new(T0, 0);
        let request = CachedRequest::new(URL, &Headers::new(), &meta);
        h.manager
            .store()
            .put(&request, &CachedResponse::new(0, "", ""))
            .await
            .unwrap();
        h.transport.set_json(URL, &json!({"a": 1}));

        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();

        assert_eq!(h.transport.total_requests(), 1);
    }

    #[tokio::test]
    async fn test_metadata_not_sent() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({}));
        let options = FetchOptions::default()
            .with_header("Authorization", "Bearer t")
            .with_name("workflows")
            .with_group(GroupKey::resource("w1"))
            .with_ttl(500);

        h.manager.fetch(URL, options).await.unwrap();

        let sent = &h.transport.requests()[0];
        assert_eq!(sent.headers.len(), 1);
        assert_eq!(sent.headers.get("authorization").map(String::as_str), Some("Bearer t"));
        let stored = entry(&h.manager, URL).await;
        assert_eq!(stored.meta.name.as_deref(), Some("workflows"));
        assert_eq!(stored.meta.ttl_ms, 500);
    }

    #[tokio::test]
    async fn test_name_moves_to_new_url() {
        let mut h = harness().await;
        let other = "https://api.example.com/workflows?page=2";
        h.transport.set_json(URL, &json!({"page": 1}));
        h.transport.set_json(other, &json!({"page": 2}));

        h.manager.fetch(URL, FetchOptions::default().with_name("list")).await.unwrap();
        h.manager.fetch(other, FetchOptions::default().with_name("list")).await.unwrap();

        let snapshot = h.manager.get_entries(false).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.by_name("list").map(CacheEntry::url), Some(other));
        assert_eq!(
            kinds(&drain(&mut h.events)),
            vec!["entry_created", "entry_deleted", "entry_created"]
        );
    }

    #[tokio::test]
    async fn test_first_group_member_publishes_group_created() {
        let mut h = harness().await;
        let group = GroupKey::resource("w1");
        h.transport.set_json("https://api.example.com/a", &json!({}));
        h.transport.set_json("https://api.example.com/b", &json!({}));

        let options = FetchOptions::default().with_group(group.clone());
        h.manager.fetch("https://api.example.com/a", options.clone()).await.unwrap();
        h.manager.fetch("https://api.example.com/b", options).await.unwrap();

        assert_eq!(
            kinds(&drain(&mut h.events)),
            vec!["group_created", "entry_created", "entry_created"]
        );
    }

    #[tokio::test]
    async fn test_refresh_group_by_key() {
        let mut h = harness().await;
        let group = GroupKey::resource_version("w1", "2");
        h.transport.set_json(URL, &json!({"v": 1}));
        h.manager
            .fetch(URL, FetchOptions::default().with_group(group.clone()).with_ttl(60_000))
            .await
            .unwrap();
        drain(&mut h.events);

        h.transport.set_json(URL, &json!({"v": 2}));
        assert!(h.manager.refresh_cache_entries_group(&group, true).await.unwrap());
        assert!(!h.manager.refresh_cache_entries_group(&GroupKey::resource("nope"), true).await.unwrap());

        let events = drain(&mut h.events);
        assert_eq!(kinds(&events), vec!["group_updated"]);
        if let CacheEvent::GroupUpdated { members, .. } = &events[0] {
            assert_eq!(members.len(), 1);
            assert_eq!(members[0].response.as_ref().unwrap().json::<serde_json::Value>().unwrap(), json!({"v": 2}));
        }
    }

    #[tokio::test]
    async fn test_refresh_entry_by_key() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({"v": 1}));
        h.manager
            .fetch(URL, FetchOptions::default().with_name("list").with_ttl(60_000))
            .await
            .unwrap();

        assert_eq!(h.manager.refresh_cache_entry_by_key("list").await.unwrap(), Some(RefreshOutcome::Unchanged));
        assert_eq!(h.manager.refresh_cache_entry_by_key("missing").await.unwrap(), None);
        assert_eq!(h.transport.total_requests(), 2);
    }

    #[tokio::test]
    async fn test_delete_operations() {
        let mut h = harness().await;
        let group = GroupKey::resource("w1");
        for (url, name) in [("https://api.example.com/a", "a"), ("https://api.example.com/b", "b")] {
            h.transport.set_json(url, &json!({}));
            h.manager
                .fetch(url, FetchOptions::default().with_name(name).with_group(group.clone()))
                .await
                .unwrap();
        }
        h.transport.set_json(URL, &json!({}));
        h.manager.fetch(URL, FetchOptions::default().with_name("list")).await.unwrap();
        drain(&mut h.events);

        assert!(h.manager.delete_cache_entry_by_key("list").await.unwrap());
        assert!(!h.manager.delete_cache_entry_by_key("list").await.unwrap());
        assert!(!h.manager.delete_cache_entry_by_url(URL).await.unwrap());
        assert_eq!(kinds(&drain(&mut h.events)), vec!["entry_deleted"]);

        assert!(h.manager.delete_cache_entries_group(&group, false).await.unwrap());
        let events = drain(&mut h.events);
        assert_eq!(
            events,
            vec![CacheEvent::GroupDeleted {
                group: group.clone(),
                members: vec!["https://api.example.com/a".into(), "https://api.example.com/b".into()],
            }]
        );
        assert!(!h.manager.delete_cache_entries_group(&group, true).await.unwrap());
        assert!(h.manager.get_entries(false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_delete_by_url_canonicalizes() {
        let h = harness().await;
        h.transport.set_json(URL, &json!({}));
        h.manager.fetch(URL, FetchOptions::default()).await.unwrap();

        assert!(h.manager.delete_cache_entry_by_url("https://API.example.com/workflows#top").await.unwrap());
    }

    #[tokio::test]
    async fn test_group_refresh_by_key_lists_every_member() {
        let mut h = harness().await;
        let group = GroupKey::resource_version("w1", "1");
        let urls = ["https://api.example.com/a", "https://api.example.com/b", "https://api.example.com/c"];
        for url in urls {
            h.transport.set_json(url, &json!({"url": url}));
            let options = FetchOptions::default().with_group(group.clone()).with_ttl(60_000);
            h.manager.fetch(url, options).await.unwrap();
        }
        drain(&mut h.events);

        h.transport.set_json(urls[2], &json!({"url": urls[2], "changed": true}));
        assert!(h.manager.refresh_cache_entries_group(&group, true).await.unwrap());

        let events = drain(&mut h.events);
        assert_eq!(kinds(&events), vec!["group_updated"]);
        let CacheEvent::GroupUpdated { group: g, members } = &events[0] else { unreachable!() };
        assert_eq!(g, &group);
        assert_eq!(members.iter().map(CacheEntry::url).collect::<Vec<_>>(), urls.to_vec());
        assert_eq!(
            members[2].response.as_ref().unwrap().json::<serde_json::Value>().unwrap(),
            json!({"url": urls[2], "changed": true})
        );
        assert_eq!(h.transport.total_requests(), 6);
    }

    #[tokio::test]
    async fn test_group_delete_continues_past_failed_member() {
        let mut h = harness().await;
        let group = GroupKey::resource("w1");
        for url in ["https://api.example.com/a", "https://api.example.com/b"] {
            h.transport.set_json(url, &json!({}));
            h.manager.fetch(url, FetchOptions::default().with_group(group.clone())).await.unwrap();
        }
        drain(&mut h.events);
        h.manager
            .store()
            .db()
            .execute_batch(
                "CREATE TRIGGER pin_a BEFORE DELETE ON cache_entries
                 WHEN old.url = 'https://api.example.com/a'
                 BEGIN SELECT RAISE(ABORT, 'pinned'); END;",
            )
            .await
            .unwrap();

        assert!(h.manager.delete_cache_entries_group(&group, true).await.unwrap());

        assert_eq!(
            drain(&mut h.events),
            vec![
                CacheEvent::EntryDeleted { url: "https://api.example.com/b".into(), name: None },
                CacheEvent::GroupDeleted { group, members: vec!["https://api.example.com/b".into()] },
            ]
        );
        let snapshot = h.manager.get_entries(false).await.unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.get("https://api.example.com/a").is_some());
    }

    #[tokio::test]
    async fn test_event_sink_receives_events() {
        let h = harness().await;
        let (tx, mut sink) = mpsc::unbounded_channel();
        let manager = h.manager.clone().with_event_sink(tx);
        h.transport.set_json(URL, &json!({}));

        manager.fetch(URL, FetchOptions::default()).await.unwrap();

        assert_eq!(sink.try_recv().unwrap().kind(), "entry_created");
        assert!(sink.try_recv().is_err());
    }
}
