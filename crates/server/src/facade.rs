//! Application-facing cache client.
//!
//! [`CacheClient`] is the only read path application code uses. It also
//! feeds push notifications to the sync worker and republishes group notices
//! as three typed broadcast streams. Notices come from the worker's output and
//! from the foreground manager, whose group updates and deletions are caused
//! by the admin operations and [`CacheClient::refresh`].

use std::collections::BTreeMap;
use std::time::Duration;

use serde::de::DeserializeOwned;
use tokio::sync::{broadcast, mpsc};

use synccache_client::fetch::with_params;
use synccache_client::{CacheEvent, CacheManager, FetchOptions, RefreshOutcome};
use synccache_core::clock::system_clock;
use synccache_core::{Error, GroupKey, Headers, SharedClock};

use crate::error::PushError;
use crate::push::{PushMessage, PushPayload, PushSource};
use crate::worker::{WorkerHandle, WorkerMessage, WorkerNotice};

/// Push messages older than this are dropped.
pub const DEFAULT_PUSH_MAX_AGE: Duration = Duration::from_secs(10);

const STREAM_CAPACITY: usize = 256;

/// Options of [`CacheClient::get`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GetOptions {
    /// Request headers; names are lowercased, repeated values kept in order.
    pub headers: BTreeMap<String, Vec<String>>,
    /// Query parameters appended to the URL.
    pub params: Vec<(String, String)>,
    pub cache_entry: Option<String>,
    pub cache_group: Option<GroupKey>,
    pub cache_ttl: Option<u64>,
}

impl GetOptions {
    pub fn header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.entry(name.to_ascii_lowercase()).or_default().push(value.into());
        self
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((name.into(), value.into()));
        self
    }

    pub fn entry(mut self, name: impl Into<String>) -> Self {
        self.cache_entry = Some(name.into());
        self
    }

    pub fn group(mut self, group: GroupKey) -> Self {
        self.cache_group = Some(group);
        self
    }

    pub fn ttl(mut self, ttl_ms: u64) -> Self {
        self.cache_ttl = Some(ttl_ms);
        self
    }

    /// Header map with repeated values joined by `,`.
    fn flat_headers(&self) -> Headers {
        self.headers.iter().map(|(name, values)| (name.clone(), values.join(","))).collect()
    }
}

/// A group the server knows about was not cached yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupCreated {
    pub group: GroupKey,
}

/// Members of a group were refreshed in the background.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupUpdated {
    pub group: GroupKey,
    pub members: Vec<String>,
}

/// A group and all of its members were removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupDeleted {
    pub group: GroupKey,
    pub members: Vec<String>,
}

/// What [`CacheClient::handle_push`] did with a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushDisposition {
    /// Older than the max age.
    Expired,
    /// Handled in the foreground.
    Local,
    /// Posted to the worker.
    Forwarded,
}

#[derive(Debug, Clone)]
struct LifecycleStreams {
    created: broadcast::Sender<GroupCreated>,
    updated: broadcast::Sender<GroupUpdated>,
    deleted: broadcast::Sender<GroupDeleted>,
}

impl LifecycleStreams {
    fn new() -> Self {
        Self {
            created: broadcast::channel(STREAM_CAPACITY).0,
            updated: broadcast::channel(STREAM_CAPACITY).0,
            deleted: broadcast::channel(STREAM_CAPACITY).0,
        }
    }

    /// Republish worker output until the worker's outbox closes.
    async fn relay(self, mut output: mpsc::Receiver<WorkerMessage>) {
        while let Some(message) = output.recv().await {
            match WorkerNotice::try_from(&message) {
                Ok(WorkerNotice::GroupCreated { group, .. }) => {
                    tracing::info!(group = %group, "group created");
                    self.created.send(GroupCreated { group }).unwrap_or_default();
                }
                Ok(WorkerNotice::GroupUpdated { group, members }) => {
                    tracing::info!(group = %group, members = members.len(), "group updated");
                    self.updated.send(GroupUpdated { group, members }).unwrap_or_default();
                }
                Ok(WorkerNotice::GroupDeleted { group, members }) => {
                    tracing::info!(group = %group, members = members.len(), "group deleted");
                    self.deleted.send(GroupDeleted { group, members }).unwrap_or_default();
                }
                Ok(notice) => tracing::debug!(?notice, "worker notice"),
                Err(err) => tracing::warn!(kind = %message.kind, error = %err, "undecodable worker output"),
            }
        }
        tracing::debug!("worker output closed");
    }

    /// Republish group updates and deletions of the foreground manager.
    ///
    /// `GroupCreated` is not relayed: on this stream it means a group the
    /// server announced is not cached, which only the worker can tell.
    async fn relay_local(self, mut events: mpsc::UnboundedReceiver<CacheEvent>) {
        while let Some(event) = events.recv().await {
            match event {
                CacheEvent::GroupUpdated { group, members } => {
                    let members = members.iter().map(|entry| entry.url().to_string()).collect();
                    self.updated.send(GroupUpdated { group, members }).unwrap_or_default();
                }
                CacheEvent::GroupDeleted { group, members } => {
                    self.deleted.send(GroupDeleted { group, members }).unwrap_or_default();
                }
                _ => {}
            }
        }
    }
}

/// Cache-aware HTTP client plus push/worker plumbing.
#[derive(Debug, Clone)]
pub struct CacheClient {
    manager: CacheManager,
    worker: WorkerHandle,
    streams: LifecycleStreams,
    clock: SharedClock,
    push_max_age: Duration,
}

impl CacheClient {
    /// Build a client around `manager` and an already running worker.
    ///
    /// `output` is the worker's outbox. Relay tasks are spawned on the current
    /// runtime to republish it and the group events of `manager`.
    pub fn new(manager: CacheManager, worker: WorkerHandle, output: mpsc::Receiver<WorkerMessage>) -> Self {
        let streams = LifecycleStreams::new();
        let (sink, events) = mpsc::unbounded_channel();
        let manager = manager.with_event_sink(sink);
        tokio::spawn(streams.clone().relay(output));
        tokio::spawn(streams.clone().relay_local(events));
        Self { manager, worker, streams, clock: system_clock(), push_max_age: DEFAULT_PUSH_MAX_AGE }
    }

    pub fn with_clock(mut self, clock: SharedClock) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_push_max_age(mut self, max_age: Duration) -> Self {
        self.push_max_age = max_age;
        self
    }

    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    /// GET `url` through the cache and decode the JSON body.
    pub async fn get<T: DeserializeOwned>(&self, url: &str, options: GetOptions) -> Result<T, Error> {
        let url = with_params(url, &options.params)?;
        let fetch_options = FetchOptions {
            headers: options.flat_headers(),
            name: options.cache_entry,
            group: options.cache_group,
            ttl_ms: options.cache_ttl,
        };
        let response = self.manager.fetch(url.as_str(), fetch_options).await?;
        response.json()
    }

    /// Route one push message.
    ///
    /// Messages older than the max age are dropped; messages without a
    /// timestamp are accepted. `joined` and `left` are handled here, every
    /// other payload is posted to the worker unchanged.
    pub async fn handle_push(&self, message: PushMessage) -> Result<PushDisposition, Error> {
        let max_age = self.push_max_age.as_millis() as i64;
        if let Some(age) = message.age_millis(self.clock.now_millis())
            && age > max_age
        {
            tracing::warn!(kind = %message.payload.kind, age_ms = age, "push message skipped: too old");
            return Ok(PushDisposition::Expired);
        }

        match message.payload.kind.as_str() {
            "joined" => {
                on_joined(&message.payload);
                Ok(PushDisposition::Local)
            }
            "left" => {
                on_left(&message.payload);
                Ok(PushDisposition::Local)
            }
            _ => {
                tracing::debug!(kind = %message.payload.kind, "posting push message to worker");
                self.worker.post(message.payload.into()).await?;
                Ok(PushDisposition::Forwarded)
            }
        }
    }

    /// Drain `source`, routing every message through [`Self::handle_push`].
    ///
    /// Returns when the source is exhausted or fails, or the worker is gone.
    pub async fn run_push<S: PushSource>(&self, mut source: S) -> Result<(), PushError> {
        while let Some(message) = source.next_message().await? {
            self.handle_push(message).await?;
        }
        tracing::info!("push channel exhausted");
        Ok(())
    }

    pub fn on_group_created(&self) -> broadcast::Receiver<GroupCreated> {
        self.streams.created.subscribe()
    }

    pub fn on_group_updated(&self) -> broadcast::Receiver<GroupUpdated> {
        self.streams.updated.subscribe()
    }

    pub fn on_group_deleted(&self) -> broadcast::Receiver<GroupDeleted> {
        self.streams.deleted.subscribe()
    }

    pub async fn delete_cache_entry_by_url(&self, url: &str) -> Result<bool, Error> {
        self.manager.delete_cache_entry_by_url(url).await
    }

    /// Delete several URLs; returns how many entries were removed.
    pub async fn delete_cache_entries_by_urls<I, S>(&self, urls: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for url in urls {
            if self.manager.delete_cache_entry_by_url(url.as_ref()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn delete_cache_entry_by_key(&self, name: &str) -> Result<bool, Error> {
        self.manager.delete_cache_entry_by_key(name).await
    }

    /// Delete several named entries; returns how many were removed.
    pub async fn delete_cache_entries_by_keys<I, S>(&self, names: I) -> Result<usize, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut removed = 0;
        for name in names {
            if self.manager.delete_cache_entry_by_key(name.as_ref()).await? {
                removed += 1;
            }
        }
        Ok(removed)
    }

    pub async fn refresh_cache_entry_by_key(&self, name: &str) -> Result<Option<RefreshOutcome>, Error> {
        self.manager.refresh_cache_entry_by_key(name).await
    }

    pub async fn delete_cache_entries_group(&self, group: &GroupKey, notify_entry_deletion: bool) -> Result<bool, Error> {
        self.manager.delete_cache_entries_group(group, notify_entry_deletion).await
    }

    pub async fn refresh_cache_entries_group(&self, group: &GroupKey, notify_group_update: bool) -> Result<bool, Error> {
        self.manager.refresh_cache_entries_group(group, notify_group_update).await
    }

    /// Refresh every expired entry in the foreground.
    pub async fn refresh(&self) -> Result<BTreeMap<String, RefreshOutcome>, Error> {
        self.manager.refresh().await
    }

    /// Start (`Some`) or stop (`None`) periodic refresh in the worker.
    pub async fn request_background_refresh(&self, interval: Option<Duration>) -> Result<(), Error> {
        let message = match interval {
            Some(every) => WorkerMessage::start(every.as_millis() as u64),
            None => WorkerMessage::stop(),
        };
        self.worker.post(message).await
    }
}

fn on_joined(payload: &PushPayload) {
    let user = payload.data.get("user").and_then(|u| u.as_str()).unwrap_or("unknown");
    tracing::info!(user, "user joined");
}

fn on_left(payload: &PushPayload) {
    let user = payload.data.get("user").and_then(|u| u.as_str()).unwrap_or("unknown");
    tracing::info!(user, "user left");
}
