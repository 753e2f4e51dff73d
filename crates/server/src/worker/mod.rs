//! Background reconciliation worker.
//!
//! The worker runs as its own tokio task with its own [`CacheManager`] bound to
//! the same named store as the foreground. It shares no memory with the
//! foreground: requests arrive as [`WorkerMessage`]s on an mpsc inbox and
//! results leave as [`WorkerMessage`]s on an mpsc outbox.
//!
//! Besides the explicit replies (`cacheEntriesGroupCreated` from `sync`), every
//! event published by the worker's manager is forwarded to the outbox in the
//! order it happened. The manager hands events over through an unbounded sink,
//! so a long refresh never loses any.

pub mod message;

use std::collections::BTreeMap;
use std::time::Duration;

use tokio::sync::mpsc::{self, error::TryRecvError};
use tokio::time::{Instant, Interval, MissedTickBehavior};

use synccache_client::{CacheEvent, CacheManager};
use synccache_core::{Error, GroupKey};

pub use message::{DispatchError, SyncEvent, WorkerMessage, WorkerNotice, WorkerRequest};

/// Capacity of the inbox and outbox channels.
const CHANNEL_CAPACITY: usize = 256;

/// Sending side of a worker's inbox. Cloning shares the worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    inbox: mpsc::Sender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn new(inbox: mpsc::Sender<WorkerMessage>) -> Self {
        Self { inbox }
    }

    /// Queue a message for the worker.
    ///
    /// # Errors
    ///
    /// Returns `Error::WorkerUnavailable` once the worker has stopped.
    pub async fn post(&self, message: WorkerMessage) -> Result<(), Error> {
        self.inbox.send(message).await.map_err(|_| Error::WorkerUnavailable)
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

enum Wake {
    Message(Option<WorkerMessage>),
    Tick,
}

/// Reconciliation logic and its private state.
pub struct SyncWorker {
    manager: CacheManager,
    events: mpsc::UnboundedReceiver<CacheEvent>,
    outbox: mpsc::Sender<WorkerMessage>,
    ticker: Option<Interval>,
}

impl SyncWorker {
    pub fn new(manager: CacheManager, outbox: mpsc::Sender<WorkerMessage>) -> Self {
        let (sink, events) = mpsc::unbounded_channel();
        let manager = manager.with_event_sink(sink);
        Self { manager, events, outbox, ticker: None }
    }

    /// Spawn a worker on the current runtime.
    ///
    /// Returns the handle used to post requests and the receiver of the
    /// worker's output. The task ends when every handle is dropped.
    pub fn spawn(manager: CacheManager) -> (WorkerHandle, mpsc::Receiver<WorkerMessage>) {
        let (inbox_tx, inbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (outbox_tx, outbox_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let worker = Self::new(manager, outbox_tx);
        tokio::spawn(worker.run(inbox_rx));
        (WorkerHandle::new(inbox_tx), outbox_rx)
    }

    /// Process messages and refresh ticks until the inbox closes.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<WorkerMessage>) {
        tracing::info!(cache = self.manager.cache_name(), "sync worker started");

        loop {
            let wake = tokio::select! {
                message = inbox.recv() => Wake::Message(message),
                () = next_tick(&mut self.ticker) => Wake::Tick,
            };

            match wake {
                Wake::Message(Some(message)) => self.handle(message).await,
                Wake::Message(None) => break,
                Wake::Tick => {
                    if let Err(err) = self.refresh().await {
                        tracing::warn!(error = %err, "background refresh failed");
                    }
                    self.forward_events().await;
                }
            }
        }

        tracing::info!(cache = self.manager.cache_name(), "sync worker stopped");
    }

    /// Dispatch one inbound message. Unknown or malformed messages are logged
    /// and dropped; handler failures are logged and never reach the sender.
    pub async fn handle(&mut self, message: WorkerMessage) {
        match WorkerRequest::try_from(&message) {
            Ok(request) => {
                if let Err(err) = self.dispatch(request).await {
                    tracing::warn!(kind = %message.kind, error = %err, "worker handler failed");
                }
            }
            Err(err) => tracing::warn!(kind = %message.kind, error = %err, "dropping worker message"),
        }
        self.forward_events().await;
    }

    async fn dispatch(&mut self, request: WorkerRequest) -> Result<(), Error> {
        match request {
            WorkerRequest::Sync(events) => self.on_sync(events).await,
            WorkerRequest::Delete(events) => self.on_delete(events).await,
            WorkerRequest::Refresh => self.refresh().await,
            WorkerRequest::Start { interval_ms } => {
                self.start(Duration::from_millis(interval_ms));
                Ok(())
            }
            WorkerRequest::Stop => {
                self.stop();
                Ok(())
            }
        }
    }

    /// Reconcile cached groups against server-side change times.
    ///
    /// Unknown groups are announced with `cacheEntriesGroupCreated`. A cached
    /// group whose oldest member predates the event's `lastUpdate` is
    /// refreshed: first the resource-wide group silently, then the version
    /// group with one `cacheEntriesGroupUpdated`.
    pub async fn on_sync(&mut self, events: Vec<SyncEvent>) -> Result<(), Error> {
        let mut by_key: BTreeMap<GroupKey, SyncEvent> = BTreeMap::new();
        for event in events {
            let key = event.group_key();
            match by_key.get(&key) {
                Some(seen) if seen.last_update >= event.last_update => {}
                _ => {
                    by_key.insert(key, event);
                }
            }
        }

        let latest = by_key.values().map(|e| e.last_update).max();
        tracing::info!(events = by_key.len(), latest_update = ?latest, "sync batch received");

        let snapshot = self.manager.get_entries(false).await?;

        for (key, event) in &by_key {
            let Some(created_at) = snapshot.group_created_at(key) else {
                tracing::debug!(group = %key, "group not cached");
                self.post(WorkerMessage::group_created(key, &[])).await;
                continue;
            };

            let age = event.last_update.saturating_sub(created_at);
            if age <= 0 {
                tracing::debug!(group = %key, age, "group up to date");
                continue;
            }

            tracing::info!(group = %key, age, "group outdated, refreshing");
            let parent = event.parent_key();
            if let Err(err) = self.manager.refresh_cache_entries_group(&parent, false).await {
                tracing::warn!(group = %parent, error = %err, "parent group refresh failed");
            }
            self.forward_events().await;
            if let Err(err) = self.manager.refresh_cache_entries_group(key, true).await {
                tracing::warn!(group = %key, error = %err, "group refresh failed");
            }
            self.forward_events().await;
        }

        Ok(())
    }

    /// Drop every cached group named by the events.
    pub async fn on_delete(&mut self, events: Vec<SyncEvent>) -> Result<(), Error> {
        for event in events {
            let key = event.group_key();
            match self.manager.delete_cache_entries_group(&key, true).await {
                Ok(true) => {}
                Ok(false) => tracing::debug!(group = %key, "nothing cached to delete"),
                Err(err) => tracing::warn!(group = %key, error = %err, "group deletion failed"),
            }
            self.forward_events().await;
        }
        Ok(())
    }

    async fn refresh(&mut self) -> Result<(), Error> {
        let outcomes = self.manager.refresh().await?;
        tracing::debug!(entries = outcomes.len(), "cache refreshed");
        Ok(())
    }

    fn start(&mut self, period: Duration) {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.ticker = Some(interval);
        tracing::info!(interval_ms = period.as_millis() as u64, "background refresh started");
    }

    fn stop(&mut self) {
        if self.ticker.take().is_some() {
            tracing::info!("background refresh stopped");
        }
    }

    /// Whether periodic background refresh is active.
    pub fn is_refreshing(&self) -> bool {
        self.ticker.is_some()
    }

    /// Post a reply after everything the manager has published so far.
    async fn post(&mut self, message: WorkerMessage) {
        self.forward_events().await;
        self.send(message).await;
    }

    async fn forward_events(&mut self) {
        loop {
            match self.events.try_recv() {
                Ok(event) => self.send(outbound(&event)).await,
                Err(TryRecvError::Empty | TryRecvError::Disconnected) => break,
            }
        }
    }

    async fn send(&self, message: WorkerMessage) {
        if self.outbox.send(message).await.is_err() {
            tracing::debug!("worker output dropped, nobody is listening");
        }
    }
}

fn outbound(event: &CacheEvent) -> WorkerMessage {
    match event {
        CacheEvent::EntryCreated { entry } => WorkerMessage::entry_created(entry),
        CacheEvent::EntryUpdated { entry } => WorkerMessage::entry_updated(entry),
        CacheEvent::EntryDeleted { url, name } => WorkerMessage::entry_deleted(url, name.as_deref()),
        CacheEvent::GroupCreated { group, members } => WorkerMessage::group_created(group, members),
        CacheEvent::GroupUpdated { group, members } => WorkerMessage::group_updated(group, members),
        CacheEvent::GroupDeleted { group, members } => WorkerMessage::group_deleted(group, members),
    }
}

async fn next_tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;
    use synccache_client::{FetchOptions, ScriptedTransport};
    use synccache_core::clock::ManualClock;
    use synccache_core::{CacheDb, CacheStore};

    const T: i64 = 1_700_000_000_000;
    const VERSION_URL: &str = "https://api.example.com/workflows/w1/versions/1";
    const OTHER_URL: &str = "https://api.example.com/workflows/w1/versions/1/steps";
    const PARENT_URL: &str = "https://api.example.com/workflows/w1";

    struct Harness {
        foreground: CacheManager,
        worker: SyncWorker,
        output: mpsc::Receiver<WorkerMessage>,
        transport: Arc<ScriptedTransport>,
        clock: ManualClock,
    }

    async fn harness() -> Harness {
        let db = CacheDb::open_in_memory().await.unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let clock = ManualClock::new(T - 1_000);
        let manager = |db: CacheDb| {
            CacheManager::new(CacheStore::new(db, "api:lm"), transport.clone()).with_clock(Arc::new(clock.clone()))
        };
        let foreground = manager(db.clone());
        let (outbox, output) = mpsc::channel(64);
        let worker = SyncWorker::new(manager(db), outbox);
        Harness { foreground, worker, output, transport, clock }
    }

    fn drain(rx: &mut mpsc::Receiver<WorkerMessage>) -> Vec<WorkerMessage> {
        let mut messages = Vec::new();
        while let Ok(message) = rx.try_recv() {
            messages.push(message);
        }
        messages
    }

    async fn cache_version_group(h: &Harness) {
        let specific = GroupKey::resource_version("w1", "1");
        for url in [VERSION_URL, OTHER_URL] {
            h.transport.set_json(url, &json!({"url": url}));
            h.foreground
                .fetch(url, FetchOptions::default().with_group(specific.clone()))
                .await
                .unwrap();
        }
        h.transport.set_json(PARENT_URL, &json!({"versions": ["1"]}));
        h.foreground
            .fetch(PARENT_URL, FetchOptions::default().with_group(GroupKey::resource("w1")))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_sync_announces_uncached_group() {
        let mut h = harness().await;

        h.worker
            .handle(WorkerMessage::sync(&[SyncEvent::new("w1", "1", T)]))
            .await;

        let messages = drain(&mut h.output);
        assert_eq!(messages.len(), 1);
        assert_eq!(
            WorkerNotice::try_from(&messages[0]).unwrap(),
            WorkerNotice::GroupCreated { group: GroupKey::resource_version("w1", "1"), members: vec![] }
        );
        assert_eq!(h.transport.total_requests(), 0);
    }

    #[tokio::test]
    async fn test_sync_refreshes_outdated_group() {
        let mut h = harness().await;
        cache_version_group(&h).await;
        h.clock.set(T + 500);
        h.transport.set_json(PARENT_URL, &json!({"versions": ["1", "2"]}));

        h.worker
            .handle(WorkerMessage::sync(&[SyncEvent::new("w1", "1", T)]))
            .await;

        assert_eq!(h.transport.request_count(PARENT_URL), 2);
        assert_eq!(h.transport.request_count(VERSION_URL), 2);
        assert_eq!(h.transport.request_count(OTHER_URL), 2);

        let notices: Vec<WorkerNotice> = drain(&mut h.output)
            .iter()
            .map(|m| WorkerNotice::try_from(m).unwrap())
            .collect();
        assert_eq!(
            notices,
            vec![WorkerNotice::GroupUpdated {
                group: GroupKey::resource_version("w1", "1"),
                members: vec![VERSION_URL.to_string(), OTHER_URL.to_string()],
            }]
        );
    }

    #[tokio::test]
    async fn test_sync_twice_refreshes_once() {
        let mut h = harness().await;
        cache_version_group(&h).await;
        h.clock.set(T + 500);
        let batch = [SyncEvent::new("w1", "1", T)];

        h.worker.handle(WorkerMessage::sync(&batch)).await;
        let after_first = h.transport.total_requests();
        drain(&mut h.output);

        h.worker.handle(WorkerMessage::sync(&batch)).await;

        assert_eq!(h.transport.total_requests(), after_first);
        assert!(drain(&mut h.output).is_empty());
    }

    #[tokio::test]
    async fn test_sync_ignores_older_updates() {
        let mut h = harness().await;
        cache_version_group(&h).await;

        h.worker
            .handle(WorkerMessage::sync(&[SyncEvent::new("w1", "1", T - 5_000)]))
            .await;

        assert_eq!(h.transport.total_requests(), 3);
        assert!(drain(&mut h.output).is_empty());
    }

    #[tokio::test]
    async fn test_delete_drops_group() {
        let mut h = harness().await;
        cache_version_group(&h).await;

        h.worker
            .handle(WorkerMessage::delete(&[SyncEvent::new("w1", "1", T)]))
            .await;

        let snapshot = h.foreground.get_entries(false).await.unwrap();
        assert!(!snapshot.contains_group(&GroupKey::resource_version("w1", "1")));
        assert_eq!(snapshot.len(), 1);

        let notices: Vec<WorkerNotice> = drain(&mut h.output)
            .iter()
            .map(|m| WorkerNotice::try_from(m).unwrap())
            .collect();
        assert_eq!(
            notices,
            vec![
                WorkerNotice::EntryDeleted { url: VERSION_URL.into() },
                WorkerNotice::EntryDeleted { url: OTHER_URL.into() },
                WorkerNotice::GroupDeleted {
                    group: GroupKey::resource_version("w1", "1"),
                    members: vec![VERSION_URL.into(), OTHER_URL.into()],
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut h = harness().await;
        assert!(!h.worker.is_refreshing());

        h.worker.handle(WorkerMessage::start(60_000)).await;
        assert!(h.worker.is_refreshing());

        h.worker.handle(WorkerMessage::stop()).await;
        assert!(!h.worker.is_refreshing());
    }

    #[tokio::test]
    async fn test_refresh_message_forwards_updates() {
        let mut h = harness().await;
        h.transport.set_json(PARENT_URL, &json!({"v": 1}));
        h.foreground
            .fetch(PARENT_URL, FetchOptions::default().with_ttl(10))
            .await
            .unwrap();
        h.clock.advance(100);
        h.transport.set_json(PARENT_URL, &json!({"v": 2}));

        h.worker.handle(WorkerMessage::refresh()).await;

        let messages = drain(&mut h.output);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].kind, message::ENTRY_UPDATED);
        assert_eq!(messages[0].data["data"], json!({"v": 2}));
    }

    #[tokio::test]
    async fn test_spawned_worker_survives_unknown_messages() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let manager = CacheManager::new(CacheStore::new(db, "api:lm"), Arc::new(ScriptedTransport::new()));
        let (handle, mut output) = SyncWorker::spawn(manager);

        handle.post(WorkerMessage::new("reticulate", json!({}))).await.unwrap();
        handle.post(WorkerMessage::new(message::SYNC, json!(42))).await.unwrap();
        handle
            .post(WorkerMessage::sync(&[SyncEvent::new("w9", "3", T)]))
            .await
            .unwrap();

        let reply = output.recv().await.unwrap();
        assert_eq!(reply.kind, message::GROUP_CREATED);
        assert_eq!(reply.data["groupName"], json!(r#"{"id":"w9","version":"3"}"#));
    }

    #[tokio::test]
    async fn test_handle_reports_closed_worker() {
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = WorkerHandle::new(tx);

        assert!(handle.is_closed());
        assert!(matches!(handle.post(WorkerMessage::refresh()).await, Err(Error::WorkerUnavailable)));
    }

    #[tokio::test]
    async fn test_sync_with_extreme_last_update() {
        let mut h = harness().await;
        cache_version_group(&h).await;

        let extreme = WorkerMessage::new(
            message::SYNC,
            json!([{"id": "w1", "version": "1", "lastUpdate": i64::MIN}, {"id": "w2", "version": "1", "lastUpdate": i64::MAX}]),
        );
        h.worker.handle(extreme).await;

        assert_eq!(h.transport.total_requests(), 3);
        let notices: Vec<WorkerNotice> = drain(&mut h.output)
            .iter()
            .map(|m| WorkerNotice::try_from(m).unwrap())
            .collect();
        assert_eq!(
            notices,
            vec![WorkerNotice::GroupCreated { group: GroupKey::resource_version("w2", "1"), members: vec![] }]
        );

        h.clock.set(T + 500);
        h.worker
            .handle(WorkerMessage::sync(&[SyncEvent::new("w1", "1", T)]))
            .await;
        assert_eq!(h.transport.total_requests(), 6);
    }

    #[tokio::test]
    async fn test_refresh_forwards_every_event() {
        let db = CacheDb::open_in_memory().await.unwrap();
        let transport = Arc::new(ScriptedTransport::new());
        let clock = ManualClock::new(T);
        let manager = |db: CacheDb| {
            CacheManager::new(CacheStore::new(db, "api:lm"), transport.clone()).with_clock(Arc::new(clock.clone()))
        };
        let foreground = manager(db.clone());
        let (handle, mut output) = SyncWorker::spawn(manager(db));

        let group = GroupKey::resource("w1");
        transport.set_json(PARENT_URL, &json!({"v": 1}));
        foreground
            .fetch(PARENT_URL, FetchOptions::default().with_group(group.clone()).with_ttl(10))
            .await
            .unwrap();
        let ungrouped = 1_100;
        for i in 0..ungrouped {
            let url = format!("https://api.example.com/items/{i}");
            transport.set_json(&url, &json!({"v": 1}));
            foreground.fetch(&url, FetchOptions::default().with_ttl(10)).await.unwrap();
            transport.set_json(&url, &json!({"v": 2}));
        }
        transport.set_json(PARENT_URL, &json!({"v": 2}));
        clock.advance(100);

        handle.post(WorkerMessage::refresh()).await.unwrap();

        let mut received = Vec::new();
        while received.len() < ungrouped + 1 {
            received.push(output.recv().await.unwrap());
        }
        assert_eq!(received[0].kind, message::GROUP_UPDATED);
        assert_eq!(received[0].data["groupName"], json!(group.as_str()));
        assert!(received[1..].iter().all(|m| m.kind == message::ENTRY_UPDATED));
    }
}
