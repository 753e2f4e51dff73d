//! Cache lifecycle events.
//!
//! The manager publishes every entry and group change on a tokio broadcast
//! channel. Any number of subscribers may listen; a subscriber only sees
//! events sent after it subscribed, and a slow one loses the oldest events
//! once the buffer is full.
//!
//! A broadcaster may also carry one unbounded sink. The sink sees every
//! event regardless of buffer size; it is meant for a single consumer that
//! must not miss anything, such as the worker relaying its results.

use tokio::sync::{broadcast, mpsc};

use synccache_core::{CacheEntry, GroupKey};

/// Default buffer size for the broadcast channel.
const DEFAULT_BUFFER_SIZE: usize = 1024;

/// A change to the cache contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// A URL was cached for the first time.
    EntryCreated { entry: CacheEntry },
    /// A cached URL now holds a different payload.
    EntryUpdated { entry: CacheEntry },
    /// An entry was removed. `name` is the entry name when it had one.
    EntryDeleted { url: String, name: Option<String> },
    /// The first member of a group was cached.
    GroupCreated { group: GroupKey, members: Vec<CacheEntry> },
    /// One or more members of a group were refreshed.
    GroupUpdated { group: GroupKey, members: Vec<CacheEntry> },
    /// Every member of a group was removed.
    GroupDeleted { group: GroupKey, members: Vec<String> },
}

impl CacheEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            CacheEvent::EntryCreated { .. } => "entry_created",
            CacheEvent::EntryUpdated { .. } => "entry_updated",
            CacheEvent::EntryDeleted { .. } => "entry_deleted",
            CacheEvent::GroupCreated { .. } => "group_created",
            CacheEvent::GroupUpdated { .. } => "group_updated",
            CacheEvent::GroupDeleted { .. } => "group_deleted",
        }
    }
}

/// Sender side of the event channel. Cloning shares the channel.
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: broadcast::Sender<CacheEvent>,
    sink: Option<mpsc::UnboundedSender<CacheEvent>>,
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBroadcaster {
    /// Create a new broadcaster with default buffer size.
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_SIZE)
    }

    /// Create a new broadcaster with custom buffer size.
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender, sink: None }
    }

    /// Also deliver every event to `sink`, without loss.
    pub fn with_sink(mut self, sink: mpsc::UnboundedSender<CacheEvent>) -> Self {
        self.sink = Some(sink);
        self
    }

    /// Send an event to all subscribers.
    ///
    /// Returns the number of subscribers that received the event; 0 when
    /// nobody is listening.
    pub fn send(&self, event: CacheEvent) -> usize {
        tracing::debug!(kind = event.kind(), "cache event");
        if let Some(sink) = &self.sink
            && sink.send(event.clone()).is_err()
        {
            tracing::debug!("event sink closed");
        }
        self.sender.send(event).unwrap_or_default()
    }

    /// Subscribe to events sent from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.sender.subscribe()
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}
