//! Foreground and background halves of synccache.
//!
//! This crate provides the sync worker, the push channel sources, and the
//! [`CacheClient`] facade that application code talks to.

pub mod error;
pub mod facade;
pub mod push;
pub mod worker;

pub use error::PushError;
pub use facade::{CacheClient, GetOptions, GroupCreated, GroupDeleted, GroupUpdated, PushDisposition};
pub use push::{ChannelSource, LineSource, PushMessage, PushPayload, PushSource, WebSocketSource};
pub use worker::{SyncEvent, SyncWorker, WorkerHandle, WorkerMessage, WorkerNotice};
