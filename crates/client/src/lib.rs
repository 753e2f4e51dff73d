//! Client side of synccache.
//!
//! This crate provides the HTTP transport, URL canonicalization, payload
//! comparison and the [`CacheManager`] that ties them to a named store.

pub mod compare;
pub mod fetch;
pub mod manager;

#[cfg(any(test, feature = "testing"))]
pub use fetch::ScriptedTransport;
pub use fetch::{FetchClient, FetchConfig, HttpTransport, OutgoingRequest, canonicalize};
pub use manager::{
    CacheEntriesSnapshot, CacheEvent, CacheManager, EventBroadcaster, FetchOptions, ManagerConfig, RefreshOptions,
    RefreshOutcome,
};
