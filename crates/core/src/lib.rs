//! Core types and shared functionality for synccache.
//!
//! This crate provides:
//! - Named request/response storage with a SQLite backend
//! - Entry metadata and canonical group keys
//! - Unified error types
//! - Configuration structures

pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod group;

pub use cache::{CacheDb, CacheEntry, CacheStore, CachedRequest, CachedResponse, EntryMeta, Headers};
pub use clock::{Clock, SharedClock, SystemClock};
pub use config::AppConfig;
pub use error::Error;
pub use group::GroupKey;
