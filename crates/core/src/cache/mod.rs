//! SQLite-backed cache storage.
//!
//! Persistent, name-scoped storage of (request, response) pairs keyed by URL,
//! with async access via tokio-rusqlite. It supports:
//!
//! - Several named caches in one database file
//! - Automatic schema migrations
//! - WAL mode so independent connections can share the file

pub mod connection;
pub mod entry;
pub mod migrations;
pub mod store;

pub use crate::Error;

pub use connection::CacheDb;
pub use entry::{CacheEntry, CachedRequest, CachedResponse, EntryMeta, Headers};
pub use store::CacheStore;
