//! Response partitions for the interceptor.
//!
//! This module provides the named, bounded buckets the caching strategies
//! read and write:
//! - Entries are `(url, response snapshot, stored_at)`
//! - `max_entries` evicts the oldest writes first
//! - `max_age` prunes on write and lazily on read

mod layer;
mod storage;
mod traits;

pub use layer::CacheLayer;
pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedResponse, Expiration};
