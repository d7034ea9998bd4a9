//! Partition manager: bounded, age-limited buckets over a storage backend.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, warn};

use super::storage::CacheStorage;
use super::traits::{CachedResponse, Expiration};
use crate::error::Result;
use crate::net::Response;

/// Named response partitions with count- and age-based eviction.
///
/// Expiration runs on every write; reads prune a single expired entry lazily.
pub struct CacheLayer<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend.
  pub fn new(storage: S) -> Self {
    Self {
      storage: Arc::new(storage),
    }
  }

  pub fn storage(&self) -> &S {
    &self.storage
  }

  /// Non-expired entry for `url` in `partition`.
  pub fn lookup(
    &self,
    partition: &str,
    url: &str,
    expiration: &Expiration,
  ) -> Result<Option<CachedResponse>> {
    let Some(cached) = self.storage.lookup(partition, url)? else {
      return Ok(None);
    };

    if expiration.is_expired(cached.stored_at, Utc::now()) {
      debug!(partition, url, "cached entry expired");
      self.storage.remove(partition, url)?;
      return Ok(None);
    }

    Ok(Some(cached))
  }

  /// Exact-URL match in any partition, without expiration.
  pub fn lookup_any(&self, url: &str) -> Result<Option<CachedResponse>> {
    self.storage.lookup_any(url)
  }

  /// Store `response` and enforce the partition's bounds.
  pub fn put(
    &self,
    partition: &str,
    url: &str,
    response: &Response,
    expiration: &Expiration,
  ) -> Result<()> {
    self.put_at(partition, url, response, expiration, Utc::now())
  }

  pub(crate) fn put_at(
    &self,
    partition: &str,
    url: &str,
    response: &Response,
    expiration: &Expiration,
    stored_at: DateTime<Utc>,
  ) -> Result<()> {
    self.storage.store(partition, url, response, stored_at)?;
    self.enforce(partition, expiration)?;
    Ok(())
  }

  /// Prune entries past `max_age`, then drop the oldest beyond `max_entries`.
  pub fn enforce(&self, partition: &str, expiration: &Expiration) -> Result<usize> {
    let mut evicted = 0;
    if let Some(max_age) = expiration.max_age {
      evicted += self
        .storage
        .evict_older_than(partition, Utc::now() - max_age)?;
    }
    if let Some(max_entries) = expiration.max_entries {
      evicted += self.storage.evict_overflow(partition, max_entries)?;
    }
    if evicted > 0 {
      debug!(partition, evicted, "expired cache entries");
    }
    Ok(evicted)
  }

  /// Store from a background task. Failures are logged, never raised.
  pub fn spawn_put(&self, partition: &str, url: &str, response: Response, expiration: Expiration)
  where
    S: 'static,
  {
    let layer = self.clone();
    let partition = partition.to_string();
    let url = url.to_string();
    tokio::spawn(async move {
      if let Err(e) = layer.put(&partition, &url, &response, &expiration) {
        warn!(partition, url, error = %e, "background cache write failed");
      }
    });
  }
}

impl<S: CacheStorage> Clone for CacheLayer<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}
