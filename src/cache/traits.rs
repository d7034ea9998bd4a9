//! Core types for the response cache.

use chrono::{DateTime, Duration, Utc};

use crate::error::OfflineError;
use crate::net::Response;

/// Bounds applied to a partition on every write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expiration {
  pub max_entries: Option<usize>,
  pub max_age: Option<Duration>,
}

impl Expiration {
  pub fn new(max_entries: usize, max_age_seconds: i64) -> Self {
    Self {
      max_entries: Some(max_entries),
      max_age: Some(Duration::seconds(max_age_seconds)),
    }
  }

  /// No bounds.
  pub fn none() -> Self {
    Self::default()
  }

  pub fn is_expired(&self, stored_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    self
      .max_age
      .map(|max_age| now - stored_at > max_age)
      .unwrap_or(false)
  }
}

/// A response snapshot plus the time it was written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedResponse {
  pub response: Response,
  pub stored_at: DateTime<Utc>,
}

/// Result of routing a request, including where the response came from.
#[derive(Debug)]
pub struct CacheResult {
  pub response: Response,
  pub source: CacheSource,
  /// When the response was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
  /// The failure that forced a fallback, if any
  pub failure: Option<OfflineError>,
}

impl CacheResult {
  pub fn from_network(response: Response) -> Self {
    Self {
      response,
      source: CacheSource::Network,
      cached_at: None,
      failure: None,
    }
  }

  pub fn from_cache(cached: CachedResponse) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Cache,
      cached_at: Some(cached.stored_at),
      failure: None,
    }
  }

  /// Cached data served because the network failed or timed out.
  pub fn offline(cached: CachedResponse, failure: OfflineError) -> Self {
    Self {
      response: cached.response,
      source: CacheSource::Offline,
      cached_at: Some(cached.stored_at),
      failure: Some(failure),
    }
  }

  pub fn fallback(response: Response, source: CacheSource, failure: OfflineError) -> Self {
    Self {
      response,
      source,
      cached_at: None,
      failure: Some(failure),
    }
  }

  pub fn unavailable(failure: OfflineError) -> Self {
    Self::fallback(Response::unavailable(), CacheSource::Unavailable, failure)
  }
}

/// Indicates where a routed response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Partition hit, network not consulted
  Cache,
  /// Partition hit after the network failed or timed out
  Offline,
  /// Runtime copy of the app shell document
  AppShell,
  /// Bundled copy of the app shell document
  PrecacheShell,
  /// Empty image stand-in
  Placeholder,
  /// Every fallback exhausted
  Unavailable,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_expiration_by_age() {
    let expiration = Expiration::new(10, 60);
    let now = Utc::now();
    assert!(!expiration.is_expired(now - Duration::seconds(30), now));
    assert!(expiration.is_expired(now - Duration::seconds(61), now));
    assert!(!Expiration::none().is_expired(now - Duration::days(3650), now));
  }
}
