//! Response-acquisition policies.
//!
//! Each strategy decides whether the network or a cache partition answers a
//! request, and what gets written back. Transport failures come back as
//! `Err` so the router can run its fallbacks; HTTP error statuses are
//! ordinary responses and are returned as-is (but never cached).

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::{CacheLayer, CacheResult, CacheStorage, CachedResponse, Expiration};
use crate::error::{OfflineError, Result};
use crate::net::{Fetch, Request};

/// Where a strategy caches and which responses qualify.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachePolicy {
  pub partition: String,
  pub expiration: Expiration,
  /// Cacheable statuses; `None` uses the strategy default
  pub statuses: Option<Vec<u16>>,
}

impl CachePolicy {
  pub fn new(partition: &str, expiration: Expiration) -> Self {
    Self {
      partition: partition.to_string(),
      expiration,
      statuses: None,
    }
  }

  pub fn with_statuses(mut self, statuses: &[u16]) -> Self {
    self.statuses = Some(statuses.to_vec());
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Strategy {
  CacheFirst(CachePolicy),
  NetworkFirst {
    policy: CachePolicy,
    timeout: Duration,
  },
  StaleWhileRevalidate(CachePolicy),
  NetworkOnly,
}

impl Strategy {
  pub fn policy(&self) -> Option<&CachePolicy> {
    match self {
      Self::CacheFirst(policy) | Self::StaleWhileRevalidate(policy) => Some(policy),
      Self::NetworkFirst { policy, .. } => Some(policy),
      Self::NetworkOnly => None,
    }
  }

  /// Whether `status` may be written to the partition.
  pub fn is_cacheable(&self, status: u16) -> bool {
    let default: &[u16] = match self {
      Self::StaleWhileRevalidate(_) => &[0, 200],
      _ => &[200],
    };
    match self.policy().and_then(|p| p.statuses.as_deref()) {
      Some(statuses) => statuses.contains(&status),
      None => default.contains(&status),
    }
  }
}

/// Runs strategies against a partition cache and the network.
pub struct StrategyEngine<S: CacheStorage> {
  cache: CacheLayer<S>,
  fetcher: Arc<dyn Fetch>,
}

impl<S: CacheStorage> Clone for StrategyEngine<S> {
  fn clone(&self) -> Self {
    Self {
      cache: self.cache.clone(),
      fetcher: Arc::clone(&self.fetcher),
    }
  }
}

impl<S: CacheStorage + 'static> StrategyEngine<S> {
  pub fn new(cache: CacheLayer<S>, fetcher: Arc<dyn Fetch>) -> Self {
    Self { cache, fetcher }
  }

  pub fn cache(&self) -> &CacheLayer<S> {
    &self.cache
  }

  pub fn fetcher(&self) -> &Arc<dyn Fetch> {
    &self.fetcher
  }

  pub async fn handle(&self, strategy: &Strategy, request: &Request) -> Result<CacheResult> {
    match strategy {
      Strategy::CacheFirst(policy) => self.cache_first(strategy, policy, request).await,
      Strategy::NetworkFirst { policy, timeout } => {
        self
          .network_first(strategy, policy, *timeout, request)
          .await
      }
      Strategy::StaleWhileRevalidate(policy) => {
        self
          .stale_while_revalidate(strategy, policy, request)
          .await
      }
      Strategy::NetworkOnly => {
        let response = self.fetcher.fetch(request).await?;
        Ok(CacheResult::from_network(response))
      }
    }
  }

  /// Partition read that treats storage failures as a miss.
  fn cached(&self, policy: &CachePolicy, request: &Request) -> Option<CachedResponse> {
    let key = request.cache_key();
    match self.cache.lookup(&policy.partition, &key, &policy.expiration) {
      Ok(hit) => hit,
      Err(e) => {
        warn!(partition = %policy.partition, url = %key, error = %e, "cache read failed");
        None
      }
    }
  }

  async fn cache_first(
    &self,
    strategy: &Strategy,
    policy: &CachePolicy,
    request: &Request,
  ) -> Result<CacheResult> {
    if let Some(cached) = self.cached(policy, request) {
      debug!(partition = %policy.partition, url = %request.url, "cache hit");
      return Ok(CacheResult::from_cache(cached));
    }

    let response = self.fetcher.fetch(request).await?;
    if strategy.is_cacheable(response.status) {
      if let Err(e) = self.cache.put(
        &policy.partition,
        &request.cache_key(),
        &response,
        &policy.expiration,
      ) {
        warn!(partition = %policy.partition, url = %request.url, error = %e, "cache write failed");
      }
    }
    Ok(CacheResult::from_network(response))
  }

  async fn network_first(
    &self,
    strategy: &Strategy,
    policy: &CachePolicy,
    timeout: Duration,
    request: &Request,
  ) -> Result<CacheResult> {
    let (tx, rx) = oneshot::channel();
    let fetcher = Arc::clone(&self.fetcher);
    let cache = self.cache.clone();
    let owned_request = request.clone();
    let cacheable = strategy.clone();
    let owned_policy = policy.clone();

    // The fetch outlives a timeout; a late success still refreshes the cache.
    tokio::spawn(async move {
      let result = fetcher.fetch(&owned_request).await;
      let response = match &result {
        Ok(response) if cacheable.is_cacheable(response.status) => Some(response.clone()),
        _ => None,
      };
      let _ = tx.send(result);
      if let Some(response) = response {
        if let Err(e) = cache.put(
          &owned_policy.partition,
          &owned_request.cache_key(),
          &response,
          &owned_policy.expiration,
        ) {
          warn!(partition = %owned_policy.partition, error = %e, "cache write failed");
        }
      }
    });

    let failure = match tokio::time::timeout(timeout, rx).await {
      Ok(Ok(Ok(response))) => return Ok(CacheResult::from_network(response)),
      Ok(Ok(Err(e))) => e,
      Ok(Err(_)) => OfflineError::transport(request.url.as_str(), "network task dropped"),
      Err(_) => OfflineError::timeout(request.url.as_str(), timeout),
    };

    debug!(url = %request.url, error = %failure, "network-first falling back to cache");
    match self.cached(policy, request) {
      Some(cached) => Ok(CacheResult::offline(cached, failure)),
      None => Err(failure),
    }
  }

  async fn stale_while_revalidate(
    &self,
    strategy: &Strategy,
    policy: &CachePolicy,
    request: &Request,
  ) -> Result<CacheResult> {
    if let Some(cached) = self.cached(policy, request) {
      self.spawn_refresh(strategy.clone(), policy.clone(), request.clone());
      return Ok(CacheResult::from_cache(cached));
    }

    let response = self.fetcher.fetch(request).await?;
    if strategy.is_cacheable(response.status) {
      self.cache.spawn_put(
        &policy.partition,
        &request.cache_key(),
        response.clone(),
        policy.expiration,
      );
    }
    Ok(CacheResult::from_network(response))
  }

  /// Background revalidation. Its result only affects the next read.
  fn spawn_refresh(&self, strategy: Strategy, policy: CachePolicy, request: Request) {
    let engine = self.clone();
    tokio::spawn(async move {
      match engine.fetcher.fetch(&request).await {
        Ok(response) if strategy.is_cacheable(response.status) => {
          if let Err(e) = engine.cache.put(
            &policy.partition,
            &request.cache_key(),
            &response,
            &policy.expiration,
          ) {
            warn!(partition = %policy.partition, error = %e, "revalidation write failed");
          }
        }
        Ok(response) => {
          debug!(url = %request.url, status = response.status, "revalidation not cacheable");
        }
        Err(e) => {
          debug!(url = %request.url, error = %e, "revalidation failed");
        }
      }
    });
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheSource, SqliteStorage};
  use crate::net::Response;
  use crate::testing::{Reply, ScriptedFetcher};

  const URL: &str = "https://api.sututeh.com/api/datos-empresa";

  fn engine(fetcher: Arc<ScriptedFetcher>) -> StrategyEngine<SqliteStorage> {
    StrategyEngine::new(
      CacheLayer::new(SqliteStorage::open_in_memory().unwrap()),
      fetcher,
    )
  }

  fn policy() -> CachePolicy {
    CachePolicy::new("api-empresa", Expiration::new(20, 7 * 24 * 3600)).with_statuses(&[0, 200])
  }

  async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
  }

  #[tokio::test]
  async fn test_cache_first_hit_skips_network() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on(URL, Reply::ok("v1"));
    let engine = engine(fetcher.clone());
    let strategy = Strategy::CacheFirst(policy());
    let request = Request::get(URL).unwrap();

    let first = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);

    let second = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.text(), "v1");
    assert_eq!(fetcher.calls(URL), 1);
  }

  #[tokio::test]
  async fn test_cache_first_does_not_store_unacceptable_status() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on(URL, Reply::status(500));
    let engine = engine(fetcher.clone());
    let strategy = Strategy::CacheFirst(policy());
    let request = Request::get(URL).unwrap();

    let result = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(result.response.status, 500);
    engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(fetcher.calls(URL), 2);
  }

  #[tokio::test]
  async fn test_cache_first_miss_propagates_network_error() {
    let fetcher = ScriptedFetcher::new();
    let engine = engine(fetcher);
    let strategy = Strategy::CacheFirst(policy());
    let err = engine
      .handle(&strategy, &Request::get(URL).unwrap())
      .await
      .unwrap_err();
    assert!(err.is_transport());
  }

  #[tokio::test]
  async fn test_network_first_timeout_returns_cached_entry() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on(URL, Reply::Delay(Duration::from_millis(500), Response::new(200, "late")));
    let engine = engine(fetcher.clone());
    let strategy = Strategy::NetworkFirst {
      policy: policy(),
      timeout: Duration::from_millis(50),
    };
    let request = Request::get(URL).unwrap();
    engine
      .cache()
      .put("api-empresa", &request.cache_key(), &Response::new(200, "cached"), &policy().expiration)
      .unwrap();

    let result = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.response.text(), "cached");
    assert!(result.failure.unwrap().is_transport());
  }

  #[tokio::test]
  async fn test_network_first_success_updates_cache_in_background() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on(URL, Reply::ok("fresh"));
    let engine = engine(fetcher.clone());
    let strategy = Strategy::NetworkFirst {
      policy: policy(),
      timeout: Duration::from_secs(3),
    };
    let request = Request::get(URL).unwrap();

    let result = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(result.source, CacheSource::Network);
    settle().await;

    fetcher.set_offline(true);
    let result = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(result.source, CacheSource::Offline);
    assert_eq!(result.response.text(), "fresh");
  }

  #[tokio::test]
  async fn test_network_first_miss_propagates_failure() {
    let fetcher = ScriptedFetcher::new();
    let engine = engine(fetcher);
    let strategy = Strategy::NetworkFirst {
      policy: policy(),
      timeout: Duration::from_secs(3),
    };
    assert!(engine
      .handle(&strategy, &Request::get(URL).unwrap())
      .await
      .is_err());
  }

  #[tokio::test]
  async fn test_stale_while_revalidate_serves_cache_and_refreshes() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on(URL, Reply::ok("v1")).on(URL, Reply::ok("v2"));
    let engine = engine(fetcher.clone());
    let strategy = Strategy::StaleWhileRevalidate(CachePolicy::new(
      "assets-js-css",
      Expiration::new(60, 7 * 24 * 3600),
    ));
    let request = Request::get(URL).unwrap();

    let first = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(first.source, CacheSource::Network);
    settle().await;

    let second = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.response.text(), "v1");
    settle().await;

    let third = engine.handle(&strategy, &request).await.unwrap();
    assert_eq!(third.response.text(), "v2");
    settle().await;
    assert_eq!(fetcher.calls(URL), 3);
  }

  #[tokio::test]
  async fn test_network_only_never_caches() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on(URL, Reply::ok("sent"));
    let engine = engine(fetcher.clone());

    engine
      .handle(&Strategy::NetworkOnly, &Request::get(URL).unwrap())
      .await
      .unwrap();
    assert!(engine.cache().storage().partition_names().unwrap().is_empty());
  }

  #[test]
  fn test_default_cacheable_statuses() {
    let cache_first = Strategy::CacheFirst(CachePolicy::new("fonts", Expiration::none()));
    assert!(cache_first.is_cacheable(200));
    assert!(!cache_first.is_cacheable(0));

    let swr = Strategy::StaleWhileRevalidate(CachePolicy::new("assets", Expiration::none()));
    assert!(swr.is_cacheable(0));

    let images = Strategy::CacheFirst(CachePolicy::new("images-local", Expiration::none()).with_statuses(&[0, 200]));
    assert!(images.is_cacheable(0));
    assert!(!images.is_cacheable(404));
  }
}
