//! Fallback chain for top-level page loads.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::cache::{
  CacheLayer, CacheResult, CacheSource, CacheStorage, CachedResponse, Expiration,
};
use crate::error::{OfflineError, Result};
use crate::net::{Fetch, Request};

/// Steps of the chain, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavState {
  TryNetwork,
  TryExactCache,
  TryAppShell,
  TryPrecacheShell,
  Fail,
}

impl NavState {
  fn next(self) -> Self {
    match self {
      Self::TryNetwork => Self::TryExactCache,
      Self::TryExactCache => Self::TryAppShell,
      Self::TryAppShell => Self::TryPrecacheShell,
      Self::TryPrecacheShell | Self::Fail => Self::Fail,
    }
  }
}

pub struct NavigationChain<S: CacheStorage> {
  cache: CacheLayer<S>,
  fetcher: Arc<dyn Fetch>,
  pages_partition: String,
  precache_partition: String,
  /// Absolute URL of the app shell document
  app_shell_url: String,
  timeout: Duration,
}

impl<S: CacheStorage + 'static> NavigationChain<S> {
  pub fn new(
    cache: CacheLayer<S>,
    fetcher: Arc<dyn Fetch>,
    pages_partition: &str,
    precache_partition: &str,
    app_shell_url: &str,
    timeout: Duration,
  ) -> Self {
    Self {
      cache,
      fetcher,
      pages_partition: pages_partition.to_string(),
      precache_partition: precache_partition.to_string(),
      app_shell_url: app_shell_url.to_string(),
      timeout,
    }
  }

  /// Walk the chain starting from the network. Never fails; the last state
  /// answers with a 503.
  pub async fn run(&self, request: &Request) -> CacheResult {
    let failure = match self.try_network(request).await {
      Ok(result) => return result,
      Err(failure) => failure,
    };
    self.walk(NavState::TryNetwork.next(), request, failure)
  }

  /// Walk the offline part of the chain for a request whose handler already
  /// failed.
  pub fn recover(&self, request: &Request, failure: OfflineError) -> CacheResult {
    self.walk(NavState::TryExactCache, request, failure)
  }

  fn walk(&self, mut state: NavState, request: &Request, failure: OfflineError) -> CacheResult {
    loop {
      let hit = match state {
        NavState::TryNetwork => None,
        NavState::TryExactCache => self
          .read(|| self.cache.lookup_any(&request.cache_key()))
          .map(|cached| (cached, CacheSource::Offline)),
        NavState::TryAppShell => self
          .read(|| {
            self
              .cache
              .lookup(&self.pages_partition, &self.app_shell_url, &Expiration::none())
          })
          .map(|cached| (cached, CacheSource::AppShell)),
        NavState::TryPrecacheShell => self
          .read(|| {
            self
              .cache
              .lookup(&self.precache_partition, &self.app_shell_url, &Expiration::none())
          })
          .map(|cached| (cached, CacheSource::PrecacheShell)),
        NavState::Fail => {
          warn!(url = %request.url, error = %failure, "navigation unavailable offline");
          return CacheResult::unavailable(failure);
        }
      };

      if let Some((cached, source)) = hit {
        debug!(url = %request.url, ?state, "navigation served offline");
        return CacheResult {
          response: cached.response,
          source,
          cached_at: Some(cached.stored_at),
          failure: Some(failure),
        };
      }
      state = state.next();
    }
  }

  async fn try_network(&self, request: &Request) -> Result<CacheResult> {
    let (tx, rx) = oneshot::channel();
    let fetcher = Arc::clone(&self.fetcher);
    let cache = self.cache.clone();
    let partition = self.pages_partition.clone();
    let owned_request = request.clone();

    // A late success is still written back after the chain has answered.
    tokio::spawn(async move {
      let result = fetcher.fetch(&owned_request).await;
      let write_back = match &result {
        Ok(response) if response.is_success() => Some(response.clone()),
        _ => None,
      };
      let _ = tx.send(result);
      if let Some(response) = write_back {
        if let Err(e) = cache.put(
          &partition,
          &owned_request.cache_key(),
          &response,
          &Expiration::none(),
        ) {
          warn!(partition, error = %e, "page write-back failed");
        }
      }
    });

    match tokio::time::timeout(self.timeout, rx).await {
      Ok(Ok(Ok(response))) => Ok(CacheResult::from_network(response)),
      Ok(Ok(Err(e))) => Err(e),
      Ok(Err(_)) => Err(OfflineError::transport(
        request.url.as_str(),
        "network task dropped",
      )),
      Err(_) => Err(OfflineError::timeout(request.url.as_str(), self.timeout)),
    }
  }

  fn read<F>(&self, lookup: F) -> Option<CachedResponse>
  where
    F: FnOnce() -> Result<Option<CachedResponse>>,
  {
    lookup().unwrap_or_else(|e| {
      warn!(error = %e, "navigation cache read failed");
      None
    })
  }
}
