//! Request interception.
//!
//! The router classifies each outgoing request and hands it to the first
//! matching handler, in this order:
//! - Precached URLs, served from the precache partition
//! - Top-level page loads on the navigation allowlist, via the fallback chain
//! - The route table, evaluated top-down
//!
//! Requests nothing claims pass straight through to the network. Handled
//! routes never surface a transport error: the catch handler turns it into
//! an app shell, an image placeholder, or a 503.

mod navigation;
mod rules;

pub use navigation::{NavState, NavigationChain};
pub use rules::{
  portal_routes, NavigationMatcher, RoutePredicate, RouteRule, ACTIVE_PARTITIONS,
  ASSETS_PARTITION, EMPRESA_PARTITION, FILES_PARTITION, FONTS_PARTITION, IMAGES_PARTITION,
  NOTICIAS_PARTITION, PAGES_PARTITION,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheSource, CacheStorage, Expiration};
use crate::error::{OfflineError, Result};
use crate::net::{Destination, Fetch, Request, Response};
use crate::precache;
use crate::strategy::StrategyEngine;

/// URLs bundled at install time and the partition holding them.
#[derive(Debug, Clone, Default)]
pub struct PrecacheRoute {
  pub partition: String,
  pub urls: HashSet<String>,
}

pub struct Router<S: CacheStorage> {
  engine: StrategyEngine<S>,
  matcher: NavigationMatcher,
  chain: NavigationChain<S>,
  rules: Vec<RouteRule>,
  precache: Option<PrecacheRoute>,
}

impl<S: CacheStorage + 'static> Router<S> {
  pub fn new(
    engine: StrategyEngine<S>,
    matcher: NavigationMatcher,
    chain: NavigationChain<S>,
    rules: Vec<RouteRule>,
  ) -> Self {
    Self {
      engine,
      matcher,
      chain,
      rules,
      precache: None,
    }
  }

  /// The portal's full routing setup for a site rooted at `site_url`.
  pub fn portal(
    cache: CacheLayer<S>,
    fetcher: Arc<dyn Fetch>,
    site_url: &Url,
    known_origins: &[String],
    network_timeout: Duration,
  ) -> Result<Self> {
    let app_shell = site_url
      .join("/index.html")
      .map_err(|e| OfflineError::InvalidRequest(format!("{}: {}", site_url, e)))?;
    let chain = NavigationChain::new(
      cache.clone(),
      Arc::clone(&fetcher),
      PAGES_PARTITION,
      &precache::partition_name(site_url),
      app_shell.as_str(),
      network_timeout,
    );
    Ok(Self::new(
      StrategyEngine::new(cache, fetcher),
      NavigationMatcher::portal(),
      chain,
      portal_routes(known_origins, network_timeout),
    ))
  }

  pub fn with_precache(mut self, precache: PrecacheRoute) -> Self {
    self.precache = Some(precache);
    self
  }

  pub fn engine(&self) -> &StrategyEngine<S> {
    &self.engine
  }

  /// Name of the handler that would claim `request`.
  pub fn classify(&self, request: &Request) -> Option<&'static str> {
    if self.is_precached(request) {
      return Some("precache");
    }
    if self.matcher.matches(request) {
      return Some("navigation");
    }
    self
      .rules
      .iter()
      .find(|rule| rule.predicate.matches(request))
      .map(|rule| rule.name)
  }

  pub async fn intercept(&self, request: &Request) -> Result<CacheResult> {
    if let Some(precache) = self.precache.as_ref().filter(|_| self.is_precached(request)) {
      return self.serve_precached(precache, request).await;
    }

    if self.matcher.matches(request) {
      return Ok(self.chain.run(request).await);
    }

    let Some(rule) = self.rules.iter().find(|rule| rule.predicate.matches(request)) else {
      debug!(url = %request.url, "passthrough");
      let response = self.engine.fetcher().fetch(request).await?;
      return Ok(CacheResult::from_network(response));
    };

    debug!(url = %request.url, route = rule.name, "route matched");
    match self.engine.handle(&rule.strategy, request).await {
      Ok(result) => Ok(result),
      Err(failure) => Ok(self.catch(request, failure)),
    }
  }

  fn is_precached(&self, request: &Request) -> bool {
    request.method == "GET"
      && self
        .precache
        .as_ref()
        .map(|p| p.urls.contains(&request.cache_key()))
        .unwrap_or(false)
  }

  async fn serve_precached(&self, precache: &PrecacheRoute, request: &Request) -> Result<CacheResult> {
    let key = request.cache_key();
    match self.engine.cache().lookup(&precache.partition, &key, &Expiration::none()) {
      Ok(Some(cached)) => return Ok(CacheResult::from_cache(cached)),
      Ok(None) => {}
      Err(e) => warn!(url = %key, error = %e, "precache read failed"),
    }
    match self.engine.fetcher().fetch(request).await {
      Ok(response) => Ok(CacheResult::from_network(response)),
      Err(failure) => Ok(self.catch(request, failure)),
    }
  }

  /// Last resort for a handled route whose strategy failed.
  fn catch(&self, request: &Request, failure: OfflineError) -> CacheResult {
    if request.navigate {
      return self.chain.recover(request, failure);
    }
    if request.destination == Destination::Image {
      debug!(url = %request.url, "image placeholder");
      return CacheResult::fallback(Response::placeholder(), CacheSource::Placeholder, failure);
    }
    warn!(url = %request.url, error = %failure, "no offline fallback");
    CacheResult::unavailable(failure)
  }
}
