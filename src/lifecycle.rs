//! Install and activation of a deployed version.
//!
//! Install primes the bootstrap pages and the precache manifest once per
//! version. The new version then waits until it is activated, either because
//! nothing was active before or because a skip-waiting message arrived.
//! Activation drops every partition outside the current allowlist.

use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, Expiration};
use crate::error::{OfflineError, Result};
use crate::net::{Fetch, Request};
use crate::precache::PrecacheManifest;
use crate::router::{ACTIVE_PARTITIONS, PAGES_PARTITION};
use crate::store::Store;

/// Documents primed into the page partition at install time.
pub const BOOTSTRAP_PAGES: &[&str] = &["/", "/index.html", "/quienes-somos", "/noticias", "/contacto"];

/// Partitions in this namespace belong to the precache and survive activation.
pub const PRECACHE_NAMESPACE: &str = "workbox-precache";

const INSTALLED_VERSION_KEY: &str = "installed_version";
const ACTIVE_VERSION_KEY: &str = "active_version";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkerState {
  /// Nothing installed in this process yet
  Idle,
  /// Installed, waiting for activation
  Waiting { version: String },
  Active { version: String },
}

#[derive(Debug, Default)]
pub struct InstallReport {
  pub version: String,
  /// Same version was already installed; nothing was fetched
  pub skipped: bool,
  pub primed: usize,
  pub precached: usize,
  pub failures: Vec<(String, OfflineError)>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivateReport {
  pub version: String,
  pub deleted: Vec<String>,
}

pub struct LifecycleManager<S: CacheStorage> {
  cache: CacheLayer<S>,
  store: Arc<Store>,
  fetcher: Arc<dyn Fetch>,
  site_url: Url,
  manifest: Option<PrecacheManifest>,
  allowlist: Vec<String>,
  state: Mutex<WorkerState>,
}

impl<S: CacheStorage> LifecycleManager<S> {
  pub fn new(
    cache: CacheLayer<S>,
    store: Arc<Store>,
    fetcher: Arc<dyn Fetch>,
    site_url: Url,
    manifest: Option<PrecacheManifest>,
  ) -> Self {
    Self {
      cache,
      store,
      fetcher,
      site_url,
      manifest,
      allowlist: ACTIVE_PARTITIONS.iter().map(|p| p.to_string()).collect(),
      state: Mutex::new(WorkerState::Idle),
    }
  }

  /// Replace the set of partitions kept on activation.
  pub fn with_allowlist(mut self, allowlist: &[&str]) -> Self {
    self.allowlist = allowlist.iter().map(|p| p.to_string()).collect();
    self
  }

  pub fn state(&self) -> WorkerState {
    self.lock().map(|s| s.clone()).unwrap_or(WorkerState::Idle)
  }

  pub fn active_version(&self) -> Result<Option<String>> {
    self.store.meta_get(ACTIVE_VERSION_KEY)
  }

  fn lock(&self) -> Result<MutexGuard<'_, WorkerState>> {
    self
      .state
      .lock()
      .map_err(|e| OfflineError::StoreIo(format!("lifecycle state poisoned: {}", e)))
  }

  fn set_state(&self, state: WorkerState) -> Result<()> {
    debug!(?state, "lifecycle transition");
    *self.lock()? = state;
    Ok(())
  }

  /// Install `version`. Fetch failures are reported but never abort the
  /// install; store failures do.
  pub async fn install(&self, version: &str) -> Result<InstallReport> {
    let mut report = InstallReport {
      version: version.to_string(),
      ..Default::default()
    };

    if self.store.meta_get(INSTALLED_VERSION_KEY)?.as_deref() == Some(version) {
      info!(version, "version already installed");
      report.skipped = true;
      let state = match self.active_version()? {
        Some(active) if active == version => WorkerState::Active { version: active },
        _ => WorkerState::Waiting {
          version: version.to_string(),
        },
      };
      self.set_state(state)?;
      return Ok(report);
    }

    info!(version, "installing");
    self.cache.storage().open_partition(PAGES_PARTITION)?;
    for path in BOOTSTRAP_PAGES {
      match self.prime(path).await {
        Ok(()) => report.primed += 1,
        Err(e) => {
          warn!(path, error = %e, "bootstrap page not primed");
          report.failures.push((path.to_string(), e));
        }
      }
    }

    if let Some(manifest) = &self.manifest {
      match manifest.install(&self.cache) {
        Ok(written) => report.precached = written,
        Err(e) => {
          warn!(error = %e, "precache install failed");
          report.failures.push((manifest.partition().to_string(), e));
        }
      }
    }

    self.store.meta_set(INSTALLED_VERSION_KEY, version)?;
    self.set_state(WorkerState::Waiting {
      version: version.to_string(),
    })?;
    info!(
      version,
      primed = report.primed,
      precached = report.precached,
      failures = report.failures.len(),
      "install finished"
    );
    Ok(report)
  }

  async fn prime(&self, path: &str) -> Result<()> {
    let url = self
      .site_url
      .join(path)
      .map_err(|e| OfflineError::InvalidRequest(format!("{}: {}", path, e)))?;
    let response = self.fetcher.fetch(&Request::get(url.as_str())?).await?;
    if !response.is_success() {
      return Err(OfflineError::HttpApplication {
        url: url.to_string(),
        status: response.status,
      });
    }
    self
      .cache
      .put(PAGES_PARTITION, url.as_str(), &response, &Expiration::none())
  }

  /// Whether a waiting version should take over without a skip-waiting
  /// message: true when no version was ever activated.
  pub fn activates_immediately(&self) -> Result<bool> {
    Ok(matches!(self.state(), WorkerState::Waiting { .. }) && self.active_version()?.is_none())
  }

  /// Activate the waiting version now. `None` when nothing is waiting.
  pub fn skip_waiting(&self) -> Result<Option<ActivateReport>> {
    match self.state() {
      WorkerState::Waiting { .. } => self.activate().map(Some),
      state => {
        debug!(?state, "skip waiting with nothing to activate");
        Ok(None)
      }
    }
  }

  /// Delete obsolete partitions and take over as the active version.
  pub fn activate(&self) -> Result<ActivateReport> {
    let version = match self.state() {
      WorkerState::Waiting { version } | WorkerState::Active { version } => version,
      WorkerState::Idle => self
        .store
        .meta_get(INSTALLED_VERSION_KEY)?
        .unwrap_or_default(),
    };

    let mut deleted = Vec::new();
    for name in self.cache.storage().partition_names()? {
      if self.keeps(&name) {
        continue;
      }
      if self.cache.storage().delete_partition(&name)? {
        info!(partition = %name, "deleted obsolete partition");
        deleted.push(name);
      }
    }

    self.store.meta_set(ACTIVE_VERSION_KEY, &version)?;
    self.set_state(WorkerState::Active {
      version: version.clone(),
    })?;
    info!(version, deleted = deleted.len(), "activated");
    Ok(ActivateReport { version, deleted })
  }

  fn keeps(&self, partition: &str) -> bool {
    self.allowlist.iter().any(|p| p == partition) || partition.contains(PRECACHE_NAMESPACE)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use crate::net::Response;
  use crate::testing::{Reply, ScriptedFetcher};

  const SITE: &str = "https://sututeh.com/";

  fn manager(fetcher: Arc<ScriptedFetcher>) -> LifecycleManager<SqliteStorage> {
    LifecycleManager::new(
      CacheLayer::new(SqliteStorage::open_in_memory().unwrap()),
      Arc::new(Store::open_in_memory().unwrap()),
      fetcher,
      Url::parse(SITE).unwrap(),
      None,
    )
  }

  fn serve_bootstrap(fetcher: &ScriptedFetcher) {
    for path in BOOTSTRAP_PAGES {
      fetcher.on(&format!("https://sututeh.com{}", path), Reply::ok("<html>"));
    }
  }

  #[tokio::test]
  async fn test_install_primes_bootstrap_pages() {
    let fetcher = ScriptedFetcher::new();
    serve_bootstrap(&fetcher);
    let manager = manager(fetcher);

    let report = manager.install("3.0.0").await.unwrap();
    assert_eq!(report.primed, BOOTSTRAP_PAGES.len());
    assert!(report.failures.is_empty());
    assert!(manager
      .cache
      .lookup(PAGES_PARTITION, "https://sututeh.com/index.html", &Expiration::none())
      .unwrap()
      .is_some());
    assert_eq!(
      manager.state(),
      WorkerState::Waiting {
        version: "3.0.0".to_string()
      }
    );
    assert!(manager.activates_immediately().unwrap());
  }

  #[tokio::test]
  async fn test_install_failures_do_not_block() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on("https://sututeh.com/index.html", Reply::ok("shell"));
    let manager = manager(fetcher);

    let report = manager.install("3.0.0").await.unwrap();
    assert_eq!(report.primed, 1);
    assert_eq!(report.failures.len(), BOOTSTRAP_PAGES.len() - 1);
    assert!(matches!(manager.state(), WorkerState::Waiting { .. }));
  }

  #[tokio::test]
  async fn test_second_install_of_same_version_is_noop() {
    let fetcher = ScriptedFetcher::new();
    serve_bootstrap(&fetcher);
    let manager = manager(fetcher.clone());

    manager.install("3.0.0").await.unwrap();
    let calls = fetcher.total_calls();
    let report = manager.install("3.0.0").await.unwrap();
    assert!(report.skipped);
    assert_eq!(fetcher.total_calls(), calls);
  }

  #[tokio::test]
  async fn test_activation_deletes_obsolete_partitions() {
    let manager = manager(ScriptedFetcher::new());
    let storage = manager.cache.storage();
    for name in ["sututeh-pages-v1", "old-cache-v0", "workbox-precache-v2-https://sututeh.com/"] {
      storage.open_partition(name).unwrap();
    }
    manager
      .cache
      .put("old-cache-v0", "https://sututeh.com/", &Response::new(200, "old"), &Expiration::none())
      .unwrap();

    let report = manager.activate().unwrap();
    assert_eq!(report.deleted, vec!["old-cache-v0".to_string()]);
    let names = storage.partition_names().unwrap();
    assert!(names.contains(&"sututeh-pages-v1".to_string()));
    assert!(names.contains(&"workbox-precache-v2-https://sututeh.com/".to_string()));
    assert!(!names.contains(&"old-cache-v0".to_string()));
    assert!(manager.cache.lookup_any("https://sututeh.com/").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_custom_allowlist_replaces_default() {
    let manager = manager(ScriptedFetcher::new()).with_allowlist(&["sututeh-pages-v2"]);
    let storage = manager.cache.storage();
    for name in ["sututeh-pages-v1", "sututeh-pages-v2", "workbox-precache-v2-https://sututeh.com/"] {
      storage.open_partition(name).unwrap();
    }

    let report = manager.activate().unwrap();
    assert_eq!(report.deleted, vec!["sututeh-pages-v1".to_string()]);
    let names = storage.partition_names().unwrap();
    assert!(names.contains(&"sututeh-pages-v2".to_string()));
    assert!(names.contains(&"workbox-precache-v2-https://sututeh.com/".to_string()));
  }

  #[tokio::test]
  async fn test_upgrade_waits_for_skip_waiting() {
    let fetcher = ScriptedFetcher::new();
    serve_bootstrap(&fetcher);
    let manager = manager(fetcher);

    manager.install("3.0.0").await.unwrap();
    manager.activate().unwrap();
    manager.install("3.1.0").await.unwrap();
    assert!(!manager.activates_immediately().unwrap());
    assert_eq!(manager.active_version().unwrap().as_deref(), Some("3.0.0"));

    let report = manager.skip_waiting().unwrap().unwrap();
    assert_eq!(report.version, "3.1.0");
    assert_eq!(
      manager.state(),
      WorkerState::Active {
        version: "3.1.0".to_string()
      }
    );
    assert!(manager.skip_waiting().unwrap().is_none());
  }
}
