//! The long-lived background service.
//!
//! One instance owns the router, the structured store, the sync engine, the
//! warmer and the lifecycle manager. The UI side talks to it only through
//! [`ServiceHandle`]: control messages in, [`ServiceEvent`]s out.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheResult, CacheStorage, SqliteStorage};
use crate::error::{OfflineError, Result};
use crate::event::{ControlMessage, EventStream, ServiceEvent};
use crate::lifecycle::LifecycleManager;
use crate::net::{Connectivity, Fetch, HttpFetcher, Request};
use crate::precache::PrecacheManifest;
use crate::router::Router;
use crate::store::Store;
use crate::sync::SyncEngine;
use crate::warmer::CacheWarmer;

const EVENT_CAPACITY: usize = 64;

/// Everything the service needs besides its storage and network.
#[derive(Debug, Clone)]
pub struct ServiceSettings {
  pub site_url: Url,
  pub api_url: String,
  pub known_origins: Vec<String>,
  pub version: String,
  pub network_timeout: Duration,
  pub warm_delay: Duration,
  pub manifest: Option<PrecacheManifest>,
}

pub struct OfflineService<S: CacheStorage> {
  router: Arc<Router<S>>,
  store: Arc<Store>,
  sync: SyncEngine,
  warmer: CacheWarmer<S>,
  lifecycle: Arc<LifecycleManager<S>>,
  connectivity: Connectivity,
  events: broadcast::Sender<ServiceEvent>,
  version: String,
  warm_delay: Duration,
}

impl<S: CacheStorage> Clone for OfflineService<S> {
  fn clone(&self) -> Self {
    Self {
      router: Arc::clone(&self.router),
      store: Arc::clone(&self.store),
      sync: self.sync.clone(),
      warmer: self.warmer.clone(),
      lifecycle: Arc::clone(&self.lifecycle),
      connectivity: self.connectivity.clone(),
      events: self.events.clone(),
      version: self.version.clone(),
      warm_delay: self.warm_delay,
    }
  }
}

impl OfflineService<SqliteStorage> {
  /// Open the store and response cache in `database` and talk to the real
  /// network.
  pub fn open(settings: ServiceSettings, database: &Path) -> Result<Self> {
    let store = Arc::new(Store::init_storage(database)?);
    let cache = CacheLayer::new(SqliteStorage::open(database)?);
    let fetcher: Arc<dyn Fetch> = Arc::new(HttpFetcher::new()?);
    Self::new(cache, store, fetcher, Connectivity::default(), settings)
  }
}

impl<S: CacheStorage + 'static> OfflineService<S> {
  pub fn new(
    cache: CacheLayer<S>,
    store: Arc<Store>,
    fetcher: Arc<dyn Fetch>,
    connectivity: Connectivity,
    settings: ServiceSettings,
  ) -> Result<Self> {
    let mut router = Router::portal(
      cache.clone(),
      Arc::clone(&fetcher),
      &settings.site_url,
      &settings.known_origins,
      settings.network_timeout,
    )?;
    if let Some(manifest) = &settings.manifest {
      router = router.with_precache(manifest.route());
    }
    let router = Arc::new(router);

    let warmer = CacheWarmer::new(
      Arc::clone(&router),
      Arc::clone(&store),
      connectivity.clone(),
      settings.site_url.clone(),
      &settings.api_url,
    );
    let lifecycle = LifecycleManager::new(
      cache,
      Arc::clone(&store),
      Arc::clone(&fetcher),
      settings.site_url.clone(),
      settings.manifest,
    );
    let (events, _) = broadcast::channel(EVENT_CAPACITY);

    Ok(Self {
      sync: SyncEngine::new(Arc::clone(&store), fetcher, connectivity.clone()),
      router,
      store,
      warmer,
      lifecycle: Arc::new(lifecycle),
      connectivity,
      events,
      version: settings.version,
      warm_delay: settings.warm_delay,
    })
  }

  pub fn router(&self) -> &Router<S> {
    &self.router
  }

  pub fn store(&self) -> &Store {
    &self.store
  }

  pub fn sync(&self) -> &SyncEngine {
    &self.sync
  }

  pub fn warmer(&self) -> &CacheWarmer<S> {
    &self.warmer
  }

  pub fn lifecycle(&self) -> &LifecycleManager<S> {
    &self.lifecycle
  }

  pub fn connectivity(&self) -> &Connectivity {
    &self.connectivity
  }

  pub fn subscribe(&self) -> EventStream {
    EventStream::new(self.events.subscribe())
  }

  pub async fn intercept(&self, request: &Request) -> Result<CacheResult> {
    self.router.intercept(request).await
  }

  fn announce(&self, event: ServiceEvent) {
    debug!(?event, "service event");
    // No subscribers is fine.
    let _ = self.events.send(event);
  }

  /// Install the configured version, activating it straight away when
  /// nothing was active before.
  pub async fn install(&self) -> Result<()> {
    let report = self.lifecycle.install(&self.version).await?;
    if !report.skipped {
      self.announce(ServiceEvent::Installed {
        version: report.version,
        primed: report.primed,
        failures: report.failures.len(),
      });
    }
    if self.lifecycle.activates_immediately()? {
      self.activate()?;
    }
    Ok(())
  }

  /// Activate the installed version and claim every UI context.
  pub fn activate(&self) -> Result<()> {
    let report = self.lifecycle.activate()?;
    self.announce(ServiceEvent::Activated {
      version: report.version.clone(),
      deleted: report.deleted,
    });
    self.announce(ServiceEvent::Claimed {
      version: report.version,
    });
    Ok(())
  }

  pub async fn drain(&self) -> Result<()> {
    let outcomes = self.sync.drain().await?;
    if outcomes.is_empty() {
      return Ok(());
    }
    let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
    self.announce(ServiceEvent::Drained {
      delivered,
      failed: outcomes.len() - delivered,
    });
    Ok(())
  }

  async fn warm(&self) {
    match self.warmer.run().await {
      Ok(report) => self.announce(ServiceEvent::Warmed {
        pages: report.pages_primed,
        failures: report.failures.len(),
      }),
      Err(skip) => debug!(?skip, "warm skipped"),
    }
  }

  /// Spawn the background tasks and the control loop.
  pub fn start(&self) -> ServiceHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    let service = self.clone();
    let task = tokio::spawn(async move { service.run(rx).await });
    ServiceHandle {
      control: tx,
      events: self.events.clone(),
      task,
    }
  }

  async fn run(self, mut rx: mpsc::UnboundedReceiver<ControlMessage>) {
    info!(version = %self.version, "offline service starting");
    if let Err(e) = self.install().await {
      error!(error = %e, "install failed");
    }

    let auto_drain = self.reconnect_drain();
    let warm = {
      let service = self.clone();
      let delay = self.warm_delay;
      tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        service.warm().await;
      })
    };

    // Drain and Warm run off the loop; SkipWaiting must not queue behind them.
    let mut jobs: Vec<JoinHandle<()>> = Vec::new();
    while let Some(message) = rx.recv().await {
      debug!(?message, "control message");
      jobs.retain(|job| !job.is_finished());
      let outcome = match message {
        ControlMessage::SkipWaiting => self.skip_waiting(),
        ControlMessage::ConnectivityChanged(online) => {
          self.connectivity.set_online(online);
          Ok(())
        }
        ControlMessage::Drain => {
          let service = self.clone();
          jobs.push(tokio::spawn(async move {
            if let Err(e) = service.drain().await {
              error!(error = %e, "drain failed");
            }
          }));
          Ok(())
        }
        ControlMessage::Warm => {
          let service = self.clone();
          jobs.push(tokio::spawn(async move { service.warm().await }));
          Ok(())
        }
        ControlMessage::Shutdown => break,
      };
      if let Err(e) = outcome {
        error!(error = %e, "control message failed");
      }
    }

    auto_drain.abort();
    warm.abort();
    for job in jobs {
      job.abort();
    }
    info!("offline service stopped");
  }

  fn skip_waiting(&self) -> Result<()> {
    match self.lifecycle.skip_waiting()? {
      Some(report) => {
        self.announce(ServiceEvent::Activated {
          version: report.version.clone(),
          deleted: report.deleted,
        });
        self.announce(ServiceEvent::Claimed {
          version: report.version,
        });
      }
      None => warn!("skip waiting received with no waiting version"),
    }
    Ok(())
  }

  /// Drain on every offline to online transition, announcing the result.
  fn reconnect_drain(&self) -> JoinHandle<()> {
    let service = self.clone();
    let mut rx = self.connectivity.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        if !*rx.borrow_and_update() {
          continue;
        }
        if let Err(e) = service.drain().await {
          error!(error = %e, "reconnect drain failed");
        }
      }
    })
  }
}

/// Control side of a running service.
pub struct ServiceHandle {
  control: mpsc::UnboundedSender<ControlMessage>,
  events: broadcast::Sender<ServiceEvent>,
  task: JoinHandle<()>,
}

impl ServiceHandle {
  pub fn send(&self, message: ControlMessage) -> Result<()> {
    self
      .control
      .send(message)
      .map_err(|_| OfflineError::InvalidRequest("offline service has stopped".to_string()))
  }

  pub fn subscribe(&self) -> EventStream {
    EventStream::new(self.events.subscribe())
  }

  /// Stop the control loop and wait for it to finish.
  pub async fn shutdown(self) {
    let _ = self.control.send(ControlMessage::Shutdown);
    if let Err(e) = self.task.await {
      warn!(error = %e, "offline service task ended abnormally");
    }
  }
}
