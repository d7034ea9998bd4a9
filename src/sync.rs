//! Outbound mutation queue replay.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::error::{OfflineError, Result};
use crate::net::{Connectivity, Fetch, Request};
use crate::store::{Partition, QueueItem, RequestDescriptor, Store, StoreKey};

/// Attempts after which a queued mutation is dropped.
pub const MAX_RETRIES: u32 = 3;

/// What happened to one queue item during a drain pass.
#[derive(Debug)]
pub enum DrainOutcome {
  /// Replayed with a 2xx and removed from the queue
  Delivered { id: i64, url: String, status: u16 },
  /// Failed; kept under the same id for the next pass
  Retrying {
    id: i64,
    url: String,
    retries: u32,
    error: OfflineError,
  },
  /// Failed for the last time and removed from the queue
  Dropped {
    id: i64,
    url: String,
    error: OfflineError,
  },
}

impl DrainOutcome {
  pub fn is_delivered(&self) -> bool {
    matches!(self, Self::Delivered { .. })
  }

  pub fn id(&self) -> i64 {
    match self {
      Self::Delivered { id, .. } | Self::Retrying { id, .. } | Self::Dropped { id, .. } => *id,
    }
  }
}

/// Replays queued mutations once connectivity returns.
///
/// A drain pass works on a snapshot of the queue taken when it starts, so
/// items enqueued mid-pass wait for the next one. Two passes running at the
/// same time may both send the same item.
#[derive(Clone)]
pub struct SyncEngine {
  store: Arc<Store>,
  fetcher: Arc<dyn Fetch>,
  connectivity: Connectivity,
}

impl SyncEngine {
  pub fn new(store: Arc<Store>, fetcher: Arc<dyn Fetch>, connectivity: Connectivity) -> Self {
    Self {
      store,
      fetcher,
      connectivity,
    }
  }

  /// Queue a mutation that failed for lack of connectivity.
  pub fn enqueue(&self, descriptor: &RequestDescriptor) -> Result<i64> {
    let id = self.store.add_to_sync_queue(descriptor)?;
    info!(id, url = %descriptor.url, method = %descriptor.method, "queued offline mutation");
    Ok(id)
  }

  pub fn pending(&self) -> Result<Vec<QueueItem>> {
    self.store.get_all()
  }

  /// Replay every queued item in insertion order, one at a time.
  pub async fn drain(&self) -> Result<Vec<DrainOutcome>> {
    if !self.connectivity.is_online() {
      debug!("offline, skipping drain");
      return Ok(Vec::new());
    }

    let queue: Vec<QueueItem> = self.store.get_all()?;
    if queue.is_empty() {
      return Ok(Vec::new());
    }
    info!(count = queue.len(), "draining offline queue");

    let mut outcomes = Vec::with_capacity(queue.len());
    for item in queue {
      outcomes.push(self.replay(item).await?);
    }

    let delivered = outcomes.iter().filter(|o| o.is_delivered()).count();
    info!(delivered, failed = outcomes.len() - delivered, "drain finished");
    Ok(outcomes)
  }

  async fn replay(&self, mut item: QueueItem) -> Result<DrainOutcome> {
    let Some(id) = item.id else {
      return Err(OfflineError::StoreIo(format!(
        "queue item for {} has no id",
        item.url
      )));
    };

    let failure = match self.send(&item).await {
      Ok(status) => {
        self.store.delete(Partition::OfflineQueue, &StoreKey::Int(id))?;
        info!(id, url = %item.url, status, "mutation delivered");
        return Ok(DrainOutcome::Delivered {
          id,
          url: item.url,
          status,
        });
      }
      Err(e) => e,
    };

    item.retry_count += 1;
    if item.retry_count >= MAX_RETRIES {
      self.store.delete(Partition::OfflineQueue, &StoreKey::Int(id))?;
      error!(id, url = %item.url, error = %failure, "mutation dropped after max retries");
      return Ok(DrainOutcome::Dropped {
        id,
        url: item.url,
        error: failure,
      });
    }

    self.store.put(&item)?;
    warn!(id, url = %item.url, retries = item.retry_count, error = %failure, "mutation failed");
    Ok(DrainOutcome::Retrying {
      id,
      url: item.url,
      retries: item.retry_count,
      error: failure,
    })
  }

  /// Re-issue one item. Non-2xx answers come back as `HttpApplication`.
  async fn send(&self, item: &QueueItem) -> Result<u16> {
    let mut request =
      Request::new(&item.method, &item.url)?.with_header("content-type", "application/json");
    for (name, value) in &item.headers {
      request = request.with_header(name, value);
    }
    if let Some(body) = &item.body {
      request = request.with_body(body.as_bytes());
    }

    let response = self.fetcher.fetch(&request).await?;
    if !response.is_success() {
      return Err(OfflineError::HttpApplication {
        url: item.url.clone(),
        status: response.status,
      });
    }
    Ok(response.status)
  }

  /// Drain on every offline to online transition until the connectivity
  /// source goes away.
  pub fn spawn_auto_drain(&self) -> JoinHandle<()> {
    let engine = self.clone();
    let mut rx = self.connectivity.subscribe();
    tokio::spawn(async move {
      while rx.changed().await.is_ok() {
        let online = *rx.borrow_and_update();
        if !online {
          continue;
        }
        if let Err(e) = engine.drain().await {
          error!(error = %e, "automatic drain failed");
        }
      }
    })
  }
}
