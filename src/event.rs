use tokio::sync::broadcast;

/// Messages the UI context sends to the background service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
  /// Activate a waiting version now
  SkipWaiting,
  /// The UI observed the network coming or going
  ConnectivityChanged(bool),
  /// Replay the outbound queue now
  Drain,
  /// Warm the cache now (still once per session)
  Warm,
  Shutdown,
}

/// Events announced by the background service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceEvent {
  Installed {
    version: String,
    primed: usize,
    failures: usize,
  },
  Activated {
    version: String,
    deleted: Vec<String>,
  },
  /// The active version now controls every UI context
  Claimed { version: String },
  Drained { delivered: usize, failed: usize },
  Warmed { pages: usize, failures: usize },
}

/// Subscriber side of the service's event channel
pub struct EventStream {
  rx: broadcast::Receiver<ServiceEvent>,
}

impl EventStream {
  pub fn new(rx: broadcast::Receiver<ServiceEvent>) -> Self {
    Self { rx }
  }

  /// Receive the next event. Events missed by a slow subscriber are
  /// skipped; `None` once the service is gone.
  pub async fn next(&mut self) -> Option<ServiceEvent> {
    loop {
      match self.rx.recv().await {
        Ok(event) => return Some(event),
        Err(broadcast::error::RecvError::Lagged(skipped)) => {
          tracing::debug!(skipped, "event subscriber lagged");
        }
        Err(broadcast::error::RecvError::Closed) => return None,
      }
    }
  }
}
