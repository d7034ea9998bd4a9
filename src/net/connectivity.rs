use tokio::sync::watch;

/// Shared online/offline flag.
///
/// The UI context (or a probe) reports changes with [`Connectivity::set_online`];
/// the warmer reads the current value and the sync engine subscribes to
/// transitions.
#[derive(Debug, Clone)]
pub struct Connectivity {
  tx: watch::Sender<bool>,
}

impl Connectivity {
  pub fn new(online: bool) -> Self {
    let (tx, _rx) = watch::channel(online);
    Self { tx }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  /// Update the flag. Subscribers are only woken on an actual change.
  pub fn set_online(&self, online: bool) {
    self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }
}

impl Default for Connectivity {
  fn default() -> Self {
    Self::new(true)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn test_subscribers_see_transitions() {
    let connectivity = Connectivity::new(false);
    let mut rx = connectivity.subscribe();

    connectivity.set_online(true);
    rx.changed().await.unwrap();
    assert!(*rx.borrow_and_update());
    assert!(connectivity.is_online());
  }

  #[test]
  fn test_same_value_does_not_notify() {
    let connectivity = Connectivity::new(true);
    let rx = connectivity.subscribe();
    connectivity.set_online(true);
    assert!(!rx.has_changed().unwrap());
  }
}
