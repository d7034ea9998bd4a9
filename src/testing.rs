//! Scripted network double shared by the unit tests.

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

use crate::error::{OfflineError, Result};
use crate::net::{Fetch, Request, Response};

#[derive(Debug, Clone)]
pub enum Reply {
  Respond(Response),
  /// Transport failure
  Fail,
  /// Respond after a delay
  Delay(Duration, Response),
}

impl Reply {
  pub fn ok(body: &str) -> Self {
    Self::Respond(Response::new(200, body))
  }

  pub fn status(status: u16) -> Self {
    Self::Respond(Response::new(status, ""))
  }
}

/// Replays per-URL replies. The last reply for a URL repeats; unknown URLs
/// and a disconnected fetcher fail with a transport error.
#[derive(Default)]
pub struct ScriptedFetcher {
  replies: Mutex<HashMap<String, VecDeque<Reply>>>,
  calls: Mutex<Vec<Request>>,
  offline: AtomicBool,
}

fn normalize(url: &str) -> String {
  Url::parse(url).map(|u| u.to_string()).unwrap_or_else(|_| url.to_string())
}

impl ScriptedFetcher {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Queue `reply` for `url`.
  pub fn on(&self, url: &str, reply: Reply) -> &Self {
    self
      .replies
      .lock()
      .unwrap()
      .entry(normalize(url))
      .or_default()
      .push_back(reply);
    self
  }

  pub fn set_offline(&self, offline: bool) {
    self.offline.store(offline, Ordering::SeqCst);
  }

  pub fn calls(&self, url: &str) -> usize {
    let url = normalize(url);
    self
      .calls
      .lock()
      .unwrap()
      .iter()
      .filter(|r| r.url.as_str() == url)
      .count()
  }

  pub fn total_calls(&self) -> usize {
    self.calls.lock().unwrap().len()
  }

  pub fn requests(&self) -> Vec<Request> {
    self.calls.lock().unwrap().clone()
  }
}

#[async_trait]
impl Fetch for ScriptedFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    self.calls.lock().unwrap().push(request.clone());

    if self.offline.load(Ordering::SeqCst) {
      return Err(OfflineError::transport(request.url.as_str(), "offline"));
    }

    let reply = {
      let mut replies = self.replies.lock().unwrap();
      match replies.get_mut(request.url.as_str()) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
      }
    };

    match reply {
      Some(Reply::Respond(response)) => Ok(response),
      Some(Reply::Delay(delay, response)) => {
        tokio::time::sleep(delay).await;
        Ok(response)
      }
      Some(Reply::Fail) | None => Err(OfflineError::transport(
        request.url.as_str(),
        "connection refused",
      )),
    }
  }
}
