//! Request and response snapshots exchanged between the router, the
//! strategies and the network.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

use crate::error::{OfflineError, Result};

/// What the requesting context intends to do with the response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Destination {
  Document,
  Script,
  Style,
  Image,
  Font,
  /// Programmatic data calls (`fetch`/XHR)
  #[default]
  Fetch,
}

impl std::str::FromStr for Destination {
  type Err = OfflineError;

  fn from_str(s: &str) -> Result<Self> {
    match s.to_ascii_lowercase().as_str() {
      "document" => Ok(Self::Document),
      "script" => Ok(Self::Script),
      "style" => Ok(Self::Style),
      "image" => Ok(Self::Image),
      "font" => Ok(Self::Font),
      "fetch" | "" => Ok(Self::Fetch),
      other => Err(OfflineError::InvalidRequest(format!(
        "unknown destination '{}'",
        other
      ))),
    }
  }
}

/// An outgoing request as seen by the interceptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
  pub method: String,
  pub url: Url,
  pub destination: Destination,
  /// Top-level page load
  pub navigate: bool,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Vec<u8>>,
}

impl Request {
  pub fn get(url: &str) -> Result<Self> {
    Self::new("GET", url)
  }

  pub fn new(method: &str, url: &str) -> Result<Self> {
    let url = Url::parse(url)
      .map_err(|e| OfflineError::InvalidRequest(format!("bad url '{}': {}", url, e)))?;
    Ok(Self {
      method: method.to_ascii_uppercase(),
      url,
      destination: Destination::Fetch,
      navigate: false,
      headers: BTreeMap::new(),
      body: None,
    })
  }

  /// A top-level document load.
  pub fn navigation(url: &str) -> Result<Self> {
    let mut request = Self::get(url)?;
    request.destination = Destination::Document;
    request.navigate = true;
    Ok(request)
  }

  pub fn with_destination(mut self, destination: Destination) -> Self {
    self.destination = destination;
    self
  }

  /// Set a header. Names are stored lowercased, so a later call with a
  /// different casing replaces the earlier value.
  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  pub fn with_body(mut self, body: impl Into<Vec<u8>>) -> Self {
    self.body = Some(body.into());
    self
  }

  pub fn path(&self) -> &str {
    self.url.path()
  }

  /// Cache key: the full URL without fragment.
  pub fn cache_key(&self) -> String {
    let mut url = self.url.clone();
    url.set_fragment(None);
    url.to_string()
  }
}

/// A response snapshot. Bodies are buffered so they can be cached and
/// replayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
  pub status: u16,
  pub status_text: String,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  #[serde(default)]
  pub body: Vec<u8>,
}

impl Response {
  pub fn new(status: u16, body: impl Into<Vec<u8>>) -> Self {
    Self {
      status,
      status_text: String::new(),
      headers: BTreeMap::new(),
      body: body.into(),
    }
  }

  pub fn with_status_text(mut self, text: &str) -> Self {
    self.status_text = text.to_string();
    self
  }

  pub fn with_header(mut self, name: &str, value: &str) -> Self {
    self.headers.insert(name.to_ascii_lowercase(), value.to_string());
    self
  }

  /// Terminal answer once every fallback is exhausted.
  pub fn unavailable() -> Self {
    Self::new(503, "Offline - Sin contenido cacheado").with_status_text("Service Unavailable")
  }

  /// Empty stand-in for images that could not be loaded.
  pub fn placeholder() -> Self {
    Self::new(200, Vec::new()).with_status_text("Offline")
  }

  /// 2xx
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }

  pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
    Ok(serde_json::from_slice(&self.body)?)
  }
}
