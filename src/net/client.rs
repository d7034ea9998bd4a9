use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::time::Duration;

use super::types::{Request, Response};
use crate::error::{OfflineError, Result};

/// The network as seen by the offline layer.
///
/// Implementations return `Ok` for every HTTP answer, including non-2xx
/// statuses, and `Err(OfflineError::Transport)` only when no answer arrived.
#[async_trait]
pub trait Fetch: Send + Sync {
  async fn fetch(&self, request: &Request) -> Result<Response>;
}

/// `reqwest`-backed network client.
#[derive(Clone)]
pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new() -> Result<Self> {
    let client = reqwest::Client::builder()
      .connect_timeout(Duration::from_secs(10))
      .build()
      .map_err(|e| OfflineError::InvalidRequest(format!("failed to build HTTP client: {}", e)))?;

    Ok(Self { client })
  }
}

#[async_trait]
impl Fetch for HttpFetcher {
  async fn fetch(&self, request: &Request) -> Result<Response> {
    let method = reqwest::Method::from_bytes(request.method.as_bytes())
      .map_err(|e| OfflineError::InvalidRequest(format!("bad method {}: {}", request.method, e)))?;

    let mut headers = HeaderMap::new();
    for (name, value) in &request.headers {
      let name = HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| OfflineError::InvalidRequest(format!("bad header name {}: {}", name, e)))?;
      let value = HeaderValue::from_str(value)
        .map_err(|e| OfflineError::InvalidRequest(format!("bad header value: {}", e)))?;
      headers.insert(name, value);
    }

    let mut builder = self
      .client
      .request(method, request.url.clone())
      .headers(headers);
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| OfflineError::transport(request.url.as_str(), e))?;

    let status = response.status();
    let headers: BTreeMap<String, String> = response
      .headers()
      .iter()
      .filter_map(|(name, value)| {
        value
          .to_str()
          .ok()
          .map(|v| (name.as_str().to_string(), v.to_string()))
      })
      .collect();

    let body = response
      .bytes()
      .await
      .map_err(|e| OfflineError::transport(request.url.as_str(), e))?;

    Ok(Response {
      status: status.as_u16(),
      status_text: status.canonical_reason().unwrap_or_default().to_string(),
      headers,
      body: body.to_vec(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use wiremock::matchers::{body_string, header, method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_fetch_returns_non_2xx_as_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/api/puestos"))
      .respond_with(ResponseTemplate::new(404))
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new().unwrap();
    let request = Request::get(&format!("{}/api/puestos", server.uri())).unwrap();
    let response = fetcher.fetch(&request).await.unwrap();

    assert_eq!(response.status, 404);
    assert_eq!(response.status_text, "Not Found");
  }

  #[tokio::test]
  async fn test_fetch_sends_method_headers_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
      .and(path("/api/contacto"))
      .and(header("content-type", "application/json"))
      .and(body_string(r#"{"nombre":"Ana"}"#))
      .respond_with(ResponseTemplate::new(201).set_body_string("ok"))
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new().unwrap();
    let request = Request::new("post", &format!("{}/api/contacto", server.uri()))
      .unwrap()
      .with_header("content-type", "application/json")
      .with_body(r#"{"nombre":"Ana"}"#);
    let response = fetcher.fetch(&request).await.unwrap();

    assert_eq!(response.status, 201);
    assert_eq!(response.text(), "ok");
  }

  #[tokio::test]
  async fn test_unreachable_host_is_transport_error() {
    let fetcher = HttpFetcher::new().unwrap();
    let request = Request::get("http://127.0.0.1:9/unreachable").unwrap();
    let err = fetcher.fetch(&request).await.unwrap_err();
    assert!(err.is_transport());
  }
}
