//! Session cache warming.
//!
//! Shortly after startup the warmer walks the public pages through the
//! router (priming the page partition) and copies the public API payloads
//! into the structured store, so the portal can render them offline.

use futures::future::join_all;
use serde::Deserialize;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheSource, CacheStorage};
use crate::error::{OfflineError, Result};
use crate::net::{Connectivity, Request};
use crate::router::Router;
use crate::store::{Noticia, Store};

/// Pages fetched to prime the page partition.
pub const PUBLIC_PAGES: &[&str] = &["/", "/quienes-somos", "/noticias", "/contacto"];

const NOTICIAS_PATH: &str = "/api/noticias/publicados";
const EMPRESA_PATH: &str = "/api/datos-empresa";
const NOSOTROS_PATH: &str = "/api/nosotros/vigentes";
const PUESTOS_PATH: &str = "/api/puestos";

/// Why a trigger did nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarmSkip {
  AlreadyWarm,
  Offline,
}

/// Outcome of one warming pass. Individual failures never abort the pass.
#[derive(Debug, Default)]
pub struct WarmReport {
  pub pages_primed: usize,
  pub noticias: usize,
  /// Data sources stored successfully
  pub sources: Vec<&'static str>,
  pub failures: Vec<(String, OfflineError)>,
}

impl WarmReport {
  pub fn is_complete(&self) -> bool {
    self.failures.is_empty()
  }
}

/// News item as the backend sends it.
#[derive(Debug, Deserialize)]
struct PublishedNoticia {
  id: i64,
  #[serde(default)]
  titulo: Option<String>,
  #[serde(default)]
  descripcion: Option<String>,
  #[serde(default)]
  fecha_publicacion: Option<String>,
  /// JSON-encoded list of image paths
  #[serde(default)]
  imagenes: Option<Value>,
}

impl TryFrom<PublishedNoticia> for Noticia {
  type Error = OfflineError;

  fn try_from(raw: PublishedNoticia) -> Result<Self> {
    let imagenes = match raw.imagenes {
      None | Some(Value::Null) => Vec::new(),
      Some(Value::String(encoded)) if encoded.is_empty() => Vec::new(),
      Some(Value::String(encoded)) => serde_json::from_str(&encoded)?,
      Some(Value::Array(list)) => list,
      Some(other) => {
        return Err(OfflineError::InvalidRequest(format!(
          "noticia {} has unexpected imagenes {}",
          raw.id, other
        )))
      }
    };
    Ok(Self {
      id: raw.id,
      titulo: raw.titulo.unwrap_or_default(),
      descripcion: raw.descripcion.unwrap_or_default(),
      fecha: raw.fecha_publicacion,
      imagenes,
    })
  }
}

/// Normalize the published-news payload into store records.
pub fn normalize_noticias(payload: Value) -> Result<Vec<Noticia>> {
  let raw: Vec<PublishedNoticia> = serde_json::from_value(payload)?;
  raw.into_iter().map(Noticia::try_from).collect()
}

pub struct CacheWarmer<S: CacheStorage> {
  router: Arc<Router<S>>,
  store: Arc<Store>,
  connectivity: Connectivity,
  site_url: Url,
  api_url: String,
  warmed: Arc<AtomicBool>,
  in_progress: Arc<AtomicBool>,
}

impl<S: CacheStorage> Clone for CacheWarmer<S> {
  fn clone(&self) -> Self {
    Self {
      router: Arc::clone(&self.router),
      store: Arc::clone(&self.store),
      connectivity: self.connectivity.clone(),
      site_url: self.site_url.clone(),
      api_url: self.api_url.clone(),
      warmed: Arc::clone(&self.warmed),
      in_progress: Arc::clone(&self.in_progress),
    }
  }
}

impl<S: CacheStorage + 'static> CacheWarmer<S> {
  pub fn new(
    router: Arc<Router<S>>,
    store: Arc<Store>,
    connectivity: Connectivity,
    site_url: Url,
    api_url: &str,
  ) -> Self {
    Self {
      router,
      store,
      connectivity,
      site_url,
      api_url: api_url.trim_end_matches('/').to_string(),
      warmed: Arc::new(AtomicBool::new(false)),
      in_progress: Arc::new(AtomicBool::new(false)),
    }
  }

  pub fn is_warm(&self) -> bool {
    self.warmed.load(Ordering::SeqCst)
  }

  /// Run once after `delay`, leaving first paint alone.
  pub fn schedule(&self, delay: Duration) -> JoinHandle<std::result::Result<WarmReport, WarmSkip>> {
    let warmer = self.clone();
    tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      warmer.run().await
    })
  }

  /// Warm now unless this session already did or the network is down.
  /// A call made while another pass is running is skipped as already warm.
  pub async fn run(&self) -> std::result::Result<WarmReport, WarmSkip> {
    if self.is_warm() {
      debug!("cache already warm this session");
      return Err(WarmSkip::AlreadyWarm);
    }
    if !self.connectivity.is_online() {
      info!("offline, not warming cache");
      return Err(WarmSkip::Offline);
    }
    if self
      .in_progress
      .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
      .is_err()
    {
      debug!("cache warm already running");
      return Err(WarmSkip::AlreadyWarm);
    }

    let report = self.warm().await;
    self.in_progress.store(false, Ordering::SeqCst);
    Ok(report)
  }

  async fn warm(&self) -> WarmReport {
    info!("warming public routes");
    let mut report = WarmReport::default();

    self.prime_pages(&mut report).await;

    match self.warm_noticias().await {
      Ok(count) => {
        report.noticias = count;
        report.sources.push(NOTICIAS_PATH);
      }
      Err(e) => self.record(&mut report, NOTICIAS_PATH, e),
    }
    match self.warm_empresa().await {
      Ok(()) => report.sources.push(EMPRESA_PATH),
      Err(e) => self.record(&mut report, EMPRESA_PATH, e),
    }
    for path in [NOSOTROS_PATH, PUESTOS_PATH] {
      match self.warm_raw(path).await {
        Ok(()) => report.sources.push(path),
        Err(e) => self.record(&mut report, path, e),
      }
    }

    self.warmed.store(true, Ordering::SeqCst);
    info!(
      pages = report.pages_primed,
      sources = report.sources.len(),
      failures = report.failures.len(),
      "cache warm finished"
    );
    report
  }

  async fn prime_pages(&self, report: &mut WarmReport) {
    let loads = PUBLIC_PAGES.iter().map(|path| self.prime_page(path));
    for (path, outcome) in PUBLIC_PAGES.iter().zip(join_all(loads).await) {
      match outcome {
        Ok(()) => {
          debug!(path, "page primed");
          report.pages_primed += 1;
        }
        Err(e) => self.record(report, path, e),
      }
    }
  }

  async fn prime_page(&self, path: &str) -> Result<()> {
    let url = self
      .site_url
      .join(path)
      .map_err(|e| OfflineError::InvalidRequest(format!("{}: {}", path, e)))?;
    let result = self.router.intercept(&Request::navigation(url.as_str())?).await?;
    match (result.source, result.failure) {
      (CacheSource::Network, _) => Ok(()),
      (_, Some(failure)) => Err(failure),
      (source, None) => Err(OfflineError::transport(
        url.as_str(),
        format!("served from {:?}", source),
      )),
    }
  }

  async fn warm_noticias(&self) -> Result<usize> {
    let (_, payload) = self.fetch_json(NOTICIAS_PATH).await?;
    let noticias = normalize_noticias(payload)?;
    self.store.cache_noticias(&noticias)?;
    Ok(noticias.len())
  }

  async fn warm_empresa(&self) -> Result<()> {
    let (url, payload) = self.fetch_json(EMPRESA_PATH).await?;
    let Some(first) = payload.as_array().and_then(|list| list.first()) else {
      debug!("datos-empresa payload empty");
      return Ok(());
    };
    let fields = first.as_object().cloned().ok_or_else(|| {
      OfflineError::InvalidRequest("datos-empresa entry is not an object".to_string())
    })?;
    self.store.cache_datos_empresa(fields)?;
    self.store.cache_api_response(&url, payload)
  }

  async fn warm_raw(&self, path: &str) -> Result<()> {
    let (url, payload) = self.fetch_json(path).await?;
    self.store.cache_api_response(&url, payload)
  }

  async fn fetch_json(&self, path: &str) -> Result<(String, Value)> {
    let url = format!("{}{}", self.api_url, path);
    let result = self.router.intercept(&Request::get(&url)?).await?;
    if !result.response.is_success() {
      return Err(result.failure.unwrap_or(OfflineError::HttpApplication {
        url,
        status: result.response.status,
      }));
    }
    let payload = result.response.json()?;
    Ok((url, payload))
  }

  fn record(&self, report: &mut WarmReport, what: &str, error: OfflineError) {
    warn!(what, error = %error, "warm step failed");
    report.failures.push((what.to_string(), error));
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{CacheLayer, SqliteStorage};
  use crate::testing::{Reply, ScriptedFetcher};
  use serde_json::json;

  const SITE: &str = "https://sututeh.com/";
  const API: &str = "https://api.sututeh.com";

  fn warmer(fetcher: Arc<ScriptedFetcher>, online: bool) -> CacheWarmer<SqliteStorage> {
    let site = Url::parse(SITE).unwrap();
    let router = Router::portal(
      CacheLayer::new(SqliteStorage::open_in_memory().unwrap()),
      fetcher,
      &site,
      &["sututeh".to_string()],
      Duration::from_millis(200),
    )
    .unwrap();
    CacheWarmer::new(
      Arc::new(router),
      Arc::new(Store::open_in_memory().unwrap()),
      Connectivity::new(online),
      site,
      &format!("{}/", API),
    )
  }

  fn script_backend(fetcher: &ScriptedFetcher) {
    for page in PUBLIC_PAGES {
      fetcher.on(&format!("https://sututeh.com{}", page), Reply::ok("<html>"));
    }
    let noticias = json!([{
      "id": 7,
      "titulo": "Asamblea",
      "descripcion": "Convocatoria",
      "fecha_publicacion": "2024-03-01",
      "imagenes": "[\"/uploads/public/a.jpg\"]"
    }]);
    fetcher.on(&format!("{}{}", API, NOTICIAS_PATH), Reply::ok(&noticias.to_string()));
    fetcher.on(
      &format!("{}{}", API, EMPRESA_PATH),
      Reply::ok(r#"[{"id": 3, "nombre_empresa": "Sindicato X"}]"#),
    );
    fetcher.on(&format!("{}{}", API, NOSOTROS_PATH), Reply::ok("[]"));
    fetcher.on(&format!("{}{}", API, PUESTOS_PATH), Reply::ok(r#"[{"id":1}]"#));
  }

  #[test]
  fn test_normalize_noticias() {
    let noticias = normalize_noticias(json!([
      {"id": 1, "titulo": "A", "descripcion": "d", "fecha_publicacion": "2024-01-02",
       "imagenes": "[\"x.jpg\"]"},
      {"id": 2, "titulo": "B", "descripcion": "e", "imagenes": null}
    ]))
    .unwrap();

    assert_eq!(noticias[0].fecha.as_deref(), Some("2024-01-02"));
    assert_eq!(noticias[0].imagenes, vec![json!("x.jpg")]);
    assert!(noticias[1].imagenes.is_empty());
    assert!(noticias[1].fecha.is_none());
  }

  #[test]
  fn test_normalize_rejects_garbled_images() {
    assert!(normalize_noticias(json!([{"id": 1, "imagenes": "[not json"}])).is_err());
  }

  #[tokio::test]
  async fn test_warm_round_trips_into_store() {
    let fetcher = ScriptedFetcher::new();
    script_backend(&fetcher);
    let warmer = warmer(fetcher, true);

    let report = warmer.run().await.unwrap();
    assert!(report.is_complete(), "{:?}", report.failures);
    assert_eq!(report.pages_primed, PUBLIC_PAGES.len());
    assert!(warmer.is_warm());

    let noticia = warmer.store.get_cached_noticia(7).unwrap().unwrap();
    assert_eq!(
      noticia,
      Noticia {
        id: 7,
        titulo: "Asamblea".to_string(),
        descripcion: "Convocatoria".to_string(),
        fecha: Some("2024-03-01".to_string()),
        imagenes: vec![json!("/uploads/public/a.jpg")],
      }
    );

    let empresa = warmer.store.get_cached_datos_empresa().unwrap().unwrap();
    assert_eq!(empresa.id, "empresa");
    assert_eq!(empresa.field("nombre_empresa"), Some(&json!("Sindicato X")));
    assert_eq!(
      warmer
        .store
        .get_cached_response(&format!("{}{}", API, PUESTOS_PATH))
        .unwrap(),
      Some(json!([{"id": 1}]))
    );
  }

  #[tokio::test]
  async fn test_partial_failure_still_sets_flag() {
    let fetcher = ScriptedFetcher::new();
    fetcher.on(&format!("{}{}", API, EMPRESA_PATH), Reply::ok("[]"));
    let warmer = warmer(fetcher, true);

    let report = warmer.run().await.unwrap();
    assert!(warmer.is_warm());
    assert!(!report.is_complete());
    assert_eq!(report.pages_primed, 0);
    assert!(report.sources.contains(&EMPRESA_PATH));
    assert!(report.failures.iter().any(|(what, _)| what == NOTICIAS_PATH));
    assert_eq!(warmer.run().await.unwrap_err(), WarmSkip::AlreadyWarm);
  }

  #[tokio::test]
  async fn test_overlapping_triggers_warm_once() {
    let fetcher = ScriptedFetcher::new();
    script_backend(&fetcher);
    let warmer = warmer(fetcher.clone(), true);

    let (first, second) = tokio::join!(warmer.run(), warmer.run());
    assert!(first.is_ok());
    assert_eq!(second.unwrap_err(), WarmSkip::AlreadyWarm);
    assert_eq!(fetcher.calls(&format!("{}{}", API, PUESTOS_PATH)), 1);
    assert!(warmer.is_warm());
  }

  #[tokio::test]
  async fn test_offline_trigger_does_nothing() {
    let fetcher = ScriptedFetcher::new();
    let warmer = warmer(fetcher.clone(), false);

    let handle = warmer.schedule(Duration::from_millis(10));
    assert_eq!(handle.await.unwrap().unwrap_err(), WarmSkip::Offline);
    assert_eq!(fetcher.total_calls(), 0);
    assert!(!warmer.is_warm());
  }
}
