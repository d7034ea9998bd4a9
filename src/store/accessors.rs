//! Read/write helpers the portal's pages call directly.

use chrono::Utc;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{
  ApiCacheEntry, DatosEmpresa, Noticia, Partition, QueueItem, QueueStatus, Store, StoreKey,
  API_CACHE_FRESHNESS_MS, API_CACHE_MAX_AGE_MS,
};
use crate::error::Result;

/// What a collaborator hands over when a mutating call fails offline.
#[derive(Debug, Clone, Default)]
pub struct RequestDescriptor {
  pub url: String,
  pub method: String,
  pub body: Option<String>,
  pub headers: std::collections::BTreeMap<String, String>,
}

impl Store {
  pub fn cache_noticias(&self, noticias: &[Noticia]) -> Result<()> {
    for noticia in noticias {
      self.put(noticia)?;
    }
    info!(count = noticias.len(), "cached noticias");
    Ok(())
  }

  pub fn get_cached_noticias(&self) -> Result<Vec<Noticia>> {
    self.get_all()
  }

  pub fn get_cached_noticia(&self, id: i64) -> Result<Option<Noticia>> {
    self.get(id)
  }

  /// Store the organization profile under its fixed id.
  pub fn cache_datos_empresa(&self, fields: Map<String, Value>) -> Result<()> {
    self.put(&DatosEmpresa::new(fields))?;
    Ok(())
  }

  pub fn get_cached_datos_empresa(&self) -> Result<Option<DatosEmpresa>> {
    self.get(DatosEmpresa::FIXED_ID)
  }

  pub fn cache_api_response(&self, url: &str, data: Value) -> Result<()> {
    self.put(&ApiCacheEntry {
      url: url.to_string(),
      data,
      timestamp: Utc::now().timestamp_millis(),
    })?;
    debug!(url, "cached api response");
    Ok(())
  }

  /// Cached payload for `url` if younger than the freshness window. A stale
  /// record is deleted and reported as a miss.
  pub fn get_cached_response(&self, url: &str) -> Result<Option<Value>> {
    let Some(entry) = self.get::<ApiCacheEntry>(url)? else {
      return Ok(None);
    };

    let age = Utc::now().timestamp_millis() - entry.timestamp;
    if age < API_CACHE_FRESHNESS_MS {
      return Ok(Some(entry.data));
    }

    self.delete(Partition::ApiCache, &StoreKey::from(url))?;
    debug!(url, age_ms = age, "api cache entry expired");
    Ok(None)
  }

  /// Remove `apiCache` records older than the maximum age. Returns how many
  /// were deleted.
  pub fn clear_old_cache(&self) -> Result<usize> {
    let cutoff = Utc::now().timestamp_millis() - API_CACHE_MAX_AGE_MS;
    let mut deleted = 0;
    for entry in self.get_all::<ApiCacheEntry>()? {
      if entry.timestamp < cutoff {
        self.delete(Partition::ApiCache, &StoreKey::from(entry.url))?;
        deleted += 1;
      }
    }
    if deleted > 0 {
      info!(deleted, "removed old api cache entries");
    }
    Ok(deleted)
  }

  /// Persist a new pending queue item. Returns its id.
  pub fn add_to_sync_queue(&self, descriptor: &RequestDescriptor) -> Result<i64> {
    let item = QueueItem {
      id: None,
      url: descriptor.url.clone(),
      method: descriptor.method.to_ascii_uppercase(),
      body: descriptor.body.clone(),
      headers: descriptor
        .headers
        .iter()
        .map(|(name, value)| (name.to_ascii_lowercase(), value.clone()))
        .collect(),
      timestamp: Utc::now().timestamp_millis(),
      status: QueueStatus::Pending,
      retry_count: 0,
    };

    match self.put(&item)? {
      StoreKey::Int(id) => Ok(id),
      StoreKey::Text(other) => Err(crate::error::OfflineError::StoreIo(format!(
        "queue returned non-numeric id {}",
        other
      ))),
    }
  }

  pub fn pending_count(&self) -> Result<usize> {
    Ok(
      self
        .get_all::<QueueItem>()?
        .iter()
        .filter(|item| item.status == QueueStatus::Pending)
        .count(),
    )
  }
}
