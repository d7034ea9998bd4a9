//! Typed records for each store partition.

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::Partition;

/// A record that lives in one store partition.
///
/// The partition's key field (`Partition::key_path`) must serialize under
/// that name; the store reads it to upsert.
pub trait Record: Serialize + DeserializeOwned {
  const PARTITION: Partition;
}

/// Normalized news item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Noticia {
  pub id: i64,
  #[serde(default)]
  pub titulo: String,
  #[serde(default)]
  pub descripcion: String,
  /// Publication date as sent by the backend
  #[serde(default)]
  pub fecha: Option<String>,
  #[serde(default)]
  pub imagenes: Vec<Value>,
}

impl Record for Noticia {
  const PARTITION: Partition = Partition::Noticias;
}

/// Organization profile. Stored under a fixed id; the remaining fields are
/// kept exactly as the backend sent them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatosEmpresa {
  pub id: String,
  #[serde(flatten)]
  pub fields: Map<String, Value>,
}

impl DatosEmpresa {
  pub const FIXED_ID: &'static str = "empresa";

  pub fn new(fields: Map<String, Value>) -> Self {
    let mut fields = fields;
    fields.remove("id");
    Self {
      id: Self::FIXED_ID.to_string(),
      fields,
    }
  }

  pub fn field(&self, name: &str) -> Option<&Value> {
    self.fields.get(name)
  }
}

impl Record for DatosEmpresa {
  const PARTITION: Partition = Partition::DatosEmpresa;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
  #[default]
  Pending,
}

/// A mutation waiting to be replayed against the network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub id: Option<i64>,
  pub url: String,
  pub method: String,
  #[serde(default)]
  pub body: Option<String>,
  #[serde(default)]
  pub headers: BTreeMap<String, String>,
  /// Enqueue time, milliseconds since the epoch
  pub timestamp: i64,
  #[serde(default)]
  pub status: QueueStatus,
  #[serde(default, rename = "retries")]
  pub retry_count: u32,
}

impl Record for QueueItem {
  const PARTITION: Partition = Partition::OfflineQueue;
}

/// Raw API payload plus the time it was stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiCacheEntry {
  pub url: String,
  pub data: Value,
  /// Milliseconds since the epoch
  pub timestamp: i64,
}

impl Record for ApiCacheEntry {
  const PARTITION: Partition = Partition::ApiCache;
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_datos_empresa_flattens_fields() {
    let record = DatosEmpresa {
      id: "empresa".to_string(),
      fields: json!({"nombre_empresa": "Sindicato X"})
        .as_object()
        .unwrap()
        .clone(),
    };
    assert_eq!(
      serde_json::to_value(&record).unwrap(),
      json!({"id": "empresa", "nombre_empresa": "Sindicato X"})
    );
  }

  #[test]
  fn test_datos_empresa_new_forces_fixed_id() {
    let fields = json!({"id": 12, "mision": "m"}).as_object().unwrap().clone();
    let record = DatosEmpresa::new(fields);
    assert_eq!(record.id, "empresa");
    assert!(record.field("id").is_none());
    assert_eq!(record.field("mision"), Some(&json!("m")));
  }

  #[test]
  fn test_queue_item_serializes_retries_and_status() {
    let item = QueueItem {
      id: None,
      url: "/api/contacto".to_string(),
      method: "POST".to_string(),
      body: None,
      headers: BTreeMap::new(),
      timestamp: 1,
      status: QueueStatus::Pending,
      retry_count: 2,
    };
    let value = serde_json::to_value(&item).unwrap();
    assert_eq!(value["retries"], json!(2));
    assert_eq!(value["status"], json!("pending"));
    assert!(value.get("id").is_none());
  }
}
