//! Persistent structured store.
//!
//! A versioned SQLite database split into four partitions, each keyed the way
//! its records declare. Every operation touches exactly one partition in a
//! single statement; there is no cross-partition atomicity and concurrent
//! writers to the same key resolve last-write-wins.

mod accessors;
mod records;
mod schema;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, OptionalExtension};
use serde_json::Value;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::warn;

use crate::db;
use crate::error::{OfflineError, Result};

pub use accessors::RequestDescriptor;
pub use records::{ApiCacheEntry, DatosEmpresa, Noticia, QueueItem, QueueStatus, Record};
pub use schema::SCHEMA_VERSION;

/// Freshness window for `apiCache` reads.
pub const API_CACHE_FRESHNESS_MS: i64 = 24 * 60 * 60 * 1000;
/// Records older than this are removed by [`Store::clear_old_cache`].
pub const API_CACHE_MAX_AGE_MS: i64 = 7 * 24 * 60 * 60 * 1000;

/// The store's partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Partition {
  /// News items, keyed by numeric id
  Noticias,
  /// Organization profile, keyed by a fixed id
  DatosEmpresa,
  /// Pending outbound mutations, auto-increment id
  OfflineQueue,
  /// Raw API payloads, keyed by URL
  ApiCache,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyKind {
  Integer,
  Text,
  AutoIncrement,
}

impl Partition {
  pub fn name(&self) -> &'static str {
    match self {
      Self::Noticias => "noticias",
      Self::DatosEmpresa => "datosEmpresa",
      Self::OfflineQueue => "offlineQueue",
      Self::ApiCache => "apiCache",
    }
  }

  fn table(&self) -> &'static str {
    match self {
      Self::Noticias => "noticias",
      Self::DatosEmpresa => "datos_empresa",
      Self::OfflineQueue => "offline_queue",
      Self::ApiCache => "api_cache",
    }
  }

  /// Record field holding the primary key.
  pub fn key_path(&self) -> &'static str {
    match self {
      Self::ApiCache => "url",
      _ => "id",
    }
  }

  fn key_kind(&self) -> KeyKind {
    match self {
      Self::Noticias => KeyKind::Integer,
      Self::DatosEmpresa | Self::ApiCache => KeyKind::Text,
      Self::OfflineQueue => KeyKind::AutoIncrement,
    }
  }

  /// Record fields mirrored into indexed columns.
  fn indexed_fields(&self) -> &'static [&'static str] {
    match self {
      Self::Noticias => &["fecha"],
      Self::DatosEmpresa => &[],
      Self::OfflineQueue => &["timestamp", "status"],
      Self::ApiCache => &["timestamp"],
    }
  }
}

impl std::fmt::Display for Partition {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.name())
  }
}

/// A partition key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum StoreKey {
  Int(i64),
  Text(String),
}

impl From<i64> for StoreKey {
  fn from(v: i64) -> Self {
    Self::Int(v)
  }
}

impl From<&str> for StoreKey {
  fn from(v: &str) -> Self {
    Self::Text(v.to_string())
  }
}

impl From<String> for StoreKey {
  fn from(v: String) -> Self {
    Self::Text(v)
  }
}

impl StoreKey {
  fn to_sql(&self) -> SqlValue {
    match self {
      Self::Int(v) => SqlValue::Integer(*v),
      Self::Text(v) => SqlValue::Text(v.clone()),
    }
  }

  fn to_json(&self) -> Value {
    match self {
      Self::Int(v) => Value::from(*v),
      Self::Text(v) => Value::from(v.clone()),
    }
  }
}

/// Handle to the structured store.
pub struct Store {
  conn: Mutex<Connection>,
}

impl Store {
  /// Open the store at `path`, creating partitions and indexes on first run
  /// or after a version bump.
  pub fn open(path: &Path) -> Result<Self> {
    Self::from_connection(db::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(db::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    schema::migrate(&conn)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  /// Open the store and drop `apiCache` records past their maximum age.
  pub fn init_storage(path: &Path) -> Result<Self> {
    let store = Self::open(path)?;
    store.clear_old_cache()?;
    Ok(store)
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| OfflineError::StoreIo(format!("lock poisoned: {}", e)))
  }

  /// Upsert a raw JSON record. Returns the key it was stored under.
  pub fn put_value(&self, partition: Partition, record: &Value) -> Result<StoreKey> {
    let object = record.as_object().ok_or_else(|| {
      OfflineError::InvalidRequest(format!("{} records must be JSON objects", partition))
    })?;
    let key = extract_key(partition, object.get(partition.key_path()))?;

    let mut data = object.clone();
    data.remove(partition.key_path());
    let data = serde_json::to_string(&data)?;

    let mut columns: Vec<&str> = Vec::new();
    let mut values: Vec<SqlValue> = Vec::new();
    if let Some(key) = &key {
      columns.push(partition.key_path());
      values.push(key.to_sql());
    }
    for field in partition.indexed_fields() {
      columns.push(*field);
      values.push(json_to_sql(object.get(*field)));
    }
    columns.push("data");
    values.push(SqlValue::Text(data));

    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
      "INSERT OR REPLACE INTO {} ({}) VALUES ({})",
      partition.table(),
      columns.join(", "),
      placeholders
    );

    let conn = self.conn()?;
    conn.execute(&sql, params_from_iter(values))?;

    Ok(key.unwrap_or_else(|| StoreKey::Int(conn.last_insert_rowid())))
  }

  /// Fetch one raw record. A miss is `Ok(None)`.
  pub fn get_value(&self, partition: Partition, key: &StoreKey) -> Result<Option<Value>> {
    let sql = format!(
      "SELECT {key}, data FROM {table} WHERE {key} = ?",
      key = partition.key_path(),
      table = partition.table()
    );

    let conn = self.conn()?;
    let row: Option<(SqlValue, String)> = conn
      .query_row(&sql, [key.to_sql()], |row| Ok((row.get(0)?, row.get(1)?)))
      .optional()?;

    row
      .map(|(key, data)| decode_row(partition, key, &data))
      .transpose()
  }

  /// All raw records of a partition, in key order.
  pub fn get_all_values(&self, partition: Partition) -> Result<Vec<Value>> {
    let sql = format!(
      "SELECT {key}, data FROM {table} ORDER BY {key}",
      key = partition.key_path(),
      table = partition.table()
    );

    let conn = self.conn()?;
    let mut stmt = conn.prepare(&sql)?;
    let rows: Vec<(SqlValue, String)> = stmt
      .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
      .collect::<rusqlite::Result<_>>()?;

    rows
      .into_iter()
      .map(|(key, data)| decode_row(partition, key, &data))
      .collect()
  }

  pub fn delete(&self, partition: Partition, key: &StoreKey) -> Result<()> {
    let sql = format!(
      "DELETE FROM {} WHERE {} = ?",
      partition.table(),
      partition.key_path()
    );
    self.conn()?.execute(&sql, [key.to_sql()])?;
    Ok(())
  }

  pub fn clear(&self, partition: Partition) -> Result<()> {
    self
      .conn()?
      .execute(&format!("DELETE FROM {}", partition.table()), [])?;
    Ok(())
  }

  /// Upsert a typed record into its partition.
  pub fn put<R: Record>(&self, record: &R) -> Result<StoreKey> {
    self.put_value(R::PARTITION, &serde_json::to_value(record)?)
  }

  pub fn get<R: Record>(&self, key: impl Into<StoreKey>) -> Result<Option<R>> {
    self
      .get_value(R::PARTITION, &key.into())?
      .map(serde_json::from_value)
      .transpose()
      .map_err(Into::into)
  }

  /// All typed records of a partition. Rows that no longer decode are
  /// skipped.
  pub fn get_all<R: Record>(&self) -> Result<Vec<R>> {
    Ok(
      self
        .get_all_values(R::PARTITION)?
        .into_iter()
        .filter_map(|value| match serde_json::from_value(value) {
          Ok(record) => Some(record),
          Err(e) => {
            warn!(partition = %R::PARTITION, error = %e, "skipping undecodable record");
            None
          }
        })
        .collect(),
    )
  }

  /// Read a value from the `meta` table.
  pub fn meta_get(&self, key: &str) -> Result<Option<String>> {
    Ok(
      self
        .conn()?
        .query_row("SELECT value FROM meta WHERE key = ?", [key], |row| {
          row.get(0)
        })
        .optional()?,
    )
  }

  pub fn meta_set(&self, key: &str, value: &str) -> Result<()> {
    self.conn()?.execute(
      "INSERT OR REPLACE INTO meta (key, value) VALUES (?, ?)",
      [key, value],
    )?;
    Ok(())
  }
}

fn extract_key(partition: Partition, value: Option<&Value>) -> Result<Option<StoreKey>> {
  let missing = || {
    OfflineError::InvalidRequest(format!(
      "{} record is missing key '{}'",
      partition,
      partition.key_path()
    ))
  };

  match (partition.key_kind(), value) {
    (KeyKind::AutoIncrement, None | Some(Value::Null)) => Ok(None),
    (KeyKind::Integer | KeyKind::AutoIncrement, Some(Value::Number(n))) => {
      n.as_i64().map(|v| Some(StoreKey::Int(v))).ok_or_else(missing)
    }
    (KeyKind::Integer | KeyKind::AutoIncrement, Some(Value::String(s))) => s
      .trim()
      .parse::<i64>()
      .map(|v| Some(StoreKey::Int(v)))
      .map_err(|_| missing()),
    (KeyKind::Text, Some(Value::String(s))) => Ok(Some(StoreKey::Text(s.clone()))),
    (KeyKind::Text, Some(Value::Number(n))) => Ok(Some(StoreKey::Text(n.to_string()))),
    _ => Err(missing()),
  }
}

fn json_to_sql(value: Option<&Value>) -> SqlValue {
  match value {
    None | Some(Value::Null) => SqlValue::Null,
    Some(Value::Bool(b)) => SqlValue::Integer(i64::from(*b)),
    Some(Value::Number(n)) => n
      .as_i64()
      .map(SqlValue::Integer)
      .or_else(|| n.as_f64().map(SqlValue::Real))
      .unwrap_or(SqlValue::Null),
    Some(Value::String(s)) => SqlValue::Text(s.clone()),
    Some(other) => SqlValue::Text(other.to_string()),
  }
}

fn decode_row(partition: Partition, key: SqlValue, data: &str) -> Result<Value> {
  let mut value: Value = serde_json::from_str(data)?;
  let key = match key {
    SqlValue::Integer(v) => StoreKey::Int(v),
    SqlValue::Text(v) => StoreKey::Text(v),
    other => {
      return Err(OfflineError::StoreIo(format!(
        "unexpected key type {:?} in {}",
        other, partition
      )))
    }
  };
  if let Some(object) = value.as_object_mut() {
    object.insert(partition.key_path().to_string(), key.to_json());
  }
  Ok(value)
}
