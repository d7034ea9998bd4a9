//! Partition storage trait and SQLite implementation.

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::traits::CachedResponse;
use crate::db;
use crate::error::{OfflineError, Result};
use crate::net::Response;

/// Trait for response-partition backends.
pub trait CacheStorage: Send + Sync {
  /// Make sure a partition exists (empty if new).
  fn open_partition(&self, partition: &str) -> Result<()>;

  /// Names of every existing partition.
  fn partition_names(&self) -> Result<Vec<String>>;

  /// Drop a partition and all its entries. Returns whether it existed.
  fn delete_partition(&self, partition: &str) -> Result<bool>;

  /// Exact-URL lookup within one partition.
  fn lookup(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>>;

  /// Exact-URL lookup across every partition, newest entry first.
  fn lookup_any(&self, url: &str) -> Result<Option<CachedResponse>>;

  /// Write (or overwrite) an entry, creating the partition if needed.
  fn store(
    &self,
    partition: &str,
    url: &str,
    response: &Response,
    stored_at: DateTime<Utc>,
  ) -> Result<()>;

  fn remove(&self, partition: &str, url: &str) -> Result<()>;

  /// Keep only the newest `max_entries` entries. Returns how many were evicted.
  fn evict_overflow(&self, partition: &str, max_entries: usize) -> Result<usize>;

  /// Remove entries stored before `cutoff`. Returns how many were removed.
  fn evict_older_than(&self, partition: &str, cutoff: DateTime<Utc>) -> Result<usize>;

  fn len(&self, partition: &str) -> Result<usize>;
}

/// SQLite-based partition storage.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

/// Schema for response partitions.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_partitions (
    name TEXT PRIMARY KEY,
    created_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS cached_responses (
    partition TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    status_text TEXT NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    stored_at INTEGER NOT NULL,
    PRIMARY KEY (partition, url)
);

CREATE INDEX IF NOT EXISTS idx_cached_responses_stored
    ON cached_responses(partition, stored_at);

CREATE INDEX IF NOT EXISTS idx_cached_responses_url ON cached_responses(url);
"#;

impl SqliteStorage {
  pub fn open(path: &Path) -> Result<Self> {
    Self::from_connection(db::open(path)?)
  }

  pub fn open_in_memory() -> Result<Self> {
    Self::from_connection(db::open_in_memory()?)
  }

  fn from_connection(conn: Connection) -> Result<Self> {
    conn.execute_batch(CACHE_SCHEMA)?;
    Ok(Self {
      conn: Mutex::new(conn),
    })
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| OfflineError::StoreIo(format!("lock poisoned: {}", e)))
  }
}

type Row = (u16, String, String, Vec<u8>, i64);

fn read_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Row> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
  ))
}

fn into_cached((status, status_text, headers, body, stored_at): Row) -> Result<CachedResponse> {
  let headers: BTreeMap<String, String> = serde_json::from_str(&headers)?;
  Ok(CachedResponse {
    response: Response {
      status,
      status_text,
      headers,
      body,
    },
    stored_at: from_millis(stored_at)?,
  })
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
  Utc
    .timestamp_millis_opt(ms)
    .single()
    .ok_or_else(|| OfflineError::StoreIo(format!("invalid stored_at {}", ms)))
}

impl CacheStorage for SqliteStorage {
  fn open_partition(&self, partition: &str) -> Result<()> {
    self.conn()?.execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![partition, Utc::now().timestamp_millis()],
    )?;
    Ok(())
  }

  fn partition_names(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn.prepare("SELECT name FROM cache_partitions ORDER BY created_at, name")?;
    let names = stmt
      .query_map([], |row| row.get(0))?
      .collect::<rusqlite::Result<Vec<String>>>()?;
    Ok(names)
  }

  fn delete_partition(&self, partition: &str) -> Result<bool> {
    let conn = self.conn()?;
    conn.execute(
      "DELETE FROM cached_responses WHERE partition = ?",
      params![partition],
    )?;
    let deleted = conn.execute(
      "DELETE FROM cache_partitions WHERE name = ?",
      params![partition],
    )?;
    Ok(deleted > 0)
  }

  fn lookup(&self, partition: &str, url: &str) -> Result<Option<CachedResponse>> {
    let row = self
      .conn()?
      .query_row(
        "SELECT status, status_text, headers, body, stored_at FROM cached_responses
         WHERE partition = ? AND url = ?",
        params![partition, url],
        read_row,
      )
      .optional()?;

    row.map(into_cached).transpose()
  }

  fn lookup_any(&self, url: &str) -> Result<Option<CachedResponse>> {
    let row = self
      .conn()?
      .query_row(
        "SELECT status, status_text, headers, body, stored_at FROM cached_responses
         WHERE url = ? ORDER BY stored_at DESC LIMIT 1",
        params![url],
        read_row,
      )
      .optional()?;

    row.map(into_cached).transpose()
  }

  fn store(
    &self,
    partition: &str,
    url: &str,
    response: &Response,
    stored_at: DateTime<Utc>,
  ) -> Result<()> {
    let headers = serde_json::to_string(&response.headers)?;
    let conn = self.conn()?;
    let stored_at = stored_at.timestamp_millis();

    conn.execute(
      "INSERT OR IGNORE INTO cache_partitions (name, created_at) VALUES (?, ?)",
      params![partition, stored_at],
    )?;
    conn.execute(
      "INSERT OR REPLACE INTO cached_responses
         (partition, url, status, status_text, headers, body, stored_at)
       VALUES (?, ?, ?, ?, ?, ?, ?)",
      params![
        partition,
        url,
        response.status,
        response.status_text,
        headers,
        response.body,
        stored_at
      ],
    )?;
    Ok(())
  }

  fn remove(&self, partition: &str, url: &str) -> Result<()> {
    self.conn()?.execute(
      "DELETE FROM cached_responses WHERE partition = ? AND url = ?",
      params![partition, url],
    )?;
    Ok(())
  }

  fn evict_overflow(&self, partition: &str, max_entries: usize) -> Result<usize> {
    // REPLACE re-inserts, so rowid also orders writes within one millisecond
    let evicted = self.conn()?.execute(
      "DELETE FROM cached_responses
       WHERE partition = ?1 AND rowid NOT IN (
         SELECT rowid FROM cached_responses WHERE partition = ?1
         ORDER BY stored_at DESC, rowid DESC LIMIT ?2
       )",
      params![partition, max_entries as i64],
    )?;
    Ok(evicted)
  }

  fn evict_older_than(&self, partition: &str, cutoff: DateTime<Utc>) -> Result<usize> {
    let evicted = self.conn()?.execute(
      "DELETE FROM cached_responses WHERE partition = ? AND stored_at < ?",
      params![partition, cutoff.timestamp_millis()],
    )?;
    Ok(evicted)
  }

  fn len(&self, partition: &str) -> Result<usize> {
    let count: i64 = self.conn()?.query_row(
      "SELECT COUNT(*) FROM cached_responses WHERE partition = ?",
      params![partition],
      |row| row.get(0),
    )?;
    Ok(count as usize)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::Duration;

  #[test]
  fn test_store_and_lookup() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let response = Response::new(200, "body").with_header("content-type", "text/html");
    storage
      .store("pages", "https://sututeh.com/", &response, Utc::now())
      .unwrap();

    let cached = storage
      .lookup("pages", "https://sututeh.com/")
      .unwrap()
      .unwrap();
    assert_eq!(cached.response, response);
    assert!(storage.lookup("fonts", "https://sututeh.com/").unwrap().is_none());
  }

  #[test]
  fn test_lookup_any_searches_all_partitions() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage
      .store("fonts", "https://x/a.woff2", &Response::new(200, "f"), Utc::now())
      .unwrap();
    let cached = storage.lookup_any("https://x/a.woff2").unwrap().unwrap();
    assert_eq!(cached.response.text(), "f");
  }

  #[test]
  fn test_partition_names_and_delete() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    storage.open_partition("sututeh-pages-v1").unwrap();
    storage
      .store("old-cache-v0", "https://x/", &Response::new(200, ""), Utc::now())
      .unwrap();

    let mut names = storage.partition_names().unwrap();
    names.sort();
    assert_eq!(names, vec!["old-cache-v0", "sututeh-pages-v1"]);

    assert!(storage.delete_partition("old-cache-v0").unwrap());
    assert!(!storage.delete_partition("old-cache-v0").unwrap());
    assert!(storage.lookup_any("https://x/").unwrap().is_none());
  }

  #[test]
  fn test_evict_overflow_removes_oldest() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let base = Utc::now();
    for i in 0..4 {
      storage
        .store(
          "images-local",
          &format!("https://x/{}.png", i),
          &Response::new(200, ""),
          base + Duration::seconds(i),
        )
        .unwrap();
    }

    assert_eq!(storage.evict_overflow("images-local", 3).unwrap(), 1);
    assert_eq!(storage.len("images-local").unwrap(), 3);
    assert!(storage
      .lookup("images-local", "https://x/0.png")
      .unwrap()
      .is_none());
  }

  #[test]
  fn test_evict_older_than() {
    let storage = SqliteStorage::open_in_memory().unwrap();
    let now = Utc::now();
    storage
      .store("fonts", "https://x/old", &Response::new(200, ""), now - Duration::days(400))
      .unwrap();
    storage
      .store("fonts", "https://x/new", &Response::new(200, ""), now)
      .unwrap();

    assert_eq!(
      storage
        .evict_older_than("fonts", now - Duration::days(365))
        .unwrap(),
      1
    );
    assert!(storage.lookup("fonts", "https://x/new").unwrap().is_some());
  }
}
