//! Versioned schema for the structured store.
//!
//! Migrations are additive only. `PRAGMA user_version` records how many have
//! been applied; opening a database written by a newer build is refused.

use rusqlite::Connection;
use tracing::info;

use crate::error::{OfflineError, Result};

/// Partition tables and their secondary indexes.
const V1_PARTITIONS: &str = r#"
CREATE TABLE IF NOT EXISTS noticias (
    id INTEGER PRIMARY KEY,
    fecha TEXT,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_noticias_fecha ON noticias(fecha);

CREATE TABLE IF NOT EXISTS datos_empresa (
    id TEXT PRIMARY KEY,
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS offline_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    timestamp INTEGER,
    status TEXT,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_offline_queue_timestamp ON offline_queue(timestamp);
CREATE INDEX IF NOT EXISTS idx_offline_queue_status ON offline_queue(status);

CREATE TABLE IF NOT EXISTS api_cache (
    url TEXT PRIMARY KEY,
    timestamp INTEGER,
    data TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_api_cache_timestamp ON api_cache(timestamp);
"#;

/// Key/value facts about the installation (deployed version, ...).
const V2_META: &str = r#"
CREATE TABLE IF NOT EXISTS meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

const MIGRATIONS: &[&str] = &[V1_PARTITIONS, V2_META];

pub const SCHEMA_VERSION: i64 = MIGRATIONS.len() as i64;

/// Bring `conn` up to [`SCHEMA_VERSION`]. Safe to call on every open.
pub fn migrate(conn: &Connection) -> Result<()> {
  let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

  if found > SCHEMA_VERSION {
    return Err(OfflineError::SchemaMigrationConflict {
      found,
      supported: SCHEMA_VERSION,
    });
  }

  for (index, migration) in MIGRATIONS.iter().enumerate().skip(found as usize) {
    let version = index as i64 + 1;
    conn.execute_batch(&format!(
      "BEGIN;\n{}\nPRAGMA user_version = {};\nCOMMIT;",
      migration, version
    ))?;
    info!(version, "applied store migration");
  }

  Ok(())
}
