use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{OfflineError, Result};

/// Open (or create) a SQLite database at `path`, creating parent directories.
pub fn open(path: &Path) -> Result<Connection> {
  if let Some(parent) = path.parent() {
    std::fs::create_dir_all(parent).map_err(|e| {
      OfflineError::StoreIo(format!(
        "failed to create database directory {}: {}",
        parent.display(),
        e
      ))
    })?;
  }

  let conn = Connection::open(path).map_err(|e| {
    OfflineError::StoreIo(format!(
      "failed to open database at {}: {}",
      path.display(),
      e
    ))
  })?;
  conn.busy_timeout(Duration::from_secs(5))?;
  conn.pragma_update(None, "journal_mode", "WAL")?;

  Ok(conn)
}

/// A private in-memory database.
pub fn open_in_memory() -> Result<Connection> {
  Ok(Connection::open_in_memory()?)
}

/// `<data_dir>/portal-offline/offline.db`
pub fn default_path() -> Option<PathBuf> {
  dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .map(|dir| dir.join("portal-offline").join("offline.db"))
}
