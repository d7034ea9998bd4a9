//! Error taxonomy for the offline layer.

use thiserror::Error;

/// Errors produced by the cache, store, router and sync engine.
#[derive(Debug, Error)]
pub enum OfflineError {
  /// Network unreachable, connection reset, or the request timed out.
  #[error("transport error for {url}: {message}")]
  Transport { url: String, message: String },

  /// The server answered with a non-2xx status.
  #[error("{url} answered with status {status}")]
  HttpApplication { url: String, status: u16 },

  /// The local database could not be opened or a transaction failed.
  #[error("store I/O error: {0}")]
  StoreIo(String),

  /// The local database ran out of space.
  #[error("storage quota exceeded: {0}")]
  QuotaExceeded(String),

  /// The on-disk schema is newer than this build understands.
  #[error("schema version {found} is newer than supported version {supported}")]
  SchemaMigrationConflict { found: i64, supported: i64 },

  /// A record or payload could not be (de)serialized.
  #[error("serialization error: {0}")]
  Serialization(#[from] serde_json::Error),

  /// The request could not be built (bad URL, unknown method).
  #[error("invalid request: {0}")]
  InvalidRequest(String),
}

pub type Result<T> = std::result::Result<T, OfflineError>;

impl OfflineError {
  pub fn transport(url: impl Into<String>, message: impl ToString) -> Self {
    Self::Transport {
      url: url.into(),
      message: message.to_string(),
    }
  }

  pub fn timeout(url: impl Into<String>, timeout: std::time::Duration) -> Self {
    Self::Transport {
      url: url.into(),
      message: format!("timed out after {}ms", timeout.as_millis()),
    }
  }

  /// True for failures a fallback chain may recover from.
  pub fn is_transport(&self) -> bool {
    matches!(self, Self::Transport { .. })
  }
}

impl From<rusqlite::Error> for OfflineError {
  fn from(err: rusqlite::Error) -> Self {
    match &err {
      rusqlite::Error::SqliteFailure(code, _) if code.code == rusqlite::ErrorCode::DiskFull => {
        Self::QuotaExceeded(err.to_string())
      }
      _ => Self::StoreIo(err.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_disk_full_maps_to_quota() {
    let err = rusqlite::Error::SqliteFailure(
      rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_FULL),
      None,
    );
    assert!(matches!(OfflineError::from(err), OfflineError::QuotaExceeded(_)));
  }

  #[test]
  fn test_other_sqlite_errors_map_to_store_io() {
    let err = rusqlite::Error::QueryReturnedNoRows;
    assert!(matches!(OfflineError::from(err), OfflineError::StoreIo(_)));
  }

  #[test]
  fn test_timeout_is_transport() {
    let err = OfflineError::timeout("/api/puestos", std::time::Duration::from_millis(3000));
    assert!(err.is_transport());
    assert!(err.to_string().contains("3000ms"));
  }
}
