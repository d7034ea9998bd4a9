//! Build-time asset manifest.
//!
//! Scans the deployed build directory for static artifacts, gives each a
//! content revision, and installs them into an immutable partition that the
//! router consults before its route table.

use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::{CacheLayer, CacheStorage, Expiration};
use crate::error::{OfflineError, Result};
use crate::net::Response;
use crate::router::PrecacheRoute;

const EXTENSIONS: &[&str] = &["html", "js", "css", "png", "svg", "webp", "json", "woff2"];

/// Files larger than this are left to the runtime routes.
const MAX_FILE_BYTES: u64 = 2 * 1024 * 1024;

/// The worker script itself is never precached.
const WORKER_SCRIPT: &str = "sw.js";

pub const REVISION_HEADER: &str = "x-precache-revision";

/// Name of the precache partition for a site.
pub fn partition_name(site_url: &Url) -> String {
  let mut scope = site_url.clone();
  scope.set_path("/");
  scope.set_query(None);
  scope.set_fragment(None);
  format!("workbox-precache-v2-{}", scope)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrecacheEntry {
  /// Absolute URL the asset is served from
  pub url: String,
  pub revision: String,
  pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct PrecacheManifest {
  partition: String,
  entries: Vec<PrecacheEntry>,
}

impl PrecacheManifest {
  /// Walk `build_dir` and revision every matching artifact.
  pub fn scan(build_dir: &Path, site_url: &Url) -> Result<Self> {
    if !build_dir.is_dir() {
      return Err(OfflineError::StoreIo(format!(
        "build directory {} not found",
        build_dir.display()
      )));
    }

    let mut entries = Vec::new();
    for entry in walkdir::WalkDir::new(build_dir)
      .follow_links(false)
      .into_iter()
      .filter_map(|entry| entry.ok())
    {
      if !entry.file_type().is_file() || !is_precacheable(entry.path()) {
        continue;
      }
      let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
      if size > MAX_FILE_BYTES {
        debug!(path = %entry.path().display(), size, "skipping oversized asset");
        continue;
      }

      let Ok(relative) = entry.path().strip_prefix(build_dir) else {
        continue;
      };
      let url_path = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
      let url = site_url
        .join(&format!("/{}", url_path))
        .map_err(|e| OfflineError::InvalidRequest(format!("{}: {}", url_path, e)))?;

      let bytes = fs::read(entry.path())
        .map_err(|e| OfflineError::StoreIo(format!("{}: {}", entry.path().display(), e)))?;
      entries.push(PrecacheEntry {
        url: url.to_string(),
        revision: revision(&bytes),
        path: entry.into_path(),
      });
    }
    entries.sort_by(|a, b| a.url.cmp(&b.url));

    info!(count = entries.len(), dir = %build_dir.display(), "precache manifest built");
    Ok(Self {
      partition: partition_name(site_url),
      entries,
    })
  }

  pub fn partition(&self) -> &str {
    &self.partition
  }

  pub fn entries(&self) -> &[PrecacheEntry] {
    &self.entries
  }

  pub fn urls(&self) -> HashSet<String> {
    self.entries.iter().map(|e| e.url.clone()).collect()
  }

  pub fn route(&self) -> PrecacheRoute {
    PrecacheRoute {
      partition: self.partition.clone(),
      urls: self.urls(),
    }
  }

  /// Copy every changed artifact into the precache partition. Returns how
  /// many entries were written; unchanged revisions are skipped.
  pub fn install<S: CacheStorage>(&self, cache: &CacheLayer<S>) -> Result<usize> {
    cache.storage().open_partition(&self.partition)?;

    let mut written = 0;
    for entry in &self.entries {
      let current = cache.lookup(&self.partition, &entry.url, &Expiration::none())?;
      let unchanged = current
        .as_ref()
        .and_then(|c| c.response.headers.get(REVISION_HEADER))
        .map(|rev| rev == &entry.revision)
        .unwrap_or(false);
      if unchanged {
        continue;
      }

      let body = match fs::read(&entry.path) {
        Ok(body) => body,
        Err(e) => {
          warn!(path = %entry.path.display(), error = %e, "precache asset vanished");
          continue;
        }
      };
      let response = Response::new(200, body)
        .with_status_text("OK")
        .with_header("content-type", content_type(&entry.path))
        .with_header(REVISION_HEADER, &entry.revision);
      cache.put(&self.partition, &entry.url, &response, &Expiration::none())?;
      written += 1;
    }

    info!(partition = %self.partition, written, "precache installed");
    Ok(written)
  }
}

fn is_precacheable(path: &Path) -> bool {
  if path.file_name() == Some(OsStr::new(WORKER_SCRIPT)) {
    return false;
  }
  path
    .extension()
    .and_then(OsStr::to_str)
    .map(|ext| EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
    .unwrap_or(false)
}

fn revision(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

fn content_type(path: &Path) -> &'static str {
  match path.extension().and_then(OsStr::to_str).unwrap_or("") {
    "html" => "text/html; charset=utf-8",
    "js" => "application/javascript",
    "css" => "text/css",
    "png" => "image/png",
    "svg" => "image/svg+xml",
    "webp" => "image/webp",
    "json" => "application/json",
    "woff2" => "font/woff2",
    _ => "application/octet-stream",
  }
}
