use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use portal_offline::precache::PrecacheManifest;
use portal_offline::service::ServiceSettings;

const API_URL_ENV: &str = "PORTAL_OFFLINE_API_URL";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Backend base URL
  pub api_url: String,
  /// Portal origin the pages are served from
  pub site_url: String,
  /// Host fragments that identify public file servers
  #[serde(default = "default_known_origins")]
  pub known_origins: Vec<String>,
  /// Database path (defaults to the user data directory)
  pub database: Option<PathBuf>,
  /// Deployed build output, scanned for the precache manifest
  pub build_dir: Option<PathBuf>,
  #[serde(default = "default_version")]
  pub version: String,
  #[serde(default = "default_network_timeout_ms")]
  pub network_timeout_ms: u64,
  #[serde(default = "default_warm_delay_ms")]
  pub warm_delay_ms: u64,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
  /// `tracing` filter directive, overridden by RUST_LOG
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Write daily log files here instead of stderr
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      directory: None,
    }
  }
}

fn default_known_origins() -> Vec<String> {
  vec!["sututeh".to_string(), "render.com".to_string()]
}

fn default_version() -> String {
  env!("CARGO_PKG_VERSION").to_string()
}

fn default_network_timeout_ms() -> u64 {
  3000
}

fn default_warm_delay_ms() -> u64 {
  2000
}

fn default_log_level() -> String {
  "info".to_string()
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./portal-offline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/portal-offline/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => {
        return Err(eyre!(
          "No configuration file found. Create one at ~/.config/portal-offline/config.yaml"
        ))
      }
    };

    if let Ok(api_url) = std::env::var(API_URL_ENV) {
      config.api_url = api_url;
    }
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("portal-offline.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("portal-offline").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents).map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Ok(config)
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    self
      .database
      .clone()
      .or_else(portal_offline::db::default_path)
      .ok_or_else(|| eyre!("Could not determine a data directory; set `database` in the config"))
  }

  pub fn site_url(&self) -> Result<Url> {
    Url::parse(&self.site_url).map_err(|e| eyre!("Invalid site_url {}: {}", self.site_url, e))
  }

  /// Settings for the background service. Scans `build_dir` when set.
  pub fn service_settings(&self) -> Result<ServiceSettings> {
    let site_url = self.site_url()?;
    let manifest = match &self.build_dir {
      Some(dir) => Some(PrecacheManifest::scan(dir, &site_url)?),
      None => None,
    };

    Ok(ServiceSettings {
      site_url,
      api_url: self.api_url.clone(),
      known_origins: self.known_origins.clone(),
      version: self.version.clone(),
      network_timeout: Duration::from_millis(self.network_timeout_ms),
      warm_delay: Duration::from_millis(self.warm_delay_ms),
      manifest,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::parse(
      "api_url: https://backend-sututeh.onrender.com\nsite_url: https://sututeh.com\n",
    )
    .unwrap();

    assert_eq!(config.known_origins, vec!["sututeh", "render.com"]);
    assert_eq!(config.network_timeout_ms, 3000);
    assert_eq!(config.warm_delay_ms, 2000);
    assert_eq!(config.log.level, "info");
    assert!(config.build_dir.is_none());

    let settings = config.service_settings().unwrap();
    assert_eq!(settings.network_timeout, Duration::from_secs(3));
    assert_eq!(settings.site_url.as_str(), "https://sututeh.com/");
  }

  #[test]
  fn test_full_config() {
    let config = Config::parse(
      r#"
api_url: http://localhost:3001
site_url: http://localhost:3000
known_origins: [localhost]
database: /tmp/portal.db
version: "3.0.0"
network_timeout_ms: 500
log:
  level: debug
  directory: /var/log/portal-offline
"#,
    )
    .unwrap();

    assert_eq!(config.known_origins, vec!["localhost"]);
    assert_eq!(config.database_path().unwrap(), PathBuf::from("/tmp/portal.db"));
    assert_eq!(config.version, "3.0.0");
    assert_eq!(config.log.directory, Some(PathBuf::from("/var/log/portal-offline")));
  }

  #[test]
  fn test_missing_explicit_path() {
    assert!(Config::load(Some(Path::new("/nonexistent/portal-offline.yaml"))).is_err());
  }
}
