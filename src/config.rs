use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub cache: CacheConfig,
  pub http: HttpConfig,
  pub offline: OfflineConfig,
  pub sync: SyncConfig,
  /// SQLite file for durable state (default: $XDG_DATA_HOME/offline-cache/cache.db)
  pub database_path: Option<PathBuf>,
}

/// Which backend a `CacheManager` is built on.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
  /// Bounded in-process map with LRU eviction
  #[default]
  Memory,
  /// SQLite file, survives restarts
  Local,
  /// In-memory SQLite database, lives as long as the process
  Session,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub storage: StorageKind,
  pub default_ttl_ms: u64,
  pub max_size: usize,
  /// Byte quota for the persistent backends
  pub quota_bytes: Option<u64>,
  /// Key prefix for the persistent backends
  pub namespace: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      storage: StorageKind::Memory,
      default_ttl_ms: 3_600_000,
      max_size: 100,
      quota_bytes: Some(5 * 1024 * 1024),
      namespace: "cache:".to_string(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
  pub default_ttl_ms: u64,
  pub max_size: usize,
  pub request_timeout_ms: u64,
  pub user_agent: String,
}

impl Default for HttpConfig {
  fn default() -> Self {
    Self {
      default_ttl_ms: 300_000,
      max_size: 50,
      request_timeout_ms: 30_000,
      user_agent: concat!("offline-cache/", env!("CARGO_PKG_VERSION")).to_string(),
    }
  }
}

impl HttpConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_millis(self.default_ttl_ms)
  }

  pub fn request_timeout(&self) -> Duration {
    Duration::from_millis(self.request_timeout_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
  /// Generation tag; buckets are named `shell-<version>` and `data-<version>`
  pub version: String,
  /// Base URL that relative request paths resolve against
  pub origin: String,
  /// Prefetched at install time, in order
  pub shell_assets: Vec<String>,
  /// Path prefixes served network-first as API calls
  pub api_prefixes: Vec<String>,
  pub offline_page: String,
}

impl Default for OfflineConfig {
  fn default() -> Self {
    Self {
      version: "v1".to_string(),
      origin: "http://localhost:8080".to_string(),
      shell_assets: [
        "/",
        "/index.html",
        "/offline.html",
        "/manifest.json",
        "/css/styles.css",
        "/js/app.js",
        "/icons/icon-192x192.png",
        "/icons/icon-512x512.png",
      ]
      .iter()
      .map(|s| s.to_string())
      .collect(),
      api_prefixes: vec!["/api/".to_string()],
      offline_page: "/offline.html".to_string(),
    }
  }
}

impl OfflineConfig {
  pub fn shell_bucket(&self) -> String {
    format!("shell-{}", self.version)
  }

  pub fn data_bucket(&self) -> String {
    format!("data-{}", self.version)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub max_retries: u32,
  /// Persist queued requests in the database so they survive restarts
  pub durable: bool,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      max_retries: 3,
      durable: true,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./offline-cache.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/offline-cache/config.yaml
  ///
  /// Falls back to built-in defaults when no file exists.
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

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Ok(Self::default()),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("offline-cache.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("offline-cache").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
  }

  fn validate(&self) -> Result<()> {
    if self.offline.version.trim().is_empty() {
      return Err(eyre!("offline.version must not be empty"));
    }
    url::Url::parse(&self.offline.origin)
      .map_err(|e| eyre!("offline.origin '{}' is not a URL: {}", self.offline.origin, e))?;
    if self.http.request_timeout_ms == 0 {
      return Err(eyre!("http.request_timeout_ms must be greater than zero"));
    }
    Ok(())
  }
}
