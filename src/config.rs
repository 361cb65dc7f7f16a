use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::cache::namespace_name;
use crate::db;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  /// Base URL of the assistant backend, e.g. https://assist.example.gov.in
  pub origin: String,
  /// Directory for the database and log files (defaults to the platform data dir)
  pub data_dir: Option<PathBuf>,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub queue: QueueConfig,
  #[serde(default)]
  pub network: NetworkConfig,
  #[serde(default)]
  pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  /// Leading part of every namespace name
  #[serde(default = "default_prefix")]
  pub prefix: String,
  /// Bump to force a new namespace (a manifest change also forces one)
  #[serde(default = "default_version")]
  pub version: String,
  /// Resources that must all be cached for install to succeed
  #[serde(
    default = "default_critical_resources",
    deserialize_with = "deserialize_manifest"
  )]
  pub critical_resources: Vec<String>,
  /// Served to offline navigations that have no cached page of their own
  #[serde(default = "default_fallback")]
  pub fallback: String,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      prefix: default_prefix(),
      version: default_version(),
      critical_resources: default_critical_resources(),
      fallback: default_fallback(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
  /// Failed attempts tolerated before an action is dropped
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
}

impl Default for QueueConfig {
  fn default() -> Self {
    Self {
      max_retries: default_max_retries(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NetworkConfig {
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
  /// Path polled to decide whether we're online
  #[serde(default = "default_probe_path")]
  pub probe_path: String,
  #[serde(default = "default_probe_interval_secs")]
  pub probe_interval_secs: u64,
}

impl Default for NetworkConfig {
  fn default() -> Self {
    Self {
      timeout_secs: default_timeout_secs(),
      probe_path: default_probe_path(),
      probe_interval_secs: default_probe_interval_secs(),
    }
  }
}

impl NetworkConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
  /// Default filter when STAYLINE_LOG is unset
  #[serde(default = "default_log_level")]
  pub level: String,
  /// Also write a daily-rotated log file into the data directory
  #[serde(default)]
  pub file: bool,
}

impl Default for LoggingConfig {
  fn default() -> Self {
    Self {
      level: default_log_level(),
      file: false,
    }
  }
}

fn default_prefix() -> String {
  "stayline".to_string()
}

fn default_version() -> String {
  "v1".to_string()
}

fn default_critical_resources() -> Vec<String> {
  vec!["/".to_string()]
}

fn default_fallback() -> String {
  "/".to_string()
}

fn default_max_retries() -> u32 {
  crate::sync::DEFAULT_MAX_RETRIES
}

fn default_timeout_secs() -> u64 {
  10
}

fn default_probe_path() -> String {
  "/".to_string()
}

fn default_probe_interval_secs() -> u64 {
  15
}

fn default_log_level() -> String {
  "info".to_string()
}

/// Trim entries, drop blanks and duplicates, keep order.
fn deserialize_manifest<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
  D: serde::Deserializer<'de>,
{
  let v: Vec<String> = Vec::deserialize(deserializer)?;
  let mut manifest: Vec<String> = Vec::with_capacity(v.len());
  for entry in v.into_iter().map(|s| s.trim().to_string()) {
    if !entry.is_empty() && !manifest.contains(&entry) {
      manifest.push(entry);
    }
  }
  Ok(manifest)
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./stayline.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/stayline/config.yaml
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
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/stayline/config.yaml\n\
                 with at least an `origin:` entry."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("stayline.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("stayline").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    config.origin_url()?;
    Ok(config)
  }

  fn origin_url(&self) -> Result<Url> {
    Url::parse(&self.origin).map_err(|e| eyre!("Invalid origin '{}': {}", self.origin, e))
  }

  /// Resolve a path (or absolute URL) against the origin.
  pub fn resolve(&self, path: &str) -> Result<String> {
    let url = self
      .origin_url()?
      .join(path)
      .map_err(|e| eyre!("Invalid resource '{}': {}", path, e))?;
    Ok(url.to_string())
  }

  /// Absolute URLs of the critical resources, in manifest order.
  pub fn manifest_urls(&self) -> Result<Vec<String>> {
    self
      .cache
      .critical_resources
      .iter()
      .map(|r| self.resolve(r))
      .collect()
  }

  /// Name of the current cache namespace.
  pub fn namespace(&self) -> String {
    namespace_name(
      &self.cache.prefix,
      &self.cache.version,
      &self.cache.critical_resources,
    )
  }

  pub fn data_dir(&self) -> Result<PathBuf> {
    match &self.data_dir {
      Some(dir) => Ok(dir.clone()),
      None => db::default_data_dir(),
    }
  }

  pub fn database_path(&self) -> Result<PathBuf> {
    Ok(self.data_dir()?.join("stayline.db"))
  }

  /// Bearer token for the backend, if one is configured.
  ///
  /// Read from STAYLINE_API_TOKEN so it never lands in the config file.
  pub fn get_api_token() -> Option<String> {
    std::env::var("STAYLINE_API_TOKEN")
      .ok()
      .filter(|t| !t.is_empty())
  }
}
