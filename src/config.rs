use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::mask::FieldMask;
use crate::queue::Backoff;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub backend: BackendConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  /// SQLite file for the queue and entity cache (defaults to the data directory)
  pub database_path: Option<PathBuf>,
  #[serde(default)]
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
  pub url: String,
  /// Path of the REST endpoint below `url`
  #[serde(default = "default_rest_path")]
  pub rest_path: String,
  /// Database schema sent as Accept-Profile / Content-Profile
  pub schema: Option<String>,
}

fn default_rest_path() -> String {
  "rest/v1".to_string()
}

/// Knobs for caching, the offline queue and connectivity handling.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
  pub stale_time_secs: u64,
  /// Column that identifies a row within a collection
  pub primary_key: String,
  pub max_attempts: u32,
  pub backoff_base_ms: u64,
  pub backoff_cap_ms: u64,
  pub backoff_jitter: bool,
  /// Sends in flight at once during a flush
  pub max_concurrency: usize,
  pub send_timeout_ms: u64,
  /// Periodic flush while online with pending work
  pub flush_interval_secs: u64,
  /// Quiet period before a connectivity change is published
  pub debounce_ms: u64,
  /// Ping the backend at this interval to detect connectivity (disabled when unset)
  pub probe_interval_secs: Option<u64>,
  /// Write fetched values through to the entity store
  pub persist_cache: bool,
  /// Fields never cached, persisted or logged, per collection
  pub mask: FieldMask,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      stale_time_secs: 300,
      primary_key: "id".to_string(),
      max_attempts: 8,
      backoff_base_ms: 1_000,
      backoff_cap_ms: 30_000,
      backoff_jitter: true,
      max_concurrency: 4,
      send_timeout_ms: 15_000,
      flush_interval_secs: 30,
      debounce_ms: 250,
      probe_interval_secs: None,
      persist_cache: true,
      mask: FieldMask::new().with_collection("comments", ["content"]),
    }
  }
}

impl SyncConfig {
  pub fn stale_time(&self) -> chrono::Duration {
    chrono::Duration::seconds(i64::try_from(self.stale_time_secs).unwrap_or(i64::MAX / 1_000))
  }

  pub fn backoff(&self) -> Backoff {
    Backoff {
      base: Duration::from_millis(self.backoff_base_ms),
      cap: Duration::from_millis(self.backoff_cap_ms),
      jitter: self.backoff_jitter,
    }
  }

  pub fn send_timeout(&self) -> Duration {
    Duration::from_millis(self.send_timeout_ms)
  }

  pub fn flush_interval(&self) -> Duration {
    Duration::from_secs(self.flush_interval_secs)
  }

  pub fn debounce(&self) -> Duration {
    Duration::from_millis(self.debounce_ms)
  }

  pub fn probe_interval(&self) -> Option<Duration> {
    self.probe_interval_secs.map(Duration::from_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directive used when RUST_LOG is unset
  pub level: String,
  /// Log directory (defaults to the data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "estisync=info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./estisync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/estisync/config.yaml
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
        "No configuration file found. Create one at ~/.config/estisync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from("estisync.yaml");
    if local.exists() {
      return Some(local);
    }

    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("estisync").join("config.yaml");
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

  pub fn parse(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;
    if config.sync.max_concurrency == 0 {
      return Err(eyre!("sync.max_concurrency must be at least 1"));
    }
    if config.sync.max_attempts == 0 {
      return Err(eyre!("sync.max_attempts must be at least 1"));
    }
    Ok(config)
  }

  /// Get the backend API key from environment variables.
  ///
  /// Checks ESTISYNC_API_KEY first, then BACKEND_API_KEY as fallback.
  pub fn get_api_key() -> Result<String> {
    std::env::var("ESTISYNC_API_KEY")
      .or_else(|_| std::env::var("BACKEND_API_KEY"))
      .map_err(|_| {
        eyre!("Backend API key not found. Set ESTISYNC_API_KEY or BACKEND_API_KEY environment variable.")
      })
  }
}
