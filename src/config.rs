use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
  #[serde(default)]
  pub remote: RemoteConfig,
  #[serde(default)]
  pub query: QueryConfig,
  #[serde(default)]
  pub cache: CacheConfig,
  #[serde(default)]
  pub outbox: OutboxConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RemoteConfig {
  /// Base URL of the REST endpoint (e.g. "https://example.supabase.co/rest/v1")
  pub url: Option<String>,
}

/// What the executor does once every attempt has failed.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
  /// Log, count, and return an empty result
  #[default]
  Lenient,
  /// Return the last error to the caller
  Strict,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueryConfig {
  #[serde(default = "default_deadline_ms")]
  pub deadline_ms: u64,
  #[serde(default = "default_max_retries")]
  pub max_retries: u32,
  #[serde(default = "default_base_backoff_ms")]
  pub base_backoff_ms: u64,
  #[serde(default = "default_max_backoff_ms")]
  pub max_backoff_ms: u64,
  #[serde(default)]
  pub failure_policy: FailurePolicy,
}

impl Default for QueryConfig {
  fn default() -> Self {
    Self {
      deadline_ms: default_deadline_ms(),
      max_retries: default_max_retries(),
      base_backoff_ms: default_base_backoff_ms(),
      max_backoff_ms: default_max_backoff_ms(),
      failure_policy: FailurePolicy::default(),
    }
  }
}

impl QueryConfig {
  pub fn deadline(&self) -> Duration {
    Duration::from_millis(self.deadline_ms)
  }

  pub fn base_backoff(&self) -> Duration {
    Duration::from_millis(self.base_backoff_ms)
  }

  pub fn max_backoff(&self) -> Duration {
    Duration::from_millis(self.max_backoff_ms)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
  #[serde(default = "default_max_size_bytes")]
  pub max_size_bytes: usize,
  /// Optional cap on the number of entries, in addition to the byte budget
  pub max_entries: Option<usize>,
  #[serde(default = "default_ttl_minutes")]
  pub default_ttl_minutes: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      max_size_bytes: default_max_size_bytes(),
      max_entries: None,
      default_ttl_minutes: default_ttl_minutes(),
    }
  }
}

impl CacheConfig {
  pub fn default_ttl(&self) -> Duration {
    Duration::from_secs(self.default_ttl_minutes * 60)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct OutboxConfig {
  #[serde(default = "default_write_timeout_ms")]
  pub write_timeout_ms: u64,
  #[serde(default = "default_max_sync_attempts")]
  pub max_sync_attempts: u32,
  /// SQLite file holding pending mutations (default: $XDG_DATA_HOME/steadfast/outbox.db)
  pub path: Option<PathBuf>,
}

impl Default for OutboxConfig {
  fn default() -> Self {
    Self {
      write_timeout_ms: default_write_timeout_ms(),
      max_sync_attempts: default_max_sync_attempts(),
      path: None,
    }
  }
}

impl OutboxConfig {
  pub fn write_timeout(&self) -> Duration {
    Duration::from_millis(self.write_timeout_ms)
  }

  /// Resolve the store location, falling back to the data directory.
  pub fn store_path(&self) -> Result<PathBuf> {
    match &self.path {
      Some(p) => Ok(p.clone()),
      None => Ok(data_dir()?.join("outbox.db")),
    }
  }
}

fn default_deadline_ms() -> u64 {
  10_000
}

fn default_max_retries() -> u32 {
  2
}

fn default_base_backoff_ms() -> u64 {
  200
}

fn default_max_backoff_ms() -> u64 {
  5_000
}

fn default_max_size_bytes() -> usize {
  32 * 1024 * 1024
}

fn default_ttl_minutes() -> u64 {
  5
}

fn default_write_timeout_ms() -> u64 {
  10_000
}

fn default_max_sync_attempts() -> u32 {
  5
}

/// Directory for the outbox database and log files.
pub fn data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("steadfast"))
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./steadfast.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/steadfast/config.yaml
  ///
  /// Without a file every setting takes its default.
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
      None => {
        tracing::debug!("no config file found, using defaults");
        Ok(Self::default())
      }
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("steadfast.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("steadfast").join("config.yaml");
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
    if config.query.deadline_ms == 0 {
      return Err(eyre!("query.deadline_ms must be greater than zero"));
    }
    Ok(config)
  }

  /// Get the backend API key from the environment.
  ///
  /// Checks STEADFAST_API_KEY. Absent means unauthenticated requests.
  pub fn get_api_key() -> Option<String> {
    std::env::var("STEADFAST_API_KEY").ok()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_defaults() {
    let config = Config::default();
    assert_eq!(config.query.deadline(), Duration::from_secs(10));
    assert_eq!(config.query.max_retries, 2);
    assert_eq!(config.cache.default_ttl(), Duration::from_secs(300));
    assert_eq!(config.cache.max_size_bytes, 32 * 1024 * 1024);
    assert_eq!(config.query.failure_policy, FailurePolicy::Lenient);
  }

  #[test]
  fn test_partial_yaml_keeps_defaults() {
    let config = Config::from_yaml(
      "remote:\n  url: https://backend.test/rest/v1\nquery:\n  max_retries: 4\n  failure_policy: strict\ncache:\n  max_entries: 100\n",
    )
    .unwrap();

    assert_eq!(
      config.remote.url.as_deref(),
      Some("https://backend.test/rest/v1")
    );
    assert_eq!(config.query.max_retries, 4);
    assert_eq!(config.query.deadline_ms, 10_000);
    assert_eq!(config.query.failure_policy, FailurePolicy::Strict);
    assert_eq!(config.cache.max_entries, Some(100));
    assert_eq!(config.outbox.max_sync_attempts, 5);
  }

  #[test]
  fn test_zero_deadline_rejected() {
    assert!(Config::from_yaml("query:\n  deadline_ms: 0\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path_is_error() {
    assert!(Config::load(Some(Path::new("/nonexistent/steadfast.yaml"))).is_err());
  }
}
