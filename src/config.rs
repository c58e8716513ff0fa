use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub firebase: FirebaseConfig,
  #[serde(default)]
  pub cache: CacheConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FirebaseConfig {
  pub project_id: String,
  pub storage_bucket: String,
  /// Web API key; FOLIO_FIREBASE_API_KEY takes precedence
  pub api_key: Option<String>,
  /// Override for the storage endpoint (e.g., a local emulator)
  pub storage_url: Option<String>,
  /// Override for the document database endpoint
  pub firestore_url: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
  /// SQLite database under the data directory
  #[default]
  Sqlite,
  /// One JSON file per key
  File,
  /// Process memory only
  Memory,
  /// Caching disabled
  #[serde(rename = "none")]
  Disabled,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  pub backend: CacheBackend,
  /// Database file (sqlite) or directory (file); defaults under the data dir
  pub path: Option<PathBuf>,
  pub image_ttl_secs: u64,
  pub list_ttl_secs: u64,
  /// Collapse concurrent fetches of the same key
  pub single_flight: bool,
  pub request_timeout_secs: u64,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      backend: CacheBackend::default(),
      path: None,
      image_ttl_secs: 24 * 60 * 60,
      list_ttl_secs: 60 * 60,
      single_flight: true,
      request_timeout_secs: 30,
    }
  }
}

impl CacheConfig {
  pub fn image_ttl(&self) -> Result<Duration> {
    ttl_from_secs("cache.image_ttl_secs", self.image_ttl_secs)
  }

  pub fn list_ttl(&self) -> Result<Duration> {
    ttl_from_secs("cache.list_ttl_secs", self.list_ttl_secs)
  }

  pub fn request_timeout(&self) -> std::time::Duration {
    std::time::Duration::from_secs(self.request_timeout_secs)
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./folio.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/folio/config.yaml
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
        "No configuration file found. Create one at ~/.config/folio/config.yaml\n\
                 with at least firebase.project_id and firebase.storage_bucket."
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("folio.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("folio").join("config.yaml");
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
    let config: Config = serde_yaml::from_str(contents).map_err(|e| eyre!("{}", e))?;

    // Reject TTLs that cannot be represented before anything uses them
    config.cache.image_ttl()?;
    config.cache.list_ttl()?;

    Ok(config)
  }

  /// Get the web API key, preferring the environment.
  ///
  /// Checks FOLIO_FIREBASE_API_KEY, then the config file.
  pub fn api_key(&self) -> Option<String> {
    std::env::var("FOLIO_FIREBASE_API_KEY")
      .ok()
      .filter(|key| !key.is_empty())
      .or_else(|| self.firebase.api_key.clone())
  }
}

fn ttl_from_secs(name: &str, secs: u64) -> Result<Duration> {
  i64::try_from(secs)
    .ok()
    .and_then(Duration::try_seconds)
    .ok_or_else(|| eyre!("{} out of range: {}", name, secs))
}
