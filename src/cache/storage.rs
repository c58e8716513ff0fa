//! Key-value storage trait and its backends.
//!
//! The cache only needs string slots: one serialized entry per key. Backends
//! know nothing about entries, kinds or timestamps.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Trait for cache storage backends.
pub trait KeyValueStore: Send + Sync {
  /// Read the raw value stored under `key`.
  fn read(&self, key: &str) -> Result<Option<String>>;

  /// Store `value` under `key`, replacing any previous value.
  fn write(&self, key: &str, value: &str) -> Result<()>;

  /// All keys currently stored, sorted.
  fn keys(&self) -> Result<Vec<String>>;
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Box<S> {
  fn read(&self, key: &str) -> Result<Option<String>> {
    (**self).read(key)
  }

  fn write(&self, key: &str, value: &str) -> Result<()> {
    (**self).write(key, value)
  }

  fn keys(&self) -> Result<Vec<String>> {
    (**self).keys()
  }
}

impl<S: KeyValueStore + ?Sized> KeyValueStore for Arc<S> {
  fn read(&self, key: &str) -> Result<Option<String>> {
    (**self).read(key)
  }

  fn write(&self, key: &str, value: &str) -> Result<()> {
    (**self).write(key, value)
  }

  fn keys(&self) -> Result<Vec<String>> {
    (**self).keys()
  }
}

/// Storage implementation that doesn't cache anything.
/// Used when caching is disabled - all operations are no-ops.
pub struct NoopStore;

impl KeyValueStore for NoopStore {
  fn read(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn write(&self, _key: &str, _value: &str) -> Result<()> {
    Ok(()) // Discard
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// In-process storage, lost on exit.
#[derive(Default)]
pub struct MemoryStore {
  slots: Mutex<HashMap<String, String>>,
}

impl MemoryStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl KeyValueStore for MemoryStore {
  fn read(&self, key: &str) -> Result<Option<String>> {
    let slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(slots.get(key).cloned())
  }

  fn write(&self, key: &str, value: &str) -> Result<()> {
    let mut slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    slots.insert(key.to_string(), value.to_string());
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut keys: Vec<String> = slots.keys().cloned().collect();
    keys.sort();
    Ok(keys)
  }
}

/// SQLite-based cache storage implementation.
pub struct SqliteStore {
  conn: Mutex<Connection>,
}

impl SqliteStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&default_data_dir()?.join("cache.db"))
  }

  /// Open or create the store at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      fs::create_dir_all(parent).map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Store backed by a private in-memory database.
  #[cfg(test)]
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    conn
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(Self {
      conn: Mutex::new(conn),
    })
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS cache_slots (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    written_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueStore for SqliteStore {
  fn read(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM cache_slots WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read cache slot {}: {}", key, e))
  }

  fn write(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO cache_slots (key, value, written_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write cache slot {}: {}", key, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM cache_slots ORDER BY key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list cache keys: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache key: {}", e))?;

    Ok(keys)
  }
}

/// One JSON file per key inside a directory.
///
/// File names are the SHA-256 of the key, so any key is a valid file name.
/// Each file keeps the original key next to the value for `keys()`.
pub struct FileStore {
  dir: PathBuf,
}

#[derive(Serialize, Deserialize)]
struct FileSlot {
  key: String,
  value: String,
}

impl FileStore {
  /// Open the store at the default location.
  pub fn open() -> Result<Self> {
    Self::open_at(&default_data_dir()?.join("slots"))
  }

  /// Open or create the store rooted at `dir`.
  pub fn open_at(dir: &Path) -> Result<Self> {
    fs::create_dir_all(dir)
      .map_err(|e| eyre!("Failed to create cache directory {}: {}", dir.display(), e))?;

    Ok(Self {
      dir: dir.to_path_buf(),
    })
  }

  fn slot_path(&self, key: &str) -> PathBuf {
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    self.dir.join(format!("{}.json", hex::encode(hasher.finalize())))
  }
}

impl KeyValueStore for FileStore {
  fn read(&self, key: &str) -> Result<Option<String>> {
    let path = self.slot_path(key);
    if !path.exists() {
      return Ok(None);
    }

    let contents = fs::read_to_string(&path)
      .map_err(|e| eyre!("Failed to read cache file {}: {}", path.display(), e))?;
    let slot: FileSlot = serde_json::from_str(&contents)
      .map_err(|e| eyre!("Failed to parse cache file {}: {}", path.display(), e))?;

    Ok(Some(slot.value))
  }

  fn write(&self, key: &str, value: &str) -> Result<()> {
    let path = self.slot_path(key);
    let json = serde_json::to_string(&FileSlot {
      key: key.to_string(),
      value: value.to_string(),
    })
    .map_err(|e| eyre!("Failed to serialize cache slot: {}", e))?;

    // Write atomically via temp file
    let temp_path = path.with_extension("tmp");
    let mut file = fs::File::create(&temp_path)
      .map_err(|e| eyre!("Failed to create {}: {}", temp_path.display(), e))?;
    file
      .write_all(json.as_bytes())
      .and_then(|_| file.sync_all())
      .map_err(|e| eyre!("Failed to write {}: {}", temp_path.display(), e))?;
    fs::rename(&temp_path, &path)
      .map_err(|e| eyre!("Failed to move cache file into place: {}", e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let entries = fs::read_dir(&self.dir)
      .map_err(|e| eyre!("Failed to list {}: {}", self.dir.display(), e))?;

    let mut keys: Vec<String> = entries
      .filter_map(|entry| entry.ok())
      .map(|entry| entry.path())
      .filter(|path| path.extension().is_some_and(|ext| ext == "json"))
      .filter_map(|path| fs::read_to_string(path).ok())
      .filter_map(|contents| serde_json::from_str::<FileSlot>(&contents).ok())
      .map(|slot| slot.key)
      .collect();
    keys.sort();

    Ok(keys)
  }
}

/// `<data_dir>/folio`, falling back to `~/.local/share/folio`.
pub fn default_data_dir() -> Result<PathBuf> {
  let data_dir = dirs::data_dir()
    .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
    .ok_or_else(|| eyre!("Could not determine data directory"))?;

  Ok(data_dir.join("folio"))
}
