mod cache;
mod commands;
mod config;
mod firebase;
mod gallery;
mod logging;

use clap::Parser;
use color_eyre::Result;
use std::path::PathBuf;
use tracing::{debug, error};

use cache::{CacheLayer, FileStore, KeyValueStore, MemoryStore, NoopStore, SqliteStore};
use commands::Command;
use config::{CacheBackend, CacheConfig};
use firebase::cached_client::{CachedContentClient, Ttls};
use firebase::client::FirebaseClient;

#[derive(Parser, Debug)]
#[command(name = "folio")]
#[command(about = "Cached access to a portfolio site's images, blog posts and gallery")]
#[command(version)]
struct Args {
  /// Path to config file (default: $XDG_CONFIG_HOME/folio/config.yaml)
  #[arg(short, long, global = true)]
  config: Option<PathBuf>,

  /// Print machine-readable JSON
  #[arg(long, global = true)]
  json: bool,

  #[command(subcommand)]
  command: Command,
}

#[tokio::main]
async fn main() -> Result<()> {
  color_eyre::install()?;

  let args = Args::parse();

  // Logs go to a file; keep the guard alive until exit so they get flushed
  let _log_guard = logging::init(&cache::default_data_dir()?.join("logs"))?;

  let command = match args.command {
    // Gallery paths need no backend at all
    Command::GalleryPath { section, filename } => {
      println!("{}", gallery::image_path(&section, &filename));
      return Ok(());
    }
    Command::Content(command) => command,
  };

  // Load configuration
  let config = config::Config::load(args.config.as_deref())?;

  let backend = FirebaseClient::new(&config)?;
  let mut cache = CacheLayer::new(open_store(&config.cache)?);
  if config.cache.single_flight {
    cache = cache.with_single_flight();
  }
  let client = CachedContentClient::new(backend, cache, Ttls::try_from(&config.cache)?);

  let result = commands::run(command, &client, args.json).await;
  if let Err(e) = &result {
    error!(error = %e, "command failed");
  }
  result
}

/// Storage backend picked by the configuration.
fn open_store(config: &CacheConfig) -> Result<Box<dyn KeyValueStore>> {
  debug!(backend = ?config.backend, path = ?config.path, "opening cache store");

  let store: Box<dyn KeyValueStore> = match (config.backend, &config.path) {
    (CacheBackend::Sqlite, Some(path)) => Box::new(SqliteStore::open_at(path)?),
    (CacheBackend::Sqlite, None) => Box::new(SqliteStore::open()?),
    (CacheBackend::File, Some(path)) => Box::new(FileStore::open_at(path)?),
    (CacheBackend::File, None) => Box::new(FileStore::open()?),
    (CacheBackend::Memory, _) => Box::new(MemoryStore::new()),
    (CacheBackend::Disabled, _) => Box::new(NoopStore),
  };

  Ok(store)
}
