//! Time-boxed caching of remote resources.
//!
//! This module provides a backend-agnostic caching mechanism that:
//! - Persists the last fetched value of each key with its fetch time
//! - Serves stored values until their TTL runs out, then refetches
//! - Treats corrupt or mistyped stored entries as misses
//! - Optionally collapses concurrent fetches of one key (single-flight)

mod clock;
mod layer;
mod storage;
mod traits;

#[cfg(test)]
pub use clock::ManualClock;
pub use clock::{Clock, SystemClock};
pub use layer::{CacheLayer, EntryInfo};
pub use storage::{default_data_dir, FileStore, KeyValueStore, MemoryStore, NoopStore, SqliteStore};
#[cfg(test)]
pub use traits::CacheSource;
pub use traits::{Cacheable, Refresh};
