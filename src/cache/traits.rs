//! Core traits and types for the caching system.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Trait for values that can be cached.
///
/// Every key holds values of a single kind. A stored entry whose kind does not
/// match the requested type is treated as absent.
pub trait Cacheable: Send + Sync + Serialize + DeserializeOwned {
  /// Stable type tag written alongside each entry (e.g., "url", "list")
  fn kind() -> &'static str;

  /// Whether a freshly fetched value should be persisted.
  fn is_storable(&self) -> bool {
    true
  }
}

/// Lists are only worth keeping when the backend returned something.
impl<T> Cacheable for Vec<T>
where
  T: Send + Sync + Serialize + DeserializeOwned,
{
  fn kind() -> &'static str {
    "list"
  }

  fn is_storable(&self) -> bool {
    !self.is_empty()
  }
}

/// A missing optional resource is never cached, so the next read asks again.
impl<T: Cacheable> Cacheable for Option<T> {
  fn kind() -> &'static str {
    T::kind()
  }

  fn is_storable(&self) -> bool {
    self.as_ref().is_some_and(Cacheable::is_storable)
  }
}

/// Persisted form of a cache slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<V> {
  /// Value type tag, see [`Cacheable::kind`]
  pub kind: String,
  /// The cached payload
  pub value: V,
  /// Fetch time in epoch milliseconds
  pub timestamp: i64,
}

impl<V> CacheEntry<V> {
  /// Whether the entry is still inside its time-to-live at `now`.
  ///
  /// An entry whose age cannot be represented is never fresh.
  pub fn is_fresh(&self, now: i64, ttl_millis: i64) -> bool {
    self.age_millis(now).is_some_and(|age| age < ttl_millis)
  }

  /// Milliseconds since the entry was fetched, `None` on overflow.
  pub fn age_millis(&self, now: i64) -> Option<i64> {
    now.checked_sub(self.timestamp)
  }
}

/// Whether a lookup may be served from a fresh entry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Refresh {
  /// Serve a fresh entry, fetch otherwise
  #[default]
  IfStale,
  /// Always call the fetcher
  Force,
}

impl From<bool> for Refresh {
  fn from(force: bool) -> Self {
    if force {
      Refresh::Force
    } else {
      Refresh::IfStale
    }
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was fetched from the backend (epoch millis)
  pub fetched_at: i64,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T, fetched_at: i64) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      fetched_at,
    }
  }

  /// Create a new cache result from a stored entry.
  pub fn from_cache(entry: CacheEntry<T>) -> Self {
    Self {
      data: entry.value,
      source: CacheSource::Cache,
      fetched_at: entry.timestamp,
    }
  }
}

/// Indicates where returned data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from the backend
  Network,
  /// Data from a stored entry within its TTL
  Cache,
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_entry_freshness_boundary() {
    let entry = CacheEntry {
      kind: "url".to_string(),
      value: "A".to_string(),
      timestamp: 0,
    };

    assert!(entry.is_fresh(3_599_999, 3_600_000));
    assert!(!entry.is_fresh(3_600_000, 3_600_000));
    assert_eq!(entry.age_millis(1_800_000), Some(1_800_000));
  }

  #[test]
  fn test_unrepresentable_age_is_never_fresh() {
    let entry = CacheEntry {
      kind: "list".to_string(),
      value: vec![1],
      timestamp: i64::MIN,
    };

    assert_eq!(entry.age_millis(1_700_000_000_000), None);
    assert!(!entry.is_fresh(1_700_000_000_000, 3_600_000));
  }

  #[test]
  fn test_entry_serialized_shape() {
    let entry = CacheEntry {
      kind: "list".to_string(),
      value: vec![1, 2],
      timestamp: 1_700_000_000_000,
    };

    let json = serde_json::to_value(&entry).unwrap();
    assert_eq!(
      json,
      serde_json::json!({ "kind": "list", "value": [1, 2], "timestamp": 1_700_000_000_000_i64 })
    );
  }

  #[test]
  fn test_empty_list_and_none_are_not_storable() {
    assert!(!Vec::<u32>::new().is_storable());
    assert!(vec![1u32].is_storable());
    assert!(!None::<Vec<u32>>.is_storable());
    assert!(!Some(Vec::<u32>::new()).is_storable());
    assert!(Some(vec![1u32]).is_storable());
  }

  #[test]
  fn test_refresh_from_flag() {
    assert_eq!(Refresh::from(true), Refresh::Force);
    assert_eq!(Refresh::from(false), Refresh::IfStale);
  }
}
