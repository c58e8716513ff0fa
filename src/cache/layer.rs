//! Cache layer that orchestrates caching logic with network fetching.

use chrono::Duration;
use color_eyre::{eyre::eyre, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

use super::clock::{Clock, SystemClock};
use super::storage::KeyValueStore;
use super::traits::{CacheEntry, CacheResult, Cacheable, Refresh};

/// Cache layer that manages caching logic and network fetching.
///
/// Every key maps to one persisted [`CacheEntry`]. Reads within the TTL are
/// served from storage, everything else goes to the fetcher. Stored data can
/// never make a lookup fail: unreadable, corrupt or mistyped entries count as
/// misses.
pub struct CacheLayer<S: KeyValueStore, C: Clock = SystemClock> {
  storage: Arc<S>,
  clock: Arc<C>,
  in_flight: Option<Arc<InFlight>>,
}

impl<S: KeyValueStore> CacheLayer<S> {
  /// Create a new cache layer with the given storage backend and the wall clock.
  pub fn new(storage: S) -> Self {
    Self::with_clock(storage, SystemClock)
  }
}

impl<S: KeyValueStore, C: Clock> CacheLayer<S, C> {
  /// Create a cache layer with an explicit time source.
  pub fn with_clock(storage: S, clock: C) -> Self {
    Self {
      storage: Arc::new(storage),
      clock: Arc::new(clock),
      in_flight: None,
    }
  }

  /// Make concurrent lookups of one key share a single fetch.
  pub fn with_single_flight(mut self) -> Self {
    self.in_flight = Some(Arc::new(InFlight::default()));
    self
  }

  /// Fetch with cache-first strategy.
  pub async fn get<V, F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> Result<CacheResult<V>>
  where
    V: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V>>,
  {
    self.fetch(key, ttl, Refresh::IfStale, fetcher).await
  }

  /// Fetch `key`, going to the network when the entry is missing, stale or
  /// unusable, or when `refresh` forces it.
  ///
  /// 1. Unless forced, return a stored entry younger than `ttl`
  /// 2. With single-flight, wait for any fetch of the same key already running
  ///    and reuse its result if it stored one
  /// 3. Call the fetcher; errors propagate and nothing is written
  /// 4. Persist the value if it is storable
  pub async fn fetch<V, F, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    refresh: Refresh,
    fetcher: F,
  ) -> Result<CacheResult<V>>
  where
    V: Cacheable,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<V>>,
  {
    let slot = match &self.in_flight {
      Some(in_flight) => Some(in_flight.slot(key)?),
      None => None,
    };
    // Taken before reading storage so a store landing in between is noticed
    let seen = slot
      .as_ref()
      .map(|slot| slot.generation.load(Ordering::SeqCst));

    if refresh == Refresh::IfStale {
      if let Some(entry) = self.load::<V>(key) {
        if entry.is_fresh(self.clock.now_millis(), ttl.num_milliseconds()) {
          debug!(key, "cache hit");
          return Ok(CacheResult::from_cache(entry));
        }
        debug!(key, "cache entry stale");
      }
    }

    let _permit = match &slot {
      Some(slot) => {
        let permit = slot.lock.lock().await;

        // Someone finished a fetch for this key since we looked
        if Some(slot.generation.load(Ordering::SeqCst)) != seen {
          if let Some(entry) = self.load::<V>(key) {
            debug!(key, "reusing result of concurrent fetch");
            return Ok(CacheResult::from_cache(entry));
          }
        }
        Some(permit)
      }
      None => None,
    };

    debug!(key, ?refresh, "fetching");
    let value = fetcher().await?;
    let fetched_at = self.clock.now_millis();

    if value.is_storable() && self.store(key, &value, fetched_at) {
      if let Some(slot) = &slot {
        slot.generation.fetch_add(1, Ordering::SeqCst);
      }
    }

    Ok(CacheResult::from_network(value, fetched_at))
  }

  /// Describe every stored entry without decoding its value.
  pub fn entries(&self, ttl_for: impl Fn(&str) -> Duration) -> Result<Vec<EntryInfo>> {
    let now = self.clock.now_millis();
    let keys = self.storage.keys()?;

    let infos = keys
      .into_iter()
      .map(|key| {
        let entry = self
          .storage
          .read(&key)
          .ok()
          .flatten()
          .and_then(|raw| serde_json::from_str::<CacheEntry<serde_json::Value>>(&raw).ok());
        let age = entry.as_ref().and_then(|entry| {
          entry
            .age_millis(now)
            .and_then(Duration::try_milliseconds)
        });
        let ttl = ttl_for(&key);

        match (entry, age) {
          (Some(entry), Some(age)) => EntryInfo {
            fresh: entry.is_fresh(now, ttl.num_milliseconds()),
            age: Some(age),
            kind: Some(entry.kind),
            key,
          },
          _ => EntryInfo {
            key,
            kind: None,
            age: None,
            fresh: false,
          },
        }
      })
      .collect();

    Ok(infos)
  }

  /// Read and decode the entry for `key`, treating any problem as a miss.
  fn load<V: Cacheable>(&self, key: &str) -> Option<CacheEntry<V>> {
    let raw = match self.storage.read(key) {
      Ok(Some(raw)) => raw,
      Ok(None) => return None,
      Err(e) => {
        warn!(key, error = %e, "cache read failed, treating as miss");
        return None;
      }
    };

    let entry: CacheEntry<V> = match serde_json::from_str(&raw) {
      Ok(entry) => entry,
      Err(e) => {
        warn!(key, error = %e, "corrupt cache entry, treating as miss");
        return None;
      }
    };

    if entry.kind != V::kind() {
      warn!(
        key,
        stored = %entry.kind,
        expected = V::kind(),
        "cache entry has unexpected kind, treating as miss"
      );
      return None;
    }

    if entry.age_millis(self.clock.now_millis()).is_none() {
      warn!(
        key,
        timestamp = entry.timestamp,
        "cache entry has unusable timestamp, treating as miss"
      );
      return None;
    }

    Some(entry)
  }

  /// Persist `value`; returns whether the write went through.
  fn store<V: Cacheable>(&self, key: &str, value: &V, timestamp: i64) -> bool {
    let entry = CacheEntry {
      kind: V::kind().to_string(),
      value,
      timestamp,
    };

    let result = serde_json::to_string(&entry)
      .map_err(|e| eyre!("Failed to serialize cache entry: {}", e))
      .and_then(|raw| self.storage.write(key, &raw));

    match result {
      Ok(()) => true,
      Err(e) => {
        warn!(key, error = %e, "failed to persist cache entry");
        false
      }
    }
  }
}

impl<S: KeyValueStore, C: Clock> Clone for CacheLayer<S, C> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
      clock: Arc::clone(&self.clock),
      in_flight: self.in_flight.clone(),
    }
  }
}

/// Summary of one stored entry, for listings.
#[derive(Debug, Clone, PartialEq)]
pub struct EntryInfo {
  pub key: String,
  /// `None` when the slot could not be decoded
  pub kind: Option<String>,
  pub age: Option<Duration>,
  pub fresh: bool,
}

/// Per-key fetch serialization for single-flight lookups.
#[derive(Default)]
struct InFlight {
  slots: Mutex<HashMap<String, Arc<KeySlot>>>,
}

#[derive(Default)]
struct KeySlot {
  lock: tokio::sync::Mutex<()>,
  /// Bumped after every fetch whose result was stored
  generation: AtomicU64,
}

impl InFlight {
  fn slot(&self, key: &str) -> Result<Arc<KeySlot>> {
    let mut slots = self
      .slots
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(Arc::clone(slots.entry(key.to_string()).or_default()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::clock::ManualClock;
  use crate::cache::storage::MemoryStore;
  use crate::cache::traits::CacheSource;
  use std::sync::atomic::{AtomicBool, AtomicU32};

  const HOUR: i64 = 3_600_000;

  fn ttl() -> Duration {
    Duration::milliseconds(HOUR)
  }

  #[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
  struct Url(String);

  impl Cacheable for Url {
    fn kind() -> &'static str {
      "url"
    }
  }

  fn url(s: &str) -> Url {
    Url(s.to_string())
  }

  fn layer() -> (CacheLayer<Arc<MemoryStore>, Arc<ManualClock>>, Arc<MemoryStore>, Arc<ManualClock>) {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::at(0));
    let layer = CacheLayer::with_clock(Arc::clone(&store), Arc::clone(&clock));
    (layer, store, clock)
  }

  async fn get_counting(
    layer: &CacheLayer<Arc<MemoryStore>, Arc<ManualClock>>,
    calls: &AtomicU32,
    value: &str,
  ) -> CacheResult<Url> {
    layer
      .get("k", ttl(), move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(url(value))
      })
      .await
      .unwrap()
  }

  #[tokio::test]
  async fn test_hit_within_ttl_skips_fetch() {
    let (layer, _, clock) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let first = get_counting(&layer, calls, "A").await;
    assert_eq!(first.source, CacheSource::Network);

    clock.advance(HOUR - 1);
    let second = get_counting(&layer, calls, "B").await;
    assert_eq!(second.data, url("A"));
    assert_eq!(second.source, CacheSource::Cache);
    assert_eq!(second.fetched_at, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_ttl_scenario() {
    let (layer, store, clock) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    get_counting(&layer, calls, "A").await;

    clock.set(1_800_000);
    assert_eq!(get_counting(&layer, calls, "X").await.data, url("A"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    clock.set(3_600_001);
    let refreshed = get_counting(&layer, calls, "B").await;
    assert_eq!(refreshed.data, url("B"));
    assert_eq!(refreshed.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    let stored: CacheEntry<Url> = serde_json::from_str(&store.read("k").unwrap().unwrap()).unwrap();
    assert_eq!(stored.timestamp, 3_600_001);

    clock.set(3_600_002);
    assert_eq!(get_counting(&layer, calls, "Y").await.data, url("B"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_corrupt_entry_is_a_miss() {
    let (layer, store, _) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    store.write("k", "{not json").unwrap();
    let result = get_counting(&layer, calls, "A").await;

    assert_eq!(result.data, url("A"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    // The corrupt slot was overwritten
    assert_eq!(get_counting(&layer, calls, "B").await.data, url("A"));
  }

  #[tokio::test]
  async fn test_entry_of_other_kind_is_a_miss() {
    let (layer, store, _) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    store
      .write("k", r#"{"kind":"list","value":"A","timestamp":0}"#)
      .unwrap();
    get_counting(&layer, calls, "B").await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_force_refresh_always_fetches() {
    let (layer, _, _) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    get_counting(&layer, calls, "A").await;
    let forced = layer
      .fetch("k", ttl(), Refresh::Force, move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(url("B"))
      })
      .await
      .unwrap();

    assert_eq!(forced.data, url("B"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(get_counting(&layer, calls, "C").await.data, url("B"));
  }

  #[tokio::test]
  async fn test_fetch_error_propagates_and_is_not_cached() {
    let (layer, store, _) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let result: Result<CacheResult<Url>> = layer
      .get("k", ttl(), || async { Err(eyre!("backend unavailable")) })
      .await;

    assert!(result.is_err());
    assert_eq!(store.read("k").unwrap(), None);

    assert_eq!(get_counting(&layer, calls, "A").await.data, url("A"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_fetch_error_after_expiry_keeps_old_entry() {
    let (layer, store, clock) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    get_counting(&layer, calls, "A").await;
    let before = store.read("k").unwrap();

    clock.advance(HOUR);
    let result: Result<CacheResult<Url>> = layer
      .get("k", ttl(), || async { Err(eyre!("timeout")) })
      .await;

    assert!(result.is_err());
    assert_eq!(store.read("k").unwrap(), before);
  }

  #[tokio::test]
  async fn test_unstorable_values_are_returned_but_not_kept() {
    let (layer, store, _) = layer();

    let missing: CacheResult<Option<Url>> = layer
      .get("k", ttl(), || async { Ok(None) })
      .await
      .unwrap();
    assert_eq!(missing.data, None);
    assert_eq!(store.read("k").unwrap(), None);

    let empty: CacheResult<Vec<u32>> = layer
      .get("list", ttl(), || async { Ok(Vec::new()) })
      .await
      .unwrap();
    assert!(empty.data.is_empty());
    assert_eq!(store.read("list").unwrap(), None);
  }

  #[tokio::test]
  async fn test_optional_value_reads_back_as_some() {
    let (layer, _, _) = layer();

    layer
      .get("k", ttl(), || async { Ok(Some(url("A"))) })
      .await
      .unwrap();
    let cached: CacheResult<Option<Url>> = layer
      .get("k", ttl(), || async { Ok(None) })
      .await
      .unwrap();

    assert_eq!(cached.data, Some(url("A")));
    assert_eq!(cached.source, CacheSource::Cache);
  }

  #[tokio::test]
  async fn test_concurrent_misses_each_fetch_without_single_flight() {
    let (layer, _, _) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let fetch = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::task::yield_now().await;
      Ok(url("A"))
    };
    let (a, b) = tokio::join!(layer.get("k", ttl(), fetch), layer.get("k", ttl(), fetch));

    assert!(a.is_ok() && b.is_ok());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_single_flight_shares_one_fetch() {
    let (layer, _, _) = layer();
    let layer = layer.with_single_flight();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let fetch = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      tokio::task::yield_now().await;
      Ok(url("A"))
    };
    let (a, b, c) = tokio::join!(
      layer.get("k", ttl(), fetch),
      layer.get("k", ttl(), fetch),
      layer.fetch("k", ttl(), Refresh::Force, fetch),
    );

    assert_eq!(a.unwrap().data, url("A"));
    assert_eq!(b.unwrap().data, url("A"));
    assert_eq!(c.unwrap().data, url("A"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_single_flight_waiter_retries_after_failed_leader() {
    let (layer, _, _) = layer();
    let layer = layer.with_single_flight();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    let fetch = move || async move {
      let n = calls.fetch_add(1, Ordering::SeqCst);
      tokio::task::yield_now().await;
      if n == 0 {
        Err(eyre!("first attempt fails"))
      } else {
        Ok(url("A"))
      }
    };
    let (a, b) = tokio::join!(layer.get("k", ttl(), fetch), layer.get("k", ttl(), fetch));

    assert!(a.is_err());
    assert_eq!(b.unwrap().data, url("A"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_single_flight_sequential_force_still_fetches() {
    let (layer, _, _) = layer();
    let layer = layer.with_single_flight();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    get_counting(&layer, calls, "A").await;
    let forced = layer
      .fetch("k", ttl(), Refresh::Force, move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(url("B"))
      })
      .await
      .unwrap();

    assert_eq!(forced.data, url("B"));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_entries_report_kind_age_and_freshness() {
    let (layer, store, clock) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    get_counting(&layer, calls, "A").await;
    store.write("broken", "???").unwrap();
    clock.set(HOUR + 5);

    let entries = layer.entries(|_| ttl()).unwrap();
    assert_eq!(
      entries,
      vec![
        EntryInfo {
          key: "broken".to_string(),
          kind: None,
          age: None,
          fresh: false,
        },
        EntryInfo {
          key: "k".to_string(),
          kind: Some("url".to_string()),
          age: Some(Duration::milliseconds(HOUR + 5)),
          fresh: false,
        },
      ]
    );
  }

  /// Memory store that can be told to fail, with a hook run on the next read.
  #[derive(Default)]
  struct FlakyStore {
    inner: MemoryStore,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    on_read: Mutex<Option<Box<dyn FnOnce() + Send>>>,
  }

  impl KeyValueStore for FlakyStore {
    fn read(&self, key: &str) -> Result<Option<String>> {
      let value = if self.fail_reads.load(Ordering::SeqCst) {
        Err(eyre!("disk unavailable"))
      } else {
        self.inner.read(key)
      };

      let hook = self.on_read.lock().unwrap().take();
      if let Some(hook) = hook {
        hook();
      }
      value
    }

    fn write(&self, key: &str, value: &str) -> Result<()> {
      if self.fail_writes.load(Ordering::SeqCst) {
        return Err(eyre!("disk full"));
      }
      self.inner.write(key, value)
    }

    fn keys(&self) -> Result<Vec<String>> {
      self.inner.keys()
    }
  }

  type FlakyLayer = CacheLayer<Arc<FlakyStore>, Arc<ManualClock>>;

  fn flaky_layer() -> (FlakyLayer, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let layer = CacheLayer::with_clock(Arc::clone(&store), Arc::new(ManualClock::at(0)));
    (layer, store)
  }

  fn generation(layer: &FlakyLayer, key: &str) -> u64 {
    layer
      .in_flight
      .as_ref()
      .unwrap()
      .slot(key)
      .unwrap()
      .generation
      .load(Ordering::SeqCst)
  }

  #[tokio::test]
  async fn test_overflowing_timestamp_is_a_miss() {
    let (layer, store, clock) = layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    store
      .write(
        "list",
        r#"{"kind":"list","value":[1],"timestamp":-9223372036854775808}"#,
      )
      .unwrap();
    clock.set(1_700_000_000_000);

    let result: CacheResult<Vec<u32>> = layer
      .get("list", ttl(), move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(vec![2])
      })
      .await
      .unwrap();

    assert_eq!(result.data, vec![2]);
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[test]
  fn test_entries_report_overflowing_timestamp_as_corrupt() {
    let (layer, store, clock) = layer();
    store
      .write(
        "list",
        r#"{"kind":"list","value":[1],"timestamp":-9223372036854775808}"#,
      )
      .unwrap();
    clock.set(1_700_000_000_000);

    assert_eq!(
      layer.entries(|_| ttl()).unwrap(),
      vec![EntryInfo {
        key: "list".to_string(),
        kind: None,
        age: None,
        fresh: false,
      }]
    );
  }

  #[tokio::test]
  async fn test_failed_read_is_a_miss() {
    let (layer, store) = flaky_layer();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    store
      .inner
      .write("k", r#"{"kind":"url","value":"A","timestamp":0}"#)
      .unwrap();
    store.fail_reads.store(true, Ordering::SeqCst);

    let result = layer
      .get("k", ttl(), move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(url("B"))
      })
      .await
      .unwrap();

    assert_eq!(result.data, url("B"));
    assert_eq!(result.source, CacheSource::Network);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn test_failed_write_still_returns_value() {
    let (layer, store) = flaky_layer();
    let layer = layer.with_single_flight();
    let counter = AtomicU32::new(0);
    let calls = &counter;
    store.fail_writes.store(true, Ordering::SeqCst);

    let fetch = move || async move {
      calls.fetch_add(1, Ordering::SeqCst);
      Ok(url("A"))
    };

    let first = layer.get("k", ttl(), fetch).await.unwrap();
    assert_eq!(first.data, url("A"));
    assert_eq!(first.source, CacheSource::Network);
    assert_eq!(store.inner.read("k").unwrap(), None);
    assert_eq!(generation(&layer, "k"), 0);

    // Nothing was kept, so the next lookup fetches again
    layer.get("k", ttl(), fetch).await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test]
  async fn test_single_flight_notices_store_during_lookup() {
    let (layer, store) = flaky_layer();
    let layer = layer.with_single_flight();
    let counter = AtomicU32::new(0);
    let calls = &counter;

    // Another fetch of "k" completes while this lookup reads storage
    let leader = layer.clone();
    *store.on_read.lock().unwrap() = Some(Box::new(move || {
      assert!(leader.store("k", &url("A"), 0));
      leader
        .in_flight
        .as_ref()
        .unwrap()
        .slot("k")
        .unwrap()
        .generation
        .fetch_add(1, Ordering::SeqCst);
    }));

    let result = layer
      .get("k", ttl(), move || async move {
        calls.fetch_add(1, Ordering::SeqCst);
        Ok(url("B"))
      })
      .await
      .unwrap();

    assert_eq!(result.data, url("A"));
    assert_eq!(result.source, CacheSource::Cache);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }
}
