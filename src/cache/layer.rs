//! Cache layer that orchestrates get-or-fetch, stale fallback and single-flight.

use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::CacheConfig;
use crate::error::{DataError, DataResult};
use crate::event::{DataEvent, EventSink};
use crate::metrics::Metrics;

use super::storage::{BudgetState, Lookup, MemoryStore};
use super::traits::{CacheResult, CacheStats, SizeEstimate};

type InFlight<T> = Shared<BoxFuture<'static, DataResult<T>>>;

/// Bounded, TTL-aware get-or-fetch cache.
///
/// This layer sits between callers and the query executor. Entries are
/// charged against a byte budget and evicted oldest-write-first. A failed
/// refresh falls back to the expired entry when one exists. Concurrent misses
/// on one key share a single fetch.
pub struct BoundedCache<T> {
  store: Arc<Mutex<MemoryStore<T>>>,
  inflight: Arc<Mutex<HashMap<String, InFlight<T>>>>,
  default_ttl: Duration,
  metrics: Arc<Metrics>,
  events: EventSink,
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
///
/// Every critical section leaves the store consistent before anything that
/// could panic, so the inner value is still valid.
fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
  mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl<T> BoundedCache<T>
where
  T: Clone + Send + Sync + SizeEstimate + 'static,
{
  /// Create a new cache with the given budget.
  pub fn new(config: &CacheConfig) -> Self {
    Self {
      store: Arc::new(Mutex::new(MemoryStore::new(
        config.max_size_bytes,
        config.max_entries,
      ))),
      inflight: Arc::new(Mutex::new(HashMap::new())),
      default_ttl: config.default_ttl(),
      metrics: Arc::new(Metrics::new()),
      events: EventSink::disabled(),
    }
  }

  pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
    self.metrics = metrics;
    self
  }

  pub fn with_events(mut self, events: EventSink) -> Self {
    self.events = events;
    self
  }

  pub fn default_ttl(&self) -> Duration {
    self.default_ttl
  }

  /// Fetch with cache-first strategy.
  ///
  /// 1. Live entry - return immediately
  /// 2. Missing or expired - run `fetcher` (or join a fetch already in flight)
  /// 3. On success, store the value and return it
  /// 4. On failure, return the expired entry if there is one, else the error
  pub async fn get_or_fetch<F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> DataResult<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = DataResult<T>> + Send + 'static,
  {
    self
      .get_or_fetch_with_source(key, ttl, fetcher)
      .await
      .map(|result| result.data)
  }

  /// Same as [`get_or_fetch`](Self::get_or_fetch), reporting where the value came from.
  pub async fn get_or_fetch_with_source<F, Fut>(
    &self,
    key: &str,
    ttl: Duration,
    fetcher: F,
  ) -> DataResult<CacheResult<T>>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = DataResult<T>> + Send + 'static,
  {
    if let Some(hit) = self.fresh(key) {
      self.metrics.record_hit();
      debug!(key, "cache hit");
      return Ok(hit);
    }
    self.metrics.record_miss();

    let pending = self.join_or_start(key, ttl, fetcher);
    match pending.await {
      Ok(value) => Ok(CacheResult::from_fetch(value)),
      Err(e) => self.stale_fallback(key, e),
    }
  }

  fn fresh(&self, key: &str) -> Option<CacheResult<T>> {
    let store = lock(&self.store);
    match store.lookup(key, Instant::now()) {
      Lookup::Fresh(entry) => Some(CacheResult::from_cache(entry.value.clone(), entry.cached_at)),
      _ => None,
    }
  }

  /// Return the fetch already running for `key`, or start one.
  ///
  /// The stored future writes its result into the cache and clears the
  /// in-flight marker itself, so whichever caller drives it to completion
  /// does the bookkeeping even if the one who started it was dropped.
  fn join_or_start<F, Fut>(&self, key: &str, ttl: Duration, fetcher: F) -> InFlight<T>
  where
    F: FnOnce() -> Fut,
    Fut: Future<Output = DataResult<T>> + Send + 'static,
  {
    let mut inflight = lock(&self.inflight);
    if let Some(pending) = inflight.get(key) {
      debug!(key, "joining in-flight fetch");
      return pending.clone();
    }

    let fetch = fetcher();
    let store = Arc::clone(&self.store);
    let markers = Arc::clone(&self.inflight);
    let metrics = Arc::clone(&self.metrics);
    let events = self.events.clone();
    let owned_key = key.to_string();

    let pending = async move {
      let result = fetch.await;
      if let Ok(value) = &result {
        write_entry(&store, &metrics, &events, &owned_key, value.clone(), ttl);
      }
      lock(&markers).remove(&owned_key);
      result
    }
    .boxed()
    .shared();

    inflight.insert(key.to_string(), pending.clone());
    pending
  }

  fn stale_fallback(&self, key: &str, error: DataError) -> DataResult<CacheResult<T>> {
    let store = lock(&self.store);
    let entry = match store.lookup(key, Instant::now()) {
      Lookup::Fresh(entry) | Lookup::Expired(entry) => entry,
      Lookup::Missing => return Err(error),
    };

    warn!(key, error = %error, cached_at = %entry.cached_at, "refresh failed, serving stale entry");
    self.metrics.record_stale();
    self.events.emit(DataEvent::StaleServed {
      key: key.to_string(),
      error: error.to_string(),
    });
    Ok(CacheResult::stale(entry.value.clone(), entry.cached_at))
  }

  /// Live value for `key`, without fetching.
  ///
  /// Missing and expired entries are both a [`DataError::CacheMiss`].
  pub fn get(&self, key: &str) -> DataResult<T> {
    self.fresh(key).map(|r| r.data).ok_or(DataError::CacheMiss)
  }

  /// Store a value directly.
  pub fn insert(&self, key: &str, value: T, ttl: Duration) {
    write_entry(&self.store, &self.metrics, &self.events, key, value, ttl);
  }

  /// Remove one entry.
  pub fn clear_key(&self, key: &str) -> bool {
    lock(&self.store).remove(key).is_some()
  }

  /// Remove every entry and reset the budget.
  pub fn clear(&self) {
    lock(&self.store).clear();
  }

  /// Drop expired entries eagerly instead of waiting for them to be replaced.
  pub fn purge_expired(&self) -> usize {
    lock(&self.store).purge_expired(Instant::now())
  }

  pub fn budget(&self) -> BudgetState {
    lock(&self.store).budget()
  }

  pub fn stats(&self) -> CacheStats {
    let counters = self.metrics.snapshot();
    let budget = self.budget();
    CacheStats {
      hits: counters.cache_hits,
      misses: counters.cache_misses,
      stale_served: counters.cache_stale_served,
      evictions: counters.cache_evictions,
      current_size_bytes: budget.current_size_bytes,
      entry_count: budget.entry_count,
    }
  }

  pub fn len(&self) -> usize {
    lock(&self.store).len()
  }

  pub fn is_empty(&self) -> bool {
    lock(&self.store).is_empty()
  }
}

fn write_entry<T: SizeEstimate>(
  store: &Mutex<MemoryStore<T>>,
  metrics: &Metrics,
  events: &EventSink,
  key: &str,
  value: T,
  ttl: Duration,
) {
  let size = value.size_bytes();
  let outcome = lock(store).insert(key, value, ttl, size, Instant::now());

  if !outcome.stored {
    debug!(key, size, "value exceeds cache budget, not stored");
  }
  for (evicted, size_bytes) in outcome.evicted {
    debug!(key = %evicted, size_bytes, "evicted");
    metrics.record_eviction();
    events.emit(DataEvent::Evicted {
      key: evicted,
      size_bytes,
    });
  }
}

impl<T> Clone for BoundedCache<T> {
  fn clone(&self) -> Self {
    Self {
      store: Arc::clone(&self.store),
      inflight: Arc::clone(&self.inflight),
      default_ttl: self.default_ttl,
      metrics: Arc::clone(&self.metrics),
      events: self.events.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheSource;
  use std::sync::atomic::{AtomicU32, Ordering};

  const TTL: Duration = Duration::from_secs(60);

  fn cache(max_size_bytes: usize) -> BoundedCache<String> {
    BoundedCache::new(&CacheConfig {
      max_size_bytes,
      max_entries: None,
      default_ttl_minutes: 5,
    })
  }

  fn counting_fetcher(
    counter: &Arc<AtomicU32>,
    value: &str,
  ) -> impl FnOnce() -> BoxFuture<'static, DataResult<String>> {
    let counter = Arc::clone(counter);
    let value = value.to_string();
    move || {
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(value)
      }
      .boxed()
    }
  }

  fn failing_fetcher() -> impl FnOnce() -> BoxFuture<'static, DataResult<String>> {
    || async { Err(DataError::Remote("backend down".to_string())) }.boxed()
  }

  #[tokio::test]
  async fn test_second_read_within_ttl_does_not_fetch() {
    let cache = cache(1_000);
    let calls = Arc::new(AtomicU32::new(0));

    let first = cache
      .get_or_fetch("k", TTL, counting_fetcher(&calls, "value"))
      .await
      .unwrap();
    let second = cache
      .get_or_fetch("k", TTL, counting_fetcher(&calls, "other"))
      .await
      .unwrap();

    assert_eq!(first, second);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_expired_entry_is_refetched() {
    let cache = cache(1_000);
    let calls = Arc::new(AtomicU32::new(0));

    cache
      .get_or_fetch("k", Duration::from_secs(1), counting_fetcher(&calls, "v1"))
      .await
      .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;
    let value = cache
      .get_or_fetch("k", Duration::from_secs(1), counting_fetcher(&calls, "v2"))
      .await
      .unwrap();

    assert_eq!(value, "v2");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
  }

  #[tokio::test(start_paused = true)]
  async fn test_failed_refresh_serves_stale() {
    let (sink, mut events) = EventSink::channel();
    let cache = cache(1_000).with_events(sink);
    let calls = Arc::new(AtomicU32::new(0));

    cache
      .get_or_fetch("k", Duration::from_secs(1), counting_fetcher(&calls, "old"))
      .await
      .unwrap();
    tokio::time::advance(Duration::from_secs(2)).await;

    let result = cache
      .get_or_fetch_with_source("k", Duration::from_secs(1), failing_fetcher())
      .await
      .unwrap();

    assert_eq!(result.data, "old");
    assert_eq!(result.source, CacheSource::CacheStale);
    assert!(events
      .drain()
      .iter()
      .any(|e| matches!(e, DataEvent::StaleServed { .. })));
  }

  #[tokio::test(start_paused = true)]
  async fn test_get_reports_expired_entry_as_miss() {
    let cache = cache(1_000);
    cache.insert("k", "v".to_string(), Duration::from_secs(1));
    assert_eq!(cache.get("k"), Ok("v".to_string()));

    tokio::time::advance(Duration::from_secs(2)).await;
    assert_eq!(cache.get("k"), Err(DataError::CacheMiss));
    assert_eq!(cache.get("never"), Err(DataError::CacheMiss));
  }

  #[tokio::test]
  async fn test_failure_without_prior_entry_propagates() {
    let cache = cache(1_000);
    let result = cache.get_or_fetch("k", TTL, failing_fetcher()).await;
    assert!(matches!(result, Err(DataError::Remote(_))));
    assert!(cache.is_empty());
  }

  #[tokio::test]
  async fn test_budget_eviction_through_layer() {
    let cache = cache(100);
    let calls = Arc::new(AtomicU32::new(0));
    let forty = "x".repeat(40);

    for key in ["A", "B", "C"] {
      cache
        .get_or_fetch(key, TTL, counting_fetcher(&calls, &forty))
        .await
        .unwrap();
    }

    assert_eq!(cache.get("A"), Err(DataError::CacheMiss));
    assert!(cache.get("B").is_ok());
    assert!(cache.get("C").is_ok());
    assert_eq!(cache.budget().current_size_bytes, 80);
  }

  #[tokio::test]
  async fn test_concurrent_misses_share_one_fetch() {
    let cache = cache(1_000);
    let calls = Arc::new(AtomicU32::new(0));

    let make = |calls: Arc<AtomicU32>| {
      move || {
        async move {
          calls.fetch_add(1, Ordering::SeqCst);
          tokio::time::sleep(Duration::from_millis(20)).await;
          Ok::<_, DataError>("shared".to_string())
        }
        .boxed()
      }
    };

    let (a, b, c) = tokio::join!(
      cache.get_or_fetch("k", TTL, make(calls.clone())),
      cache.get_or_fetch("k", TTL, make(calls.clone())),
      cache.get_or_fetch("k", TTL, make(calls.clone())),
    );

    assert_eq!(a.unwrap(), "shared");
    assert_eq!(b.unwrap(), "shared");
    assert_eq!(c.unwrap(), "shared");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(lock(&cache.inflight).is_empty());
  }

  #[tokio::test]
  async fn test_clear_key_and_clear() {
    let cache = cache(1_000);
    cache.insert("a", "1".to_string(), TTL);
    cache.insert("b", "22".to_string(), TTL);

    assert!(cache.clear_key("a"));
    assert!(!cache.clear_key("a"));
    assert_eq!(cache.budget().current_size_bytes, 2);

    cache.clear();
    assert_eq!(cache.budget().current_size_bytes, 0);
    assert_eq!(cache.len(), 0);
  }

  #[tokio::test]
  async fn test_metrics_track_hits_and_misses() {
    let metrics = Arc::new(Metrics::new());
    let cache = cache(1_000).with_metrics(metrics.clone());
    let calls = Arc::new(AtomicU32::new(0));

    for _ in 0..3 {
      cache
        .get_or_fetch("k", TTL, counting_fetcher(&calls, "v"))
        .await
        .unwrap();
    }

    let snap = metrics.snapshot();
    assert_eq!(snap.cache_misses, 1);
    assert_eq!(snap.cache_hits, 2);
  }

  #[tokio::test]
  async fn test_stats_combine_counters_and_budget() {
    let cache = cache(100);
    let calls = Arc::new(AtomicU32::new(0));
    let forty = "x".repeat(40);

    for key in ["A", "B", "C", "C"] {
      cache
        .get_or_fetch(key, TTL, counting_fetcher(&calls, &forty))
        .await
        .unwrap();
    }

    let stats = cache.stats();
    assert_eq!(stats.misses, 3);
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.evictions, 1);
    assert_eq!(stats.current_size_bytes, 80);
    assert_eq!(stats.entry_count, 2);
  }
}
