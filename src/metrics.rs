//! Lock-free counters for the data-access layer.
//!
//! One [`Metrics`] instance is shared (via `Arc`) by the executor, cache and
//! outbox of a client. Call [`Metrics::snapshot`] to read them.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
  query_attempts: AtomicU64,
  query_failures: AtomicU64,
  query_timeouts: AtomicU64,
  cache_hits: AtomicU64,
  cache_misses: AtomicU64,
  cache_stale_served: AtomicU64,
  cache_evictions: AtomicU64,
  writes_confirmed: AtomicU64,
  writes_queued: AtomicU64,
  sync_succeeded: AtomicU64,
  sync_exhausted: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
  pub query_attempts: u64,
  pub query_failures: u64,
  pub query_timeouts: u64,
  pub cache_hits: u64,
  pub cache_misses: u64,
  pub cache_stale_served: u64,
  pub cache_evictions: u64,
  pub writes_confirmed: u64,
  pub writes_queued: u64,
  pub sync_succeeded: u64,
  pub sync_exhausted: u64,
}

macro_rules! counter {
  ($($name:ident => $field:ident),* $(,)?) => {
    impl Metrics {
      $(
        pub(crate) fn $name(&self) {
          self.$field.fetch_add(1, Ordering::Relaxed);
        }
      )*
    }
  };
}

counter! {
  record_attempt => query_attempts,
  record_query_failure => query_failures,
  record_timeout => query_timeouts,
  record_hit => cache_hits,
  record_miss => cache_misses,
  record_stale => cache_stale_served,
  record_eviction => cache_evictions,
  record_confirmed_write => writes_confirmed,
  record_queued_write => writes_queued,
  record_synced => sync_succeeded,
  record_exhausted => sync_exhausted,
}

impl Metrics {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn snapshot(&self) -> MetricsSnapshot {
    MetricsSnapshot {
      query_attempts: self.query_attempts.load(Ordering::Relaxed),
      query_failures: self.query_failures.load(Ordering::Relaxed),
      query_timeouts: self.query_timeouts.load(Ordering::Relaxed),
      cache_hits: self.cache_hits.load(Ordering::Relaxed),
      cache_misses: self.cache_misses.load(Ordering::Relaxed),
      cache_stale_served: self.cache_stale_served.load(Ordering::Relaxed),
      cache_evictions: self.cache_evictions.load(Ordering::Relaxed),
      writes_confirmed: self.writes_confirmed.load(Ordering::Relaxed),
      writes_queued: self.writes_queued.load(Ordering::Relaxed),
      sync_succeeded: self.sync_succeeded.load(Ordering::Relaxed),
      sync_exhausted: self.sync_exhausted.load(Ordering::Relaxed),
    }
  }
}

impl MetricsSnapshot {
  /// Fraction of cache lookups served without a fetch.
  pub fn hit_rate(&self) -> f64 {
    let total = self.cache_hits + self.cache_misses;
    if total == 0 {
      0.0
    } else {
      self.cache_hits as f64 / total as f64
    }
  }
}
