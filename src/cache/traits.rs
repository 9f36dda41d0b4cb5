//! Core traits and types for the caching system.

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::remote::ResultSet;

/// Trait for values that can be held in the bounded cache.
///
/// The estimate is charged against the cache's byte budget. It does not have
/// to be exact, but it must be stable for a given value.
pub trait SizeEstimate {
  fn size_bytes(&self) -> usize;
}

impl SizeEstimate for String {
  fn size_bytes(&self) -> usize {
    self.len()
  }
}

impl SizeEstimate for Vec<u8> {
  fn size_bytes(&self) -> usize {
    self.len()
  }
}

impl SizeEstimate for Value {
  fn size_bytes(&self) -> usize {
    serde_json::to_vec(self).map(|v| v.len()).unwrap_or(0)
  }
}

impl SizeEstimate for ResultSet {
  /// Serialized size of the rows plus the total counter.
  fn size_bytes(&self) -> usize {
    let rows = serde_json::to_vec(&self.rows).map(|v| v.len()).unwrap_or(0);
    rows + std::mem::size_of::<Option<u64>>()
  }
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was written to the cache (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from freshly fetched data.
  pub fn from_fetch(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Fetched,
      cached_at: None,
    }
  }

  /// Create a new cache result from a live entry.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheFresh,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for an expired entry served after a failed refresh.
  pub fn stale(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::CacheStale,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where cached data came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fetched just now (possibly by a concurrent caller for the same key)
  Fetched,
  /// Live entry, within its TTL
  CacheFresh,
  /// Expired entry, served because the refresh failed
  CacheStale,
}

/// Counters and budget usage of one cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
  pub hits: u64,
  pub misses: u64,
  pub stale_served: u64,
  pub evictions: u64,
  pub current_size_bytes: usize,
  pub entry_count: usize,
}
