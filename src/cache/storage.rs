//! In-memory entry store with byte-budget accounting.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::time::Instant;

/// A single cached value.
#[derive(Debug, Clone)]
pub struct CacheEntry<T> {
  pub key: String,
  pub value: T,
  pub written_at: Instant,
  /// Wall-clock write time, for reporting
  pub cached_at: DateTime<Utc>,
  pub ttl: Duration,
  pub size_bytes: usize,
  /// Position in write order; smaller is older
  seq: u64,
}

impl<T> CacheEntry<T> {
  pub fn is_expired(&self, now: Instant) -> bool {
    now.saturating_duration_since(self.written_at) > self.ttl
  }
}

/// Size and count accounting for one cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetState {
  pub current_size_bytes: usize,
  pub max_size_bytes: usize,
  pub entry_count: usize,
  pub max_entry_count: Option<usize>,
}

impl BudgetState {
  fn fits(&self, extra_bytes: usize) -> bool {
    let bytes_ok = self.current_size_bytes + extra_bytes <= self.max_size_bytes;
    let count_ok = self
      .max_entry_count
      .map(|max| self.entry_count < max)
      .unwrap_or(true);
    bytes_ok && count_ok
  }
}

/// Outcome of a lookup.
#[derive(Debug)]
pub enum Lookup<'a, T> {
  Fresh(&'a CacheEntry<T>),
  Expired(&'a CacheEntry<T>),
  Missing,
}

/// What happened on insert.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct InsertOutcome {
  /// False when the value alone exceeds the budget
  pub stored: bool,
  /// Keys and sizes evicted to make room, oldest first
  pub evicted: Vec<(String, usize)>,
}

/// Entry map plus a write-order index.
///
/// Eviction removes the entry with the oldest write, not the least recently
/// read. Reads never reorder entries.
#[derive(Debug)]
pub struct MemoryStore<T> {
  entries: HashMap<String, CacheEntry<T>>,
  write_order: BTreeMap<u64, String>,
  next_seq: u64,
  budget: BudgetState,
}

impl<T> MemoryStore<T> {
  pub fn new(max_size_bytes: usize, max_entry_count: Option<usize>) -> Self {
    Self {
      entries: HashMap::new(),
      write_order: BTreeMap::new(),
      next_seq: 0,
      budget: BudgetState {
        current_size_bytes: 0,
        max_size_bytes,
        entry_count: 0,
        max_entry_count,
      },
    }
  }

  pub fn budget(&self) -> BudgetState {
    self.budget
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  #[cfg(test)]
  pub fn contains(&self, key: &str) -> bool {
    self.entries.contains_key(key)
  }

  pub fn lookup(&self, key: &str, now: Instant) -> Lookup<'_, T> {
    match self.entries.get(key) {
      Some(entry) if entry.is_expired(now) => Lookup::Expired(entry),
      Some(entry) => Lookup::Fresh(entry),
      None => Lookup::Missing,
    }
  }

  /// Insert a value, evicting oldest-written entries until it fits.
  ///
  /// Any previous entry under `key` is released first. A value larger than
  /// the whole budget is not stored.
  pub fn insert(
    &mut self,
    key: &str,
    value: T,
    ttl: Duration,
    size_bytes: usize,
    now: Instant,
  ) -> InsertOutcome {
    self.remove(key);

    if size_bytes > self.budget.max_size_bytes || self.budget.max_entry_count == Some(0) {
      return InsertOutcome::default();
    }

    let mut evicted = Vec::new();
    while !self.budget.fits(size_bytes) {
      match self.evict_oldest() {
        Some(e) => evicted.push(e),
        None => break,
      }
    }

    let seq = self.next_seq;
    self.next_seq += 1;
    self.write_order.insert(seq, key.to_string());
    self.entries.insert(
      key.to_string(),
      CacheEntry {
        key: key.to_string(),
        value,
        written_at: now,
        cached_at: Utc::now(),
        ttl,
        size_bytes,
        seq,
      },
    );
    self.budget.current_size_bytes += size_bytes;
    self.budget.entry_count += 1;

    InsertOutcome {
      stored: true,
      evicted,
    }
  }

  fn evict_oldest(&mut self) -> Option<(String, usize)> {
    let (_, key) = self.write_order.pop_first()?;
    let entry = self.entries.remove(&key)?;
    self.release(&entry);
    Some((key, entry.size_bytes))
  }

  fn release(&mut self, entry: &CacheEntry<T>) {
    self.budget.current_size_bytes -= entry.size_bytes;
    self.budget.entry_count -= 1;
  }

  pub fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
    let entry = self.entries.remove(key)?;
    self.write_order.remove(&entry.seq);
    self.release(&entry);
    Some(entry)
  }

  /// Drop every expired entry. Returns how many were removed.
  pub fn purge_expired(&mut self, now: Instant) -> usize {
    let expired: Vec<String> = self
      .entries
      .values()
      .filter(|e| e.is_expired(now))
      .map(|e| e.key.clone())
      .collect();
    for key in &expired {
      self.remove(key);
    }
    expired.len()
  }

  pub fn clear(&mut self) {
    self.entries.clear();
    self.write_order.clear();
    self.budget.current_size_bytes = 0;
    self.budget.entry_count = 0;
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  const TTL: Duration = Duration::from_secs(60);

  #[test]
  fn test_oldest_written_is_evicted_first() {
    let now = Instant::now();
    let mut store = MemoryStore::new(100, None);

    store.insert("A", "a", TTL, 40, now);
    store.insert("B", "b", TTL, 40, now);
    let outcome = store.insert("C", "c", TTL, 40, now);

    assert_eq!(outcome.evicted, vec![("A".to_string(), 40)]);
    assert!(!store.contains("A"));
    assert!(store.contains("B"));
    assert!(store.contains("C"));
    assert_eq!(store.budget().current_size_bytes, 80);
  }

  #[test]
  fn test_reads_do_not_refresh_write_order() {
    let now = Instant::now();
    let mut store = MemoryStore::new(100, None);

    store.insert("A", 1, TTL, 40, now);
    store.insert("B", 2, TTL, 40, now);
    assert!(matches!(store.lookup("A", now), Lookup::Fresh(_)));
    store.insert("C", 3, TTL, 40, now);

    assert!(!store.contains("A"));
  }

  #[test]
  fn test_overwrite_releases_old_bytes() {
    let now = Instant::now();
    let mut store = MemoryStore::new(100, None);

    store.insert("A", 1, TTL, 60, now);
    let outcome = store.insert("A", 2, TTL, 70, now);

    assert!(outcome.evicted.is_empty());
    assert_eq!(store.len(), 1);
    assert_eq!(store.budget().current_size_bytes, 70);
  }

  #[test]
  fn test_oversized_value_not_stored() {
    let now = Instant::now();
    let mut store = MemoryStore::new(100, None);
    store.insert("A", 1, TTL, 50, now);

    let outcome = store.insert("B", 2, TTL, 101, now);

    assert!(!outcome.stored);
    assert!(store.contains("A"));
    assert_eq!(store.budget().current_size_bytes, 50);
  }

  #[test]
  fn test_entry_count_budget() {
    let now = Instant::now();
    let mut store = MemoryStore::new(1_000, Some(2));

    store.insert("A", 1, TTL, 1, now);
    store.insert("B", 2, TTL, 1, now);
    store.insert("C", 3, TTL, 1, now);

    assert_eq!(store.len(), 2);
    assert!(!store.contains("A"));
  }

  #[test]
  fn test_expiry_and_purge() {
    let now = Instant::now();
    let mut store = MemoryStore::new(100, None);
    store.insert("A", 1, Duration::from_secs(1), 10, now);
    store.insert("B", 2, Duration::from_secs(120), 10, now);

    let later = now + Duration::from_secs(2);
    assert!(matches!(store.lookup("A", later), Lookup::Expired(_)));
    assert!(matches!(store.lookup("B", later), Lookup::Fresh(_)));

    assert_eq!(store.purge_expired(later), 1);
    assert_eq!(store.budget().current_size_bytes, 10);
  }

  #[test]
  fn test_clear_resets_budget() {
    let now = Instant::now();
    let mut store = MemoryStore::new(100, None);
    store.insert("A", 1, TTL, 30, now);
    store.insert("B", 2, TTL, 30, now);

    store.clear();

    assert!(store.is_empty());
    assert_eq!(store.budget().current_size_bytes, 0);
    assert_eq!(store.budget().entry_count, 0);
  }

  proptest! {
    #[test]
    fn prop_budget_never_exceeded(
      max in 1usize..2_000,
      ops in prop::collection::vec((0u8..16, 0usize..600), 1..200),
    ) {
      let now = Instant::now();
      let mut store = MemoryStore::new(max, None);

      for (key, size) in ops {
        store.insert(&format!("k{}", key), (), TTL, size, now);
        let budget = store.budget();
        prop_assert!(budget.current_size_bytes <= budget.max_size_bytes);
        prop_assert_eq!(budget.entry_count, store.len());
      }
    }
  }
}
