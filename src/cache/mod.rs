//! Bounded in-memory caching layer for query results.
//!
//! This module provides a get-or-fetch cache that:
//! - Keys entries by logical query identity
//! - Charges every entry against a byte budget and evicts oldest writes first
//! - Expires entries after a per-entry TTL
//! - Serves the expired entry when a refresh fails (stale-on-error)
//! - Shares one in-flight fetch between concurrent misses on the same key

mod layer;
mod storage;
mod traits;

pub use layer::BoundedCache;
pub use storage::{BudgetState, CacheEntry};
pub use traits::{CacheResult, CacheSource, CacheStats, SizeEstimate};
