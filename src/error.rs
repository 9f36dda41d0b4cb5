//! Error taxonomy for the data-access layer.

use std::time::Duration;

/// Failures the data-access layer distinguishes.
///
/// Read paths mostly absorb these (see [`FailurePolicy`](crate::config::FailurePolicy));
/// they surface through `try_*` methods, events and logs.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DataError {
  #[error("timed out after {}ms", after.as_millis())]
  Timeout { after: Duration },
  #[error("remote error: {0}")]
  Remote(String),
  #[error("not found: {0}")]
  NotFound(String),
  #[error("could not interpret response: {0}")]
  Serialization(String),
  #[error("cache miss")]
  CacheMiss,
  #[error("no path to the remote store")]
  OfflineUnavailable,
  #[error("mutation {provisional_id} failed after {attempts} sync attempts")]
  SyncExhausted {
    provisional_id: String,
    attempts: u32,
  },
  #[error("invalid query: {0}")]
  InvalidDescriptor(String),
  #[error("local storage error: {0}")]
  Storage(String),
}

impl DataError {
  /// Whether another attempt could plausibly succeed.
  pub fn is_retryable(&self) -> bool {
    matches!(self, DataError::Timeout { .. } | DataError::Remote(_))
  }
}

impl From<serde_json::Error> for DataError {
  fn from(e: serde_json::Error) -> Self {
    DataError::Serialization(e.to_string())
  }
}

impl From<reqwest::Error> for DataError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      DataError::Serialization(e.to_string())
    } else {
      DataError::Remote(e.to_string())
    }
  }
}

pub type DataResult<T> = std::result::Result<T, DataError>;
