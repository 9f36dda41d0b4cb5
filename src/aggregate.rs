//! Concurrent fan-out over independent sources with partial-failure isolation.
//!
//! Every source runs concurrently on the calling task. A source that returns
//! an error, panics (while building its future or while running it) or
//! overruns the optional per-source deadline is recorded as
//! [`Outcome::Failed`]; its siblings are unaffected.

use chrono::{DateTime, Utc};
use futures::future::{join_all, FutureExt};
use std::any::Any;
use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;
use tracing::warn;

use crate::error::DataResult;

/// Settled result of one source.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
  Fulfilled(T),
  Failed(String),
}

impl<T> Outcome<T> {
  pub fn is_fulfilled(&self) -> bool {
    matches!(self, Outcome::Fulfilled(_))
  }

  pub fn value(&self) -> Option<&T> {
    match self {
      Outcome::Fulfilled(v) => Some(v),
      Outcome::Failed(_) => None,
    }
  }

  pub fn reason(&self) -> Option<&str> {
    match self {
      Outcome::Fulfilled(_) => None,
      Outcome::Failed(r) => Some(r),
    }
  }

  /// The value, or `T::default()` in place of a failure.
  pub fn value_or_default(self) -> T
  where
    T: Default,
  {
    match self {
      Outcome::Fulfilled(v) => v,
      Outcome::Failed(_) => T::default(),
    }
  }
}

/// One snapshot across several sources.
#[derive(Debug, Clone)]
pub struct AggregateResult<T> {
  pub per_source: BTreeMap<String, Outcome<T>>,
  /// When every source had settled
  pub merged_at: DateTime<Utc>,
}

impl<T> AggregateResult<T> {
  pub fn get(&self, name: &str) -> Option<&Outcome<T>> {
    self.per_source.get(name)
  }

  /// Names and reasons of the sources that failed.
  pub fn failures(&self) -> Vec<(&str, &str)> {
    self
      .per_source
      .iter()
      .filter_map(|(name, o)| o.reason().map(|r| (name.as_str(), r)))
      .collect()
  }

  pub fn all_fulfilled(&self) -> bool {
    self.per_source.values().all(Outcome::is_fulfilled)
  }

  /// Name → value map with defaults substituted for failed sources.
  pub fn merged(self) -> BTreeMap<String, T>
  where
    T: Default,
  {
    self
      .per_source
      .into_iter()
      .map(|(name, o)| (name, o.value_or_default()))
      .collect()
  }
}

/// Fans out source closures and merges their outcomes.
#[derive(Debug, Clone, Default)]
pub struct Aggregator {
  source_timeout: Option<Duration>,
}

impl Aggregator {
  pub fn new() -> Self {
    Self::default()
  }

  /// Fail any single source that has not settled within `timeout`.
  pub fn with_source_timeout(mut self, timeout: Duration) -> Self {
    self.source_timeout = Some(timeout);
    self
  }

  /// Run every source concurrently and collect one outcome per name.
  ///
  /// Duplicate names keep the outcome of the last one listed.
  pub async fn aggregate<T, N, F, Fut>(
    &self,
    sources: impl IntoIterator<Item = (N, F)>,
  ) -> AggregateResult<T>
  where
    N: Into<String>,
    F: FnOnce() -> Fut,
    Fut: Future<Output = DataResult<T>>,
  {
    let source_timeout = self.source_timeout;

    let pending = sources.into_iter().map(|(name, source)| {
      let name: String = name.into();
      // Building the future can panic too
      let started = std::panic::catch_unwind(AssertUnwindSafe(source));

      async move {
        let outcome = match started {
          Err(panic) => Outcome::Failed(panic_message(panic)),
          Ok(fut) => settle(fut, source_timeout).await,
        };
        if let Outcome::Failed(reason) = &outcome {
          warn!(source = %name, %reason, "aggregate source failed");
        }
        (name, outcome)
      }
    });

    let per_source = join_all(pending).await.into_iter().collect();

    AggregateResult {
      per_source,
      merged_at: Utc::now(),
    }
  }
}

async fn settle<T, Fut>(fut: Fut, source_timeout: Option<Duration>) -> Outcome<T>
where
  Fut: Future<Output = DataResult<T>>,
{
  let guarded = AssertUnwindSafe(fut).catch_unwind();
  let result = match source_timeout {
    Some(limit) => match tokio::time::timeout(limit, guarded).await {
      Ok(r) => r,
      Err(_) => return Outcome::Failed(format!("timed out after {}ms", limit.as_millis())),
    },
    None => guarded.await,
  };

  match result {
    Ok(Ok(value)) => Outcome::Fulfilled(value),
    Ok(Err(e)) => Outcome::Failed(e.to_string()),
    Err(panic) => Outcome::Failed(panic_message(panic)),
  }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
  if let Some(s) = panic.downcast_ref::<&str>() {
    format!("panicked: {}", s)
  } else if let Some(s) = panic.downcast_ref::<String>() {
    format!("panicked: {}", s)
  } else {
    "panicked".to_string()
  }
}
