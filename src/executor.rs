//! Deadline-bound, retrying execution of a single remote query.

use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::{FailurePolicy, QueryConfig};
use crate::error::{DataError, DataResult};
use crate::event::{DataEvent, EventSink};
use crate::metrics::Metrics;
use crate::query::QueryDescriptor;
use crate::remote::{RemoteQuery, ResultSet};

/// Runs queries against the remote store with a per-attempt deadline,
/// bounded retries and exponential backoff.
///
/// An attempt that overruns its deadline is dropped, not cancelled on the
/// server; its outcome is unknown.
#[derive(Clone)]
pub struct QueryExecutor {
  remote: Arc<dyn RemoteQuery>,
  config: QueryConfig,
  metrics: Arc<Metrics>,
  events: EventSink,
}

impl QueryExecutor {
  pub fn new(remote: Arc<dyn RemoteQuery>, config: QueryConfig) -> Self {
    Self {
      remote,
      config,
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

  pub fn policy(&self) -> FailurePolicy {
    self.config.failure_policy
  }

  /// Delay before retry number `attempt + 1`: `2^attempt * base`, capped.
  pub fn backoff_for(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    self
      .config
      .base_backoff()
      .saturating_mul(factor)
      .min(self.config.max_backoff())
  }

  /// Execute under the configured failure policy.
  ///
  /// Lenient: once every attempt has failed, the failure is logged, counted
  /// and published as [`DataEvent::QueryFailed`], and an empty result set is
  /// returned. Strict: the last error is returned instead.
  pub async fn execute(&self, query: &QueryDescriptor) -> DataResult<ResultSet> {
    match self.try_execute(query).await {
      Ok(rows) => Ok(rows),
      Err(e) => match self.config.failure_policy {
        FailurePolicy::Lenient => {
          debug!(query = %query.description(), "serving empty result after failure");
          Ok(ResultSet::empty())
        }
        FailurePolicy::Strict => Err(e),
      },
    }
  }

  /// Execute and return the last error if every attempt fails, whatever the policy.
  pub async fn try_execute(&self, query: &QueryDescriptor) -> DataResult<ResultSet> {
    let description = query.description();
    let (result, attempts) = self.run(query, &description).await;

    if let Err(e) = &result {
      self.metrics.record_query_failure();
      warn!(query = %description, attempts, error = %e, "query failed");
      self.events.emit(DataEvent::QueryFailed {
        description,
        attempts,
        error: e.to_string(),
      });
    }
    result
  }

  /// The attempt loop. Returns the outcome and the number of attempts made.
  async fn run(&self, query: &QueryDescriptor, description: &str) -> (DataResult<ResultSet>, u32) {
    if let Err(e) = query.validate() {
      return (Err(e), 0);
    }

    let deadline = query.deadline.unwrap_or_else(|| self.config.deadline());
    let max_retries = query.max_retries.unwrap_or(self.config.max_retries);
    let mut attempt = 0u32;

    loop {
      self.metrics.record_attempt();

      let outcome = match timeout(deadline, self.remote.fetch(query)).await {
        Ok(result) => result,
        Err(_) => {
          self.metrics.record_timeout();
          Err(DataError::Timeout { after: deadline })
        }
      };

      let error = match outcome {
        Ok(rows) => {
          debug!(query = %description, attempt, rows = rows.len(), "query succeeded");
          return (Ok(rows), attempt + 1);
        }
        Err(e) => e,
      };

      if !error.is_retryable() || attempt >= max_retries {
        return (Err(error), attempt + 1);
      }

      let backoff = self.backoff_for(attempt);
      warn!(query = %description, attempt, ?backoff, error = %error, "query attempt failed, retrying");
      self.events.emit(DataEvent::AttemptFailed {
        description: description.to_string(),
        attempt,
        backoff,
        error: error.to_string(),
      });
      tokio::time::sleep(backoff).await;
      attempt += 1;
    }
  }
}
