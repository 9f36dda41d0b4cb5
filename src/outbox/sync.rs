use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::config::OutboxConfig;
use crate::error::{DataError, DataResult};
use crate::event::DataEvent;
use crate::remote::{entity_id, Action};

use super::queue::OfflineWriteQueue;
use super::record::{is_provisional, OfflineMutationRecord, SyncStatus};

/// What one pass over the outbox did, by provisional id.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncReport {
  /// Accepted by the remote store, with the confirmed id when there is one
  pub synced: Vec<(String, Option<String>)>,
  /// Failed this pass, will be tried again
  pub retried: Vec<String>,
  /// Failed for the last time and now need an operator
  pub exhausted: Vec<String>,
  /// Waiting on a create that has not synced yet
  pub deferred: Vec<String>,
}

impl SyncReport {
  pub fn is_empty(&self) -> bool {
    self.synced.is_empty()
      && self.retried.is_empty()
      && self.exhausted.is_empty()
      && self.deferred.is_empty()
  }
}

/// Replays queued mutations against the remote store.
///
/// Conflicts are last-writer-wins: the queued payload overwrites whatever the
/// remote entity holds.
#[derive(Clone)]
pub struct Synchronizer {
  queue: OfflineWriteQueue,
  max_attempts: u32,
}

impl Synchronizer {
  pub fn new(queue: OfflineWriteQueue, config: &OutboxConfig) -> Self {
    Self {
      queue,
      max_attempts: config.max_sync_attempts.max(1),
    }
  }

  pub fn queue(&self) -> &OfflineWriteQueue {
    &self.queue
  }

  /// One pass over every `Pending` record, oldest first.
  ///
  /// Stops early only when the local store itself fails.
  pub async fn sync_once(&self) -> DataResult<SyncReport> {
    let mut report = SyncReport::default();

    for record in self.queue.list_where(|s| s == SyncStatus::Pending)? {
      // A create earlier in this pass may have rewritten the target
      let Some(mut record) = self.queue.get(&record.provisional_id)? else {
        continue;
      };

      if let Some(target) = record.target_id.clone().filter(|t| is_provisional(t)) {
        match self.queue.resolve(&target) {
          Ok(Some(remote_id)) => record.target_id = Some(remote_id),
          // An exhausted create may still be retried by an operator
          Ok(None) | Err(DataError::SyncExhausted { .. }) => {
            report.deferred.push(record.provisional_id.clone());
            continue;
          }
          Err(DataError::NotFound(_)) => {
            // Nothing left that could ever give the target a real id
            let reason = DataError::NotFound(format!("{} was discarded before syncing", target));
            self.exhaust(record, &reason, &mut report)?;
            continue;
          }
          Err(e) => return Err(e),
        }
      }

      if !self.queue.claim(&record.provisional_id)? {
        debug!(provisional_id = %record.provisional_id, "record claimed elsewhere, skipping");
        continue;
      }
      record.sync_status = SyncStatus::Syncing;
      self.queue.save(&record)?;

      match self.queue.apply_remote(&record.to_mutation()).await {
        Ok(entity) => {
          let remote_id = entity_id(&entity).or_else(|| record.target_id.clone());
          let synced = self.queue.complete(record, remote_id)?;
          report.synced.push((synced.provisional_id, synced.remote_id));
        }
        Err(DataError::NotFound(_)) if record.action == Action::Delete => {
          let remote_id = record.target_id.clone();
          let synced = self.queue.complete(record, remote_id)?;
          report.synced.push((synced.provisional_id, synced.remote_id));
        }
        Err(e) => self.record_failure(record, &e, &mut report)?,
      }
    }

    if !report.is_empty() {
      info!(
        synced = report.synced.len(),
        retried = report.retried.len(),
        exhausted = report.exhausted.len(),
        deferred = report.deferred.len(),
        "outbox sync pass finished"
      );
    }
    Ok(report)
  }

  fn record_failure(
    &self,
    mut record: OfflineMutationRecord,
    err: &DataError,
    report: &mut SyncReport,
  ) -> DataResult<()> {
    record.attempts += 1;
    if record.attempts >= self.max_attempts {
      return self.exhaust(record, err, report);
    }

    warn!(
      provisional_id = %record.provisional_id,
      attempts = record.attempts,
      error = %err,
      "outbox replay failed, will retry"
    );
    record.sync_status = SyncStatus::Pending;
    record.last_error = Some(err.to_string());
    self.queue.save(&record)?;
    report.retried.push(record.provisional_id);
    Ok(())
  }

  fn exhaust(
    &self,
    mut record: OfflineMutationRecord,
    err: &DataError,
    report: &mut SyncReport,
  ) -> DataResult<()> {
    record.attempts = record.attempts.max(1);
    record.sync_status = SyncStatus::Failed;
    record.last_error = Some(err.to_string());
    self.queue.save(&record)?;

    error!(
      provisional_id = %record.provisional_id,
      entity_type = %record.entity_type,
      attempts = record.attempts,
      error = %err,
      "outbox record exhausted its sync attempts"
    );
    self.queue.metrics.record_exhausted();
    self.queue.events.emit(DataEvent::SyncExhausted {
      provisional_id: record.provisional_id.clone(),
      attempts: record.attempts,
      error: err.to_string(),
    });
    report.exhausted.push(record.provisional_id);
    Ok(())
  }
}
