use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::OutboxConfig;
use crate::error::{DataError, DataResult};
use crate::event::{DataEvent, EventSink};
use crate::metrics::Metrics;
use crate::remote::{Action, Entity, Mutation, RemoteWrite};

use super::derive::Derivation;
use super::record::{is_provisional, OfflineMutationRecord, SyncStatus};
use super::store::OutboxStore;

/// Write path that never loses a mutation.
///
/// Writes go straight to the remote store when it answers in time. Anything
/// else is persisted as an [`OfflineMutationRecord`] and the caller gets a
/// provisional entity back. Clones share the same store and online flag.
#[derive(Clone)]
pub struct OfflineWriteQueue {
  pub(super) remote: Arc<dyn RemoteWrite>,
  store: Arc<dyn OutboxStore>,
  derivations: HashMap<String, Arc<dyn Derivation>>,
  pub(super) write_timeout: Duration,
  online: Arc<AtomicBool>,
  pub(super) metrics: Arc<Metrics>,
  pub(super) events: EventSink,
}

impl OfflineWriteQueue {
  /// Open the queue over `store`.
  ///
  /// Records another process is replaying are left alone. The process that
  /// owns the outbox calls [`recover_interrupted`](Self::recover_interrupted)
  /// after a crash.
  pub fn new(
    remote: Arc<dyn RemoteWrite>,
    store: Arc<dyn OutboxStore>,
    config: &OutboxConfig,
  ) -> DataResult<Self> {
    Ok(Self {
      remote,
      store,
      derivations: HashMap::new(),
      write_timeout: config.write_timeout(),
      online: Arc::new(AtomicBool::new(true)),
      metrics: Arc::new(Metrics::new()),
      events: EventSink::disabled(),
    })
  }

  pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
    self.metrics = metrics;
    self
  }

  pub fn with_events(mut self, events: EventSink) -> Self {
    self.events = events;
    self
  }

  /// Register a derivation for payloads of `entity_type`.
  pub fn with_derivation(
    mut self,
    entity_type: impl Into<String>,
    derivation: impl Derivation + 'static,
  ) -> Self {
    self
      .derivations
      .insert(entity_type.into(), Arc::new(derivation));
    self
  }

  /// While offline, writes are queued without trying the remote store.
  pub fn set_online(&self, online: bool) {
    let was = self.online.swap(online, Ordering::SeqCst);
    if was != online {
      info!(online, "outbox connectivity changed");
    }
  }

  pub fn is_online(&self) -> bool {
    self.online.load(Ordering::SeqCst)
  }

  /// Apply a mutation remotely, or queue it and return a provisional entity.
  ///
  /// Only a failure of the local store is returned as an error.
  pub async fn write(&self, mut mutation: Mutation) -> DataResult<Entity> {
    if let Some(target) = mutation.target_id.as_deref().filter(|t| is_provisional(t)) {
      if let Some(remote_id) = self.mapped(target)? {
        mutation.target_id = Some(remote_id);
      }
    }

    let reason = match self.blocked_reason(&mutation) {
      Some(reason) => reason,
      None => match self.apply_remote(&mutation).await {
        Ok(entity) => {
          self.metrics.record_confirmed_write();
          return Ok(entity);
        }
        Err(e) => e,
      },
    };

    self.enqueue(mutation, reason)
  }

  /// Why the remote store must not be tried for this mutation, if anything.
  fn blocked_reason(&self, mutation: &Mutation) -> Option<DataError> {
    if !self.is_online() {
      return Some(DataError::OfflineUnavailable);
    }
    // The remote store has never seen a provisional id
    match &mutation.target_id {
      Some(target) if is_provisional(target) => Some(DataError::NotFound(format!(
        "{} has not been synced yet",
        target
      ))),
      _ => None,
    }
  }

  pub(super) async fn apply_remote(&self, mutation: &Mutation) -> DataResult<Entity> {
    match tokio::time::timeout(self.write_timeout, self.remote.apply(mutation)).await {
      Ok(result) => result,
      Err(_) => Err(DataError::Timeout {
        after: self.write_timeout,
      }),
    }
  }

  fn enqueue(&self, mut mutation: Mutation, reason: DataError) -> DataResult<Entity> {
    if mutation.action != Action::Delete {
      if let Some(derivation) = self.derivations.get(&mutation.entity_type) {
        derivation.apply(&mut mutation.payload);
      }
    }

    let record = OfflineMutationRecord::new(mutation);
    self.save(&record)?;

    self.metrics.record_queued_write();
    warn!(
      provisional_id = %record.provisional_id,
      entity_type = %record.entity_type,
      action = record.action.as_str(),
      reason = %reason,
      "write queued offline"
    );
    self.events.emit(DataEvent::WriteQueued {
      provisional_id: record.provisional_id.clone(),
      entity_type: record.entity_type.clone(),
      reason: reason.to_string(),
    });

    Ok(record.provisional_entity())
  }

  /// Records awaiting sync or operator action, oldest first.
  pub fn pending(&self) -> DataResult<Vec<OfflineMutationRecord>> {
    self.list_where(|s| matches!(s, SyncStatus::Pending | SyncStatus::Failed))
  }

  /// Records that ran out of sync attempts.
  pub fn exhausted(&self) -> DataResult<Vec<OfflineMutationRecord>> {
    self.list_where(|s| s == SyncStatus::Failed)
  }

  pub fn get(&self, provisional_id: &str) -> DataResult<Option<OfflineMutationRecord>> {
    self.store.get(provisional_id).map_err(storage_error)
  }

  /// The confirmed id for `id`.
  ///
  /// Non-provisional ids resolve to themselves. A provisional id resolves
  /// once its create has synced, and is `None` while the create waits. A
  /// create that ran out of attempts is [`DataError::SyncExhausted`]; an id
  /// with neither a mapping nor a record is `NotFound`.
  pub fn resolve(&self, id: &str) -> DataResult<Option<String>> {
    if !is_provisional(id) {
      return Ok(Some(id.to_string()));
    }
    if let Some(remote_id) = self.mapped(id)? {
      return Ok(Some(remote_id));
    }

    match self.get(id)? {
      Some(record) if record.sync_status == SyncStatus::Failed => Err(DataError::SyncExhausted {
        provisional_id: record.provisional_id,
        attempts: record.attempts,
      }),
      Some(_) => Ok(None),
      None => Err(DataError::NotFound(id.to_string())),
    }
  }

  fn mapped(&self, provisional_id: &str) -> DataResult<Option<String>> {
    self.store.mapping(provisional_id).map_err(storage_error)
  }

  /// Put a `Failed` record back in line with a fresh attempt budget.
  pub fn retry(&self, provisional_id: &str) -> DataResult<OfflineMutationRecord> {
    retry_record(self.store.as_ref(), provisional_id)
  }

  /// Drop a record for good.
  pub fn discard(&self, provisional_id: &str) -> DataResult<()> {
    discard_record(self.store.as_ref(), provisional_id)
  }

  /// Reset records a crashed sync pass left `Syncing`. Returns how many.
  ///
  /// Only safe while no other synchronizer is working on the same store.
  pub fn recover_interrupted(&self) -> DataResult<usize> {
    recover_records(self.store.as_ref())
  }

  pub(super) fn list_where(
    &self,
    keep: impl Fn(SyncStatus) -> bool,
  ) -> DataResult<Vec<OfflineMutationRecord>> {
    let records = self.store.list().map_err(storage_error)?;
    Ok(records.into_iter().filter(|r| keep(r.sync_status)).collect())
  }

  pub(super) fn save(&self, record: &OfflineMutationRecord) -> DataResult<()> {
    self.store.save(record).map_err(storage_error)
  }

  pub(super) fn claim(&self, provisional_id: &str) -> DataResult<bool> {
    self.store.claim(provisional_id).map_err(storage_error)
  }

  /// Finish a replayed record: remember the id, drop the record and point
  /// later records at the confirmed id. Returns the record as synced.
  pub(super) fn complete(
    &self,
    mut record: OfflineMutationRecord,
    remote_id: Option<String>,
  ) -> DataResult<OfflineMutationRecord> {
    if let (Action::Create, Some(remote_id)) = (record.action, &remote_id) {
      self
        .store
        .save_mapping(&record.provisional_id, remote_id)
        .map_err(storage_error)?;
      self.retarget(&record.provisional_id, remote_id)?;
    }

    self
      .store
      .delete(&record.provisional_id)
      .map_err(storage_error)?;
    record.sync_status = SyncStatus::Synced;
    record.remote_id = remote_id;

    self.metrics.record_synced();
    debug!(provisional_id = %record.provisional_id, remote_id = ?record.remote_id, "outbox record synced");
    self.events.emit(DataEvent::Synced {
      provisional_id: record.provisional_id.clone(),
      remote_id: record.remote_id.clone(),
    });
    Ok(record)
  }

  /// Rewrite stored records that target `provisional_id`.
  fn retarget(&self, provisional_id: &str, remote_id: &str) -> DataResult<()> {
    let dependents = self.list_where(|_| true)?;
    for mut dependent in dependents
      .into_iter()
      .filter(|r| r.target_id.as_deref() == Some(provisional_id))
    {
      dependent.target_id = Some(remote_id.to_string());
      self.save(&dependent)?;
    }
    Ok(())
  }

}

/// Put a `Failed` record back to `Pending` with a fresh attempt budget.
///
/// Works on the store alone, so operator tooling does not need a remote.
pub fn retry_record(
  store: &dyn OutboxStore,
  provisional_id: &str,
) -> DataResult<OfflineMutationRecord> {
  let mut record = store
    .get(provisional_id)
    .map_err(storage_error)?
    .ok_or_else(|| DataError::NotFound(provisional_id.to_string()))?;
  if record.sync_status != SyncStatus::Failed {
    return Err(DataError::Storage(format!(
      "{} is {}, only failed records can be retried",
      provisional_id, record.sync_status
    )));
  }

  record.sync_status = SyncStatus::Pending;
  record.attempts = 0;
  store.save(&record).map_err(storage_error)?;
  info!(%provisional_id, "outbox record requeued");
  Ok(record)
}

/// Reset every `Syncing` record to `Pending`. Returns how many were reset.
pub fn recover_records(store: &dyn OutboxStore) -> DataResult<usize> {
  let mut reset = 0;
  for mut record in store.list().map_err(storage_error)? {
    if record.sync_status != SyncStatus::Syncing {
      continue;
    }
    warn!(provisional_id = %record.provisional_id, "resetting interrupted sync");
    record.sync_status = SyncStatus::Pending;
    store.save(&record).map_err(storage_error)?;
    reset += 1;
  }
  Ok(reset)
}

/// Delete a record for good.
pub fn discard_record(store: &dyn OutboxStore, provisional_id: &str) -> DataResult<()> {
  if !store.delete(provisional_id).map_err(storage_error)? {
    return Err(DataError::NotFound(provisional_id.to_string()));
  }
  warn!(%provisional_id, "outbox record discarded");
  Ok(())
}

fn storage_error(e: color_eyre::Report) -> DataError {
  DataError::Storage(e.to_string())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::outbox::derive::LineItemTotals;
  use crate::outbox::store::MemoryOutboxStore;
  use crate::remote::entity_id;
  use crate::remote::fake::{entity, FakeBackend};
  use serde_json::json;

  fn queue_with(remote: Arc<FakeBackend>) -> (OfflineWriteQueue, Arc<MemoryOutboxStore>) {
    let store = Arc::new(MemoryOutboxStore::new());
    let queue = OfflineWriteQueue::new(remote, store.clone(), &OutboxConfig::default())
      .unwrap()
      .with_derivation("repairs", LineItemTotals::default());
    (queue, store)
  }

  fn repair() -> Entity {
    entity(json!({
      "title": "Replace seal",
      "line_items": [{"quantity": 2, "unit_price": 12.5}],
    }))
  }

  #[tokio::test]
  async fn test_online_write_returns_confirmed_entity() {
    let remote = Arc::new(FakeBackend::new());
    let (queue, store) = queue_with(remote.clone());

    let saved = queue.write(Mutation::create("repairs", repair())).await.unwrap();

    assert_eq!(entity_id(&saved), Some("srv-1".to_string()));
    assert!(!saved.contains_key("offline"));
    assert!(store.list().unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_failed_write_is_queued_with_provisional_id() {
    let remote = Arc::new(FakeBackend::new());
    remote.fail_writes(true);
    let (sink, mut events) = EventSink::channel();
    let (queue, store) = queue_with(remote.clone());
    let queue = queue.with_events(sink);

    let saved = queue.write(Mutation::create("repairs", repair())).await.unwrap();

    let id = entity_id(&saved).unwrap();
    assert!(is_provisional(&id));
    assert_eq!(saved["offline"], json!(true));
    assert_eq!(saved["total_cost"], json!(25.0));

    let stored = store.get(&id).unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Pending);
    assert_eq!(stored.payload["total_cost"], json!(25.0));
    assert!(matches!(
      events.drain().as_slice(),
      [DataEvent::WriteQueued { provisional_id, .. }] if *provisional_id == id
    ));
  }

  #[tokio::test]
  async fn test_offline_skips_remote() {
    let remote = Arc::new(FakeBackend::new());
    let (queue, _store) = queue_with(remote.clone());
    queue.set_online(false);

    let saved = queue.write(Mutation::create("repairs", repair())).await.unwrap();

    assert_eq!(remote.write_calls(), 0);
    assert_eq!(saved["offline"], json!(true));
    assert_eq!(queue.pending().unwrap().len(), 1);
  }

  #[tokio::test(start_paused = true)]
  async fn test_slow_remote_write_is_queued_after_timeout() {
    let remote = Arc::new(FakeBackend::new());
    remote.set_latency(Duration::from_secs(60));
    let (queue, _store) = queue_with(remote.clone());

    let saved = queue.write(Mutation::create("repairs", repair())).await.unwrap();

    assert_eq!(saved["offline"], json!(true));
  }

  #[tokio::test]
  async fn test_update_of_unsynced_entity_is_queued() {
    let remote = Arc::new(FakeBackend::new());
    let (queue, _store) = queue_with(remote.clone());

    let saved = queue
      .write(Mutation::update(
        "repairs",
        "offline-0192",
        entity(json!({"status": "closed"})),
      ))
      .await
      .unwrap();

    assert_eq!(remote.write_calls(), 0);
    assert_eq!(saved["id"], json!("offline-0192"));
  }

  #[tokio::test]
  async fn test_resolve_reports_each_state() {
    let (queue, store) = queue_with(Arc::new(FakeBackend::new()));
    assert_eq!(queue.resolve("srv-4"), Ok(Some("srv-4".to_string())));
    assert!(matches!(
      queue.resolve("offline-unknown"),
      Err(DataError::NotFound(_))
    ));

    queue.set_online(false);
    let saved = queue.write(Mutation::create("repairs", repair())).await.unwrap();
    let id = entity_id(&saved).unwrap();
    assert_eq!(queue.resolve(&id), Ok(None));

    let mut record = store.get(&id).unwrap().unwrap();
    record.sync_status = SyncStatus::Failed;
    record.attempts = 4;
    store.save(&record).unwrap();
    assert_eq!(
      queue.resolve(&id),
      Err(DataError::SyncExhausted {
        provisional_id: id.clone(),
        attempts: 4,
      })
    );

    store.save_mapping(&id, "srv-12").unwrap();
    assert_eq!(queue.resolve(&id), Ok(Some("srv-12".to_string())));
  }

  #[tokio::test]
  async fn test_retry_and_discard() {
    let remote = Arc::new(FakeBackend::new());
    let (queue, store) = queue_with(remote.clone());
    queue.set_online(false);

    let saved = queue.write(Mutation::create("repairs", repair())).await.unwrap();
    let id = entity_id(&saved).unwrap();

    // Pending records cannot be retried
    assert!(queue.retry(&id).is_err());

    let mut record = store.get(&id).unwrap().unwrap();
    record.sync_status = SyncStatus::Failed;
    record.attempts = 5;
    store.save(&record).unwrap();
    assert_eq!(queue.exhausted().unwrap().len(), 1);

    let retried = queue.retry(&id).unwrap();
    assert_eq!(retried.sync_status, SyncStatus::Pending);
    assert_eq!(retried.attempts, 0);
    assert!(queue.exhausted().unwrap().is_empty());

    queue.discard(&id).unwrap();
    assert!(queue.pending().unwrap().is_empty());
    assert!(matches!(queue.discard(&id), Err(DataError::NotFound(_))));
  }

  #[test]
  fn test_opening_a_queue_leaves_in_flight_records_alone() {
    let store = Arc::new(MemoryOutboxStore::new());
    let record = OfflineMutationRecord::new(Mutation::create("repairs", repair()));
    store.save(&record).unwrap();
    assert!(store.claim(&record.provisional_id).unwrap());

    let _second = OfflineWriteQueue::new(
      Arc::new(FakeBackend::new()),
      store.clone(),
      &OutboxConfig::default(),
    )
    .unwrap();

    let stored = store.get(&record.provisional_id).unwrap().unwrap();
    assert_eq!(stored.sync_status, SyncStatus::Syncing);
  }

  #[test]
  fn test_recover_interrupted_resets_syncing_records() {
    let (queue, store) = queue_with(Arc::new(FakeBackend::new()));
    let mut record = OfflineMutationRecord::new(Mutation::create("repairs", repair()));
    record.sync_status = SyncStatus::Syncing;
    store.save(&record).unwrap();

    assert_eq!(queue.recover_interrupted().unwrap(), 1);
    let pending = queue.pending().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].sync_status, SyncStatus::Pending);
    assert_eq!(queue.recover_interrupted().unwrap(), 0);
  }

  #[test]
  fn test_operator_actions_need_only_the_store() {
    let store = MemoryOutboxStore::new();
    let mut record = OfflineMutationRecord::new(Mutation::create("repairs", repair()));
    record.sync_status = SyncStatus::Failed;
    record.attempts = 5;
    store.save(&record).unwrap();

    let retried = retry_record(&store, &record.provisional_id).unwrap();
    assert_eq!(retried.sync_status, SyncStatus::Pending);
    discard_record(&store, &record.provisional_id).unwrap();
    assert!(matches!(
      retry_record(&store, &record.provisional_id),
      Err(DataError::NotFound(_))
    ));
  }

  #[tokio::test]
  async fn test_store_failure_is_returned() {
    struct BrokenStore;

    impl OutboxStore for BrokenStore {
      fn save(&self, _: &OfflineMutationRecord) -> color_eyre::Result<()> {
        Err(color_eyre::eyre::eyre!("disk full"))
      }
      fn get(&self, _: &str) -> color_eyre::Result<Option<OfflineMutationRecord>> {
        Ok(None)
      }
      fn list(&self) -> color_eyre::Result<Vec<OfflineMutationRecord>> {
        Ok(Vec::new())
      }
      fn delete(&self, _: &str) -> color_eyre::Result<bool> {
        Ok(false)
      }
      fn claim(&self, _: &str) -> color_eyre::Result<bool> {
        Ok(false)
      }
      fn save_mapping(&self, _: &str, _: &str) -> color_eyre::Result<()> {
        Err(color_eyre::eyre::eyre!("disk full"))
      }
      fn mapping(&self, _: &str) -> color_eyre::Result<Option<String>> {
        Ok(None)
      }
    }

    let remote = Arc::new(FakeBackend::new());
    remote.fail_writes(true);
    let queue =
      OfflineWriteQueue::new(remote, Arc::new(BrokenStore), &OutboxConfig::default()).unwrap();

    let err = queue
      .write(Mutation::create("repairs", repair()))
      .await
      .unwrap_err();
    assert!(matches!(err, DataError::Storage(msg) if msg.contains("disk full")));
  }
}
