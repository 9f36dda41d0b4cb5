//! Data client that puts the cache, executor, aggregator and outbox behind one API.

use color_eyre::{eyre::eyre, Result};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, MutexGuard};
use tokio::sync::Mutex;
use tracing::debug;

use crate::aggregate::{AggregateResult, Aggregator};
use crate::cache::{BoundedCache, CacheResult};
use crate::config::{Config, FailurePolicy, OutboxConfig};
use crate::error::DataResult;
use crate::event::EventSink;
use crate::executor::QueryExecutor;
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::outbox::{
  Derivation, OfflineWriteQueue, OutboxStore, SqliteOutboxStore, SyncReport, Synchronizer,
};
use crate::query::QueryDescriptor;
use crate::remote::{Entity, Mutation, RemoteQuery, RemoteWrite, RestBackend, ResultSet};

/// Resilient access to the remote store.
///
/// Reads go through the bounded cache, which calls the query executor on a
/// miss. Writes go through the offline queue. Clones share every component.
#[derive(Clone)]
pub struct DataClient {
  executor: QueryExecutor,
  cache: BoundedCache<ResultSet>,
  outbox: OfflineWriteQueue,
  outbox_config: OutboxConfig,
  aggregator: Aggregator,
  metrics: Arc<Metrics>,
  policy: FailurePolicy,
  /// One sync pass at a time
  sync_lock: Arc<Mutex<()>>,
  /// Cache keys issued per collection, so writes can drop them
  cached_keys: Arc<std::sync::Mutex<HashMap<String, HashSet<String>>>>,
}

impl DataClient {
  /// Create a client for the configured REST endpoint and SQLite outbox.
  pub fn new(config: &Config) -> Result<Self> {
    let url = config
      .remote
      .url
      .as_deref()
      .ok_or_else(|| eyre!("remote.url is not set in the configuration"))?;
    let backend = Arc::new(RestBackend::new(url, Config::get_api_key())?);
    let store = Arc::new(SqliteOutboxStore::open(&config.outbox.store_path()?)?);

    Ok(Self::from_parts(backend.clone(), backend, store, config)?)
  }

  /// Assemble a client from explicit remote and storage implementations.
  pub fn from_parts(
    reader: Arc<dyn RemoteQuery>,
    writer: Arc<dyn RemoteWrite>,
    store: Arc<dyn OutboxStore>,
    config: &Config,
  ) -> DataResult<Self> {
    let metrics = Arc::new(Metrics::new());

    let executor =
      QueryExecutor::new(reader, config.query.clone()).with_metrics(metrics.clone());
    let cache = BoundedCache::new(&config.cache).with_metrics(metrics.clone());
    let outbox =
      OfflineWriteQueue::new(writer, store, &config.outbox)?.with_metrics(metrics.clone());

    Ok(Self {
      executor,
      cache,
      outbox,
      outbox_config: config.outbox.clone(),
      aggregator: Aggregator::new(),
      metrics,
      policy: config.query.failure_policy,
      sync_lock: Arc::new(Mutex::new(())),
      cached_keys: Arc::new(std::sync::Mutex::new(HashMap::new())),
    })
  }

  /// Publish failure details and transitions to `sink`.
  pub fn with_events(mut self, sink: EventSink) -> Self {
    self.executor = self.executor.with_events(sink.clone());
    self.cache = self.cache.with_events(sink.clone());
    self.outbox = self.outbox.with_events(sink);
    self
  }

  /// Compute fields locally for queued writes of `entity_type`.
  pub fn with_derivation(
    mut self,
    entity_type: impl Into<String>,
    derivation: impl Derivation + 'static,
  ) -> Self {
    self.outbox = self.outbox.with_derivation(entity_type, derivation);
    self
  }

  pub fn with_aggregator(mut self, aggregator: Aggregator) -> Self {
    self.aggregator = aggregator;
    self
  }

  /// Run a query through the cache under the configured failure policy.
  ///
  /// A failure with nothing cached becomes an empty result set when the
  /// policy is lenient.
  pub async fn query(&self, query: &QueryDescriptor) -> DataResult<ResultSet> {
    match self.query_with_source(query).await {
      Ok(result) => Ok(result.data),
      Err(e) => match self.policy {
        FailurePolicy::Lenient => {
          debug!(query = %query.description(), error = %e, "serving empty result");
          Ok(ResultSet::empty())
        }
        FailurePolicy::Strict => Err(e),
      },
    }
  }

  /// Run a query through the cache, reporting where the rows came from.
  ///
  /// Failures are returned whatever the policy, so they never land in the
  /// cache as empty results.
  pub async fn query_with_source(
    &self,
    query: &QueryDescriptor,
  ) -> DataResult<CacheResult<ResultSet>> {
    let key = query.cache_key();
    self
      .keys()
      .entry(query.collection.trim().to_string())
      .or_default()
      .insert(key.clone());
    let executor = self.executor.clone();
    let owned = query.clone();

    self
      .cache
      .get_or_fetch_with_source(&key, self.cache.default_ttl(), move || async move {
        executor.try_execute(&owned).await
      })
      .await
  }

  /// Run several named queries concurrently. One failing query does not
  /// affect the others.
  pub async fn aggregate<N>(
    &self,
    queries: impl IntoIterator<Item = (N, QueryDescriptor)>,
  ) -> AggregateResult<ResultSet>
  where
    N: Into<String>,
  {
    let sources = queries.into_iter().map(move |(name, query)| {
      let source = move || async move { self.query_with_source(&query).await.map(|r| r.data) };
      (name, source)
    });

    self.aggregator.aggregate(sources).await
  }

  /// Drop the cached result of one query.
  pub fn invalidate(&self, query: &QueryDescriptor) -> bool {
    self.cache.clear_key(&query.cache_key())
  }

  /// Drop every cached query over `collection`. Returns how many entries went.
  pub fn invalidate_collection(&self, collection: &str) -> usize {
    let keys = self.keys().remove(collection.trim()).unwrap_or_default();
    let dropped = keys.iter().filter(|key| self.cache.clear_key(key)).count();
    if dropped > 0 {
      debug!(collection, dropped, "dropped cached queries after write");
    }
    dropped
  }

  /// Apply a write, queueing it offline when the remote store is unavailable.
  ///
  /// Cached queries over the written collection are dropped either way.
  pub async fn write(&self, mutation: Mutation) -> DataResult<Entity> {
    let collection = mutation.entity_type.clone();
    let entity = self.outbox.write(mutation).await?;
    self.invalidate_collection(&collection);
    Ok(entity)
  }

  /// Replay queued writes once.
  ///
  /// The cache is emptied when anything synced, since replayed writes may
  /// touch any collection.
  pub async fn sync(&self) -> DataResult<SyncReport> {
    let _guard = self.sync_lock.lock().await;
    let report = Synchronizer::new(self.outbox.clone(), &self.outbox_config)
      .sync_once()
      .await?;
    if !report.synced.is_empty() {
      self.keys().clear();
      self.cache.clear();
    }
    Ok(report)
  }

  pub fn outbox(&self) -> &OfflineWriteQueue {
    &self.outbox
  }

  pub fn cache(&self) -> &BoundedCache<ResultSet> {
    &self.cache
  }

  pub fn metrics(&self) -> MetricsSnapshot {
    self.metrics.snapshot()
  }

  fn keys(&self) -> MutexGuard<'_, HashMap<String, HashSet<String>>> {
    self
      .cached_keys
      .lock()
      .unwrap_or_else(|poisoned| poisoned.into_inner())
  }
}
