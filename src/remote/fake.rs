//! In-process remote store for tests: counts calls, injects latency and failures.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::error::{DataError, DataResult};
use crate::query::{FilterOp, QueryDescriptor};

use super::{entity_id, Action, Entity, Mutation, RemoteQuery, RemoteWrite, ResultSet};

#[derive(Default)]
pub(crate) struct FakeBackend {
  rows: Mutex<HashMap<String, Vec<Entity>>>,
  latency: Mutex<Duration>,
  fail_queries: AtomicBool,
  fail_writes: AtomicBool,
  malformed: AtomicBool,
  query_calls: AtomicU32,
  write_calls: AtomicU32,
  next_id: AtomicU64,
}

impl FakeBackend {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn with_rows(self, collection: &str, rows: Vec<Entity>) -> Self {
    self
      .rows
      .lock()
      .unwrap()
      .insert(collection.to_string(), rows);
    self
  }

  pub(crate) fn set_latency(&self, latency: Duration) {
    *self.latency.lock().unwrap() = latency;
  }

  pub(crate) fn fail_queries(&self, fail: bool) {
    self.fail_queries.store(fail, Ordering::SeqCst);
  }

  pub(crate) fn fail_writes(&self, fail: bool) {
    self.fail_writes.store(fail, Ordering::SeqCst);
  }

  pub(crate) fn return_malformed(&self, malformed: bool) {
    self.malformed.store(malformed, Ordering::SeqCst);
  }

  pub(crate) fn query_calls(&self) -> u32 {
    self.query_calls.load(Ordering::SeqCst)
  }

  pub(crate) fn write_calls(&self) -> u32 {
    self.write_calls.load(Ordering::SeqCst)
  }

  pub(crate) fn stored(&self, collection: &str) -> Vec<Entity> {
    self
      .rows
      .lock()
      .unwrap()
      .get(collection)
      .cloned()
      .unwrap_or_default()
  }

  async fn delay(&self) {
    let latency = *self.latency.lock().unwrap();
    if !latency.is_zero() {
      tokio::time::sleep(latency).await;
    }
  }
}

fn matches(entity: &Entity, field: &str, op: FilterOp, value: &str) -> bool {
  let actual = match entity.get(field) {
    Some(Value::String(s)) => s.clone(),
    Some(other) => other.to_string(),
    None => return false,
  };
  match op {
    FilterOp::Eq => actual == value,
    FilterOp::Neq => actual != value,
    // Only equality is needed by the tests
    _ => true,
  }
}

/// Build an entity from a JSON literal.
pub(crate) fn entity(value: Value) -> Entity {
  match value {
    Value::Object(map) => map,
    other => panic!("not an object: {}", other),
  }
}

#[async_trait]
impl RemoteQuery for FakeBackend {
  async fn fetch(&self, query: &QueryDescriptor) -> DataResult<ResultSet> {
    self.query_calls.fetch_add(1, Ordering::SeqCst);
    self.delay().await;

    if self.fail_queries.load(Ordering::SeqCst) {
      return Err(DataError::Remote("injected failure".to_string()));
    }
    if self.malformed.load(Ordering::SeqCst) {
      return Err(DataError::Serialization("expected array".to_string()));
    }

    let rows: Vec<Entity> = self
      .stored(&query.collection)
      .into_iter()
      .filter(|e| {
        query
          .filters
          .iter()
          .all(|f| matches(e, &f.field, f.op, &f.value))
      })
      .collect();
    let total = rows.len() as u64;
    Ok(ResultSet {
      rows,
      total: Some(total),
    })
  }
}

#[async_trait]
impl RemoteWrite for FakeBackend {
  async fn apply(&self, mutation: &Mutation) -> DataResult<Entity> {
    self.write_calls.fetch_add(1, Ordering::SeqCst);
    self.delay().await;

    if self.fail_writes.load(Ordering::SeqCst) {
      return Err(DataError::Remote("injected failure".to_string()));
    }

    let mut rows = self.rows.lock().unwrap();
    let collection = rows.entry(mutation.entity_type.clone()).or_default();
    let target = mutation.target_id.as_deref();
    let position = target.and_then(|id| {
      collection
        .iter()
        .position(|e| entity_id(e).as_deref() == Some(id))
    });

    match mutation.action {
      Action::Create => {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let mut created = mutation.payload.clone();
        created.insert("id".to_string(), Value::String(format!("srv-{}", id)));
        collection.push(created.clone());
        Ok(created)
      }
      Action::Update => {
        let idx = position
          .ok_or_else(|| DataError::NotFound(target.unwrap_or_default().to_string()))?;
        for (k, v) in &mutation.payload {
          collection[idx].insert(k.clone(), v.clone());
        }
        Ok(collection[idx].clone())
      }
      Action::Delete => {
        let idx = position
          .ok_or_else(|| DataError::NotFound(target.unwrap_or_default().to_string()))?;
        Ok(collection.remove(idx))
      }
    }
  }
}
