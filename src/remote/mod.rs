//! The remote store as seen by the data-access layer.
//!
//! Two narrow traits model the consumed APIs: [`RemoteQuery`] for reads and
//! [`RemoteWrite`] for mutations. [`RestBackend`] implements both against a
//! PostgREST-style HTTP endpoint.

mod rest;

#[cfg(test)]
pub(crate) mod fake;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::DataResult;
use crate::query::QueryDescriptor;

pub use rest::RestBackend;

/// A record as exchanged with the remote store: a JSON object.
pub type Entity = Map<String, Value>;

/// Rows returned by a remote query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSet {
  pub rows: Vec<Entity>,
  /// Total matching rows across all pages, when the backend reports it
  pub total: Option<u64>,
}

impl ResultSet {
  pub fn new(rows: Vec<Entity>) -> Self {
    Self { rows, total: None }
  }

  /// The fail-soft zero value.
  pub fn empty() -> Self {
    Self::default()
  }

  pub fn len(&self) -> usize {
    self.rows.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
  Create,
  Update,
  Delete,
}

impl Action {
  pub fn as_str(&self) -> &'static str {
    match self {
      Action::Create => "create",
      Action::Update => "update",
      Action::Delete => "delete",
    }
  }
}

impl std::str::FromStr for Action {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "create" => Ok(Action::Create),
      "update" => Ok(Action::Update),
      "delete" => Ok(Action::Delete),
      other => Err(format!("unknown action '{}'", other)),
    }
  }
}

/// A write against one entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Mutation {
  /// Collection the entity lives in (e.g. "repairs")
  pub entity_type: String,
  pub action: Action,
  /// Id of the existing entity for updates and deletes
  pub target_id: Option<String>,
  pub payload: Entity,
}

impl Mutation {
  pub fn create(entity_type: impl Into<String>, payload: Entity) -> Self {
    Self {
      entity_type: entity_type.into(),
      action: Action::Create,
      target_id: None,
      payload,
    }
  }

  pub fn update(entity_type: impl Into<String>, id: impl Into<String>, payload: Entity) -> Self {
    Self {
      entity_type: entity_type.into(),
      action: Action::Update,
      target_id: Some(id.into()),
      payload,
    }
  }

  pub fn delete(entity_type: impl Into<String>, id: impl Into<String>) -> Self {
    Self {
      entity_type: entity_type.into(),
      action: Action::Delete,
      target_id: Some(id.into()),
      payload: Entity::new(),
    }
  }
}

/// Read side of the remote store.
#[async_trait]
pub trait RemoteQuery: Send + Sync {
  /// Run one query attempt. No retries or deadlines at this level.
  async fn fetch(&self, query: &QueryDescriptor) -> DataResult<ResultSet>;
}

/// Write side of the remote store.
#[async_trait]
pub trait RemoteWrite: Send + Sync {
  /// Apply a mutation, returning the entity as confirmed by the server.
  async fn apply(&self, mutation: &Mutation) -> DataResult<Entity>;
}

/// Read the `id` field of an entity as a string, whatever its JSON type.
pub fn entity_id(entity: &Entity) -> Option<String> {
  match entity.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}
