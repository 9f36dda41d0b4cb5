//! Offline mutation records and provisional identifiers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::remote::{Action, Entity, Mutation};

/// Prefix that marks an id as locally generated and not yet confirmed.
pub const PROVISIONAL_PREFIX: &str = "offline-";

/// Generate a fresh provisional id. UUIDv7, so ids sort by creation time.
pub fn new_provisional_id() -> String {
  format!("{}{}", PROVISIONAL_PREFIX, Uuid::now_v7())
}

/// Whether `id` was generated locally by [`new_provisional_id`].
pub fn is_provisional(id: &str) -> bool {
  id.starts_with(PROVISIONAL_PREFIX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
  /// Waiting for the synchronizer
  Pending,
  /// Being replayed right now
  Syncing,
  /// Accepted by the remote store (the record is removed right after)
  Synced,
  /// Out of sync attempts; needs an operator
  Failed,
}

impl SyncStatus {
  pub fn as_str(&self) -> &'static str {
    match self {
      SyncStatus::Pending => "pending",
      SyncStatus::Syncing => "syncing",
      SyncStatus::Synced => "synced",
      SyncStatus::Failed => "failed",
    }
  }
}

impl fmt::Display for SyncStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for SyncStatus {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "pending" => Ok(SyncStatus::Pending),
      "syncing" => Ok(SyncStatus::Syncing),
      "synced" => Ok(SyncStatus::Synced),
      "failed" => Ok(SyncStatus::Failed),
      other => Err(format!("unknown sync status '{}'", other)),
    }
  }
}

/// A write that could not reach the remote store, kept until it is replayed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineMutationRecord {
  pub provisional_id: String,
  pub entity_type: String,
  pub action: Action,
  /// Entity the update/delete applies to; may itself be provisional
  pub target_id: Option<String>,
  pub payload: Entity,
  pub created_at: DateTime<Utc>,
  pub sync_status: SyncStatus,
  pub attempts: u32,
  pub last_error: Option<String>,
  /// Id assigned by the remote store once synced
  pub remote_id: Option<String>,
}

impl OfflineMutationRecord {
  pub fn new(mutation: Mutation) -> Self {
    Self {
      provisional_id: new_provisional_id(),
      entity_type: mutation.entity_type,
      action: mutation.action,
      target_id: mutation.target_id,
      payload: mutation.payload,
      created_at: Utc::now(),
      sync_status: SyncStatus::Pending,
      attempts: 0,
      last_error: None,
      remote_id: None,
    }
  }

  pub fn to_mutation(&self) -> Mutation {
    Mutation {
      entity_type: self.entity_type.clone(),
      action: self.action,
      target_id: self.target_id.clone(),
      payload: self.payload.clone(),
    }
  }

  /// Id consumers see for the affected entity.
  ///
  /// Creates have no server id yet, so the record's own provisional id stands in.
  pub fn entity_id(&self) -> &str {
    match self.action {
      Action::Create => &self.provisional_id,
      Action::Update | Action::Delete => self.target_id.as_deref().unwrap_or(&self.provisional_id),
    }
  }

  /// The entity as callers should see it until the write is confirmed.
  pub fn provisional_entity(&self) -> Entity {
    let mut entity = self.payload.clone();
    entity.insert("id".to_string(), Value::String(self.entity_id().to_string()));
    entity.insert("offline".to_string(), Value::Bool(true));
    entity.insert(
      "pending_mutation".to_string(),
      Value::String(self.provisional_id.clone()),
    );
    if self.action == Action::Delete {
      entity.insert("deleted".to_string(), Value::Bool(true));
    }
    entity
  }
}
