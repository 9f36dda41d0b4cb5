//! Durable storage for offline mutation records.

use chrono::{DateTime, SecondsFormat, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Mutex;

use super::record::{OfflineMutationRecord, SyncStatus};

/// Trait for outbox storage backends.
///
/// Records are keyed by provisional id. `save` is an upsert.
pub trait OutboxStore: Send + Sync {
  /// Insert or replace a record.
  fn save(&self, record: &OfflineMutationRecord) -> Result<()>;

  /// Get a record by provisional id.
  fn get(&self, provisional_id: &str) -> Result<Option<OfflineMutationRecord>>;

  /// All records, oldest first.
  fn list(&self) -> Result<Vec<OfflineMutationRecord>>;

  /// Remove a record. Returns whether it existed.
  fn delete(&self, provisional_id: &str) -> Result<bool>;

  /// Move a record from `Pending` to `Syncing` in one step.
  ///
  /// Returns false when the record is gone or not pending, which means some
  /// other synchronizer got to it first.
  fn claim(&self, provisional_id: &str) -> Result<bool>;

  /// Remember the id the remote store gave a synced create.
  fn save_mapping(&self, provisional_id: &str, remote_id: &str) -> Result<()>;

  /// Remote id recorded for a synced create.
  fn mapping(&self, provisional_id: &str) -> Result<Option<String>>;
}

/// Store that keeps records in memory only.
/// Used for tests and when persistence is not wanted.
#[derive(Default)]
pub struct MemoryOutboxStore {
  records: Mutex<BTreeMap<String, OfflineMutationRecord>>,
  mappings: Mutex<HashMap<String, String>>,
}

impl MemoryOutboxStore {
  pub fn new() -> Self {
    Self::default()
  }
}

impl OutboxStore for MemoryOutboxStore {
  fn save(&self, record: &OfflineMutationRecord) -> Result<()> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    records.insert(record.provisional_id.clone(), record.clone());
    Ok(())
  }

  fn get(&self, provisional_id: &str) -> Result<Option<OfflineMutationRecord>> {
    let records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(records.get(provisional_id).cloned())
  }

  fn list(&self) -> Result<Vec<OfflineMutationRecord>> {
    let records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let mut out: Vec<OfflineMutationRecord> = records.values().cloned().collect();
    out.sort_by(|a, b| {
      a.created_at
        .cmp(&b.created_at)
        .then_with(|| a.provisional_id.cmp(&b.provisional_id))
    });
    Ok(out)
  }

  fn delete(&self, provisional_id: &str) -> Result<bool> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(records.remove(provisional_id).is_some())
  }

  fn claim(&self, provisional_id: &str) -> Result<bool> {
    let mut records = self
      .records
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    match records.get_mut(provisional_id) {
      Some(record) if record.sync_status == SyncStatus::Pending => {
        record.sync_status = SyncStatus::Syncing;
        Ok(true)
      }
      _ => Ok(false),
    }
  }

  fn save_mapping(&self, provisional_id: &str, remote_id: &str) -> Result<()> {
    let mut mappings = self
      .mappings
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    mappings.insert(provisional_id.to_string(), remote_id.to_string());
    Ok(())
  }

  fn mapping(&self, provisional_id: &str) -> Result<Option<String>> {
    let mappings = self
      .mappings
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    Ok(mappings.get(provisional_id).cloned())
  }
}

/// SQLite-based outbox storage implementation.
pub struct SqliteOutboxStore {
  conn: Mutex<Connection>,
}

impl SqliteOutboxStore {
  /// Open (or create) the outbox database at `path`.
  pub fn open(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create outbox directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open outbox database at {}: {}", path.display(), e))?;

    let store = Self {
      conn: Mutex::new(conn),
    };
    store.run_migrations()?;

    Ok(store)
  }

  /// Run database migrations for the outbox table.
  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(OUTBOX_SCHEMA)
      .map_err(|e| eyre!("Failed to run outbox migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for the outbox table.
const OUTBOX_SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;

CREATE TABLE IF NOT EXISTS outbox (
    provisional_id TEXT PRIMARY KEY,
    entity_type TEXT NOT NULL,
    action TEXT NOT NULL,
    target_id TEXT,
    payload BLOB NOT NULL,
    created_at TEXT NOT NULL,
    sync_status TEXT NOT NULL,
    attempts INTEGER NOT NULL DEFAULT 0,
    last_error TEXT,
    remote_id TEXT
);

CREATE INDEX IF NOT EXISTS idx_outbox_status
    ON outbox(sync_status, created_at);

CREATE TABLE IF NOT EXISTS id_map (
    provisional_id TEXT PRIMARY KEY,
    remote_id TEXT NOT NULL,
    synced_at TEXT NOT NULL
);
"#;

const SELECT_COLUMNS: &str = "SELECT provisional_id, entity_type, action, target_id, payload, \
   created_at, sync_status, attempts, last_error, remote_id FROM outbox";

/// Raw column values; decoding happens outside the rusqlite callback.
type RawRecord = (
  String,
  String,
  String,
  Option<String>,
  Vec<u8>,
  String,
  String,
  u32,
  Option<String>,
  Option<String>,
);

fn read_row(row: &Row<'_>) -> rusqlite::Result<RawRecord> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
    row.get(6)?,
    row.get(7)?,
    row.get(8)?,
    row.get(9)?,
  ))
}

fn decode(raw: RawRecord) -> Result<OfflineMutationRecord> {
  let (
    provisional_id,
    entity_type,
    action,
    target_id,
    payload,
    created_at,
    status,
    attempts,
    last_error,
    remote_id,
  ) = raw;

  Ok(OfflineMutationRecord {
    action: action
      .parse()
      .map_err(|e| eyre!("Bad action for {}: {}", provisional_id, e))?,
    payload: serde_json::from_slice(&payload)
      .map_err(|e| eyre!("Failed to deserialize payload for {}: {}", provisional_id, e))?,
    created_at: parse_datetime(&created_at)?,
    sync_status: status
      .parse()
      .map_err(|e| eyre!("Bad status for {}: {}", provisional_id, e))?,
    provisional_id,
    entity_type,
    target_id,
    attempts,
    last_error,
    remote_id,
  })
}

impl OutboxStore for SqliteOutboxStore {
  fn save(&self, record: &OfflineMutationRecord) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;
    let payload =
      serde_json::to_vec(&record.payload).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO outbox (provisional_id, entity_type, action, target_id, payload, created_at, sync_status, attempts, last_error, remote_id)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
          record.provisional_id,
          record.entity_type,
          record.action.as_str(),
          record.target_id,
          payload,
          format_datetime(&record.created_at),
          record.sync_status.as_str(),
          record.attempts,
          record.last_error,
          record.remote_id,
        ],
      )
      .map_err(|e| eyre!("Failed to store outbox record: {}", e))?;

    Ok(())
  }

  fn get(&self, provisional_id: &str) -> Result<Option<OfflineMutationRecord>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let raw = conn
      .query_row(
        &format!("{} WHERE provisional_id = ?", SELECT_COLUMNS),
        params![provisional_id],
        read_row,
      )
      .optional()
      .map_err(|e| eyre!("Failed to query outbox record: {}", e))?;

    raw.map(decode).transpose()
  }

  fn list(&self) -> Result<Vec<OfflineMutationRecord>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare(&format!(
        "{} ORDER BY created_at, provisional_id",
        SELECT_COLUMNS
      ))
      .map_err(|e| eyre!("Failed to prepare outbox query: {}", e))?;

    let raws: Vec<RawRecord> = stmt
      .query_map([], read_row)
      .map_err(|e| eyre!("Failed to query outbox: {}", e))?
      .collect::<rusqlite::Result<_>>()
      .map_err(|e| eyre!("Failed to read outbox row: {}", e))?;

    raws.into_iter().map(decode).collect()
  }

  fn delete(&self, provisional_id: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let deleted = conn
      .execute(
        "DELETE FROM outbox WHERE provisional_id = ?",
        params![provisional_id],
      )
      .map_err(|e| eyre!("Failed to delete outbox record: {}", e))?;

    Ok(deleted > 0)
  }

  fn claim(&self, provisional_id: &str) -> Result<bool> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    // Conditional update, so two processes sharing the file cannot both win
    let claimed = conn
      .execute(
        "UPDATE outbox SET sync_status = ? WHERE provisional_id = ? AND sync_status = ?",
        params![
          SyncStatus::Syncing.as_str(),
          provisional_id,
          SyncStatus::Pending.as_str()
        ],
      )
      .map_err(|e| eyre!("Failed to claim outbox record: {}", e))?;

    Ok(claimed > 0)
  }

  fn save_mapping(&self, provisional_id: &str, remote_id: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute(
        "INSERT OR REPLACE INTO id_map (provisional_id, remote_id, synced_at) VALUES (?, ?, ?)",
        params![provisional_id, remote_id, format_datetime(&Utc::now())],
      )
      .map_err(|e| eyre!("Failed to store id mapping: {}", e))?;

    Ok(())
  }

  fn mapping(&self, provisional_id: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT remote_id FROM id_map WHERE provisional_id = ?",
        params![provisional_id],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to query id mapping: {}", e))
  }
}

/// Fixed-width RFC 3339 so that text order matches time order.
fn format_datetime(dt: &DateTime<Utc>) -> String {
  dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  DateTime::parse_from_rfc3339(s)
    .map(|dt| dt.with_timezone(&Utc))
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
