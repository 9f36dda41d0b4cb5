//! Offline write queue ("outbox") and its synchronizer.
//!
//! A write that cannot reach the remote store is persisted as an
//! [`OfflineMutationRecord`] under a provisional id and answered locally.
//! The [`Synchronizer`] replays those records later and maps provisional ids
//! to the ids the remote store assigns.

mod derive;
mod queue;
mod record;
mod store;
mod sync;

pub use derive::{Derivation, LineItemTotals};
pub use queue::{discard_record, recover_records, retry_record, OfflineWriteQueue};
pub use record::{
  is_provisional, new_provisional_id, OfflineMutationRecord, SyncStatus, PROVISIONAL_PREFIX,
};
pub use store::{MemoryOutboxStore, OutboxStore, SqliteOutboxStore};
pub use sync::{SyncReport, Synchronizer};
