use std::time::Duration;
use tokio::sync::mpsc;

/// Failure detail and notable transitions, published next to the fail-soft
/// return values so callers can tell "no rows" from "backend down".
#[derive(Debug, Clone, PartialEq)]
pub enum DataEvent {
  /// Every attempt for a query failed
  QueryFailed {
    description: String,
    attempts: u32,
    error: String,
  },
  /// A single attempt failed and will be retried after `backoff`
  AttemptFailed {
    description: String,
    attempt: u32,
    backoff: Duration,
    error: String,
  },
  /// A refresh failed and an expired entry was served instead
  StaleServed { key: String, error: String },
  /// An entry was dropped to stay within budget
  Evicted { key: String, size_bytes: usize },
  /// A write could not reach the remote store and was queued locally
  WriteQueued {
    provisional_id: String,
    entity_type: String,
    reason: String,
  },
  /// A queued mutation was accepted by the remote store
  Synced {
    provisional_id: String,
    remote_id: Option<String>,
  },
  /// A queued mutation used up its sync attempts
  SyncExhausted {
    provisional_id: String,
    attempts: u32,
    error: String,
  },
}

/// Sending half of the event channel. Cheap to clone; sends never block.
///
/// A sink without a receiver silently drops events.
#[derive(Debug, Clone, Default)]
pub struct EventSink {
  tx: Option<mpsc::UnboundedSender<DataEvent>>,
}

impl EventSink {
  /// Create a sink and the receiver that observes it.
  pub fn channel() -> (Self, EventStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Self { tx: Some(tx) }, EventStream { rx })
  }

  /// A sink that discards everything.
  pub fn disabled() -> Self {
    Self { tx: None }
  }

  pub fn emit(&self, event: DataEvent) {
    if let Some(tx) = &self.tx {
      // Ignore send errors - receiver may have been dropped
      let _ = tx.send(event);
    }
  }
}

/// Receiving half of the event channel
pub struct EventStream {
  rx: mpsc::UnboundedReceiver<DataEvent>,
}

impl EventStream {
  /// Receive the next event
  pub async fn next(&mut self) -> Option<DataEvent> {
    self.rx.recv().await
  }

  /// Drain whatever is buffered without waiting.
  pub fn drain(&mut self) -> Vec<DataEvent> {
    let mut out = Vec::new();
    while let Ok(event) = self.rx.try_recv() {
      out.push(event);
    }
    out
  }
}
