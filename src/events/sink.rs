//! Event transports.

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tokio::sync::broadcast;
use tracing::debug;

use super::ProgressEvent;

/// Default capacity of the broadcast channel behind [`BroadcastSink`].
const DEFAULT_BROADCAST_CAPACITY: usize = 1000;

/// Transport that receives published events.
///
/// `publish` reports only whether the transport accepted the event; it says
/// nothing about whether any client received it.
pub trait EventSink: Send + Sync {
    fn publish(&self, event: &ProgressEvent) -> bool;
}

/// Fan-out transport backed by a tokio broadcast channel.
///
/// Subscribers that fall behind by more than the channel capacity observe a
/// `Lagged` error and skip ahead; they can use `sequence_number` to notice.
#[derive(Debug, Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<ProgressEvent>,
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(DEFAULT_BROADCAST_CAPACITY)
    }
}

impl BroadcastSink {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Registers a new receiver. Only events published after this call are seen.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<ProgressEvent> {
        self.tx.subscribe()
    }

    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl EventSink for BroadcastSink {
    fn publish(&self, event: &ProgressEvent) -> bool {
        match self.tx.send(event.clone()) {
            Ok(_) => true,
            Err(_) => {
                debug!(task_id = %event.task_id, "no subscribers; event dropped");
                false
            }
        }
    }
}

/// Writes each event as one JSON document per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Returns the wrapped writer.
    pub fn into_inner(self) -> W {
        self.writer
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> EventSink for JsonLinesSink<W> {
    fn publish(&self, event: &ProgressEvent) -> bool {
        let Ok(line) = serde_json::to_string(event) else {
            return false;
        };
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{line}").and_then(|()| writer.flush()).is_ok()
    }
}
