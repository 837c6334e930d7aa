//! Progress and terminal event emission.
//!
//! Task logic never talks to a transport directly. It calls
//! [`ProgressEventBus::emit_progress`] as work advances and the worker boundary
//! calls [`ProgressEventBus::emit_terminal`] exactly once per outcome. The bus
//! enforces the event contract:
//!
//! - progress values are clamped to `[0, 100]` and never go backwards
//! - `sequence_number` strictly increases per task
//! - progress calls inside the coalescing window collapse to the latest value
//! - only the first terminal event for a task is published; later ones, from
//!   any code path, are dropped
//!
//! Delivery is best-effort: a sink that reports failure loses the event.

mod bus;
mod sink;

pub use bus::{DEFAULT_COALESCE_WINDOW, ProgressEventBus};
pub use sink::{BroadcastSink, EventSink, JsonLinesSink};

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::stats::StatsSnapshot;
use crate::task::TaskId;

/// Kind of a progress event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    Progress,
    Completed,
    Failed,
    Cancelled,
}

impl EventType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Progress => "progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }

    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Progress)
    }
}

impl fmt::Display for EventType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of a task, as passed to [`ProgressEventBus::emit_terminal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalKind {
    Completed,
    Failed,
    Cancelled,
}

impl From<TerminalKind> for EventType {
    fn from(kind: TerminalKind) -> Self {
        match kind {
            TerminalKind::Completed => Self::Completed,
            TerminalKind::Failed => Self::Failed,
            TerminalKind::Cancelled => Self::Cancelled,
        }
    }
}

/// Wire schema shared by the engine and every transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    pub task_id: TaskId,
    pub event_type: EventType,
    pub progress: f64,
    pub message: String,
    pub stats_snapshot: StatsSnapshot,
    pub timestamp: DateTime<Utc>,
    pub sequence_number: u64,
}

impl ProgressEvent {
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        self.event_type.is_terminal()
    }
}
