//! Coalescing, idempotent event bus.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::{DashMap, DashSet};
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

use super::{EventSink, EventType, ProgressEvent, TerminalKind};
use crate::stats::StatsSnapshot;
use crate::task::{TaskId, clamp_progress};

/// Progress calls closer together than this collapse to the latest value.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(100);

#[derive(Debug)]
struct PendingProgress {
    progress: f64,
    message: String,
    stats: StatsSnapshot,
}

#[derive(Debug, Default)]
struct StreamState {
    next_sequence: u64,
    last_progress: f64,
    last_published: Option<Instant>,
    pending: Option<PendingProgress>,
    flush_scheduled: bool,
    terminal: bool,
}

impl StreamState {
    fn take_sequence(&mut self) -> u64 {
        self.next_sequence += 1;
        self.next_sequence
    }
}

struct BusInner {
    sink: Arc<dyn EventSink>,
    window: Duration,
    streams: DashMap<TaskId, StreamState>,
    emitted_terminal: DashSet<TaskId>,
}

impl BusInner {
    /// Publishes while the caller holds the task's stream entry, so sequence
    /// numbers reach the sink in order.
    fn publish_locked(
        &self,
        task_id: TaskId,
        state: &mut StreamState,
        event_type: EventType,
        progress: f64,
        message: String,
        stats: StatsSnapshot,
    ) -> ProgressEvent {
        let event = ProgressEvent {
            task_id,
            event_type,
            progress,
            message,
            stats_snapshot: stats,
            timestamp: Utc::now(),
            sequence_number: state.take_sequence(),
        };
        state.last_published = Some(Instant::now());
        if !self.sink.publish(&event) {
            debug!(
                task_id = %task_id,
                event_type = %event_type,
                sequence = event.sequence_number,
                "transport did not accept event"
            );
        }
        event
    }

    fn flush_pending(&self, task_id: TaskId) {
        let Some(mut state) = self.streams.get_mut(&task_id) else {
            return;
        };
        state.flush_scheduled = false;
        if state.terminal {
            state.pending = None;
            return;
        }
        if let Some(pending) = state.pending.take() {
            self.publish_locked(
                task_id,
                &mut state,
                EventType::Progress,
                pending.progress,
                pending.message,
                pending.stats,
            );
        }
    }
}

/// Event bus shared by the task registry and every task worker.
///
/// Cloning is cheap; all clones publish through the same sink and share the
/// per-task sequence counters and terminal guard.
#[derive(Clone)]
pub struct ProgressEventBus {
    inner: Arc<BusInner>,
}

impl std::fmt::Debug for ProgressEventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressEventBus")
            .field("window", &self.inner.window)
            .field("streams", &self.inner.streams.len())
            .field("terminated", &self.inner.emitted_terminal.len())
            .finish_non_exhaustive()
    }
}

impl ProgressEventBus {
    /// Creates a bus with the default coalescing window.
    #[must_use]
    pub fn new(sink: Arc<dyn EventSink>) -> Self {
        Self::with_window(sink, DEFAULT_COALESCE_WINDOW)
    }

    /// Creates a bus with a custom coalescing window. `Duration::ZERO` publishes
    /// every progress call.
    #[must_use]
    pub fn with_window(sink: Arc<dyn EventSink>, window: Duration) -> Self {
        Self {
            inner: Arc::new(BusInner {
                sink,
                window,
                streams: DashMap::new(),
                emitted_terminal: DashSet::new(),
            }),
        }
    }

    /// Returns the coalescing window.
    #[must_use]
    pub fn window(&self) -> Duration {
        self.inner.window
    }

    /// Emits a progress update for a task.
    ///
    /// Returns true if the event was published immediately, false if it was
    /// held back for coalescing or dropped because the task is already
    /// terminal. A held-back value is published at the end of the window unless
    /// a newer value or a terminal event supersedes it.
    #[instrument(level = "trace", skip(self, message, stats), fields(task_id = %task_id))]
    pub fn emit_progress(
        &self,
        task_id: TaskId,
        progress: f64,
        message: impl Into<String>,
        stats: StatsSnapshot,
    ) -> bool {
        if self.inner.emitted_terminal.contains(&task_id) {
            debug!(task_id = %task_id, "progress after terminal event ignored");
            return false;
        }

        let message = message.into();
        let mut state = self.inner.streams.entry(task_id).or_default();
        if state.terminal {
            return false;
        }

        let progress = clamp_progress(progress).max(state.last_progress);
        state.last_progress = progress;

        let window_elapsed = state
            .last_published
            .is_none_or(|at| at.elapsed() >= self.inner.window);

        if window_elapsed {
            state.pending = None;
            self.inner.publish_locked(
                task_id,
                &mut state,
                EventType::Progress,
                progress,
                message,
                stats,
            );
            return true;
        }

        state.pending = Some(PendingProgress {
            progress,
            message,
            stats,
        });

        if !state.flush_scheduled {
            let delay = state
                .last_published
                .map_or(Duration::ZERO, |at| {
                    self.inner.window.saturating_sub(at.elapsed())
                });
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    state.flush_scheduled = true;
                    let inner = Arc::clone(&self.inner);
                    handle.spawn(async move {
                        tokio::time::sleep(delay).await;
                        inner.flush_pending(task_id);
                    });
                }
                Err(_) => {
                    // No runtime to defer on: publish now instead of losing the value.
                    if let Some(pending) = state.pending.take() {
                        self.inner.publish_locked(
                            task_id,
                            &mut state,
                            EventType::Progress,
                            pending.progress,
                            pending.message,
                            pending.stats,
                        );
                        return true;
                    }
                }
            }
        }
        false
    }

    /// Emits the single terminal event for a task.
    ///
    /// Only the first call per task publishes; every later call is a no-op
    /// logged at debug level and returns false. Any progress value still held
    /// for coalescing is discarded.
    #[instrument(skip(self, message, stats), fields(task_id = %task_id))]
    pub fn emit_terminal(
        &self,
        task_id: TaskId,
        kind: TerminalKind,
        message: impl Into<String>,
        stats: StatsSnapshot,
    ) -> bool {
        let mut state = self.inner.streams.entry(task_id).or_default();
        if state.terminal || !self.inner.emitted_terminal.insert(task_id) {
            debug!(?kind, "duplicate terminal event suppressed");
            return false;
        }
        state.terminal = true;
        state.pending = None;

        let progress = match kind {
            TerminalKind::Completed => 100.0,
            TerminalKind::Failed | TerminalKind::Cancelled => state.last_progress,
        };
        let event = self.inner.publish_locked(
            task_id,
            &mut state,
            kind.into(),
            progress,
            message.into(),
            stats,
        );
        debug!(
            event_type = %event.event_type,
            sequence = event.sequence_number,
            "terminal event emitted"
        );
        true
    }

    /// Returns true once a terminal event has been emitted for the task.
    #[must_use]
    pub fn has_terminated(&self, task_id: TaskId) -> bool {
        self.inner.emitted_terminal.contains(&task_id)
    }

    /// Drops per-task stream state. The terminal guard is kept so a late
    /// completion path still cannot publish a second terminal event.
    pub fn forget(&self, task_id: TaskId) {
        if self.inner.streams.remove(&task_id).is_some_and(|(_, s)| s.pending.is_some()) {
            warn!(task_id = %task_id, "discarding unflushed progress for evicted task");
        }
    }
    /// Drops everything the bus holds for the task, terminal guard included.
    ///
    /// Only for tasks whose terminal event is out and that the registry no
    /// longer tracks; the registry then rejects any late emission itself.
    pub fn release(&self, task_id: TaskId) {
        self.forget(task_id);
        self.inner.emitted_terminal.remove(&task_id);
    }
}
