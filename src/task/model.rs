//! Task record, identifiers and lifecycle states.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::TaskError;
use crate::stats::StatsSnapshot;

/// Unique identifier of a task (UUID v4).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Allocates a fresh random id.
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for TaskId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Kind of work a task performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskType {
    /// Run document processors over a directory tree.
    Processing,
    /// Recursive crawl with document discovery and download.
    Crawl,
    /// Resolve a playlist into entries and download each one.
    Playlist,
}

impl TaskType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Crawl => "crawl",
            Self::Playlist => "playlist",
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a task.
///
/// ```text
/// pending ─► running ─┬─► completed
///                     ├─► failed
///                     ├─► cancelled
///                     └─► cancelling ─► cancelled
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Cancelling,
    Cancelled,
    Completed,
    Failed,
}

impl TaskStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelling => "cancelling",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Terminal states are final: no transition leaves them.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Returns whether `self -> next` is a legal forward transition.
    #[must_use]
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::Running)
                | (
                    Self::Running,
                    Self::Cancelling | Self::Completed | Self::Failed | Self::Cancelled
                )
                | (Self::Cancelling, Self::Cancelled)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a task as seen by callers of the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub status: TaskStatus,
    /// Percentage in `[0, 100]`, non-decreasing over the task's life.
    pub progress: f64,
    pub stats: StatsSnapshot,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Task {
    /// Creates a task in `pending` with zero progress.
    #[must_use]
    pub fn new(id: TaskId, task_type: TaskType) -> Self {
        Self {
            id,
            task_type,
            status: TaskStatus::Pending,
            progress: 0.0,
            stats: StatsSnapshot::default(),
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            error: None,
        }
    }

    /// Applies a status transition, stamping start/finish times.
    ///
    /// # Errors
    ///
    /// Returns [`TaskError::InvalidTransition`] for anything that is not a
    /// forward move in the state machine.
    pub fn transition(&mut self, next: TaskStatus) -> Result<(), TaskError> {
        if !self.status.can_transition_to(next) {
            return Err(TaskError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        match next {
            TaskStatus::Running => self.started_at = Some(Utc::now()),
            status if status.is_terminal() => self.finished_at = Some(Utc::now()),
            _ => {}
        }
        Ok(())
    }

    /// Raises progress to `value` (clamped), never lowering it.
    pub fn advance_progress(&mut self, value: f64) -> f64 {
        let clamped = clamp_progress(value);
        if clamped > self.progress {
            self.progress = clamped;
        }
        self.progress
    }
}

/// Clamps a progress value into `[0, 100]`; NaN becomes 0.
#[must_use]
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 100.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_transitions_allowed() {
        let mut task = Task::new(TaskId::new(), TaskType::Crawl);
        task.transition(TaskStatus::Running).unwrap();
        assert!(task.started_at.is_some());
        task.transition(TaskStatus::Cancelling).unwrap();
        task.transition(TaskStatus::Cancelled).unwrap();
        assert!(task.finished_at.is_some());
    }

    #[test]
    fn test_terminal_states_are_final() {
        for terminal in [
            TaskStatus::Completed,
            TaskStatus::Failed,
            TaskStatus::Cancelled,
        ] {
            for next in [
                TaskStatus::Pending,
                TaskStatus::Running,
                TaskStatus::Cancelling,
                TaskStatus::Cancelled,
                TaskStatus::Completed,
                TaskStatus::Failed,
            ] {
                assert!(
                    !terminal.can_transition_to(next),
                    "{terminal} -> {next} must be rejected"
                );
            }
        }
    }

    #[test]
    fn test_backward_transition_rejected() {
        let mut task = Task::new(TaskId::new(), TaskType::Processing);
        task.transition(TaskStatus::Running).unwrap();
        let err = task.transition(TaskStatus::Pending).unwrap_err();
        assert!(matches!(err, TaskError::InvalidTransition { .. }));
        assert_eq!(task.status, TaskStatus::Running);
    }

    #[test]
    fn test_pending_cannot_skip_to_completed() {
        assert!(!TaskStatus::Pending.can_transition_to(TaskStatus::Completed));
        assert!(!TaskStatus::Cancelling.can_transition_to(TaskStatus::Completed));
    }

    #[test]
    fn test_progress_is_clamped_and_monotonic() {
        let mut task = Task::new(TaskId::new(), TaskType::Playlist);
        assert_eq!(task.advance_progress(40.0), 40.0);
        assert_eq!(task.advance_progress(20.0), 40.0);
        assert_eq!(task.advance_progress(250.0), 100.0);
        assert_eq!(task.advance_progress(f64::NAN), 100.0);
    }

    #[test]
    fn test_clamp_progress_bounds() {
        assert_eq!(clamp_progress(-5.0), 0.0);
        assert_eq!(clamp_progress(101.0), 100.0);
        assert_eq!(clamp_progress(f64::NAN), 0.0);
        assert_eq!(clamp_progress(55.5), 55.5);
    }

    #[test]
    fn test_task_id_round_trips_through_string() {
        let id = TaskId::new();
        let parsed: TaskId = id.to_string().parse().unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_task_serializes_type_field() {
        let task = Task::new(TaskId::new(), TaskType::Crawl);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["type"], "crawl");
        assert_eq!(json["status"], "pending");
    }
}
