//! Error types for task execution and the task registry.

use thiserror::Error;

use super::model::{TaskId, TaskStatus};
use crate::download::QueueError;

/// Errors surfaced by the task registry and by task logic.
///
/// Item-level failures (a page that will not fetch, a download that exhausts
/// its retries) never become a `TaskError`; they are absorbed and counted in
/// the task's stats. Only [`TaskError::Cancelled`] and genuine control-flow
/// failures reach the worker boundary.
#[derive(Debug, Error)]
pub enum TaskError {
    /// No task with this id is registered.
    #[error("task {0} not found")]
    NotFound(TaskId),

    /// A status change that would move the state machine backwards.
    #[error("task {id}: invalid transition {from} -> {to}")]
    InvalidTransition {
        id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    /// The task observed its cancellation token.
    #[error("task cancelled")]
    Cancelled,

    /// Invalid parameters supplied at submission time.
    #[error("invalid task parameters: {0}")]
    InvalidParams(String),

    /// The download queue backing the task could not be driven.
    #[error("download queue error: {0}")]
    Queue(#[from] QueueError),

    /// An opaque collaborator (processor, playlist source) failed in a way that
    /// stops the whole task.
    #[error("{collaborator} failed: {message}")]
    Collaborator {
        collaborator: &'static str,
        message: String,
    },

    /// File system error in the task's own control flow.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The task's logic panicked.
    #[error("task panic: {0}")]
    Panicked(String),
}

impl TaskError {
    /// Creates a collaborator failure.
    pub fn collaborator(collaborator: &'static str, message: impl Into<String>) -> Self {
        Self::Collaborator {
            collaborator,
            message: message.into(),
        }
    }

    /// Returns true for the cancellation outcome.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_display_includes_id() {
        let id = TaskId::new();
        let msg = TaskError::NotFound(id).to_string();
        assert!(msg.contains(&id.to_string()));
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = TaskError::InvalidTransition {
            id: TaskId::new(),
            from: TaskStatus::Completed,
            to: TaskStatus::Running,
        };
        let msg = err.to_string();
        assert!(msg.contains("completed -> running"), "got: {msg}");
    }

    #[test]
    fn test_collaborator_display() {
        let err = TaskError::collaborator("playlist source", "HTTP 500");
        assert_eq!(err.to_string(), "playlist source failed: HTTP 500");
        assert!(!err.is_cancelled());
        assert!(TaskError::Cancelled.is_cancelled());
    }
}
