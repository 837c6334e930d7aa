//! Cooperative cancellation for running tasks.
//!
//! Every task gets a [`CancellationToken`] when it is created. The token is
//! passed by value into each unit of work (page fetch, download attempt, file
//! processed) and polled at its boundaries; nothing is ever preempted.
//!
//! [`CancellationController`] owns the live tokens and a separate set of
//! force-cancelled task ids. The forced set survives [`CancellationController::clear`]
//! so that a worker iteration which escaped the main polling loop still sees the
//! cancellation after the task's normal cleanup has run.

use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use dashmap::{DashMap, DashSet};
use tracing::{debug, info, instrument};

use crate::task::TaskId;

#[derive(Debug, Default)]
struct TokenState {
    requested_at: OnceLock<DateTime<Utc>>,
    forced: AtomicBool,
    signal: tokio_util::sync::CancellationToken,
}

/// Per-task cancellation flag, cheap to clone and safe to share across workers.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    task_id: TaskId,
    state: Arc<TokenState>,
}

impl CancellationToken {
    /// Creates an untriggered token for `task_id`.
    #[must_use]
    pub fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            state: Arc::new(TokenState::default()),
        }
    }

    /// Returns the task this token belongs to.
    #[must_use]
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Returns true once cancellation has been requested (normal or forced).
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state.signal.is_cancelled() || self.is_forced()
    }

    /// Returns true if a forced cancellation was requested.
    #[must_use]
    pub fn is_forced(&self) -> bool {
        self.state.forced.load(Ordering::SeqCst)
    }

    /// When cancellation was first requested.
    #[must_use]
    pub fn requested_at(&self) -> Option<DateTime<Utc>> {
        self.state.requested_at.get().copied()
    }

    /// Completes when the token is cancelled. Used inside `select!` around
    /// sleeps, permit waits and in-flight requests.
    pub async fn cancelled(&self) {
        self.state.signal.cancelled().await;
    }

    /// Returns a child signal that is cancelled with this token but can also be
    /// cancelled on its own (e.g. a download queue's `cancel_all`).
    #[must_use]
    pub fn child_signal(&self) -> tokio_util::sync::CancellationToken {
        self.state.signal.child_token()
    }

    /// Triggers the token. Returns true if this call moved it from live to cancelled.
    pub fn cancel(&self, force: bool) -> bool {
        let first = self.state.requested_at.set(Utc::now()).is_ok();
        if force {
            self.state.forced.store(true, Ordering::SeqCst);
        }
        self.state.signal.cancel();
        first
    }
}

/// Registry of cancellation tokens for all live tasks.
#[derive(Debug, Default)]
pub struct CancellationController {
    tokens: DashMap<TaskId, CancellationToken>,
    forced: DashSet<TaskId>,
}

impl CancellationController {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates and registers the token for a new task.
    pub fn register(&self, task_id: TaskId) -> CancellationToken {
        let token = CancellationToken::new(task_id);
        self.tokens.insert(task_id, token.clone());
        token
    }

    /// Returns the live token for a task, if one is registered.
    #[must_use]
    pub fn token(&self, task_id: TaskId) -> Option<CancellationToken> {
        self.tokens.get(&task_id).map(|entry| entry.clone())
    }

    /// Requests cancellation of a task.
    ///
    /// Returns true if a token was found and triggered by this call. With
    /// `force`, the id is added to the forced set even if the token has already
    /// been cleared.
    #[instrument(skip(self), fields(task_id = %task_id))]
    pub fn request_cancel(&self, task_id: TaskId, force: bool) -> bool {
        if force {
            self.forced.insert(task_id);
        }
        let Some(token) = self.token(task_id) else {
            debug!("no live token; cancellation request recorded only if forced");
            return false;
        };
        let first = token.cancel(force);
        info!(force, first, "cancellation requested");
        first
    }

    /// Returns true if the task has been cancelled or force-cancelled.
    #[must_use]
    pub fn is_cancelled(&self, task_id: TaskId) -> bool {
        if self.forced.contains(&task_id) {
            return true;
        }
        self.tokens
            .get(&task_id)
            .is_some_and(|token| token.is_cancelled())
    }

    /// Returns true if the task is in the forced set.
    #[must_use]
    pub fn is_forced(&self, task_id: TaskId) -> bool {
        self.forced.contains(&task_id)
    }

    /// Drops the live token once the task is terminal. The forced set is kept.
    pub fn clear(&self, task_id: TaskId) {
        self.tokens.remove(&task_id);
    }

    /// Drops every trace of the task, forced set included.
    pub fn forget(&self, task_id: TaskId) {
        self.tokens.remove(&task_id);
        self.forced.remove(&task_id);
    }

    /// Number of registered live tokens.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.tokens.len()
    }
}
