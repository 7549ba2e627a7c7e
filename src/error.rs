use std::time::Duration;

use crate::types::TaskState;

/// Error enum for one decider process.
///
/// Categories:
/// - Replay inconsistency: abandon the current decision task without responding;
///   the next poll replays from scratch
/// - Retryable: transport hiccup, back off and poll again
/// - Fleet: only ever logged by the completion hook
/// - Fatal: halt the decider
#[derive(Debug, thiserror::Error)]
pub enum DeciderError {
    // Replay inconsistency
    #[error("Event references unknown scheduledEventId {0}")]
    UnknownScheduledEvent(i64),

    #[error("Event references unknown task '{0}'")]
    UnknownTask(String),

    #[error("Task '{0}' is defined more than once in history")]
    DuplicateTask(String),

    #[error("Event {event_id} ({event_type}) is missing its attributes")]
    MissingAttributes { event_id: i64, event_type: String },

    #[error("Malformed division output from task '{task_id}': {reason}")]
    MalformedDivision { task_id: String, reason: String },

    #[error("Task '{task_id}' cannot move from {from:?} to {to:?}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("Node '{node_id}' received more child completions than it has children")]
    DependencyOverflow { node_id: String },

    #[error("Task '{0}' has no owning node")]
    OrphanTask(String),

    #[error("Inconsistent replay snapshot: {0}")]
    InconsistentSnapshot(String),

    // Retryable
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Transport command timed out after {0:?}")]
    CommandTimeout(Duration),

    // Fleet hook
    #[error("Fleet hook error: {0}")]
    Fleet(String),

    // Fatal
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl DeciderError {
    /// Returns true if the history could not be replayed into a consistent
    /// snapshot. The decision task must be abandoned, never answered.
    pub fn is_replay_inconsistency(&self) -> bool {
        matches!(
            self,
            DeciderError::UnknownScheduledEvent(_)
                | DeciderError::UnknownTask(_)
                | DeciderError::DuplicateTask(_)
                | DeciderError::MissingAttributes { .. }
                | DeciderError::MalformedDivision { .. }
                | DeciderError::InvalidTransition { .. }
                | DeciderError::DependencyOverflow { .. }
                | DeciderError::OrphanTask(_)
                | DeciderError::InconsistentSnapshot(_)
        )
    }

    /// Returns true if the error is transient and the poll should be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DeciderError::Transport(_) | DeciderError::CommandTimeout(_)
        )
    }

    /// Returns true if the decider loop should halt.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DeciderError::Config(_) | DeciderError::Io(_))
    }
}

/// Lets the CLI layer keep its `Result<(), String>` handlers.
impl From<DeciderError> for String {
    fn from(err: DeciderError) -> String {
        err.to_string()
    }
}
