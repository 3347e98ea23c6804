use crate::protocol::TaskId;
use thiserror::Error;

/// Errors produced by the `task_orchestra` execution engine.
///
/// The type is `Clone` because a single outcome is cached in a promise and
/// handed to every waiter of that promise.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecError {
  #[error("An execution or cancellation is already in progress for task {0}")]
  AdmissionConflict(TaskId),

  #[error("Concurrency quota exceeded: {0}")]
  QuotaExceeded(String),

  #[error("Failed to set up task workers: {0}")]
  SetupFailure(String),

  #[error("Task processing failed: {0}")]
  ProcessingFailure(String),

  #[error("Task {task_id} cannot be canceled: {reason}")]
  NotCancelable { task_id: TaskId, reason: String },

  #[error("Event queue is closed")]
  QueueClosed,

  #[error("Operation was canceled by the caller")]
  Canceled,

  #[error("Operation timed out")]
  TimedOut,

  #[error("Event broker for task {0} was destroyed")]
  BrokerDestroyed(TaskId),

  #[error("Execution manager is shutting down or already shut down, cannot accept new work")]
  ManagerShuttingDown,
}

impl ExecError {
  /// Re-labels an error raised while building collaborators as a setup failure.
  pub(crate) fn into_setup_failure(self) -> Self {
    match self {
      ExecError::SetupFailure(_) => self,
      ExecError::ProcessingFailure(msg) => ExecError::SetupFailure(msg),
      other => ExecError::SetupFailure(other.to_string()),
    }
  }
}
