use crate::error::ExecError;

use std::time::Duration;

use futures_intrusive::sync::ManualResetEvent;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// A single-assignment future used to hand a worker's outcome to any number
/// of waiters.
///
/// The outcome is written and the completion event is set while the slot lock
/// is held, so a waiter that observes the signal always finds the outcome.
pub struct Promise<T: Clone> {
  outcome: Mutex<Option<Result<T, ExecError>>>,
  completed: ManualResetEvent,
}

impl<T: Clone> Promise<T> {
  pub fn new() -> Self {
    Self {
      outcome: Mutex::new(None),
      completed: ManualResetEvent::new(false),
    }
  }

  /// Stores the outcome and wakes every waiter.
  ///
  /// Returns `false` and leaves the stored outcome untouched if the promise
  /// was already resolved.
  pub fn resolve(&self, outcome: Result<T, ExecError>) -> bool {
    let mut slot = self.outcome.lock();
    if slot.is_some() {
      warn!("Promise: Ignoring second resolution attempt.");
      return false;
    }
    *slot = Some(outcome);
    self.completed.set();
    true
  }

  pub fn is_resolved(&self) -> bool {
    self.completed.is_set()
  }

  /// Returns the cached outcome without waiting.
  pub fn try_get(&self) -> Option<Result<T, ExecError>> {
    self.outcome.lock().clone()
  }

  /// Waits until the promise is resolved or `token` is cancelled, whichever
  /// happens first. Cancellation leaves the promise untouched.
  pub async fn wait(&self, token: &CancellationToken) -> Result<T, ExecError> {
    if let Some(outcome) = self.try_get() {
      return outcome;
    }

    tokio::select! {
      biased;
      _ = self.completed.wait() => {},
      _ = token.cancelled() => {
        trace!("Promise: Wait abandoned, caller token cancelled.");
        return Err(ExecError::Canceled);
      }
    }

    match self.try_get() {
      Some(outcome) => outcome,
      // The event is only ever set after the slot is filled.
      None => Err(ExecError::ProcessingFailure("promise signalled without an outcome".to_string())),
    }
  }

  /// Like [`Promise::wait`] with a deadline instead of a caller token.
  pub async fn wait_timeout(&self, timeout: Duration) -> Result<T, ExecError> {
    let never_cancelled = CancellationToken::new();
    match tokio::time::timeout(timeout, self.wait(&never_cancelled)).await {
      Ok(outcome) => outcome,
      Err(_) => Err(ExecError::TimedOut),
    }
  }
}

impl<T: Clone> Default for Promise<T> {
  fn default() -> Self {
    Self::new()
  }
}
