//! Collaborator seams: the agent-facing adapters the engine drives.

use crate::error::ExecError;
use crate::pipe::PipeWriter;
use crate::protocol::{Event, MessageSendParams, SendMessageResult, TaskIdParams};

use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Produces the events of one task invocation into `queue`.
///
/// Returning `Ok` closes the execution's pipe and the consumer still drains
/// whatever was written. Returning an error stops the consumer.
#[async_trait]
pub trait Executor: Send + Sync {
  async fn execute(&self, token: CancellationToken, queue: PipeWriter) -> Result<(), ExecError>;
}

/// Writes a cancellation signal for a task into `queue`.
///
/// While an execution is active, `queue` is that execution's own pipe.
#[async_trait]
pub trait Canceler: Send + Sync {
  async fn cancel(&self, token: CancellationToken, queue: PipeWriter) -> Result<(), ExecError>;
}

/// Decides when a stream of events has reached a result.
#[async_trait]
pub trait Processor: Send + Sync {
  /// Consumes one event. `Ok(None)` means keep going.
  async fn process(&self, token: &CancellationToken, event: Event) -> Result<Option<SendMessageResult>, ExecError>;

  /// Gets a chance to turn a worker failure into a result, for example by
  /// recording a failed task. The default passes the error through.
  async fn process_error(&self, _token: &CancellationToken, error: ExecError) -> Result<SendMessageResult, ExecError> {
    Err(error)
  }
}

/// Builds the matched collaborators for each request.
#[async_trait]
pub trait Factory: Send + Sync {
  async fn create_executor(
    &self,
    token: &CancellationToken,
    task_id: &str,
    params: &MessageSendParams,
  ) -> Result<(Arc<dyn Executor>, Arc<dyn Processor>), ExecError>;

  async fn create_canceler(
    &self,
    token: &CancellationToken,
    params: &TaskIdParams,
  ) -> Result<(Arc<dyn Canceler>, Arc<dyn Processor>), ExecError>;
}
