use crate::error::ExecError;
use crate::pipe::PipeWriter;
use crate::promise::Promise;
use crate::protocol::{Event, MessageSendParams, ScopeLabel, SendMessageResult, TaskId, TaskIdParams};
use crate::queue::{EventQueue, QueueManager};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use futures_util::stream::BoxStream;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Registry record of one in-flight execution.
pub(crate) struct ExecutionState {
  pub(crate) task_id: TaskId,
  pub(crate) params: MessageSendParams,
  pub(crate) scope: Option<ScopeLabel>,
  pub(crate) promise: Promise<SendMessageResult>,
  pub(crate) pipe_writer: PipeWriter,
  pub(crate) worker_token: CancellationToken,
}

/// Registry record of one in-flight cancellation.
pub(crate) struct CancellationState {
  pub(crate) task_id: TaskId,
  pub(crate) params: TaskIdParams,
  pub(crate) promise: Promise<SendMessageResult>,
  pub(crate) worker_token: CancellationToken,
}

/// A handle to an in-flight task execution.
///
/// Cloning is cheap; every clone observes the same result.
#[derive(Clone)]
pub struct Execution {
  pub(crate) state: Arc<ExecutionState>,
  pub(crate) queue_manager: Arc<dyn QueueManager>,
}

impl fmt::Debug for Execution {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Execution")
      .field("task_id", &self.state.task_id)
      .field("scope", &self.state.scope)
      .field("finished", &self.is_finished())
      .finish_non_exhaustive()
  }
}

impl Execution {
  pub fn task_id(&self) -> &str {
    &self.state.task_id
  }

  pub fn params(&self) -> &MessageSendParams {
    &self.state.params
  }

  pub fn scope(&self) -> Option<&str> {
    self.state.scope.as_deref()
  }

  /// Returns `true` once the execution's result is available.
  pub fn is_finished(&self) -> bool {
    self.state.promise.is_resolved()
  }

  /// Waits for the execution's result.
  ///
  /// # Errors
  /// `ExecError::Canceled` if `token` fires first (the execution keeps
  /// running), otherwise whatever failure the execution resolved to.
  pub async fn result(&self, token: &CancellationToken) -> Result<SendMessageResult, ExecError> {
    self.state.promise.wait(token).await
  }

  /// Waits for the execution's result for at most `timeout`.
  pub async fn result_timeout(&self, timeout: Duration) -> Result<SendMessageResult, ExecError> {
    self.state.promise.wait_timeout(timeout).await
  }

  /// Subscribes to the execution's events. Nothing happens until the stream
  /// is first polled.
  ///
  /// If the execution finished before the subscription could attach, the
  /// stream yields the final result as its only item.
  pub fn events(&self, token: CancellationToken) -> BoxStream<'static, Result<Event, ExecError>> {
    let initial = EventsState::Connecting {
      execution: self.clone(),
      token,
    };
    stream::unfold(initial, next_event).boxed()
  }
}

/// An event subscription returned alongside a new execution.
///
/// Consumed by [`Subscription::events`], so it can be read exactly once.
pub struct Subscription {
  task_id: TaskId,
  queue: Box<dyn EventQueue>,
}

impl fmt::Debug for Subscription {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Subscription").field("task_id", &self.task_id).finish_non_exhaustive()
  }
}

impl Subscription {
  pub(crate) fn new(task_id: TaskId, queue: Box<dyn EventQueue>) -> Self {
    Self { task_id, queue }
  }

  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  /// Turns the subscription into a lazy event stream.
  ///
  /// The stream ends when the task's broker is destroyed after the execution
  /// completes. A fired `token` yields `ExecError::Canceled` once and ends the
  /// stream without affecting the execution or other subscribers.
  pub fn events(self, token: CancellationToken) -> BoxStream<'static, Result<Event, ExecError>> {
    let initial = EventsState::Streaming {
      queue: self.queue,
      token,
    };
    stream::unfold(initial, next_event).boxed()
  }
}

enum EventsState {
  Connecting {
    execution: Execution,
    token: CancellationToken,
  },
  Streaming {
    queue: Box<dyn EventQueue>,
    token: CancellationToken,
  },
  Done,
}

async fn next_event(state: EventsState) -> Option<(Result<Event, ExecError>, EventsState)> {
  match state {
    EventsState::Connecting { execution, token } => match execution.queue_manager.get(execution.task_id()).await {
      Some(queue) => read_queue(queue, token).await,
      None => {
        trace!(task_id = %execution.task_id(), "Events: Broker gone, yielding final result.");
        let item = execution.result(&token).await.map(Event::from);
        Some((item, EventsState::Done))
      }
    },
    EventsState::Streaming { queue, token } => read_queue(queue, token).await,
    EventsState::Done => None,
  }
}

async fn read_queue(
  mut queue: Box<dyn EventQueue>,
  token: CancellationToken,
) -> Option<(Result<Event, ExecError>, EventsState)> {
  match queue.read(&token).await {
    Ok(event) => Some((Ok(event), EventsState::Streaming { queue, token })),
    Err(ExecError::QueueClosed) => {
      queue.close().await;
      None
    }
    Err(failure) => {
      queue.close().await;
      Some((Err(failure), EventsState::Done))
    }
  }
}
