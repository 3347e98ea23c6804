#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_orchestra::{
  Canceler, Event, ExecError, Executor, Factory, Message, MessageSendParams, PipeWriter, Processor, Role,
  SendMessageResult, Task, TaskIdParams, TaskState, TaskStatus, TaskStatusUpdateEvent,
};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

pub const CONTEXT_ID: &str = "ctx-test";

// Helper to initialize tracing for tests (call once per test run, not per test function)
pub fn setup_tracing_for_test() {
  use std::sync::Once;
  use tracing_subscriber::{fmt, EnvFilter};
  static TRACING_INIT: Once = Once::new();

  TRACING_INIT.call_once(|| {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,task_orchestra=trace"));

    fmt::Subscriber::builder()
      .with_env_filter(filter)
      .with_test_writer()
      .try_init()
      .ok();
  });
}

/// Message whose text selects what the scripted executor does:
/// `complete`, `hang`, `fail`, `fail-recover`, `gated-fail`, `panic`,
/// `message`, `silent`, `setup-fail`, `stream:<n>` or `sleep:<ms>`.
pub fn params(script: &str) -> MessageSendParams {
  MessageSendParams::new(Message::text(format!("msg-{}", script), Role::User, script))
}

/// Cancel params; `outcome` selects what the scripted canceler writes:
/// `canceled`, `gated`, `noop`, `completed`, `message`, `fail` or `hang`.
pub fn cancel_params(task_id: &str, outcome: &str) -> TaskIdParams {
  TaskIdParams::new(task_id).with_metadata("outcome", outcome)
}

pub fn task_event(task_id: &str, state: TaskState) -> Event {
  Event::Task(Task::new(task_id, CONTEXT_ID, state))
}

pub fn task_result(task_id: &str, state: TaskState) -> SendMessageResult {
  SendMessageResult::Task(Task::new(task_id, CONTEXT_ID, state))
}

pub fn working_update(task_id: &str) -> Event {
  Event::StatusUpdate(TaskStatusUpdateEvent {
    task_id: task_id.to_string(),
    context_id: CONTEXT_ID.to_string(),
    status: TaskStatus::new(TaskState::Working),
    is_final: false,
  })
}

/// Polls `condition` every few milliseconds, giving up after two seconds.
pub async fn wait_until(what: &str, condition: impl Fn() -> bool) {
  for _ in 0..400 {
    if condition() {
      return;
    }
    sleep(Duration::from_millis(5)).await;
  }
  panic!("Timed out waiting until {}", what);
}

#[derive(Default)]
pub struct ScriptedFactory {
  pub executors_created: AtomicUsize,
  pub cancelers_created: AtomicUsize,
  /// Held shut until `open_gate`; `gated` scripts wait on it.
  gate: CancellationToken,
}

impl ScriptedFactory {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn executors_created(&self) -> usize {
    self.executors_created.load(Ordering::SeqCst)
  }

  pub fn cancelers_created(&self) -> usize {
    self.cancelers_created.load(Ordering::SeqCst)
  }

  pub fn open_gate(&self) {
    self.gate.cancel();
  }
}

#[async_trait]
impl Factory for ScriptedFactory {
  async fn create_executor(
    &self,
    _token: &CancellationToken,
    task_id: &str,
    params: &MessageSendParams,
  ) -> Result<(Arc<dyn Executor>, Arc<dyn Processor>), ExecError> {
    let script = params.message.text_content();
    if script == "setup-fail" {
      return Err(ExecError::ProcessingFailure("agent unavailable".to_string()));
    }
    self.executors_created.fetch_add(1, Ordering::SeqCst);
    let processor = ScriptedProcessor {
      task_id: task_id.to_string(),
      recover_failures: script == "fail-recover",
    };
    Ok((
      Arc::new(ScriptedExecutor {
        task_id: task_id.to_string(),
        script,
        gate: self.gate.clone(),
      }),
      Arc::new(processor),
    ))
  }

  async fn create_canceler(
    &self,
    _token: &CancellationToken,
    params: &TaskIdParams,
  ) -> Result<(Arc<dyn Canceler>, Arc<dyn Processor>), ExecError> {
    self.cancelers_created.fetch_add(1, Ordering::SeqCst);
    let outcome = params.metadata.get("outcome").cloned().unwrap_or_else(|| "canceled".to_string());
    Ok((
      Arc::new(ScriptedCanceler {
        task_id: params.id.clone(),
        outcome,
        gate: self.gate.clone(),
      }),
      Arc::new(ScriptedProcessor {
        task_id: params.id.clone(),
        recover_failures: false,
      }),
    ))
  }
}

struct ScriptedExecutor {
  task_id: String,
  script: String,
  gate: CancellationToken,
}

#[async_trait]
impl Executor for ScriptedExecutor {
  async fn execute(&self, token: CancellationToken, queue: PipeWriter) -> Result<(), ExecError> {
    let task_id = self.task_id.as_str();
    match self.script.as_str() {
      "complete" => {
        queue.write(&token, task_event(task_id, TaskState::Working)).await?;
        queue.write(&token, task_event(task_id, TaskState::Completed)).await
      }
      "hang" => {
        queue.write(&token, task_event(task_id, TaskState::Working)).await?;
        token.cancelled().await;
        Err(ExecError::Canceled)
      }
      "fail" | "fail-recover" => {
        queue.write(&token, task_event(task_id, TaskState::Working)).await?;
        Err(ExecError::ProcessingFailure("scripted failure".to_string()))
      }
      "gated-fail" => {
        queue.write(&token, task_event(task_id, TaskState::Working)).await?;
        pass_gate(&self.gate, &token).await?;
        Err(ExecError::ProcessingFailure("scripted failure".to_string()))
      }
      "panic" => panic!("scripted executor panic for {}", task_id),
      "message" => {
        let reply = Message::text("reply", Role::Agent, "hello").with_task_id(task_id);
        queue.write(&token, Event::Message(reply)).await
      }
      "silent" => Ok(()),
      script => {
        if let Some(count) = script.strip_prefix("stream:") {
          let count: usize = count.parse().unwrap_or(1);
          for _ in 0..count {
            queue.write(&token, working_update(task_id)).await?;
          }
        } else if let Some(ms) = script.strip_prefix("sleep:") {
          let ms: u64 = ms.parse().unwrap_or(10);
          tokio::select! {
            _ = sleep(Duration::from_millis(ms)) => {},
            _ = token.cancelled() => return Err(ExecError::Canceled),
          }
        }
        queue.write(&token, task_event(task_id, TaskState::Completed)).await
      }
    }
  }
}

struct ScriptedCanceler {
  task_id: String,
  outcome: String,
  gate: CancellationToken,
}

/// Waits for the factory gate, or fails with `Canceled` if `token` fires first.
async fn pass_gate(gate: &CancellationToken, token: &CancellationToken) -> Result<(), ExecError> {
  tokio::select! {
    _ = gate.cancelled() => Ok(()),
    _ = token.cancelled() => Err(ExecError::Canceled),
  }
}

#[async_trait]
impl Canceler for ScriptedCanceler {
  async fn cancel(&self, token: CancellationToken, queue: PipeWriter) -> Result<(), ExecError> {
    let task_id = self.task_id.as_str();
    match self.outcome.as_str() {
      "completed" => queue.write(&token, task_event(task_id, TaskState::Completed)).await,
      "message" => {
        let reply = Message::text("cancel-reply", Role::Agent, "nothing to cancel").with_task_id(task_id);
        queue.write(&token, Event::Message(reply)).await
      }
      "fail" => Err(ExecError::ProcessingFailure("canceler refused".to_string())),
      "gated" => {
        pass_gate(&self.gate, &token).await?;
        queue.write(&token, task_event(task_id, TaskState::Canceled)).await
      }
      "noop" => Ok(()),
      "hang" => {
        token.cancelled().await;
        Err(ExecError::Canceled)
      }
      _ => queue.write(&token, task_event(task_id, TaskState::Canceled)).await,
    }
  }
}

/// Stops at the first final event.
struct ScriptedProcessor {
  task_id: String,
  recover_failures: bool,
}

#[async_trait]
impl Processor for ScriptedProcessor {
  async fn process(&self, _token: &CancellationToken, event: Event) -> Result<Option<SendMessageResult>, ExecError> {
    match event {
      Event::Task(task) if task.state().is_terminal() => Ok(Some(SendMessageResult::Task(task))),
      Event::Message(message) => Ok(Some(SendMessageResult::Message(message))),
      Event::StatusUpdate(update) if update.is_final => Ok(Some(SendMessageResult::Task(Task::new(
        update.task_id,
        update.context_id,
        update.status.state,
      )))),
      _ => Ok(None),
    }
  }

  async fn process_error(&self, _token: &CancellationToken, error: ExecError) -> Result<SendMessageResult, ExecError> {
    if self.recover_failures {
      tracing::info!(task_id = %self.task_id, %error, "Recording failure as a failed task.");
      return Ok(task_result(&self.task_id, TaskState::Failed));
    }
    Err(error)
  }
}
