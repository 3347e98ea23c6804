use async_trait::async_trait;
use futures::future::join_all;
use rand::Rng;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use task_orchestra::{
  Canceler, CompletionInfo, CompletionStatus, ConcurrencyConfig, Event, ExecError, ExecutionManager, Executor, Factory,
  ManagerConfig, Message, MessageSendParams, PipeWriter, Processor, Role, SendMessageResult, ShutdownMode, Task,
  TaskIdParams, TaskState,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

// Works for a random while, then completes unless stopped.
struct SlowAgent {
  task_id: String,
  work_ms: u64,
}

#[async_trait]
impl Executor for SlowAgent {
  async fn execute(&self, token: CancellationToken, queue: PipeWriter) -> Result<(), ExecError> {
    queue
      .write(&token, Event::Task(Task::new(self.task_id.clone(), "demo", TaskState::Working)))
      .await?;
    tokio::select! {
      _ = tokio::time::sleep(Duration::from_millis(self.work_ms)) => {},
      _ = token.cancelled() => return Err(ExecError::Canceled),
    }
    queue
      .write(&token, Event::Task(Task::new(self.task_id.clone(), "demo", TaskState::Completed)))
      .await
  }
}

struct StopAgent {
  task_id: String,
}

#[async_trait]
impl Canceler for StopAgent {
  async fn cancel(&self, token: CancellationToken, queue: PipeWriter) -> Result<(), ExecError> {
    queue
      .write(&token, Event::Task(Task::new(self.task_id.clone(), "demo", TaskState::Canceled)))
      .await
  }
}

struct FinalTaskProcessor;

#[async_trait]
impl Processor for FinalTaskProcessor {
  async fn process(&self, _token: &CancellationToken, event: Event) -> Result<Option<SendMessageResult>, ExecError> {
    match event {
      Event::Task(task) if task.state().is_terminal() => Ok(Some(SendMessageResult::Task(task))),
      _ => Ok(None),
    }
  }
}

struct SlowFactory;

#[async_trait]
impl Factory for SlowFactory {
  async fn create_executor(
    &self,
    _token: &CancellationToken,
    task_id: &str,
    _params: &MessageSendParams,
  ) -> Result<(Arc<dyn Executor>, Arc<dyn Processor>), ExecError> {
    let work_ms = rand::rng().random_range(200..800);
    info!("Agent for {} will work for {}ms", task_id, work_ms);
    let agent = SlowAgent {
      task_id: task_id.to_string(),
      work_ms,
    };
    Ok((Arc::new(agent), Arc::new(FinalTaskProcessor)))
  }

  async fn create_canceler(
    &self,
    _token: &CancellationToken,
    params: &TaskIdParams,
  ) -> Result<(Arc<dyn Canceler>, Arc<dyn Processor>), ExecError> {
    Ok((
      Arc::new(StopAgent {
        task_id: params.id.clone(),
      }),
      Arc::new(FinalTaskProcessor),
    ))
  }
}

#[tokio::main]
async fn main() {
  tracing_subscriber::fmt()
    .with_max_level(tracing::Level::INFO)
    .with_target(false)
    .init();

  info!("--- Concurrent Cancel Example ---");

  let config = ManagerConfig::default().with_concurrency(ConcurrencyConfig::unlimited().with_max_executions(4));
  let manager = ExecutionManager::in_memory("cancel_manager", Arc::new(SlowFactory), config, Handle::current());

  let canceled_count = Arc::new(AtomicUsize::new(0));
  let counter = canceled_count.clone();
  manager.add_completion_handler(move |info: CompletionInfo| {
    if info.status == CompletionStatus::Canceled {
      counter.fetch_add(1, Ordering::Relaxed);
    }
    info!("[Handler] {:?} for {} finished: {:?}", info.kind, info.task_id, info.status);
  });

  let mut executions = Vec::new();
  for i in 0..4 {
    let task_id = format!("job-{}", i);
    let params = MessageSendParams::new(Message::text(format!("m-{}", i), Role::User, "work"));
    match manager.execute(task_id.clone(), params).await {
      Ok((execution, _subscription)) => executions.push(execution),
      Err(e) => tracing::error!("Failed to execute {}: {}", task_id, e),
    }
  }

  if let Err(e) = manager.execute("job-overflow", MessageSendParams::new(Message::text("m-x", Role::User, "work"))).await {
    info!("Fifth execution rejected as expected: {}", e);
  }

  tokio::time::sleep(Duration::from_millis(150)).await;

  // Three callers race to cancel the same task; they share one outcome.
  let token = CancellationToken::new();
  let cancels = (0..3).map(|_| manager.cancel(&token, TaskIdParams::new("job-0")));
  for (caller, outcome) in join_all(cancels).await.into_iter().enumerate() {
    match outcome {
      Ok(task) => info!("Caller {} saw {} in state {}", caller, task.id, task.state()),
      Err(e) => info!("Caller {} could not cancel: {}", caller, e),
    }
  }

  for execution in executions {
    match execution.result(&token).await {
      Ok(result) => info!("{} resolved to {:?}", execution.task_id(), result.as_task().map(|task| task.state())),
      Err(e) => info!("{} failed: {}", execution.task_id(), e),
    }
  }

  manager
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Manager shutdown failed");
  tokio::time::sleep(Duration::from_millis(50)).await;
  info!("Canceled notifications: {}", canceled_count.load(Ordering::Relaxed));
  info!("--- Concurrent Cancel Example End ---");
}
