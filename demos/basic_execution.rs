use async_trait::async_trait;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use task_orchestra::{
  Canceler, Event, ExecError, ExecutionManager, Executor, Factory, ManagerConfig, Message, MessageSendParams,
  PipeWriter, Processor, Role, SendMessageResult, ShutdownMode, Task, TaskIdParams, TaskState, TaskStatus,
  TaskStatusUpdateEvent,
};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::info;

// Echoes the request back word by word, one status update per word.
struct EchoAgent {
  task_id: String,
  text: String,
}

#[async_trait]
impl Executor for EchoAgent {
  async fn execute(&self, token: CancellationToken, queue: PipeWriter) -> Result<(), ExecError> {
    for word in self.text.split_whitespace() {
      tokio::time::sleep(Duration::from_millis(100)).await;
      let mut status = TaskStatus::new(TaskState::Working);
      status.message = Some(Message::text(format!("echo-{}", word), Role::Agent, word));
      let update = TaskStatusUpdateEvent {
        task_id: self.task_id.clone(),
        context_id: "demo".to_string(),
        status,
        is_final: false,
      };
      queue.write(&token, Event::StatusUpdate(update)).await?;
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
      Event::Message(message) => Ok(Some(SendMessageResult::Message(message))),
      _ => Ok(None),
    }
  }
}

struct EchoFactory;

#[async_trait]
impl Factory for EchoFactory {
  async fn create_executor(
    &self,
    _token: &CancellationToken,
    task_id: &str,
    params: &MessageSendParams,
  ) -> Result<(Arc<dyn Executor>, Arc<dyn Processor>), ExecError> {
    let agent = EchoAgent {
      task_id: task_id.to_string(),
      text: params.message.text_content(),
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
    .with_max_level(tracing::Level::DEBUG)
    .with_target(false)
    .init();

  info!("--- Basic Execution Example ---");

  let manager = ExecutionManager::in_memory("basic_manager", Arc::new(EchoFactory), ManagerConfig::default(), Handle::current());

  let params = MessageSendParams::new(Message::text("m-1", Role::User, "hello from the orchestra"));
  let (execution, subscription) = manager.execute("echo-1", params).await.expect("Execute failed");
  info!("Execution {} admitted.", execution.task_id());

  let token = CancellationToken::new();
  let mut events = subscription.events(token.clone());
  while let Some(item) = events.next().await {
    match item {
      Ok(Event::StatusUpdate(update)) => {
        let word = update.status.message.map(|message| message.text_content()).unwrap_or_default();
        info!("Update for {}: {}", update.task_id, word);
      }
      Ok(event) => info!("Event: {:?}", event),
      Err(e) => info!("Subscription ended with error: {}", e),
    }
  }

  match execution.result(&token).await {
    Ok(result) => info!("Result: {:?}", result),
    Err(e) => info!("Execution failed: {}", e),
  }

  manager
    .shutdown(ShutdownMode::Graceful)
    .await
    .expect("Manager shutdown failed");
  info!("--- Basic Execution Example End ---");
}
