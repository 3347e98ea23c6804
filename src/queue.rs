use crate::broker::{EventBroker, DEFAULT_CONNECTION_CAPACITY};
use crate::error::ExecError;
use crate::protocol::{Event, TaskId};

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// A bidirectional endpoint into a task's event stream.
#[async_trait]
pub trait EventQueue: Send + Sync {
  /// Blocks until an event arrives, the queue closes, or `token` fires.
  async fn read(&mut self, token: &CancellationToken) -> Result<Event, ExecError>;

  /// Publishes `event` to the other endpoints of the same task.
  async fn write(&self, token: &CancellationToken, event: Event) -> Result<(), ExecError>;

  /// Detaches this endpoint. Reads afterwards report `ExecError::QueueClosed`.
  async fn close(&mut self);
}

/// Store of per-task event queues.
#[async_trait]
pub trait QueueManager: Send + Sync {
  /// Returns a new endpoint for `task_id`, creating the task's queue if needed.
  async fn get_or_create(&self, task_id: &str) -> Result<Box<dyn EventQueue>, ExecError>;

  /// Returns a new endpoint for `task_id` if its queue exists.
  async fn get(&self, task_id: &str) -> Option<Box<dyn EventQueue>>;

  /// Destroys the task's queue, closing every endpoint.
  async fn destroy(&self, task_id: &str) -> Result<(), ExecError>;
}

/// [`QueueManager`] backed by one in-process [`EventBroker`] per task.
#[derive(Debug)]
pub struct InMemoryQueueManager {
  brokers: DashMap<TaskId, Arc<EventBroker>>,
  connection_capacity: usize,
  tokio_handle: TokioHandle,
}

impl InMemoryQueueManager {
  pub fn new(connection_capacity: usize, tokio_handle: TokioHandle) -> Arc<Self> {
    Arc::new(Self {
      brokers: DashMap::new(),
      connection_capacity,
      tokio_handle,
    })
  }

  pub fn with_defaults(tokio_handle: TokioHandle) -> Arc<Self> {
    Self::new(DEFAULT_CONNECTION_CAPACITY, tokio_handle)
  }

  /// Number of tasks that currently have a live broker.
  pub fn broker_count(&self) -> usize {
    self.brokers.len()
  }

  fn broker_for(&self, task_id: &str) -> Arc<EventBroker> {
    let mut entry = self
      .brokers
      .entry(task_id.to_string())
      .or_insert_with(|| EventBroker::new(task_id, self.connection_capacity, &self.tokio_handle));
    if entry.is_destroyed() {
      trace!(%task_id, "QueueManager: Replacing destroyed broker.");
      *entry = EventBroker::new(task_id, self.connection_capacity, &self.tokio_handle);
    }
    entry.value().clone()
  }
}

#[async_trait]
impl QueueManager for InMemoryQueueManager {
  async fn get_or_create(&self, task_id: &str) -> Result<Box<dyn EventQueue>, ExecError> {
    let broker = self.broker_for(task_id);
    let connection = broker.connect().await?;
    Ok(Box::new(connection))
  }

  async fn get(&self, task_id: &str) -> Option<Box<dyn EventQueue>> {
    let broker = self.brokers.get(task_id).map(|entry| entry.value().clone())?;
    match broker.connect().await {
      Ok(connection) => Some(Box::new(connection)),
      Err(e) => {
        trace!(%task_id, "QueueManager: Existing broker refused connection: {}", e);
        None
      }
    }
  }

  async fn destroy(&self, task_id: &str) -> Result<(), ExecError> {
    if let Some((_, broker)) = self.brokers.remove(task_id) {
      broker.destroy().await;
      debug!(%task_id, "QueueManager: Broker destroyed.");
    }
    Ok(())
  }
}
