//! A Tokio-based engine that admits, runs and cancels agent tasks, fanning
//! each task's events out to any number of subscribers.
//!
//! An [`ExecutionManager`] pairs a producer ([`Executor`] or [`Canceler`])
//! with a consumer ([`Processor`]) per request, enforces one piece of work per
//! task id, applies concurrency quotas, and tears everything down once the
//! result is known.

mod adapter;
mod broker;
mod error;
mod handle;
mod limiter;
mod manager;
mod notifier;
mod pipe;
mod promise;
mod protocol;
mod queue;
mod runner;

pub use adapter::{Canceler, Executor, Factory, Processor};
pub use broker::{BrokerConnection, ConnectionId, EventBroker, DEFAULT_CONNECTION_CAPACITY};
pub use error::ExecError;
pub use handle::{Execution, Subscription};
pub use limiter::ConcurrencyConfig;
pub use manager::{ExecutionManager, ManagerConfig, ShutdownMode};
pub use notifier::{CompletionInfo, CompletionStatus, WorkKind};
pub use pipe::{PipeWriter, DEFAULT_PIPE_CAPACITY};
pub use promise::Promise;
pub use protocol::{
  Artifact, Event, Message, MessageSendParams, Metadata, Part, Role, ScopeLabel, SendMessageResult, Task,
  TaskArtifactUpdateEvent, TaskId, TaskIdParams, TaskState, TaskStatus, TaskStatusUpdateEvent,
};
pub use queue::{EventQueue, InMemoryQueueManager, QueueManager};
