//! The agent-protocol shapes moved through the engine: tasks, messages,
//! streaming events and request parameters.

use std::collections::HashMap;
use std::fmt;

/// Opaque identifier of one task across its lifetime.
pub type TaskId = String;

/// Caller-supplied label used to apply finer-grained concurrency quotas.
pub type ScopeLabel = String;

/// Free-form key/value metadata attached to requests and tasks.
pub type Metadata = HashMap<String, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskState {
  Submitted,
  Working,
  InputRequired,
  AuthRequired,
  Completed,
  Canceled,
  Failed,
  Rejected,
  Unknown,
}

impl TaskState {
  /// Returns `true` for states after which the current invocation produces no
  /// further events.
  pub fn is_terminal(&self) -> bool {
    matches!(
      self,
      TaskState::Completed | TaskState::Canceled | TaskState::Failed | TaskState::Rejected | TaskState::AuthRequired
    )
  }
}

impl fmt::Display for TaskState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      TaskState::Submitted => "submitted",
      TaskState::Working => "working",
      TaskState::InputRequired => "input-required",
      TaskState::AuthRequired => "auth-required",
      TaskState::Completed => "completed",
      TaskState::Canceled => "canceled",
      TaskState::Failed => "failed",
      TaskState::Rejected => "rejected",
      TaskState::Unknown => "unknown",
    };
    f.write_str(name)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
  User,
  Agent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Part {
  Text(String),
  Bytes { mime_type: Option<String>, data: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
  pub message_id: String,
  pub role: Role,
  pub parts: Vec<Part>,
  pub task_id: Option<TaskId>,
  pub context_id: Option<String>,
  pub metadata: Metadata,
}

impl Message {
  pub fn new(message_id: impl Into<String>, role: Role, parts: Vec<Part>) -> Self {
    Self {
      message_id: message_id.into(),
      role,
      parts,
      task_id: None,
      context_id: None,
      metadata: Metadata::new(),
    }
  }

  /// Convenience constructor for a single text part message.
  pub fn text(message_id: impl Into<String>, role: Role, text: impl Into<String>) -> Self {
    Self::new(message_id, role, vec![Part::Text(text.into())])
  }

  pub fn with_task_id(mut self, task_id: impl Into<TaskId>) -> Self {
    self.task_id = Some(task_id.into());
    self
  }

  /// Concatenation of all text parts, in order.
  pub fn text_content(&self) -> String {
    self
      .parts
      .iter()
      .filter_map(|part| match part {
        Part::Text(text) => Some(text.as_str()),
        Part::Bytes { .. } => None,
      })
      .collect::<Vec<_>>()
      .join("")
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatus {
  pub state: TaskState,
  pub message: Option<Message>,
}

impl TaskStatus {
  pub fn new(state: TaskState) -> Self {
    Self { state, message: None }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
  pub artifact_id: String,
  pub name: Option<String>,
  pub parts: Vec<Part>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Task {
  pub id: TaskId,
  pub context_id: String,
  pub status: TaskStatus,
  pub history: Vec<Message>,
  pub artifacts: Vec<Artifact>,
  pub metadata: Metadata,
}

impl Task {
  pub fn new(id: impl Into<TaskId>, context_id: impl Into<String>, state: TaskState) -> Self {
    Self {
      id: id.into(),
      context_id: context_id.into(),
      status: TaskStatus::new(state),
      history: Vec::new(),
      artifacts: Vec::new(),
      metadata: Metadata::new(),
    }
  }

  pub fn state(&self) -> TaskState {
    self.status.state
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskStatusUpdateEvent {
  pub task_id: TaskId,
  pub context_id: String,
  pub status: TaskStatus,
  pub is_final: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskArtifactUpdateEvent {
  pub task_id: TaskId,
  pub context_id: String,
  pub artifact: Artifact,
  pub append: bool,
  pub last_chunk: bool,
}

/// A single protocol event emitted by an agent while working on a task.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
  Message(Message),
  Task(Task),
  StatusUpdate(TaskStatusUpdateEvent),
  ArtifactUpdate(TaskArtifactUpdateEvent),
}

impl Event {
  pub fn task_id(&self) -> Option<&str> {
    match self {
      Event::Message(message) => message.task_id.as_deref(),
      Event::Task(task) => Some(&task.id),
      Event::StatusUpdate(update) => Some(&update.task_id),
      Event::ArtifactUpdate(update) => Some(&update.task_id),
    }
  }

  /// Whether this event closes the stream of its invocation.
  pub fn is_final(&self) -> bool {
    match self {
      Event::Message(_) => true,
      Event::Task(task) => task.status.state.is_terminal(),
      Event::StatusUpdate(update) => update.is_final,
      Event::ArtifactUpdate(_) => false,
    }
  }
}

/// The outcome of an execution: either a direct reply or a task snapshot.
#[derive(Debug, Clone, PartialEq)]
pub enum SendMessageResult {
  Message(Message),
  Task(Task),
}

impl SendMessageResult {
  pub fn as_task(&self) -> Option<&Task> {
    match self {
      SendMessageResult::Task(task) => Some(task),
      SendMessageResult::Message(_) => None,
    }
  }
}

impl From<SendMessageResult> for Event {
  fn from(result: SendMessageResult) -> Self {
    match result {
      SendMessageResult::Message(message) => Event::Message(message),
      SendMessageResult::Task(task) => Event::Task(task),
    }
  }
}

/// Parameters of a message-send invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageSendParams {
  pub message: Message,
  pub metadata: Metadata,
}

impl MessageSendParams {
  pub fn new(message: Message) -> Self {
    Self {
      message,
      metadata: Metadata::new(),
    }
  }
}

/// Parameters identifying a task, used by cancel requests.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskIdParams {
  pub id: TaskId,
  pub metadata: Metadata,
}

impl TaskIdParams {
  pub fn new(id: impl Into<TaskId>) -> Self {
    Self {
      id: id.into(),
      metadata: Metadata::new(),
    }
  }

  pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.metadata.insert(key.into(), value.into());
    self
  }
}
