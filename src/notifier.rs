use crate::error::ExecError;
use crate::protocol::{ScopeLabel, SendMessageResult, TaskId, TaskState};

use fibre::mpsc::AsyncReceiver;
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::{Arc, Once};
use std::time::SystemTime;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

// --- Public Event Structs for Handlers ---

/// Which kind of background work finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
  Execution,
  Cancellation,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
  /// Resolved to a result other than a canceled task.
  Succeeded,
  /// Resolved to a task in canceled state.
  Canceled,
  /// Resolved to an error.
  Failed,
}

impl From<&Result<SendMessageResult, ExecError>> for CompletionStatus {
  fn from(outcome: &Result<SendMessageResult, ExecError>) -> Self {
    match outcome {
      Ok(SendMessageResult::Task(task)) if task.state() == TaskState::Canceled => CompletionStatus::Canceled,
      Ok(_) => CompletionStatus::Succeeded,
      Err(_) => CompletionStatus::Failed,
    }
  }
}

#[derive(Debug, Clone)]
pub struct CompletionInfo {
  pub task_id: TaskId,
  pub manager_name: Arc<String>,
  pub kind: WorkKind,
  pub scope: Option<ScopeLabel>,
  pub status: CompletionStatus,
  /// Final task state when the outcome was a task.
  pub state: Option<TaskState>,
  pub error: Option<ExecError>,
  pub completion_time: SystemTime,
}

// --- Internal Message (crate-public) ---
#[derive(Debug)]
pub(crate) struct InternalCompletionMessage {
  pub(crate) task_id: TaskId,
  pub(crate) manager_name: Arc<String>,
  pub(crate) kind: WorkKind,
  pub(crate) scope: Option<ScopeLabel>,
  pub(crate) status: CompletionStatus,
  pub(crate) state: Option<TaskState>,
  pub(crate) error: Option<ExecError>,
}

impl InternalCompletionMessage {
  pub(crate) fn from_outcome(
    task_id: &str,
    manager_name: Arc<String>,
    kind: WorkKind,
    scope: Option<ScopeLabel>,
    outcome: &Result<SendMessageResult, ExecError>,
  ) -> Self {
    Self {
      task_id: task_id.to_string(),
      manager_name,
      kind,
      scope,
      status: CompletionStatus::from(outcome),
      state: outcome.as_ref().ok().and_then(|result| result.as_task()).map(|task| task.state()),
      error: outcome.as_ref().err().cloned(),
    }
  }
}

type CompletionHandler = Arc<dyn Fn(CompletionInfo) + Send + Sync + 'static>;

// --- CompletionNotifier Struct ---

struct NotifierInternalState {
  internal_rx_for_init: Option<AsyncReceiver<InternalCompletionMessage>>,
  tokio_handle: TokioHandle,
  manager_name_for_logging: Arc<String>,
  worker_join_handle: Option<JoinHandle<()>>,
}

pub(crate) struct CompletionNotifier {
  handlers: Arc<RwLock<Vec<CompletionHandler>>>,
  init_once: Once,
  internal_state_for_init: Mutex<NotifierInternalState>,
}

impl fmt::Debug for CompletionNotifier {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let handler_count = self.handlers.try_read().map_or(0, |guard| guard.len());
    f.debug_struct("CompletionNotifier")
      .field("handler_count", &handler_count)
      .field("initialized", &self.init_once.is_completed())
      .finish_non_exhaustive()
  }
}

impl CompletionNotifier {
  pub(crate) fn new(
    internal_rx: AsyncReceiver<InternalCompletionMessage>,
    tokio_handle: TokioHandle,
    manager_name_for_logging: Arc<String>,
  ) -> Arc<Self> {
    Arc::new(Self {
      handlers: Arc::new(RwLock::new(Vec::new())),
      init_once: Once::new(),
      internal_state_for_init: Mutex::new(NotifierInternalState {
        internal_rx_for_init: Some(internal_rx),
        tokio_handle,
        manager_name_for_logging,
        worker_join_handle: None,
      }),
    })
  }

  /// Whether notifications are worth queueing at all.
  pub(crate) fn has_handlers(&self) -> bool {
    !self.handlers.read().is_empty()
  }

  fn ensure_worker_initialized(&self) {
    self.init_once.call_once(|| {
      let mut state_guard = self.internal_state_for_init.lock();
      if let Some(rx_to_use) = state_guard.internal_rx_for_init.take() {
        info!(manager = %*state_guard.manager_name_for_logging, "First completion handler added. Starting notification worker.");

        let worker_handlers = self.handlers.clone();
        let worker_tokio_handle = state_guard.tokio_handle.clone();
        let worker_manager_name = state_guard.manager_name_for_logging.clone();

        let worker_jh = state_guard.tokio_handle.spawn(
          Self::run_notification_worker_loop(rx_to_use, worker_handlers, worker_tokio_handle)
            .instrument(info_span!("completion_notifier", manager = %*worker_manager_name)),
        );
        state_guard.worker_join_handle = Some(worker_jh);
      } else {
        warn!(manager = %*state_guard.manager_name_for_logging, "Notifier initialization: receiver already taken.");
      }
    });
  }

  pub(crate) fn add_handler(&self, handler: impl Fn(CompletionInfo) + Send + Sync + 'static) {
    self.ensure_worker_initialized();

    let manager_name_for_logging = self.internal_state_for_init.lock().manager_name_for_logging.clone();

    let mut handlers_guard = self.handlers.write();
    handlers_guard.push(Arc::new(handler));
    info!(manager = %*manager_name_for_logging, "Notifier: Added completion handler. Total handlers: {}", handlers_guard.len());
  }

  async fn run_notification_worker_loop(
    mut queue_rx: AsyncReceiver<InternalCompletionMessage>,
    handlers_list_arc: Arc<RwLock<Vec<CompletionHandler>>>,
    tokio_handle_for_spawning_handlers: TokioHandle,
  ) {
    info!("Notification worker started. Will process messages until its input queue is closed.");

    loop {
      match queue_rx.recv().await {
        Ok(internal_msg_payload) => {
          trace!(task_id = %internal_msg_payload.task_id, "Notification worker: processing message.");

          let handlers_snapshot: Vec<CompletionHandler> = handlers_list_arc.read().clone();
          if handlers_snapshot.is_empty() {
            trace!(task_id = %internal_msg_payload.task_id, "No completion handlers registered, dropping notification.");
            continue;
          }

          let public_info = CompletionInfo {
            task_id: internal_msg_payload.task_id,
            manager_name: internal_msg_payload.manager_name,
            kind: internal_msg_payload.kind,
            scope: internal_msg_payload.scope,
            status: internal_msg_payload.status,
            state: internal_msg_payload.state,
            error: internal_msg_payload.error,
            completion_time: SystemTime::now(),
          };

          debug!(task_id = %public_info.task_id, kind = ?public_info.kind, "Dispatching notification to {} handlers.", handlers_snapshot.len());

          for handler in handlers_snapshot {
            let info_for_handler = public_info.clone();
            tokio_handle_for_spawning_handlers.spawn(async move {
              let task_id = info_for_handler.task_id.clone();
              let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler(info_for_handler)));
              if result.is_err() {
                error!(%task_id, "A completion handler panicked during execution.");
              }
            });
          }
        }
        Err(receive_error) => {
          // Closed and empty: every sender is gone.
          info!("Notification worker: Message queue closed and drained ({:?}). Terminating.", receive_error);
          break;
        }
      }
    }

    info!("Notification worker stopped.");
  }

  pub(crate) async fn await_shutdown(&self) {
    let (handle_option, manager_name) = {
      let mut guard = self.internal_state_for_init.lock();
      (guard.worker_join_handle.take(), guard.manager_name_for_logging.clone())
    };

    if let Some(handle) = handle_option {
      info!(manager = %*manager_name, "Notifier: Waiting for notification worker to join.");
      if let Err(e) = handle.await {
        error!(manager = %*manager_name, "Notifier: Error joining notification worker: {:?}", e);
      } else {
        debug!(manager = %*manager_name, "Notifier: Notification worker joined.");
      }
    } else {
      trace!(manager = %*manager_name, "Notifier: Worker not started or already joined.");
    }
  }
}
