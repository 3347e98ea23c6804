use crate::adapter::{Factory, Processor};
use crate::error::ExecError;
use crate::handle::{CancellationState, Execution, ExecutionState, Subscription};
use crate::limiter::{ConcurrencyConfig, ConcurrencyLimiter};
use crate::notifier::{CompletionInfo, CompletionNotifier, InternalCompletionMessage, WorkKind};
use crate::pipe::{Pipe, PipeReader, DEFAULT_PIPE_CAPACITY};
use crate::promise::Promise;
use crate::protocol::{MessageSendParams, ScopeLabel, SendMessageResult, Task, TaskId, TaskIdParams, TaskState};
use crate::queue::{EventQueue, InMemoryQueueManager, QueueManager};
use crate::runner::{catch_panic, consume_events, run_producer_consumer};

use std::collections::HashMap;
use std::sync::Arc;

use fibre::mpsc::{self, AsyncSender};
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, trace, warn, Instrument};

/// Defines how the manager should behave upon shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
  /// Stops admitting work and waits for active executions and cancellations
  /// to resolve on their own.
  Graceful,
  /// Stops admitting work and cancels the workers of everything in flight
  /// before waiting for them to resolve.
  ForcefulCancel,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagerConfig {
  pub concurrency: ConcurrencyConfig,
  /// Events buffered between an executor and its consumer.
  pub pipe_capacity: usize,
}

impl Default for ManagerConfig {
  fn default() -> Self {
    Self {
      concurrency: ConcurrencyConfig::unlimited(),
      pipe_capacity: DEFAULT_PIPE_CAPACITY,
    }
  }
}

impl ManagerConfig {
  pub fn with_concurrency(mut self, concurrency: ConcurrencyConfig) -> Self {
    self.concurrency = concurrency;
    self
  }
}

/// Active work per task, plus the quota counters. Guarded by one lock that is
/// never held across an `.await`.
struct Registry {
  executions: HashMap<TaskId, Arc<ExecutionState>>,
  cancellations: HashMap<TaskId, Arc<CancellationState>>,
  limiter: ConcurrencyLimiter,
}

/// Everything a background worker needs to run and clean up after itself.
#[derive(Clone)]
struct WorkerContext {
  manager_name: Arc<String>,
  factory: Arc<dyn Factory>,
  queue_manager: Arc<dyn QueueManager>,
  registry: Arc<Mutex<Registry>>,
  tokio_handle: TokioHandle,
  pipe_capacity: usize,
  notifier: Arc<CompletionNotifier>,
  completion_tx: AsyncSender<InternalCompletionMessage>,
}

/// Admits, runs and supervises task executions and cancellations.
///
/// Each manager owns its own registries; create as many independent
/// managers as needed. Call [`ExecutionManager::shutdown`] to stop one
/// deterministically; dropping the last handle only stops admission.
pub struct ExecutionManager {
  context: WorkerContext,
  shutdown_token: CancellationToken,
  workers_token: CancellationToken,
}

impl ExecutionManager {
  pub fn new(
    manager_name: &str,
    factory: Arc<dyn Factory>,
    queue_manager: Arc<dyn QueueManager>,
    config: ManagerConfig,
    tokio_handle: TokioHandle,
  ) -> Arc<Self> {
    let manager_name = Arc::new(manager_name.to_string());
    let (completion_tx, completion_rx) = mpsc::unbounded_async();
    let notifier = CompletionNotifier::new(completion_rx, tokio_handle.clone(), manager_name.clone());

    info!(manager = %*manager_name, concurrency = ?config.concurrency, "Execution manager created.");

    Arc::new(Self {
      context: WorkerContext {
        manager_name,
        factory,
        queue_manager,
        registry: Arc::new(Mutex::new(Registry {
          executions: HashMap::new(),
          cancellations: HashMap::new(),
          limiter: ConcurrencyLimiter::new(config.concurrency),
        })),
        tokio_handle,
        pipe_capacity: config.pipe_capacity,
        notifier,
        completion_tx,
      },
      shutdown_token: CancellationToken::new(),
      workers_token: CancellationToken::new(),
    })
  }

  /// Builds a manager backed by an [`InMemoryQueueManager`].
  pub fn in_memory(
    manager_name: &str,
    factory: Arc<dyn Factory>,
    config: ManagerConfig,
    tokio_handle: TokioHandle,
  ) -> Arc<Self> {
    let queue_manager = InMemoryQueueManager::with_defaults(tokio_handle.clone());
    Self::new(manager_name, factory, queue_manager, config, tokio_handle)
  }

  pub fn name(&self) -> &str {
    &self.context.manager_name
  }

  pub fn active_execution_count(&self) -> usize {
    self.context.registry.lock().executions.len()
  }

  pub fn active_cancellation_count(&self) -> usize {
    self.context.registry.lock().cancellations.len()
  }

  /// Registers a handler invoked after every execution or cancellation resolves.
  pub fn add_completion_handler(&self, handler: impl Fn(CompletionInfo) + Send + Sync + 'static) {
    self.context.notifier.add_handler(handler);
  }

  /// Looks up the in-flight execution of `task_id` without blocking.
  pub fn get_execution(&self, task_id: &str) -> Option<Execution> {
    let registry = self.context.registry.lock();
    registry.executions.get(task_id).map(|state| Execution {
      state: state.clone(),
      queue_manager: self.context.queue_manager.clone(),
    })
  }

  /// Starts executing `task_id` outside of any quota scope.
  pub async fn execute(
    &self,
    task_id: impl Into<TaskId>,
    params: MessageSendParams,
  ) -> Result<(Execution, Subscription), ExecError> {
    self.execute_in_scope(None, task_id, params).await
  }

  /// Starts executing `task_id`, counting it against `scope`'s quota.
  ///
  /// The workers run detached from the caller: dropping the returned handles
  /// does not stop them.
  ///
  /// # Errors
  /// `ExecError::AdmissionConflict` if an execution or cancellation is already
  /// registered for `task_id`, `ExecError::QuotaExceeded` if a limit is hit,
  /// `ExecError::SetupFailure` if the task's event queue could not be set up.
  pub async fn execute_in_scope(
    &self,
    scope: Option<ScopeLabel>,
    task_id: impl Into<TaskId>,
    params: MessageSendParams,
  ) -> Result<(Execution, Subscription), ExecError> {
    let task_id = task_id.into();
    let ctx = &self.context;

    if self.shutdown_token.is_cancelled() {
      warn!(manager = %*ctx.manager_name, %task_id, "Execute: Manager is shutting down.");
      return Err(ExecError::ManagerShuttingDown);
    }

    let (state, reader) = {
      let mut registry = ctx.registry.lock();
      if registry.executions.contains_key(&task_id) || registry.cancellations.contains_key(&task_id) {
        debug!(manager = %*ctx.manager_name, %task_id, "Execute: Rejected, work already in progress.");
        return Err(ExecError::AdmissionConflict(task_id));
      }
      if let Err(quota_error) = registry.limiter.acquire(scope.as_deref()) {
        debug!(manager = %*ctx.manager_name, %task_id, ?scope, "Execute: Rejected, {}", quota_error);
        return Err(quota_error);
      }

      let (pipe_writer, reader) = Pipe::new(ctx.pipe_capacity).split();
      let state = Arc::new(ExecutionState {
        task_id: task_id.clone(),
        params,
        scope,
        promise: Promise::new(),
        pipe_writer,
        worker_token: self.workers_token.child_token(),
      });
      registry.executions.insert(task_id.clone(), state.clone());
      (state, reader)
    };

    let broadcaster = match ctx.queue_manager.get_or_create(&task_id).await {
      Ok(queue) => queue,
      Err(setup_error) => return Err(ctx.abort_execution_setup(&state, setup_error).await),
    };
    let subscriber = match ctx.queue_manager.get_or_create(&task_id).await {
      Ok(queue) => queue,
      Err(setup_error) => {
        let mut broadcaster = broadcaster;
        broadcaster.close().await;
        return Err(ctx.abort_execution_setup(&state, setup_error).await);
      }
    };

    info!(manager = %*ctx.manager_name, %task_id, scope = ?state.scope, "Execution admitted.");

    let worker_ctx = ctx.clone();
    let worker_state = state.clone();
    ctx.tokio_handle.spawn(
      async move { worker_ctx.run_execution(worker_state, reader, broadcaster).await }
        .instrument(info_span!("execution", manager = %*ctx.manager_name, %task_id)),
    );

    let execution = Execution {
      state,
      queue_manager: ctx.queue_manager.clone(),
    };
    Ok((execution, Subscription::new(task_id, subscriber)))
  }

  /// Requests cancellation of a task and waits for the outcome.
  ///
  /// Concurrent requests for the same task share one cancellation. While an
  /// execution is active the cancel signal goes through that execution's own
  /// pipe, and the outcome is whatever the execution resolves to.
  ///
  /// # Errors
  /// `ExecError::NotCancelable` if the outcome is not a task in canceled
  /// state, `ExecError::Canceled` if `token` fires first (the cancellation
  /// keeps running), or the failure the cancellation resolved to.
  pub async fn cancel(&self, token: &CancellationToken, params: TaskIdParams) -> Result<Task, ExecError> {
    let ctx = &self.context;
    let task_id = params.id.clone();

    if self.shutdown_token.is_cancelled() {
      warn!(manager = %*ctx.manager_name, %task_id, "Cancel: Manager is shutting down.");
      return Err(ExecError::ManagerShuttingDown);
    }

    let (cancellation, start_with) = {
      let mut registry = ctx.registry.lock();
      match registry.cancellations.get(&task_id).cloned() {
        Some(existing) => {
          debug!(manager = %*ctx.manager_name, %task_id, "Cancel: Joining cancellation in progress.");
          (existing, None)
        }
        None => {
          let state = Arc::new(CancellationState {
            task_id: task_id.clone(),
            params,
            promise: Promise::new(),
            worker_token: self.workers_token.child_token(),
          });
          registry.cancellations.insert(task_id.clone(), state.clone());
          let active_execution = registry.executions.get(&task_id).cloned();
          (state, Some(active_execution))
        }
      }
    };

    if let Some(active_execution) = start_with {
      info!(
        manager = %*ctx.manager_name,
        %task_id,
        concurrent_execution = active_execution.is_some(),
        "Cancellation admitted."
      );
      let worker_ctx = ctx.clone();
      let worker_state = cancellation.clone();
      ctx.tokio_handle.spawn(
        async move { worker_ctx.run_cancellation(worker_state, active_execution).await }
          .instrument(info_span!("cancellation", manager = %*ctx.manager_name, %task_id)),
      );
    }

    let outcome = cancellation.promise.wait(token).await?;
    canceled_task(&task_id, outcome)
  }

  /// Stops admitting work and waits for everything in flight to resolve.
  pub async fn shutdown(&self, mode: ShutdownMode) -> Result<(), ExecError> {
    let ctx = &self.context;
    let already_initiating_shutdown = self.shutdown_token.is_cancelled();

    if !already_initiating_shutdown {
      info!(manager = %*ctx.manager_name, "Initiating manager shutdown (mode: {:?}).", mode);
      self.shutdown_token.cancel();
    } else {
      info!(manager = %*ctx.manager_name, "Shutdown already in progress or initiated by another call.");
    }

    if mode == ShutdownMode::ForcefulCancel {
      info!(manager = %*ctx.manager_name, "Forceful shutdown: Cancelling all workers.");
      self.workers_token.cancel();
    }

    let (executions, cancellations): (Vec<Arc<ExecutionState>>, Vec<Arc<CancellationState>>) = {
      let registry = ctx.registry.lock();
      (
        registry.executions.values().cloned().collect(),
        registry.cancellations.values().cloned().collect(),
      )
    };
    info!(
      manager = %*ctx.manager_name,
      executions = executions.len(),
      cancellations = cancellations.len(),
      "Waiting for in-flight work to resolve."
    );

    let never_cancelled = CancellationToken::new();
    for execution in executions {
      let _ = execution.promise.wait(&never_cancelled).await;
    }
    for cancellation in cancellations {
      let _ = cancellation.promise.wait(&never_cancelled).await;
    }

    let _ = ctx.completion_tx.close();
    ctx.notifier.await_shutdown().await;

    if !already_initiating_shutdown {
      info!(manager = %*ctx.manager_name, "Manager shutdown completed by this call.");
    }
    Ok(())
  }
}

fn canceled_task(task_id: &str, outcome: SendMessageResult) -> Result<Task, ExecError> {
  match outcome {
    SendMessageResult::Task(task) if task.state() == TaskState::Canceled => Ok(task),
    SendMessageResult::Task(task) => Err(ExecError::NotCancelable {
      task_id: task_id.to_string(),
      reason: format!("task ended in state {}", task.state()),
    }),
    SendMessageResult::Message(_) => Err(ExecError::NotCancelable {
      task_id: task_id.to_string(),
      reason: "outcome was a message, not a task".to_string(),
    }),
  }
}

impl WorkerContext {
  async fn run_execution(self, state: Arc<ExecutionState>, reader: PipeReader, broadcaster: Box<dyn EventQueue>) {
    let outcome = self.drive_execution(&state, reader, broadcaster).await;
    self.finish_execution(&state, outcome).await;
  }

  async fn drive_execution(
    &self,
    state: &Arc<ExecutionState>,
    reader: PipeReader,
    broadcaster: Box<dyn EventQueue>,
  ) -> Result<SendMessageResult, ExecError> {
    let token = state.worker_token.clone();
    let (executor, processor) = catch_panic(
      "executor factory",
      self.factory.create_executor(&token, &state.task_id, &state.params),
    )
    .await
    .map_err(ExecError::into_setup_failure)?;

    let writer = state.pipe_writer.clone();
    let consumer_processor = processor.clone();
    let consumer_task_id = state.task_id.clone();

    let outcome = run_producer_consumer(
      &state.task_id,
      &self.tokio_handle,
      &token,
      move |producer_token| async move {
        let produced = executor.execute(producer_token, writer.clone()).await;
        // A failed producer stops the consumer instead.
        if produced.is_ok() {
          writer.close();
        }
        produced
      },
      move |consumer_token| consume_events(consumer_task_id, consumer_token, reader, consumer_processor, Some(broadcaster)),
    )
    .await;

    match outcome {
      Ok(result) => Ok(result),
      Err(failure) => self.recover(&state.task_id, processor, failure).await,
    }
  }

  async fn run_cancellation(self, state: Arc<CancellationState>, active_execution: Option<Arc<ExecutionState>>) {
    let outcome = match active_execution {
      Some(execution) => self.cancel_active_execution(&state, &execution).await,
      None => self.drive_standalone_cancellation(&state).await,
    };
    self.finish_cancellation(&state, outcome).await;
  }

  /// Signals through the execution's pipe and adopts the execution's outcome;
  /// the execution's consumer alone decides the final state.
  async fn cancel_active_execution(
    &self,
    state: &Arc<CancellationState>,
    execution: &Arc<ExecutionState>,
  ) -> Result<SendMessageResult, ExecError> {
    let token = state.worker_token.clone();
    let (canceler, _processor) = catch_panic("canceler factory", self.factory.create_canceler(&token, &state.params))
      .await
      .map_err(ExecError::into_setup_failure)?;

    match catch_panic("canceler", canceler.cancel(token.clone(), execution.pipe_writer.clone())).await {
      Ok(()) => debug!(task_id = %state.task_id, "Cancel signal written to the execution's pipe."),
      Err(ExecError::QueueClosed) => debug!(task_id = %state.task_id, "Execution pipe already closed, awaiting its result."),
      Err(failure) => return Err(failure),
    }

    execution.promise.wait(&token).await
  }

  async fn drive_standalone_cancellation(&self, state: &Arc<CancellationState>) -> Result<SendMessageResult, ExecError> {
    let token = state.worker_token.clone();
    let (canceler, processor) = catch_panic("canceler factory", self.factory.create_canceler(&token, &state.params))
      .await
      .map_err(ExecError::into_setup_failure)?;

    let (writer, reader) = Pipe::new(self.pipe_capacity).split();
    let consumer_processor = processor.clone();
    let consumer_task_id = state.task_id.clone();

    let outcome = run_producer_consumer(
      &state.task_id,
      &self.tokio_handle,
      &token,
      move |producer_token| async move {
        let produced = canceler.cancel(producer_token, writer.clone()).await;
        if produced.is_ok() {
          writer.close();
        }
        produced
      },
      move |consumer_token| consume_events(consumer_task_id, consumer_token, reader, consumer_processor, None),
    )
    .await;

    match outcome {
      Ok(result) => Ok(result),
      Err(failure) => self.recover(&state.task_id, processor, failure).await,
    }
  }

  /// Gives the processor a chance to turn a worker failure into a result.
  async fn recover(
    &self,
    task_id: &str,
    processor: Arc<dyn Processor>,
    failure: ExecError,
  ) -> Result<SendMessageResult, ExecError> {
    debug!(%task_id, error = %failure, "Handing worker failure to the processor.");
    // The worker token may be the reason for the failure; recovery gets its own.
    let recovery_token = CancellationToken::new();
    catch_panic("processor recovery", processor.process_error(&recovery_token, failure)).await
  }

  async fn abort_execution_setup(&self, state: &Arc<ExecutionState>, setup_error: ExecError) -> ExecError {
    let failure = setup_error.into_setup_failure();
    error!(manager = %*self.manager_name, task_id = %state.task_id, error = %failure, "Execution queue setup failed.");
    self.finish_execution(state, Err(failure.clone())).await;
    failure
  }

  /// Tears an execution down once its outcome is known, in this order: close
  /// the pipe, destroy the task's broker, release quota and unregister, queue
  /// the completion notification, resolve the promise.
  ///
  /// The broker is destroyed before the registry entry is removed. While the
  /// entry exists, `execute` rejects the task id, so a new execution of the
  /// same task can never attach to the broker being torn down; it always gets
  /// a fresh one. Resolving the promise last keeps "execution gone" from being
  /// observable before its result.
  async fn finish_execution(&self, state: &Arc<ExecutionState>, outcome: Result<SendMessageResult, ExecError>) {
    let task_id = &state.task_id;
    // Releases a canceler still blocked on a full pipe.
    state.pipe_writer.close();

    if let Err(e) = self.queue_manager.destroy(task_id).await {
      warn!(manager = %*self.manager_name, %task_id, "Failed to destroy task queue: {}", e);
    }

    {
      let mut registry = self.registry.lock();
      registry.limiter.release(state.scope.as_deref());
      let registered = registry
        .executions
        .get(task_id)
        .map_or(false, |current| Arc::ptr_eq(current, state));
      if registered {
        registry.executions.remove(task_id);
      } else {
        error!(manager = %*self.manager_name, %task_id, "Finished execution was not the registered one.");
      }
    }

    match &outcome {
      Ok(result) => info!(
        manager = %*self.manager_name,
        %task_id,
        state = ?result.as_task().map(|task| task.state()),
        "Execution finished."
      ),
      Err(failure) => warn!(manager = %*self.manager_name, %task_id, error = %failure, "Execution failed."),
    }

    let message = InternalCompletionMessage::from_outcome(
      task_id,
      self.manager_name.clone(),
      WorkKind::Execution,
      state.scope.clone(),
      &outcome,
    );
    // Must be queued before the promise resolves; shutdown closes the channel after.
    self.notify(message).await;
    state.promise.resolve(outcome);
  }

  async fn finish_cancellation(&self, state: &Arc<CancellationState>, outcome: Result<SendMessageResult, ExecError>) {
    let task_id = &state.task_id;
    {
      let mut registry = self.registry.lock();
      let registered = registry
        .cancellations
        .get(task_id)
        .map_or(false, |current| Arc::ptr_eq(current, state));
      if registered {
        registry.cancellations.remove(task_id);
      } else {
        error!(manager = %*self.manager_name, %task_id, "Finished cancellation was not the registered one.");
      }
    }

    match &outcome {
      Ok(result) => info!(
        manager = %*self.manager_name,
        %task_id,
        state = ?result.as_task().map(|task| task.state()),
        "Cancellation finished."
      ),
      Err(failure) => warn!(manager = %*self.manager_name, %task_id, error = %failure, "Cancellation failed."),
    }

    let message =
      InternalCompletionMessage::from_outcome(task_id, self.manager_name.clone(), WorkKind::Cancellation, None, &outcome);
    self.notify(message).await;
    state.promise.resolve(outcome);
  }

  async fn notify(&self, message: InternalCompletionMessage) {
    if !self.notifier.has_handlers() {
      return;
    }
    if self.completion_tx.send(message).await.is_err() {
      trace!(manager = %*self.manager_name, "Completion channel closed, notification dropped.");
    }
  }
}

impl Drop for ExecutionManager {
  fn drop(&mut self) {
    if !self.shutdown_token.is_cancelled() {
      info!(
        manager = %*self.context.manager_name,
        "ExecutionManager dropped without shutdown. Stopping admission; in-flight work continues detached."
      );
      self.shutdown_token.cancel();
      let _ = self.context.completion_tx.close();
    } else {
      trace!(manager = %*self.context.manager_name, "Drop: Shutdown already in progress or completed.");
    }
  }
}
