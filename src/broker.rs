//! Per-task publish/subscribe hub.
//!
//! Every broker runs one coordinator task that owns the set of registered
//! connections. Connections never touch that set directly: they send commands
//! to the coordinator, which handles them strictly one at a time. That
//! ordering makes fan-out and membership changes race-free without locks and
//! gives every subscriber of a task the same event order.
//!
//! Broadcast, register and unregister share a single command channel of
//! capacity 1, and each command waits for a oneshot acknowledgement, so every
//! request is a rendezvous with the coordinator in one total order. Destroy is
//! not a command: it is a `CancellationToken` the coordinator checks alongside
//! the command channel and inside every delivery, so it takes effect even
//! while a broadcast is blocked on a full subscriber buffer.

use crate::error::ExecError;
use crate::protocol::{Event, TaskId};
use crate::queue::EventQueue;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::runtime::Handle as TokioHandle;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

lazy_static::lazy_static! {
  static ref NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);
}

/// Default number of events buffered per subscriber connection.
pub const DEFAULT_CONNECTION_CAPACITY: usize = 32;

pub type ConnectionId = u64;

enum BrokerCommand {
  Broadcast {
    sender: ConnectionId,
    event: Event,
    done: oneshot::Sender<()>,
  },
  Register {
    id: ConnectionId,
    tx: mpsc::Sender<Event>,
    done: oneshot::Sender<()>,
  },
  Unregister {
    id: ConnectionId,
    done: oneshot::Sender<()>,
  },
}

/// The event fan-out hub for a single task.
pub struct EventBroker {
  task_id: TaskId,
  connection_capacity: usize,
  commands: mpsc::Sender<BrokerCommand>,
  destroyed: CancellationToken,
  coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for EventBroker {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("EventBroker")
      .field("task_id", &self.task_id)
      .field("destroyed", &self.destroyed.is_cancelled())
      .finish_non_exhaustive()
  }
}

impl EventBroker {
  /// Creates a broker and starts its coordinator on `tokio_handle`.
  pub fn new(task_id: impl Into<TaskId>, connection_capacity: usize, tokio_handle: &TokioHandle) -> Arc<Self> {
    let task_id = task_id.into();
    // Capacity 1 plus a completion reply per command keeps every request a
    // rendezvous with the coordinator.
    let (commands_tx, commands_rx) = mpsc::channel(1);
    let destroyed = CancellationToken::new();

    let coordinator = tokio_handle.spawn(
      Self::run_coordinator(task_id.clone(), commands_rx, destroyed.clone())
        .instrument(info_span!("event_broker", %task_id)),
    );

    Arc::new(Self {
      task_id,
      connection_capacity: connection_capacity.max(1),
      commands: commands_tx,
      destroyed,
      coordinator: Mutex::new(Some(coordinator)),
    })
  }

  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  pub fn is_destroyed(&self) -> bool {
    self.destroyed.is_cancelled()
  }

  /// Registers a new subscriber connection.
  ///
  /// # Errors
  /// `ExecError::BrokerDestroyed` if the broker was destroyed.
  pub async fn connect(&self) -> Result<BrokerConnection, ExecError> {
    let id = NEXT_CONNECTION_ID.fetch_add(1, AtomicOrdering::Relaxed);
    let (tx, rx) = mpsc::channel(self.connection_capacity);
    let (done_tx, done_rx) = oneshot::channel();

    self
      .request(BrokerCommand::Register { id, tx, done: done_tx }, done_rx)
      .await?;

    debug!(task_id = %self.task_id, connection_id = id, "Broker: Connection registered.");
    Ok(BrokerConnection {
      id,
      task_id: self.task_id.clone(),
      rx,
      commands: self.commands.clone(),
      destroyed: self.destroyed.clone(),
      closed: false,
    })
  }

  /// Stops the coordinator, force-closing every registered connection.
  /// Calling it again is a no-op.
  pub async fn destroy(&self) {
    self.destroyed.cancel();

    let handle_to_await = self.coordinator.lock().take();
    if let Some(handle) = handle_to_await {
      if let Err(join_error) = handle.await {
        error!(task_id = %self.task_id, "Broker: Coordinator terminated abnormally: {:?}", join_error);
      } else {
        debug!(task_id = %self.task_id, "Broker: Destroyed.");
      }
    } else {
      trace!(task_id = %self.task_id, "Broker: Destroy already performed.");
    }
  }

  async fn request(&self, command: BrokerCommand, done: oneshot::Receiver<()>) -> Result<(), ExecError> {
    if self.destroyed.is_cancelled() {
      return Err(ExecError::BrokerDestroyed(self.task_id.clone()));
    }
    send_command(&self.task_id, &self.commands, &self.destroyed, command, done).await
  }

  async fn run_coordinator(
    task_id: TaskId,
    mut commands: mpsc::Receiver<BrokerCommand>,
    destroyed: CancellationToken,
  ) {
    trace!(%task_id, "Broker coordinator started.");
    let mut connections: HashMap<ConnectionId, mpsc::Sender<Event>> = HashMap::new();

    'coordinator: loop {
      let command = tokio::select! {
        biased;
        _ = destroyed.cancelled() => break,
        received = commands.recv() => match received {
          Some(command) => command,
          None => break,
        },
      };

      match command {
        BrokerCommand::Broadcast { sender, event, done } => {
          let mut gone = Vec::new();
          for (id, tx) in connections.iter() {
            if *id == sender {
              continue;
            }
            // A full buffer blocks here, which is what pushes back on publishers.
            tokio::select! {
              biased;
              _ = destroyed.cancelled() => break 'coordinator,
              delivered = tx.send(event.clone()) => {
                if delivered.is_err() {
                  gone.push(*id);
                }
              }
            }
          }
          for id in gone {
            debug!(%task_id, connection_id = id, "Broker: Dropping connection whose reader is gone.");
            connections.remove(&id);
          }
          let _ = done.send(());
        }
        BrokerCommand::Register { id, tx, done } => {
          connections.insert(id, tx);
          let _ = done.send(());
        }
        BrokerCommand::Unregister { id, done } => {
          if connections.remove(&id).is_some() {
            trace!(%task_id, connection_id = id, "Broker: Connection unregistered.");
          }
          let _ = done.send(());
        }
      }
    }

    // Dropping the senders closes every connection; buffered events stay readable.
    debug!(%task_id, open_connections = connections.len(), "Broker coordinator stopped, force-closing connections.");
    connections.clear();
  }
}

async fn send_command(
  task_id: &str,
  commands: &mpsc::Sender<BrokerCommand>,
  destroyed: &CancellationToken,
  command: BrokerCommand,
  done: oneshot::Receiver<()>,
) -> Result<(), ExecError> {
  let destroyed_error = || ExecError::BrokerDestroyed(task_id.to_string());

  tokio::select! {
    biased;
    _ = destroyed.cancelled() => return Err(destroyed_error()),
    sent = commands.send(command) => sent.map_err(|_| destroyed_error())?,
  }
  done.await.map_err(|_| destroyed_error())
}

/// One subscriber's endpoint into an [`EventBroker`].
///
/// Writing broadcasts to every other connection of the same broker; reading
/// yields what other connections published.
pub struct BrokerConnection {
  id: ConnectionId,
  task_id: TaskId,
  rx: mpsc::Receiver<Event>,
  commands: mpsc::Sender<BrokerCommand>,
  destroyed: CancellationToken,
  closed: bool,
}

impl fmt::Debug for BrokerConnection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BrokerConnection")
      .field("id", &self.id)
      .field("task_id", &self.task_id)
      .field("closed", &self.closed)
      .finish_non_exhaustive()
  }
}

impl BrokerConnection {
  pub fn id(&self) -> ConnectionId {
    self.id
  }

  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  /// Publishes `event` to every other registered connection. Returns once the
  /// coordinator has handed the event to each of their buffers.
  pub async fn broadcast(&self, token: &CancellationToken, event: Event) -> Result<(), ExecError> {
    if self.closed {
      return Err(ExecError::QueueClosed);
    }
    if self.destroyed.is_cancelled() {
      return Err(ExecError::BrokerDestroyed(self.task_id.clone()));
    }

    let (done_tx, done_rx) = oneshot::channel();
    let command = BrokerCommand::Broadcast {
      sender: self.id,
      event,
      done: done_tx,
    };

    tokio::select! {
      biased;
      _ = token.cancelled() => Err(ExecError::Canceled),
      delivered = send_command(&self.task_id, &self.commands, &self.destroyed, command, done_rx) => delivered,
    }
  }

  /// Receives the next event published by another connection.
  ///
  /// Events buffered before a forced close are still returned, then
  /// `ExecError::QueueClosed` is reported.
  pub async fn receive(&mut self, token: &CancellationToken) -> Result<Event, ExecError> {
    if self.closed {
      return Err(ExecError::QueueClosed);
    }

    tokio::select! {
      biased;
      received = self.rx.recv() => received.ok_or(ExecError::QueueClosed),
      _ = token.cancelled() => Err(ExecError::Canceled),
    }
  }

  /// Unregisters this connection. Subsequent reads report `QueueClosed`.
  pub async fn shutdown(&mut self) {
    if self.closed {
      return;
    }
    self.closed = true;

    if self.destroyed.is_cancelled() {
      return;
    }

    let (done_tx, done_rx) = oneshot::channel();
    let command = BrokerCommand::Unregister { id: self.id, done: done_tx };
    let unregister = send_command(&self.task_id, &self.commands, &self.destroyed, command, done_rx);
    tokio::pin!(unregister);

    // Keep draining while the request is pending so a coordinator blocked on
    // this connection's full buffer can finish its broadcast.
    let mut drained = 0usize;
    loop {
      tokio::select! {
        biased;
        _ = &mut unregister => break,
        received = self.rx.recv() => match received {
          Some(_) => drained += 1,
          None => break,
        },
      }
    }
    if drained > 0 {
      debug!(task_id = %self.task_id, connection_id = self.id, drained, "Broker: Discarded undelivered events on close.");
    }
  }
}

impl Drop for BrokerConnection {
  fn drop(&mut self) {
    if self.closed || self.destroyed.is_cancelled() {
      return;
    }
    // Best effort: if the request does not fit, the coordinator drops this
    // connection on its next failed delivery instead.
    let (done_tx, _done_rx) = oneshot::channel();
    if self
      .commands
      .try_send(BrokerCommand::Unregister { id: self.id, done: done_tx })
      .is_err()
    {
      warn!(task_id = %self.task_id, connection_id = self.id, "Broker: Connection dropped without close, deferring unregister.");
    }
  }
}

#[async_trait]
impl EventQueue for BrokerConnection {
  async fn read(&mut self, token: &CancellationToken) -> Result<Event, ExecError> {
    self.receive(token).await
  }

  async fn write(&self, token: &CancellationToken, event: Event) -> Result<(), ExecError> {
    self.broadcast(token, event).await
  }

  async fn close(&mut self) {
    self.shutdown().await
  }
}
