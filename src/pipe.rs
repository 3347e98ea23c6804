use crate::error::ExecError;
use crate::protocol::Event;

use std::fmt;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default number of events buffered between a producer and its consumer.
pub const DEFAULT_PIPE_CAPACITY: usize = 32;

/// A bounded, single-consumer buffer connecting the adapter that emits events
/// for one execution (or one cancellation) to the worker that consumes them.
///
/// Closing is explicit rather than tied to dropping every writer, because a
/// concurrent cancellation borrows a writer for as long as the execution runs.
#[derive(Debug)]
pub(crate) struct Pipe {
  tx: mpsc::Sender<Event>,
  rx: mpsc::Receiver<Event>,
  closed: CancellationToken,
}

impl Pipe {
  pub(crate) fn new(capacity: usize) -> Self {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    Self {
      tx,
      rx,
      closed: CancellationToken::new(),
    }
  }

  /// Splits the pipe into its writer and reader halves.
  pub(crate) fn split(self) -> (PipeWriter, PipeReader) {
    (
      PipeWriter {
        tx: self.tx,
        closed: self.closed.clone(),
      },
      PipeReader {
        rx: self.rx,
        closed: self.closed,
      },
    )
  }
}

/// The writing half handed to executors and cancelers.
#[derive(Clone)]
pub struct PipeWriter {
  tx: mpsc::Sender<Event>,
  closed: CancellationToken,
}

impl fmt::Debug for PipeWriter {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("PipeWriter")
      .field("closed", &self.closed.is_cancelled())
      .field("free_capacity", &self.tx.capacity())
      .finish()
  }
}

impl PipeWriter {
  /// Writes one event, waiting for buffer space if the pipe is full.
  ///
  /// # Errors
  /// `ExecError::QueueClosed` if the pipe was closed before the event was
  /// accepted, `ExecError::Canceled` if `token` fired first.
  pub async fn write(&self, token: &CancellationToken, event: Event) -> Result<(), ExecError> {
    if self.closed.is_cancelled() {
      return Err(ExecError::QueueClosed);
    }

    tokio::select! {
      biased;
      _ = token.cancelled() => Err(ExecError::Canceled),
      _ = self.closed.cancelled() => Err(ExecError::QueueClosed),
      sent = self.tx.send(event) => sent.map_err(|_| ExecError::QueueClosed),
    }
  }

  /// Closes the pipe for every writer. Events already buffered stay readable.
  pub fn close(&self) {
    self.closed.cancel();
  }

  pub fn is_closed(&self) -> bool {
    self.closed.is_cancelled()
  }
}

/// The reading half, owned by the consuming worker.
#[derive(Debug)]
pub(crate) struct PipeReader {
  rx: mpsc::Receiver<Event>,
  closed: CancellationToken,
}

impl PipeReader {
  /// Reads the next event. Buffered events are always returned before the
  /// closed condition is reported.
  pub(crate) async fn read(&mut self, token: &CancellationToken) -> Result<Event, ExecError> {
    tokio::select! {
      biased;
      received = self.rx.recv() => received.ok_or(ExecError::QueueClosed),
      _ = self.closed.cancelled() => self.rx.try_recv().map_err(|_| ExecError::QueueClosed),
      _ = token.cancelled() => Err(ExecError::Canceled),
    }
  }
}
