use crate::adapter::Processor;
use crate::error::ExecError;
use crate::pipe::PipeReader;
use crate::protocol::SendMessageResult;
use crate::queue::EventQueue;

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::runtime::Handle as TokioHandle;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info_span, trace, warn, Instrument};

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
  if let Some(message) = payload.downcast_ref::<&str>() {
    (*message).to_string()
  } else if let Some(message) = payload.downcast_ref::<String>() {
    message.clone()
  } else {
    "non-string panic payload".to_string()
  }
}

/// Runs `future`, turning a panic into `ExecError::ProcessingFailure`.
pub(crate) async fn catch_panic<F, T>(what: &'static str, future: F) -> Result<T, ExecError>
where
  F: Future<Output = Result<T, ExecError>>,
{
  match AssertUnwindSafe(future).catch_unwind().await {
    Ok(outcome) => outcome,
    Err(payload) => {
      let message = panic_message(&*payload);
      error!("{} panicked: {}", what, message);
      Err(ExecError::ProcessingFailure(format!("{} panicked: {}", what, message)))
    }
  }
}

async fn join_worker<T>(handle: JoinHandle<Result<T, ExecError>>) -> Result<T, ExecError> {
  match handle.await {
    Ok(outcome) => outcome,
    Err(join_error) => Err(ExecError::ProcessingFailure(format!(
      "worker terminated abnormally: {}",
      join_error
    ))),
  }
}

/// Runs a producer and a consumer as two supervised tasks.
///
/// The consumer finishing (with a result or an error) cancels the producer's
/// token; the producer failing cancels the consumer's. A producer that
/// finishes cleanly leaves the consumer running so it can drain the pipe.
///
/// Both sides are joined before the outcome is decided. A result from the
/// consumer always wins. A producer failure wins over a consumer that only
/// saw the pipe close or its token fire, since those follow from the
/// producer stopping. Any other consumer failure is returned as is.
pub(crate) async fn run_producer_consumer<P, PF, C, CF>(
  task_id: &str,
  tokio_handle: &TokioHandle,
  group_token: &CancellationToken,
  producer: P,
  consumer: C,
) -> Result<SendMessageResult, ExecError>
where
  P: FnOnce(CancellationToken) -> PF,
  PF: Future<Output = Result<(), ExecError>> + Send + 'static,
  C: FnOnce(CancellationToken) -> CF,
  CF: Future<Output = Result<SendMessageResult, ExecError>> + Send + 'static,
{
  let producer_token = group_token.child_token();
  let consumer_token = group_token.child_token();

  let producer_handle = tokio_handle.spawn(
    catch_panic("producer", producer(producer_token.clone())).instrument(info_span!("execution_producer", %task_id)),
  );
  let consumer_handle = tokio_handle.spawn(
    catch_panic("consumer", consumer(consumer_token.clone())).instrument(info_span!("execution_consumer", %task_id)),
  );

  let producer_side = async {
    let outcome = join_worker(producer_handle).await;
    match &outcome {
      Ok(()) => trace!(%task_id, "Producer finished."),
      Err(failure) => {
        debug!(%task_id, error = %failure, "Producer failed, stopping consumer.");
        consumer_token.cancel();
      }
    }
    outcome
  };

  let consumer_side = async {
    let outcome = join_worker(consumer_handle).await;
    producer_token.cancel();
    if let Err(failure) = &outcome {
      debug!(%task_id, error = %failure, "Consumer stopped without a result.");
    }
    outcome
  };

  let (producer_outcome, consumer_outcome) = tokio::join!(producer_side, consumer_side);
  match (producer_outcome, consumer_outcome) {
    (_, Ok(result)) => Ok(result),
    (Err(producer_failure), Err(ExecError::QueueClosed | ExecError::Canceled)) => Err(producer_failure),
    (_, Err(consumer_failure)) => Err(consumer_failure),
  }
}

/// Drains `reader`, hands every event to `processor`, and re-publishes it
/// through `broadcaster` when one is given. Returns the first result the
/// processor reports.
///
/// An event the processor rejects is still re-published before its error is
/// returned.
pub(crate) async fn consume_events(
  task_id: String,
  token: CancellationToken,
  mut reader: PipeReader,
  processor: Arc<dyn Processor>,
  broadcaster: Option<Box<dyn EventQueue>>,
) -> Result<SendMessageResult, ExecError> {
  let mut processed = 0usize;
  loop {
    let event = reader.read(&token).await?;
    processed += 1;

    let published = broadcaster.as_ref().map(|_| event.clone());
    let outcome = processor.process(&token, event).await;

    if let (Some(broadcaster), Some(event)) = (broadcaster.as_ref(), published) {
      if let Err(failure) = broadcaster.write(&token, event).await {
        if matches!(outcome, Ok(None)) && failure == ExecError::Canceled {
          return Err(failure);
        }
        warn!(%task_id, error = %failure, "Consumer: Failed to re-broadcast event.");
      }
    }

    let result = outcome?;

    if let Some(result) = result {
      debug!(%task_id, processed, "Consumer: Result reached.");
      return Ok(result);
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::broker::EventBroker;
  use crate::pipe::Pipe;
  use crate::protocol::{Event, Task, TaskState};
  use async_trait::async_trait;

  struct FinalEventProcessor;

  #[async_trait]
  impl Processor for FinalEventProcessor {
    async fn process(&self, _token: &CancellationToken, event: Event) -> Result<Option<SendMessageResult>, ExecError> {
      match event {
        Event::Task(task) if task.state().is_terminal() => Ok(Some(SendMessageResult::Task(task))),
        _ => Ok(None),
      }
    }
  }

  fn completed_task() -> SendMessageResult {
    SendMessageResult::Task(Task::new("t1", "ctx", TaskState::Completed))
  }

  #[tokio::test]
  async fn test_consumer_result_wins_over_stopped_producer() {
    let group = CancellationToken::new();
    let outcome = run_producer_consumer(
      "t1",
      &TokioHandle::current(),
      &group,
      |token| async move {
        token.cancelled().await;
        Err(ExecError::Canceled)
      },
      |_token| async move { Ok(completed_task()) },
    )
    .await;
    assert_eq!(outcome, Ok(completed_task()));
  }

  #[tokio::test]
  async fn test_producer_failure_stops_consumer_and_is_reported() {
    let group = CancellationToken::new();
    let outcome = run_producer_consumer(
      "t1",
      &TokioHandle::current(),
      &group,
      |_token| async move { Err(ExecError::ProcessingFailure("agent crashed".to_string())) },
      |token| async move {
        token.cancelled().await;
        Err(ExecError::Canceled)
      },
    )
    .await;
    assert_eq!(outcome, Err(ExecError::ProcessingFailure("agent crashed".to_string())));
  }

  #[tokio::test]
  async fn test_producer_panic_becomes_processing_failure() {
    let group = CancellationToken::new();
    let outcome = run_producer_consumer(
      "t1",
      &TokioHandle::current(),
      &group,
      |_token| async move {
        if true {
          panic!("executor exploded");
        }
        Ok(())
      },
      |token| async move {
        token.cancelled().await;
        Err(ExecError::Canceled)
      },
    )
    .await;
    match outcome {
      Err(ExecError::ProcessingFailure(message)) => assert!(message.contains("executor exploded"), "{}", message),
      other => panic!("Expected ProcessingFailure, got {:?}", other),
    }
  }

  #[tokio::test]
  async fn test_consumer_drains_pipe_after_producer_returns() {
    let group = CancellationToken::new();
    let (writer, reader) = Pipe::new(4).split();
    let processor: Arc<dyn Processor> = Arc::new(FinalEventProcessor);

    let outcome = run_producer_consumer(
      "t1",
      &TokioHandle::current(),
      &group,
      move |token| async move {
        writer.write(&token, Event::Task(Task::new("t1", "ctx", TaskState::Working))).await?;
        writer.write(&token, Event::Task(Task::new("t1", "ctx", TaskState::Completed))).await?;
        writer.close();
        Ok(())
      },
      move |token| consume_events("t1".to_string(), token, reader, processor, None),
    )
    .await;
    assert_eq!(outcome, Ok(completed_task()));
  }

  #[tokio::test]
  async fn test_consumer_reports_closed_pipe_without_result() {
    let group = CancellationToken::new();
    let (writer, reader) = Pipe::new(4).split();
    let processor: Arc<dyn Processor> = Arc::new(FinalEventProcessor);

    let outcome = run_producer_consumer(
      "t1",
      &TokioHandle::current(),
      &group,
      move |token| async move {
        writer.write(&token, Event::Task(Task::new("t1", "ctx", TaskState::Working))).await?;
        writer.close();
        Ok(())
      },
      move |token| consume_events("t1".to_string(), token, reader, processor, None),
    )
    .await;
    assert_eq!(outcome, Err(ExecError::QueueClosed));
  }

  #[tokio::test]
  async fn test_group_token_stops_both_workers() {
    let group = CancellationToken::new();
    group.cancel();
    let outcome = run_producer_consumer(
      "t1",
      &TokioHandle::current(),
      &group,
      |token| async move {
        token.cancelled().await;
        Err(ExecError::Canceled)
      },
      |token| async move {
        token.cancelled().await;
        Err(ExecError::Canceled)
      },
    )
    .await;
    assert_eq!(outcome, Err(ExecError::Canceled));
  }

  #[tokio::test]
  async fn test_producer_failure_wins_over_closed_pipe() {
    // Current-thread: the consumer can observe the dropped writer before the
    // producer's error is joined.
    for _ in 0..50 {
      let group = CancellationToken::new();
      let (writer, reader) = Pipe::new(4).split();
      let processor: Arc<dyn Processor> = Arc::new(FinalEventProcessor);

      let outcome = run_producer_consumer(
        "t1",
        &TokioHandle::current(),
        &group,
        move |_token| async move {
          drop(writer);
          Err(ExecError::ProcessingFailure("canceler refused".to_string()))
        },
        move |token| consume_events("t1".to_string(), token, reader, processor, None),
      )
      .await;
      assert_eq!(outcome, Err(ExecError::ProcessingFailure("canceler refused".to_string())));
    }
  }

  #[tokio::test]
  async fn test_consumer_processing_failure_wins_over_stopped_producer() {
    let group = CancellationToken::new();
    let outcome = run_producer_consumer(
      "t1",
      &TokioHandle::current(),
      &group,
      |token| async move {
        token.cancelled().await;
        Err(ExecError::Canceled)
      },
      |_token| async move { Err(ExecError::ProcessingFailure("bad event".to_string())) },
    )
    .await;
    assert_eq!(outcome, Err(ExecError::ProcessingFailure("bad event".to_string())));
  }

  struct RejectingProcessor;

  #[async_trait]
  impl Processor for RejectingProcessor {
    async fn process(&self, _token: &CancellationToken, _event: Event) -> Result<Option<SendMessageResult>, ExecError> {
      Err(ExecError::ProcessingFailure("bad event".to_string()))
    }
  }

  #[tokio::test]
  async fn test_rejected_event_is_still_broadcast() {
    let token = CancellationToken::new();
    let broker = EventBroker::new("t1", 4, &TokioHandle::current());
    let broadcaster = broker.connect().await.unwrap();
    let mut subscriber = broker.connect().await.unwrap();

    let (writer, reader) = Pipe::new(4).split();
    let event = Event::Task(Task::new("t1", "ctx", TaskState::Working));
    writer.write(&token, event.clone()).await.unwrap();

    let outcome = consume_events(
      "t1".to_string(),
      token.clone(),
      reader,
      Arc::new(RejectingProcessor),
      Some(Box::new(broadcaster)),
    )
    .await;
    assert_eq!(outcome, Err(ExecError::ProcessingFailure("bad event".to_string())));
    assert_eq!(subscriber.receive(&token).await, Ok(event));

    broker.destroy().await;
  }
}
