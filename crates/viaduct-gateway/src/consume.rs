// Consume-session coordinator: bridges one client stream to a backend
// consume handler.
//
// Three subtasks cooperate over bounded channels. The receiver turns client
// frames into the start handshake and the confirmation feed; the sender
// drains backend deliveries onto the stream; the handler driver runs the
// backend and turns its return value into session resolution. The first
// error any of them reports ends the session; the coordinator's drop guard
// then cancels the token and every subtask unwinds.
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use viaduct_backend::{ConsumeHandler, ConsumerConfig};
use viaduct_wire::{Confirmation, ConsumerRequest, Message, StartConsumeRequest};

use crate::HANDOFF_DEPTH;
use crate::error::SessionError;
use crate::fanin::{self, ErrorReporter};
use crate::stream::{FrameSink, FrameSource, TransportError};

/// Run one consume session to completion.
///
/// Returns `Ok(())` on clean shutdown: client EOF, stream cancellation, or
/// the handler finishing its replay. The first protocol violation, transport
/// fault, or backend error ends the session with that error.
pub async fn serve<S, K>(
    handler: Arc<dyn ConsumeHandler>,
    stream_ctx: CancellationToken,
    incoming: S,
    outgoing: K,
) -> Result<(), SessionError>
where
    S: FrameSource + 'static,
    K: FrameSink + 'static,
{
    let cancel = stream_ctx.child_token();
    let _guard = cancel.clone().drop_guard();

    let (start_tx, start_rx) = oneshot::channel();
    let (confirm_tx, confirm_rx) = mpsc::channel(HANDOFF_DEPTH);
    let (reporter, mut collector) = fanin::channel();

    tokio::spawn(recv_frames(
        incoming,
        cancel.clone(),
        start_tx,
        confirm_tx,
        reporter.clone(),
    ));

    // Nothing runs until the start frame lands.
    let start = tokio::select! {
        biased;
        maybe = collector.recv() => {
            return match maybe {
                Some(err) => Err(err),
                None => Ok(()),
            };
        }
        res = start_rx => match res {
            Ok(start) => start,
            // The receiver exited before any start frame. EOF is a clean
            // end; a violation it reported on the way out still wins.
            Err(_) => {
                return match collector.try_recv() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
        },
        _ = cancel.cancelled() => return Ok(()),
    };

    let (delivery_tx, delivery_rx) = mpsc::channel(HANDOFF_DEPTH);
    tokio::spawn(send_deliveries(
        outgoing,
        cancel.clone(),
        delivery_rx,
        reporter.clone(),
    ));

    let config = ConsumerConfig {
        topic: start.topic,
        consumer: start.consumer,
    };
    tracing::debug!(topic = %config.topic, consumer = %config.consumer, "consume session started");
    metrics::counter!("viaduct_sessions_total", "kind" => "consume").increment(1);
    tokio::spawn(drive_handler(
        handler,
        cancel.clone(),
        config,
        delivery_tx,
        confirm_rx,
        reporter,
    ));

    let result = collector.resolve(&cancel).await;
    if let Err(err) = &result {
        metrics::counter!("viaduct_session_errors_total", "kind" => "consume").increment(1);
        tracing::debug!(error = %err, "consume session failed");
    }
    result
}

async fn recv_frames<S: FrameSource>(
    mut incoming: S,
    cancel: CancellationToken,
    start_tx: oneshot::Sender<StartConsumeRequest>,
    confirm_tx: mpsc::Sender<Confirmation>,
    errors: ErrorReporter,
) {
    // Consumed by the first start frame; a second one is a violation.
    let mut start_tx = Some(start_tx);
    loop {
        let frame = tokio::select! {
            res = incoming.next_frame() => match res {
                Ok(Some(frame)) => frame,
                Ok(None) => return,
                Err(err) if err.is_clean_shutdown() => return,
                Err(err) => {
                    errors.report(err.into());
                    return;
                }
            },
            _ = cancel.cancelled() => return,
        };
        match ConsumerRequest::decode(&frame) {
            Ok(ConsumerRequest::Start(start)) => match start_tx.take() {
                Some(tx) => {
                    let _ = tx.send(start);
                }
                None => {
                    errors.report(SessionError::StartedTwice);
                    return;
                }
            },
            Ok(ConsumerRequest::Confirmation(confirm)) => {
                if start_tx.is_some() {
                    errors.report(SessionError::EarlyConfirmation);
                    return;
                }
                tokio::select! {
                    res = confirm_tx.send(confirm) => {
                        // A closed channel means the handler already
                        // finished; the session is resolving.
                        if res.is_err() {
                            return;
                        }
                    }
                    _ = cancel.cancelled() => return,
                }
            }
            Err(err) => {
                errors.report(SessionError::InvalidRequest(err));
                return;
            }
        }
    }
}

async fn send_deliveries<K: FrameSink>(
    mut outgoing: K,
    cancel: CancellationToken,
    mut deliveries: mpsc::Receiver<Message>,
    errors: ErrorReporter,
) {
    loop {
        let message = tokio::select! {
            maybe = deliveries.recv() => match maybe {
                Some(message) => message,
                None => return,
            },
            _ = cancel.cancelled() => return,
        };
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(err) => {
                errors.report(SessionError::Transport(TransportError::Protocol(err)));
                return;
            }
        };
        tokio::select! {
            res = outgoing.send_frame(frame) => {
                if let Err(err) = res {
                    if err.is_clean_shutdown() {
                        tracing::debug!("client left while a delivery was in flight");
                    } else {
                        errors.report(err.into());
                    }
                    return;
                }
            }
            _ = cancel.cancelled() => return,
        }
    }
}

async fn drive_handler(
    handler: Arc<dyn ConsumeHandler>,
    cancel: CancellationToken,
    config: ConsumerConfig,
    deliveries: mpsc::Sender<Message>,
    confirmations: mpsc::Receiver<Confirmation>,
    errors: ErrorReporter,
) {
    match handler
        .handle_consume(cancel.child_token(), config, deliveries, confirmations)
        .await
    {
        // Graceful end of stream is treated exactly like cancellation.
        Ok(()) => cancel.cancel(),
        Err(err) => errors.report(err.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::{TestStream, test_stream};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;
    use viaduct_backend::MockBackend;
    use viaduct_wire::{Code, Frame, StartPublishRequest};

    fn start_frame(topic: &str, consumer: &str) -> Frame {
        StartConsumeRequest {
            topic: topic.to_string(),
            consumer: consumer.to_string(),
        }
        .encode()
        .expect("encode start")
    }

    fn confirm_frame(msg_id: &str) -> Frame {
        Confirmation::new(msg_id).encode().expect("encode confirm")
    }

    async fn preloaded_backend(ids: &[&str]) -> Arc<MockBackend> {
        let backend = Arc::new(MockBackend::new());
        let messages = ids
            .iter()
            .map(|id| Message::new(*id, Bytes::from_static(b"payload")))
            .collect();
        backend.set_topic("t", messages).await;
        backend
    }

    fn spawn_session(
        backend: Arc<MockBackend>,
        stream_ctx: CancellationToken,
    ) -> (TestStream, JoinHandle<Result<(), SessionError>>) {
        let (client, source, sink) = test_stream();
        let task = tokio::spawn(serve(backend, stream_ctx, source, sink));
        (client, task)
    }

    async fn finish(task: JoinHandle<Result<(), SessionError>>) -> Result<(), SessionError> {
        timeout(Duration::from_secs(2), task)
            .await
            .expect("session should settle")
            .expect("join")
    }

    #[tokio::test]
    async fn replays_topic_in_order_and_completes() {
        let backend = preloaded_backend(&["a", "b", "c"]).await;
        let (mut client, task) = spawn_session(backend, CancellationToken::new());

        client.send(start_frame("t", "g")).await;
        for expected in ["a", "b", "c"] {
            let frame = client.recv().await.expect("delivery");
            let message = Message::decode(frame.payload).expect("decode");
            assert_eq!(message.id, expected);
            client.send(confirm_frame(&message.id)).await;
        }

        finish(task).await.expect("session");
        assert!(client.recv().await.is_none(), "no frames after completion");
    }

    #[tokio::test]
    async fn empty_topic_completes_immediately() {
        let backend = preloaded_backend(&[]).await;
        let (mut client, task) = spawn_session(backend, CancellationToken::new());

        client.send(start_frame("t", "g")).await;
        finish(task).await.expect("session");
        assert!(client.recv().await.is_none());
    }

    #[tokio::test]
    async fn wrong_confirmation_fails_with_invalid_argument() {
        let backend = preloaded_backend(&["a"]).await;
        let (mut client, task) = spawn_session(backend, CancellationToken::new());

        client.send(start_frame("t", "g")).await;
        client.recv().await.expect("delivery");
        client.send(confirm_frame("x")).await;

        let err = finish(task).await.expect_err("wrong ack");
        assert_eq!(err.code(), Code::InvalidArgument);
        assert_eq!(err.to_string(), "wrong acknowledgement");
    }

    #[tokio::test]
    async fn second_start_frame_is_rejected() {
        // One undelivered message keeps the session running.
        let backend = preloaded_backend(&["a"]).await;
        let (client, task) = spawn_session(backend, CancellationToken::new());

        client.send(start_frame("t", "g")).await;
        client.send(start_frame("t", "g")).await;

        let err = finish(task).await.expect_err("second start");
        assert!(matches!(err, SessionError::StartedTwice));
        assert_eq!(err.code(), Code::InvalidArgument);
    }

    #[tokio::test]
    async fn confirmation_before_start_is_rejected() {
        let backend = preloaded_backend(&["a"]).await;
        let (client, task) = spawn_session(backend, CancellationToken::new());

        client.send(confirm_frame("a")).await;

        let err = finish(task).await.expect_err("early confirmation");
        assert!(matches!(err, SessionError::EarlyConfirmation));
    }

    #[tokio::test]
    async fn publish_frames_are_rejected_as_invalid() {
        let backend = preloaded_backend(&["a"]).await;
        let (client, task) = spawn_session(backend, CancellationToken::new());

        let foreign = StartPublishRequest {
            topic: "t".to_string(),
        }
        .encode()
        .expect("encode");
        client.send(foreign).await;

        let err = finish(task).await.expect_err("foreign frame");
        assert!(matches!(err, SessionError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn eof_before_start_is_clean() {
        let backend = preloaded_backend(&["a"]).await;
        let (client, task) = spawn_session(backend, CancellationToken::new());

        drop(client);
        finish(task).await.expect("clean eof");
    }

    #[tokio::test]
    async fn eof_after_start_lets_the_backend_finish() {
        let backend = preloaded_backend(&["a"]).await;
        let (mut client, task) = spawn_session(backend, CancellationToken::new());

        client.send(start_frame("t", "g")).await;
        client.recv().await.expect("delivery");
        drop(client.to_server);

        // The handler sees its confirmation feed close and returns Ok.
        finish(task).await.expect("clean eof");
    }

    #[tokio::test]
    async fn stream_cancellation_resolves_promptly_without_error() {
        let backend = preloaded_backend(&["a"]).await;
        let stream_ctx = CancellationToken::new();
        let (mut client, task) = spawn_session(backend, stream_ctx.clone());

        client.send(start_frame("t", "g")).await;
        client.recv().await.expect("delivery");
        stream_ctx.cancel();

        finish(task).await.expect("cancellation is success");
    }

    #[tokio::test]
    async fn cancelled_sentinel_from_transport_is_clean() {
        let backend = preloaded_backend(&["a"]).await;
        let (mut client, task) = spawn_session(backend, CancellationToken::new());

        client.send(start_frame("t", "g")).await;
        client.recv().await.expect("delivery");
        client.send_failure(TransportError::Cancelled).await;

        finish(task).await.expect("sentinel is clean");
    }

    #[tokio::test]
    async fn transport_fault_surfaces_as_internal() {
        let backend = preloaded_backend(&["a"]).await;
        let (client, task) = spawn_session(backend, CancellationToken::new());

        client.send(start_frame("t", "g")).await;
        client
            .send_failure(TransportError::Io(std::io::Error::other("wire torn")))
            .await;

        let err = finish(task).await.expect_err("transport fault");
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(err.code(), Code::Internal);
    }
}
