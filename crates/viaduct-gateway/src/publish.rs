// Publish-session coordinator: bridges one client stream to a backend
// produce handler.
//
// Mirror of the consume coordinator with one structural difference: the
// confirmation sender holds no cancellation arm. The handler owns the only
// confirmation sender, so the channel closes exactly once, when the handler
// driver returns, and channel close is the sender's exit signal.
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use viaduct_backend::{ProduceHandler, ProducerConfig};
use viaduct_wire::{Confirmation, Message, ProducerRequest, StartPublishRequest};

use crate::HANDOFF_DEPTH;
use crate::error::SessionError;
use crate::fanin::{self, ErrorReporter};
use crate::stream::{FrameSink, FrameSource, TransportError};

/// Run one publish session to completion.
///
/// Returns `Ok(())` on clean shutdown: client EOF, stream cancellation, or
/// the handler returning after its input ends. The first protocol violation,
/// transport fault, or backend error ends the session with that error.
pub async fn serve<S, K>(
    handler: Arc<dyn ProduceHandler>,
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
    let (message_tx, message_rx) = mpsc::channel(HANDOFF_DEPTH);
    let (reporter, mut collector) = fanin::channel();

    tokio::spawn(recv_frames(
        incoming,
        cancel.clone(),
        start_tx,
        message_tx,
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
            Err(_) => {
                return match collector.try_recv() {
                    Some(err) => Err(err),
                    None => Ok(()),
                };
            }
        },
        _ = cancel.cancelled() => return Ok(()),
    };

    let (confirm_tx, confirm_rx) = mpsc::channel(HANDOFF_DEPTH);
    tokio::spawn(send_confirmations(outgoing, confirm_rx, reporter.clone()));

    let config = ProducerConfig { topic: start.topic };
    tracing::debug!(topic = %config.topic, "publish session started");
    metrics::counter!("viaduct_sessions_total", "kind" => "publish").increment(1);
    tokio::spawn(drive_handler(
        handler,
        cancel.clone(),
        config,
        confirm_tx,
        message_rx,
        reporter,
    ));

    let result = collector.resolve(&cancel).await;
    if let Err(err) = &result {
        metrics::counter!("viaduct_session_errors_total", "kind" => "publish").increment(1);
        tracing::debug!(error = %err, "publish session failed");
    }
    result
}

async fn recv_frames<S: FrameSource>(
    mut incoming: S,
    cancel: CancellationToken,
    start_tx: oneshot::Sender<StartPublishRequest>,
    message_tx: mpsc::Sender<Message>,
    errors: ErrorReporter,
) {
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
        match ProducerRequest::decode(&frame) {
            Ok(ProducerRequest::Start(start)) => match start_tx.take() {
                Some(tx) => {
                    let _ = tx.send(start);
                }
                None => {
                    errors.report(SessionError::StartedTwice);
                    return;
                }
            },
            Ok(ProducerRequest::Message(message)) => {
                if start_tx.is_some() {
                    errors.report(SessionError::NotConnected);
                    return;
                }
                tokio::select! {
                    res = message_tx.send(message) => {
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

async fn send_confirmations<K: FrameSink>(
    mut outgoing: K,
    mut confirmations: mpsc::Receiver<Confirmation>,
    errors: ErrorReporter,
) {
    // No cancellation arm: the channel closing when the handler driver
    // returns is this task's exit signal.
    while let Some(confirm) = confirmations.recv().await {
        let frame = match confirm.encode() {
            Ok(frame) => frame,
            Err(err) => {
                errors.report(SessionError::Transport(TransportError::Protocol(err)));
                return;
            }
        };
        if let Err(err) = outgoing.send_frame(frame).await {
            if err.is_clean_shutdown() {
                tracing::debug!("client left while a confirmation was in flight");
            } else {
                errors.report(err.into());
            }
            return;
        }
    }
}

async fn drive_handler(
    handler: Arc<dyn ProduceHandler>,
    cancel: CancellationToken,
    config: ProducerConfig,
    confirmations: mpsc::Sender<Confirmation>,
    messages: mpsc::Receiver<Message>,
    errors: ErrorReporter,
) {
    match handler
        .handle_produce(cancel.child_token(), config, confirmations, messages)
        .await
    {
        // Graceful end of stream is treated exactly like cancellation.
        Ok(()) => cancel.cancel(),
        Err(err) => errors.report(err.into()),
    }
}
