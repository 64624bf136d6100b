// Per-connection session dispatch: one TCP connection carries one session,
// and the first frame picks which coordinator runs it.
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{Context, Result};
use bytes::BytesMut;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use viaduct_backend::{BackendError, ConsumeHandler, ProduceHandler};
use viaduct_gateway::{FrameSink, FrameSource, SessionError, TransportError, consume, publish};
use viaduct_wire::{Code, ErrorInfo, FLAG_START_CONSUME, FLAG_START_PUBLISH, Frame};

use super::codec;
use crate::config::GatewayConfig;

/// Backend capabilities the gateway serves. Either side may be absent;
/// sessions of that kind are rejected with `Unimplemented`.
#[derive(Clone, Default)]
pub struct Handlers {
    pub consume: Option<Arc<dyn ConsumeHandler>>,
    pub produce: Option<Arc<dyn ProduceHandler>>,
}

impl Handlers {
    /// Serve both directions from one backend.
    pub fn from_backend<B>(backend: Arc<B>) -> Self
    where
        B: ConsumeHandler + ProduceHandler + 'static,
    {
        Self {
            consume: Some(Arc::clone(&backend) as Arc<dyn ConsumeHandler>),
            produce: Some(backend as Arc<dyn ProduceHandler>),
        }
    }

    /// Serve only the consume direction.
    pub fn consume_only(handler: Arc<dyn ConsumeHandler>) -> Self {
        Self {
            consume: Some(handler),
            produce: None,
        }
    }

    /// Serve only the publish direction.
    pub fn produce_only(handler: Arc<dyn ProduceHandler>) -> Self {
        Self {
            consume: None,
            produce: Some(handler),
        }
    }
}

/// Accept loop: one task per connection, all bound to `shutdown`.
pub async fn serve(
    listener: TcpListener,
    handlers: Handlers,
    config: GatewayConfig,
    shutdown: CancellationToken,
) -> Result<()> {
    loop {
        let (stream, peer) = tokio::select! {
            res = listener.accept() => res.context("accept connection")?,
            _ = shutdown.cancelled() => return Ok(()),
        };
        tracing::debug!(%peer, "connection accepted");
        metrics::counter!("viaduct_connections_total").increment(1);

        let handlers = handlers.clone();
        let session_ctx = shutdown.child_token();
        let max_frame_bytes = config.max_frame_bytes;
        tokio::spawn(async move {
            if let Err(err) = handle_connection(stream, handlers, max_frame_bytes, session_ctx).await
            {
                tracing::info!(%peer, error = %err, "session ended with error");
            }
        });
    }
}

async fn handle_connection(
    stream: TcpStream,
    handlers: Handlers,
    max_frame_bytes: usize,
    session_ctx: CancellationToken,
) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut source = TcpFrameSource::new(read_half, max_frame_bytes);
    let write = Arc::new(Mutex::new(write_half));

    // Read the first frame to pick the session kind, then replay it so the
    // coordinator's receiver sees the full stream from the start.
    let first = match source.next_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(()),
        Err(err) if err.is_clean_shutdown() => return Ok(()),
        Err(err) => return Err(err.into()),
    };
    let kind = first.header.flags;
    source.replay(first);

    let sink = TcpFrameSink {
        write: Arc::clone(&write),
    };
    let result = match kind {
        FLAG_START_CONSUME => match &handlers.consume {
            Some(handler) => {
                consume::serve(Arc::clone(handler), session_ctx, source, sink).await
            }
            None => Err(SessionError::Backend(BackendError::new(
                Code::Unimplemented,
                "backend does not support consuming",
            ))),
        },
        FLAG_START_PUBLISH => match &handlers.produce {
            Some(handler) => {
                publish::serve(Arc::clone(handler), session_ctx, source, sink).await
            }
            None => Err(SessionError::Backend(BackendError::new(
                Code::Unimplemented,
                "backend does not support publishing",
            ))),
        },
        tag => Err(SessionError::InvalidRequest(
            viaduct_wire::Error::UnknownTag(tag),
        )),
    };

    match result {
        Ok(()) => Ok(()),
        Err(err) => {
            // The session has resolved and its sender is unwinding, so the
            // lock serialises any straggling write before the status frame.
            if let Ok(frame) = ErrorInfo::new(err.code(), err.to_string()).encode() {
                let mut guard = write.lock().await;
                if let Err(write_err) = codec::write_frame(&mut *guard, &frame).await {
                    tracing::debug!(error = %write_err, "failed to report session error to client");
                }
            }
            Err(err.into())
        }
    }
}

struct TcpFrameSource {
    read: OwnedReadHalf,
    scratch: BytesMut,
    pending: Option<Frame>,
    max_frame_bytes: usize,
}

impl TcpFrameSource {
    fn new(read: OwnedReadHalf, max_frame_bytes: usize) -> Self {
        Self {
            read,
            scratch: BytesMut::new(),
            pending: None,
            max_frame_bytes,
        }
    }

    // Hand a frame back so the next read returns it first.
    fn replay(&mut self, frame: Frame) {
        self.pending = Some(frame);
    }
}

impl FrameSource for TcpFrameSource {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, TransportError>> + Send + '_>> {
        Box::pin(async move {
            if let Some(frame) = self.pending.take() {
                return Ok(Some(frame));
            }
            codec::read_frame_limited(&mut self.read, self.max_frame_bytes, &mut self.scratch).await
        })
    }
}

struct TcpFrameSink {
    write: Arc<Mutex<OwnedWriteHalf>>,
}

impl FrameSink for TcpFrameSink {
    fn send_frame(
        &mut self,
        frame: Frame,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>> {
        Box::pin(async move {
            let mut guard = self.write.lock().await;
            codec::write_frame(&mut *guard, &frame).await
        })
    }
}
