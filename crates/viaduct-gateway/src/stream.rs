// Stream seam between a transport adapter and the session coordinators.
use std::future::Future;
use std::pin::Pin;

use viaduct_wire::Frame;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    /// The stream context ended underneath an operation.
    #[error("stream cancelled")]
    Cancelled,
    /// The peer went away mid-stream.
    #[error("stream closed by peer")]
    Closed,
    #[error("protocol: {0}")]
    Protocol(#[from] viaduct_wire::Error),
    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Whether this failure is one of the structural shutdown sentinels.
    /// Shutdown is never classified by matching error message text.
    pub fn is_clean_shutdown(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Closed)
    }
}

/// Client-to-server direction of a stream. `Ok(None)` is end of stream.
pub trait FrameSource: Send {
    fn next_frame(
        &mut self,
    ) -> Pin<Box<dyn Future<Output = Result<Option<Frame>, TransportError>> + Send + '_>>;
}

/// Server-to-client direction of a stream.
pub trait FrameSink: Send {
    fn send_frame(
        &mut self,
        frame: Frame,
    ) -> Pin<Box<dyn Future<Output = Result<(), TransportError>> + Send + '_>>;
}

#[cfg(test)]
pub(crate) use testing::{TestStream, test_stream};
