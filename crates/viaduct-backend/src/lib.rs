// Backend capability contracts: a backend speaks the asynchronous message
// source / message sink interface and implements only the directions it
// supports. The gateway coordinators drive these traits through channels.
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use viaduct_wire::{Code, Confirmation, Message};

pub mod mock;

pub use mock::MockBackend;

pub type Result<T> = std::result::Result<T, BackendError>;

/// Error returned by a backend handler. The code is forwarded to the client
/// verbatim; handlers that have nothing more specific should use `internal`.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct BackendError {
    pub code: Code,
    pub message: String,
}

impl BackendError {
    pub fn new(code: Code, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(Code::InvalidArgument, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(Code::Internal, message)
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::new(Code::Unavailable, message)
    }
}

/// Immutable per-session consumer identity, derived from the start frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerConfig {
    pub topic: String,
    pub consumer: String,
}

/// Immutable per-session producer identity, derived from the start frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerConfig {
    pub topic: String,
}

/// Health snapshot reported by a backend.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackendStatus {
    pub working: bool,
    pub problems: Vec<String>,
}

/// A backend that can serve consume sessions.
#[async_trait]
pub trait ConsumeHandler: Send + Sync {
    /// Drive one consume session.
    ///
    /// Deliver messages by sending on `deliveries` and ingest client
    /// acknowledgements from `confirmations`. Return when `shutdown` is
    /// cancelled, when the source is exhausted, or on error. A closed
    /// channel on either side means the client is gone; return `Ok(())`.
    /// `deliveries` is bounded, so sending applies back-pressure.
    async fn handle_consume(
        &self,
        shutdown: CancellationToken,
        config: ConsumerConfig,
        deliveries: mpsc::Sender<Message>,
        confirmations: mpsc::Receiver<Confirmation>,
    ) -> Result<()>;

    /// Report backend health for the consume direction.
    async fn status(&self) -> Result<BackendStatus>;
}

/// A backend that can serve publish sessions.
#[async_trait]
pub trait ProduceHandler: Send + Sync {
    /// Drive one publish session.
    ///
    /// Ingest messages from `messages` and emit one confirmation per
    /// accepted message on `confirmations`, in an order the backend
    /// chooses. The same shutdown and channel-close rules as
    /// [`ConsumeHandler::handle_consume`] apply.
    async fn handle_produce(
        &self,
        shutdown: CancellationToken,
        config: ProducerConfig,
        confirmations: mpsc::Sender<Confirmation>,
        messages: mpsc::Receiver<Message>,
    ) -> Result<()>;

    /// Report backend health for the publish direction.
    async fn status(&self) -> Result<BackendStatus>;
}
