use viaduct_backend::BackendError;
use viaduct_wire::Code;

use crate::stream::TransportError;

/// Terminal outcome of a failed session. Clean shutdown paths (client EOF,
/// cancellation, graceful backend completion) never produce one of these.
#[derive(thiserror::Error, Debug)]
pub enum SessionError {
    #[error("stream already started")]
    StartedTwice,
    #[error("confirmation received before start")]
    EarlyConfirmation,
    #[error("not connected to a topic")]
    NotConnected,
    #[error("invalid request frame: {0}")]
    InvalidRequest(#[source] viaduct_wire::Error),
    #[error("transport failure: {0}")]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Backend(#[from] BackendError),
}

impl SessionError {
    /// Status category reported to the client. Protocol violations are the
    /// client's fault; transport failures are ours; backend errors carry
    /// their own code through unchanged.
    pub fn code(&self) -> Code {
        match self {
            SessionError::Backend(err) => err.code,
            SessionError::Transport(_) => Code::Internal,
            SessionError::StartedTwice
            | SessionError::EarlyConfirmation
            | SessionError::NotConnected
            | SessionError::InvalidRequest(_) => Code::InvalidArgument,
        }
    }
}
