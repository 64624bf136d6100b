// First-error-wins fan-in shared by both session coordinators.
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::SessionError;

// One slot per reporting subtask, with headroom so a report never blocks
// even when the coordinator has already moved on.
pub(crate) const ERROR_CHANNEL_DEPTH: usize = 4;

pub(crate) fn channel() -> (ErrorReporter, ErrorCollector) {
    let (tx, rx) = mpsc::channel(ERROR_CHANNEL_DEPTH);
    (ErrorReporter(tx), ErrorCollector(rx))
}

/// Handed to every subtask; each reports at most once before returning.
#[derive(Clone)]
pub(crate) struct ErrorReporter(mpsc::Sender<SessionError>);

impl ErrorReporter {
    // Capacity covers every reporter, so a failed try_send means a winner
    // already exists and the loss is harmless.
    pub(crate) fn report(&self, err: SessionError) {
        let _ = self.0.try_send(err);
    }
}

pub(crate) struct ErrorCollector(mpsc::Receiver<SessionError>);

impl ErrorCollector {
    pub(crate) async fn recv(&mut self) -> Option<SessionError> {
        self.0.recv().await
    }

    pub(crate) fn try_recv(&mut self) -> Option<SessionError> {
        self.0.try_recv().ok()
    }

    /// Resolve the session: the first reported error wins; cancellation, or
    /// every reporter finishing without one, resolves to success. Ties go to
    /// the error so an already-reported failure is never masked by teardown.
    pub(crate) async fn resolve(&mut self, cancel: &CancellationToken) -> Result<(), SessionError> {
        tokio::select! {
            biased;
            maybe = self.0.recv() => match maybe {
                Some(err) => Err(err),
                None => Ok(()),
            },
            _ = cancel.cancelled() => Ok(()),
        }
    }
}
