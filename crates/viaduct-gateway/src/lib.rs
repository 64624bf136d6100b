//! Per-stream session coordinators for the streaming gateway.
//!
//! One coordinator runs per client stream. It spawns three subtasks (the
//! client receive direction, the client send direction, and the backend
//! handler driver), wires them together with bounded channels, and resolves
//! the session to the first error any of them reports. Cancellation (client
//! disconnect, stream teardown, graceful backend completion) is not an
//! error: the session resolves to success.
//!
//! The coordinators are transport-agnostic: they drive the [`FrameSource`]
//! and [`FrameSink`] seams, which a transport adapter implements over its
//! own streams.

pub mod consume;
mod error;
mod fanin;
pub mod publish;
pub mod stream;

pub use error::SessionError;
pub use stream::{FrameSink, FrameSource, TransportError};

// Payload handoff channels are capacity 1: the closest bounded analog of a
// rendezvous handoff, so neither side runs ahead by more than one frame.
pub(crate) const HANDOFF_DEPTH: usize = 1;
