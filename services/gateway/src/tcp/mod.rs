// TCP transport adapter: frame codec plus per-connection session dispatch.
//! TCP transport adapter for the gateway.

mod codec;
mod conn;

pub use codec::{read_frame_limited, write_frame};
pub use conn::{Handlers, serve};
