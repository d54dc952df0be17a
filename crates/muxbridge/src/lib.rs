//! A bridge that multiplexes many channels over one framed byte stream.
//!
//! # Crate Structure
//!
//! - [`frame`]: wire framing and control messages
//! - [`transport`]: child processes and the askpass interaction socket
//! - [`router`]: channel routing, local handlers and forwarding peers

/// Re-export frame types.
pub mod frame {
    pub use muxbridge_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use muxbridge_transport::*;
}

/// Re-export routing types.
pub mod router {
    pub use muxbridge_router::*;
}
