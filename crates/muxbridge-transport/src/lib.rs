//! Process boundary of a peer.
//!
//! - [`child`] spawns a subprocess with piped stdio and keeps a rolling
//!   capture of its stderr for failure diagnosis.
//! - [`interaction`] hosts the Unix socket that the `muxbridge-askpass`
//!   helper talks to, so that `sudo`/`ssh` password prompts reach the owner
//!   of the peer instead of a terminal.

pub mod child;
pub mod error;
pub mod interaction;

pub use child::{spawn, ChildTransport, SpawnSpec, StderrCapture};
pub use error::{Result, TransportError};
pub use interaction::{
    ask, InteractionRequest, InteractionServer, PromptRequest, PromptResponse,
    ASKPASS_SOCKET_ENV,
};
