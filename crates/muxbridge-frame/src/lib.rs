//! Length-prefixed framing with string channel ids.
//!
//! Every frame on the wire is:
//! - the ASCII decimal length of the frame body, followed by `\n`
//! - the body: a channel id, `\n`, then the payload
//!
//! An empty channel id marks a control frame whose payload is a JSON object
//! with a mandatory `command` field. Everything else is a data frame.

pub mod codec;
pub mod control;
pub mod error;
pub mod json;
pub mod reader;
pub mod writer;

pub use codec::{consume_frame, decode_frame, encode_frame, Frame, MAX_LENGTH_DIGITS};
pub use control::{
    ControlMessage, COMMAND_AUTHORIZE, COMMAND_CLOSE, COMMAND_DONE, COMMAND_INIT, COMMAND_KILL,
    COMMAND_OPEN, COMMAND_OPTIONS, COMMAND_PING, COMMAND_PONG, COMMAND_READY,
    COMMAND_SUPERUSER_INIT_DONE, PROTOCOL_VERSION,
};
pub use error::{FrameError, Result};
pub use json::JsonObject;
pub use reader::{FrameCodec, FrameReader};
pub use writer::FrameWriter;
