use muxbridge_frame::{ControlMessage, FrameError, JsonObject, COMMAND_CLOSE};
use serde_json::Value;

pub const PROTOCOL_ERROR: &str = "protocol-error";
pub const NOT_SUPPORTED: &str = "not-supported";
pub const TERMINATED: &str = "terminated";
pub const ACCESS_DENIED: &str = "access-denied";
pub const INTERNAL_ERROR: &str = "internal-error";
pub const NO_COCKPIT: &str = "no-cockpit";
pub const NO_HOST: &str = "no-host";
pub const UNKNOWN_HOST: &str = "unknown-host";
pub const UNKNOWN_HOSTKEY: &str = "unknown-hostkey";
pub const INVALID_HOSTKEY: &str = "invalid-hostkey";
pub const AUTHENTICATION_FAILED: &str = "authentication-failed";
pub const CANCELLED: &str = "cancelled";
pub const TIMEOUT: &str = "timeout";

/// A stable problem code, an optional human-readable message and any extra
/// fields that travel with the `close` message.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{code}{}", message_suffix(.message))]
pub struct Problem {
    pub code: String,
    pub message: Option<String>,
    pub details: JsonObject,
}

/// Errors raised by channel handlers. Always converted into a `close`.
pub type ChannelError = Problem;

impl Problem {
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: None,
            details: JsonObject::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn with_detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }

    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::new(PROTOCOL_ERROR).with_message(message)
    }

    pub fn not_supported() -> Self {
        Self::new(NOT_SUPPORTED)
    }

    pub fn terminated() -> Self {
        Self::new(TERMINATED)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(INTERNAL_ERROR).with_message(message)
    }

    /// Write `problem`, `message` and the details into `message`.
    pub fn apply(&self, target: &mut ControlMessage) {
        target.extend(&self.details);
        target.insert("problem", self.code.as_str());
        if let Some(message) = &self.message {
            target.insert("message", message.as_str());
        }
    }

    /// A `close` for `channel`, or a connection-level `close` when `None`.
    pub fn to_close(&self, channel: Option<&str>) -> ControlMessage {
        let mut close = match channel {
            Some(channel) => ControlMessage::for_channel(COMMAND_CLOSE, channel),
            None => ControlMessage::new(COMMAND_CLOSE),
        };
        self.apply(&mut close);
        close
    }

    /// Read the problem out of a `close` message, if it carries one.
    pub fn from_close(close: &ControlMessage) -> Option<Self> {
        let code = close.get_str("problem")?;
        let mut details = close.as_object().clone();
        for key in ["command", "channel", "problem", "message"] {
            details.remove(key);
        }
        Some(Self {
            code: code.to_string(),
            message: close.get_str("message").map(str::to_owned),
            details,
        })
    }
}

fn message_suffix(message: &Option<String>) -> String {
    message
        .as_deref()
        .map(|message| format!(": {message}"))
        .unwrap_or_default()
}

/// Errors raised while establishing or running a peer.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PeerError {
    /// `start()` was called on a peer that is not in the not-started state.
    #[error("peer already started")]
    AlreadyStarted,

    /// The peer could not be established; carries the problem for its channels.
    #[error("peer failed: {0}")]
    Failed(Problem),

    /// The peer was closed while the caller was waiting on it.
    #[error("peer closed")]
    Closed,
}

impl PeerError {
    pub fn problem(&self) -> Problem {
        match self {
            PeerError::Failed(problem) => problem.clone(),
            PeerError::Closed => Problem::new(CANCELLED),
            PeerError::AlreadyStarted => Problem::internal("peer already started"),
        }
    }
}

/// Errors from the superuser control surface.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SuperuserError {
    #[error("already running")]
    AlreadyRunning,

    #[error("unknown superuser bridge type \"{0}\"")]
    UnknownBridge(String),

    #[error("{0}")]
    Failed(Problem),

    #[error("cancelled")]
    Cancelled,
}

impl SuperuserError {
    pub fn problem(&self) -> Problem {
        match self {
            SuperuserError::Failed(problem) => problem.clone(),
            SuperuserError::Cancelled => Problem::new(CANCELLED),
            SuperuserError::UnknownBridge(_) => Problem::not_supported().with_message(self.to_string()),
            SuperuserError::AlreadyRunning => Problem::internal(self.to_string()),
        }
    }
}

/// Errors fatal to the whole connection.
#[derive(Debug, thiserror::Error)]
pub enum RouterError {
    /// Malformed frame or control message.
    #[error(transparent)]
    Frame(#[from] FrameError),

    /// Well-formed but out-of-sequence or unsupported traffic.
    #[error("protocol error: {0}")]
    Protocol(String),
}

impl RouterError {
    /// The `close` to send before hanging up, if the transport is still usable.
    pub fn to_close(&self) -> Option<ControlMessage> {
        match self {
            RouterError::Frame(err) if err.is_protocol_error() => {
                Some(Problem::protocol_error(err.to_string()).to_close(None))
            }
            RouterError::Protocol(message) => {
                Some(Problem::protocol_error(message.clone()).to_close(None))
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RouterError>;
