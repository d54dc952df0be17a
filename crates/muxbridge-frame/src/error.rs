/// Errors that can occur while encoding or decoding frames and control messages.
///
/// Apart from I/O and end-of-stream, every variant is a protocol error that is
/// fatal to the whole connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// No newline found within the bounded length prefix.
    #[error("frame size line is too long (more than {max} digits)")]
    HeaderTooLong { max: usize },

    /// The length prefix is not a decimal number.
    #[error("invalid frame length {0:?}")]
    InvalidLength(String),

    /// The channel id is not valid UTF-8 or contains a newline.
    #[error("invalid channel id: {0}")]
    InvalidChannel(String),

    /// The frame body does not fit into the bounded length prefix.
    #[error("frame too large ({size} bytes, max {max})")]
    FrameTooLarge { size: usize, max: usize },

    /// A control frame that is not a JSON object with the required fields.
    #[error("invalid control message: {0}")]
    InvalidControl(String),

    /// An I/O error occurred while reading or writing frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The connection was closed before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

impl FrameError {
    /// Whether the far side violated the protocol (as opposed to the stream failing).
    pub fn is_protocol_error(&self) -> bool {
        !matches!(self, FrameError::Io(_) | FrameError::ConnectionClosed)
    }

    /// Problem code reported in the `close` message sent before hanging up.
    pub fn problem(&self) -> &'static str {
        if self.is_protocol_error() {
            "protocol-error"
        } else {
            "disconnected"
        }
    }
}

pub type Result<T> = std::result::Result<T, FrameError>;
