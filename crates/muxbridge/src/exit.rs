use std::fmt;
use std::io;

use muxbridge_frame::FrameError;
use muxbridge_router::{ConfigError, RouterError};

pub const SUCCESS: i32 = 0;
pub const FAILURE: i32 = 1;
pub const PERMISSION_DENIED: i32 = 50;
/// The far side broke the protocol.
pub const DATA_INVALID: i32 = 60;
/// Unreadable or invalid settings.
pub const CONFIG_INVALID: i32 = 78;
pub const TIMEOUT: i32 = 124;
pub const INTERNAL: i32 = 125;

pub type CliResult<T> = Result<T, CliError>;

#[derive(Debug)]
pub struct CliError {
    pub code: i32,
    pub message: String,
}

impl CliError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for CliError {}

pub fn io_error(context: &str, err: io::Error) -> CliError {
    let code = match err.kind() {
        io::ErrorKind::PermissionDenied => PERMISSION_DENIED,
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TIMEOUT,
        io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof => FAILURE,
        _ => INTERNAL,
    };
    CliError::new(code, format!("{context}: {err}"))
}

pub fn config_error(err: ConfigError) -> CliError {
    match err {
        ConfigError::Read { path, source } => CliError::new(
            CONFIG_INVALID,
            format!("cannot read {}: {source}", path.display()),
        ),
        other => CliError::new(CONFIG_INVALID, other.to_string()),
    }
}

pub fn router_error(context: &str, err: RouterError) -> CliError {
    match err {
        RouterError::Frame(FrameError::Io(source)) => io_error(context, source),
        RouterError::Frame(FrameError::ConnectionClosed) => {
            CliError::new(FAILURE, format!("{context}: connection closed mid-frame"))
        }
        other => CliError::new(DATA_INVALID, format!("{context}: {other}")),
    }
}
