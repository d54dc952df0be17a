use std::path::PathBuf;

/// Errors that can occur in transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The child process could not be started.
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    /// Failed to bind the interaction socket.
    #[error("failed to bind to {path}: {source}")]
    Bind {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Failed to connect to the interaction socket.
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        source: std::io::Error,
    },

    /// The socket path is too long for the platform.
    #[error("socket path too long ({len} bytes, max {max}): {path}")]
    PathTooLong {
        path: PathBuf,
        len: usize,
        max: usize,
    },

    /// A malformed message on the interaction socket.
    #[error("interaction failed: {0}")]
    Interaction(String),

    /// An I/O error occurred on the transport.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The transport has been shut down.
    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Whether the spawn failed because the program does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            TransportError::Spawn { source, .. } if source.kind() == std::io::ErrorKind::NotFound
        )
    }
}

pub type Result<T> = std::result::Result<T, TransportError>;
