use std::io::{BufRead, Write};
use std::os::unix::fs::{FileTypeExt, MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{Result, TransportError};

/// Environment variable through which the askpass helper finds the socket.
pub const ASKPASS_SOCKET_ENV: &str = "MUXBRIDGE_ASKPASS_SOCKET";

/// Permission mode for the socket file.
pub const SOCKET_MODE: u32 = 0o600;

/// Largest prompt line accepted from a helper.
const MAX_LINE_LEN: u64 = 64 * 1024;

/// `sockaddr_un.sun_path` is 108 bytes on Linux, 104 on macOS.
#[cfg(target_os = "linux")]
const MAX_PATH_LEN: usize = 108;
#[cfg(not(target_os = "linux"))]
const MAX_PATH_LEN: usize = 104;

static NEXT_SOCKET_ID: AtomicU64 = AtomicU64::new(1);

/// First line written by the helper.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptRequest {
    pub prompt: String,
}

/// Line written back to the helper. `reply: null` cancels the prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptResponse {
    pub reply: Option<String>,
}

/// A prompt waiting for its owner to answer or cancel it.
///
/// Dropping the request cancels the prompt.
#[derive(Debug)]
pub struct InteractionRequest {
    pub prompt: String,
    reply: oneshot::Sender<Option<String>>,
}

impl InteractionRequest {
    pub fn answer(self, reply: impl Into<String>) {
        self.respond(Some(reply.into()));
    }

    pub fn cancel(self) {
        self.respond(None);
    }

    pub fn respond(self, reply: Option<String>) {
        // The helper may have gone away already.
        let _ = self.reply.send(reply);
    }
}

/// Listening Unix socket that serves askpass prompts.
///
/// Each connection carries exactly one prompt: a JSON [`PromptRequest`] line
/// in, a JSON [`PromptResponse`] line out. Prompts are handed to the owner
/// through the receiver returned by [`InteractionServer::bind`].
#[derive(Debug)]
pub struct InteractionServer {
    path: PathBuf,
    created_inode: Option<(u64, u64)>,
    accept_task: JoinHandle<()>,
}

impl InteractionServer {
    /// Bind at a fresh path in the runtime (or temp) directory.
    pub fn bind() -> Result<(Self, mpsc::Receiver<InteractionRequest>)> {
        let dir = std::env::var_os("XDG_RUNTIME_DIR")
            .map(PathBuf::from)
            .filter(|dir| dir.is_dir())
            .unwrap_or_else(std::env::temp_dir);
        let id = NEXT_SOCKET_ID.fetch_add(1, Ordering::Relaxed);
        Self::bind_at(dir.join(format!(
            "muxbridge-askpass-{}-{id}.sock",
            std::process::id()
        )))
    }

    /// Bind at an explicit path.
    ///
    /// A stale socket at `path` is removed first; any other kind of file is
    /// left alone and binding fails.
    pub fn bind_at(path: impl AsRef<Path>) -> Result<(Self, mpsc::Receiver<InteractionRequest>)> {
        let path = path.as_ref().to_path_buf();

        let path_bytes = path.as_os_str().len();
        if path_bytes >= MAX_PATH_LEN {
            return Err(TransportError::PathTooLong {
                path,
                len: path_bytes,
                max: MAX_PATH_LEN,
            });
        }

        let bind_err = |source| TransportError::Bind {
            path: path.clone(),
            source,
        };

        if let Ok(metadata) = std::fs::symlink_metadata(&path) {
            if !metadata.file_type().is_socket() {
                return Err(bind_err(std::io::Error::new(
                    std::io::ErrorKind::AlreadyExists,
                    "existing path is not a unix socket",
                )));
            }
            debug!(?path, "removing stale socket");
            std::fs::remove_file(&path).map_err(bind_err)?;
        }

        let listener = UnixListener::bind(&path).map_err(bind_err)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(SOCKET_MODE))
            .map_err(bind_err)?;
        let metadata = std::fs::symlink_metadata(&path).map_err(bind_err)?;

        let (tx, rx) = mpsc::channel(4);
        let accept_task = tokio::spawn(accept_loop(listener, tx));
        info!(?path, "interaction socket listening");

        Ok((
            Self {
                path,
                created_inode: Some((metadata.dev(), metadata.ino())),
                accept_task,
            },
            rx,
        ))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// `(ASKPASS_SOCKET_ENV, path)` for the child environment.
    pub fn env(&self) -> (String, String) {
        (
            ASKPASS_SOCKET_ENV.to_string(),
            self.path.to_string_lossy().into_owned(),
        )
    }
}

impl Drop for InteractionServer {
    fn drop(&mut self) {
        self.accept_task.abort();
        let Some((expected_dev, expected_ino)) = self.created_inode else {
            return;
        };
        if let Ok(metadata) = std::fs::symlink_metadata(&self.path) {
            if metadata.file_type().is_socket()
                && metadata.dev() == expected_dev
                && metadata.ino() == expected_ino
            {
                debug!(path = ?self.path, "cleaning up socket file");
                let _ = std::fs::remove_file(&self.path);
            } else {
                debug!(path = ?self.path, "socket path identity changed; skipping cleanup");
            }
        }
    }
}

async fn accept_loop(listener: UnixListener, requests: mpsc::Sender<InteractionRequest>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let requests = requests.clone();
                tokio::spawn(async move {
                    if let Err(err) = serve_prompt(stream, requests).await {
                        warn!(error = %err, "askpass connection failed");
                    }
                });
            }
            Err(err) => {
                warn!(error = %err, "failed to accept askpass connection");
                return;
            }
        }
    }
}

async fn serve_prompt(
    stream: UnixStream,
    requests: mpsc::Sender<InteractionRequest>,
) -> Result<()> {
    let (read, mut write) = stream.into_split();
    let mut line = String::new();
    BufReader::new(read.take(MAX_LINE_LEN))
        .read_line(&mut line)
        .await?;
    let request: PromptRequest = serde_json::from_str(line.trim_end())
        .map_err(|err| TransportError::Interaction(format!("invalid prompt: {err}")))?;
    debug!(prompt = %request.prompt, "askpass prompt");

    let (reply_tx, reply_rx) = oneshot::channel();
    let reply = match requests
        .send(InteractionRequest {
            prompt: request.prompt,
            reply: reply_tx,
        })
        .await
    {
        Ok(()) => reply_rx.await.unwrap_or(None),
        Err(_) => None,
    };

    let mut out = serde_json::to_vec(&PromptResponse { reply })
        .map_err(|err| TransportError::Interaction(err.to_string()))?;
    out.push(b'\n');
    write.write_all(&out).await?;
    write.shutdown().await?;
    Ok(())
}

/// Ask the prompt owner listening at `path` (blocking).
///
/// Returns `Ok(None)` when the prompt was cancelled.
pub fn ask(path: &Path, prompt: &str) -> Result<Option<String>> {
    let mut stream =
        std::os::unix::net::UnixStream::connect(path).map_err(|source| TransportError::Connect {
            path: path.to_path_buf(),
            source,
        })?;

    let mut request = serde_json::to_vec(&PromptRequest {
        prompt: prompt.to_string(),
    })
    .map_err(|err| TransportError::Interaction(err.to_string()))?;
    request.push(b'\n');
    stream.write_all(&request)?;
    stream.flush()?;

    let mut line = String::new();
    std::io::BufReader::new(stream).read_line(&mut line)?;
    if line.is_empty() {
        return Err(TransportError::Closed);
    }
    let response: PromptResponse = serde_json::from_str(line.trim_end())
        .map_err(|err| TransportError::Interaction(format!("invalid reply: {err}")))?;
    Ok(response.reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("muxbridge-{name}-{}.sock", std::process::id()))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn prompt_is_answered() {
        let (server, mut prompts) = InteractionServer::bind_at(socket_path("answer")).unwrap();
        let path = server.path().to_path_buf();

        let client = tokio::task::spawn_blocking(move || ask(&path, "[sudo] password for admin: "));

        let request = prompts.recv().await.unwrap();
        assert_eq!(request.prompt, "[sudo] password for admin: ");
        request.answer("s3cret");

        let reply = client.await.unwrap().unwrap();
        assert_eq!(reply.as_deref(), Some("s3cret"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dropped_request_cancels() {
        let (server, mut prompts) = InteractionServer::bind_at(socket_path("cancel")).unwrap();
        let path = server.path().to_path_buf();

        let client = tokio::task::spawn_blocking(move || ask(&path, "Password: "));
        drop(prompts.recv().await.unwrap());

        assert_eq!(client.await.unwrap().unwrap(), None);
    }

    #[tokio::test]
    async fn socket_is_private_and_removed_on_drop() {
        let (server, _prompts) = InteractionServer::bind().unwrap();
        let path = server.path().to_path_buf();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);
        assert_eq!(server.env().0, ASKPASS_SOCKET_ENV);

        drop(server);
        assert!(!path.exists(), "socket file should be cleaned up on drop");
    }

    #[tokio::test]
    async fn rejects_existing_non_socket_file() {
        let path = socket_path("regular-file");
        std::fs::write(&path, b"regular-file").unwrap();

        let result = InteractionServer::bind_at(&path);
        assert!(matches!(result, Err(TransportError::Bind { .. })));

        let _ = std::fs::remove_file(&path);
    }

    #[tokio::test]
    async fn path_too_long() {
        let long_path = "/tmp/".to_string() + &"a".repeat(200) + ".sock";
        let result = InteractionServer::bind_at(&long_path);
        assert!(matches!(result, Err(TransportError::PathTooLong { .. })));
    }

    #[test]
    fn ask_without_listener_fails_to_connect() {
        let err = ask(Path::new("/nonexistent/muxbridge.sock"), "Password: ").unwrap_err();
        assert!(matches!(err, TransportError::Connect { .. }));
    }
}
