//! An endpoint that forwards its channels to a child running the same protocol.

use std::fmt;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use muxbridge_frame::{
    json, ControlMessage, Frame, FrameReader, FrameWriter, COMMAND_AUTHORIZE, COMMAND_CLOSE,
    COMMAND_INIT, COMMAND_PING, COMMAND_PONG, PROTOCOL_VERSION,
};
use muxbridge_transport::{
    spawn, ChildTransport, InteractionRequest, InteractionServer, SpawnSpec, StderrCapture,
    TransportError,
};
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::DEFAULT_PEER_INIT_TIMEOUT_SECS;
use crate::endpoint::{next_endpoint_id, Endpoint, EndpointId, RouterHandle};
use crate::error::{PeerError, Problem, CANCELLED, INTERNAL_ERROR, NO_COCKPIT, TIMEOUT};

const EXIT_WAIT: Duration = Duration::from_secs(5);
const STDERR_DRAIN: Duration = Duration::from_secs(1);

/// Receives prompts the child's askpass helper forwards while starting.
pub type PromptHandler = Arc<dyn Fn(InteractionRequest) + Send + Sync>;

/// Maps a failed start to the problem reported for the peer's channels.
pub type Diagnose = Arc<dyn Fn(&PeerFailure) -> Problem + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    NotStarted,
    Starting,
    Running,
    Closed,
}

/// Why a peer could not be established.
#[derive(Debug)]
pub enum PeerFailure {
    Spawn(TransportError),
    /// The child went away before sending `init`.
    Exited {
        status: Option<ExitStatus>,
        stderr: Vec<String>,
    },
    /// The child spoke, but not a compatible `init`.
    Protocol(String),
    Timeout(Duration),
    Cancelled,
}

impl PeerFailure {
    /// What the child printed on stderr, when it exited.
    pub fn stderr(&self) -> &[String] {
        match self {
            PeerFailure::Exited { stderr, .. } => stderr,
            _ => &[],
        }
    }
}

/// Problem mapping used when a peer has no specialised diagnosis.
pub fn default_diagnosis(failure: &PeerFailure) -> Problem {
    match failure {
        PeerFailure::Spawn(err) if err.is_not_found() => {
            Problem::new(NO_COCKPIT).with_message(err.to_string())
        }
        PeerFailure::Spawn(err) => Problem::new(INTERNAL_ERROR).with_message(err.to_string()),
        PeerFailure::Exited { stderr, .. } => {
            let problem = Problem::terminated();
            match stderr.iter().rev().find(|line| !line.trim().is_empty()) {
                Some(line) => problem.with_message(line.trim()),
                None => problem,
            }
        }
        PeerFailure::Protocol(message) => Problem::protocol_error(message.clone()),
        PeerFailure::Timeout(after) => Problem::new(TIMEOUT).with_message(format!(
            "no init from peer within {}s",
            after.as_secs()
        )),
        PeerFailure::Cancelled => Problem::new(CANCELLED),
    }
}

/// Kind of prompt an askpass helper relays.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptKind {
    Password,
    /// A passphrase for a locked private key.
    Passphrase { path: String },
    /// "Are you sure you want to continue connecting (yes/no)?"
    HostKey,
    Other,
}

impl PromptKind {
    pub fn classify(prompt: &str) -> Self {
        const PASSPHRASE: &str = "passphrase for key '";
        if let Some(start) = prompt.find(PASSPHRASE) {
            let rest = &prompt[start + PASSPHRASE.len()..];
            let path = rest.split('\'').next().unwrap_or(rest);
            return PromptKind::Passphrase {
                path: path.to_string(),
            };
        }
        if prompt.contains("(yes/no") {
            return PromptKind::HostKey;
        }
        if prompt.to_lowercase().contains("password") {
            return PromptKind::Password;
        }
        PromptKind::Other
    }
}

/// How to start a peer.
#[derive(Clone)]
pub struct PeerConfig {
    pub spawn: SpawnSpec,
    /// Host announced to the child in our `init`.
    pub init_host: String,
    /// Bytes written to the child before any frame.
    pub bootstrap: Option<Bytes>,
    pub init_timeout: Duration,
    /// Askpass helper exposed to the child as `SUDO_ASKPASS` / `SSH_ASKPASS`.
    pub askpass: Option<PathBuf>,
    pub prompts: Option<PromptHandler>,
    pub diagnose: Option<Diagnose>,
}

impl PeerConfig {
    pub fn new(spawn: SpawnSpec, init_host: impl Into<String>) -> Self {
        Self {
            spawn,
            init_host: init_host.into(),
            bootstrap: None,
            init_timeout: Duration::from_secs(DEFAULT_PEER_INIT_TIMEOUT_SECS),
            askpass: None,
            prompts: None,
            diagnose: None,
        }
    }

    pub fn with_bootstrap(mut self, bootstrap: Option<Bytes>) -> Self {
        self.bootstrap = bootstrap;
        self
    }

    pub fn with_init_timeout(mut self, timeout: Duration) -> Self {
        self.init_timeout = timeout;
        self
    }

    pub fn with_prompts(mut self, askpass: Option<PathBuf>, handler: PromptHandler) -> Self {
        self.askpass = askpass;
        self.prompts = Some(handler);
        self
    }

    pub fn with_diagnosis(mut self, diagnose: Diagnose) -> Self {
        self.diagnose = Some(diagnose);
        self
    }
}

impl fmt::Debug for PeerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerConfig")
            .field("spawn", &self.spawn)
            .field("init_host", &self.init_host)
            .field("bootstrap", &self.bootstrap.as_ref().map(Bytes::len))
            .field("init_timeout", &self.init_timeout)
            .field("askpass", &self.askpass)
            .field("prompts", &self.prompts.is_some())
            .field("diagnose", &self.diagnose.is_some())
            .finish()
    }
}

struct PeerShared {
    state: PeerState,
    /// Frames for the child received before it was running.
    queue: Vec<Frame>,
    outbound: Option<mpsc::UnboundedSender<Frame>>,
}

struct PeerInner {
    id: EndpointId,
    label: String,
    router: RouterHandle,
    config: PeerConfig,
    shared: Mutex<PeerShared>,
    cancel: CancellationToken,
}

/// A child process running its own bridge, bound as one endpoint.
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct Peer {
    inner: Arc<PeerInner>,
}

struct Link {
    child: Child,
    reader: FrameReader<ChildStdout>,
    writer: FrameWriter<ChildStdin>,
    stderr: StderrCapture,
}

enum Relay {
    Forwarded,
    Reply(Frame),
    Closed(Problem),
}

impl Peer {
    pub fn new(config: PeerConfig, router: RouterHandle) -> Self {
        Self {
            inner: Arc::new(PeerInner {
                id: next_endpoint_id(),
                label: config.spawn.label.clone(),
                router,
                config,
                shared: Mutex::new(PeerShared {
                    state: PeerState::NotStarted,
                    queue: Vec::new(),
                    outbound: None,
                }),
                cancel: CancellationToken::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PeerShared> {
        self.inner.shared.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self) -> PeerState {
        self.lock().state
    }

    pub fn label(&self) -> &str {
        &self.inner.label
    }

    pub fn init_host(&self) -> &str {
        &self.inner.config.init_host
    }

    /// Spawn the child and wait for its `init`.
    ///
    /// On failure the peer is closed and its channels are closed with the
    /// diagnosed problem, which is also returned.
    pub async fn start(&self) -> Result<(), PeerError> {
        {
            let mut shared = self.lock();
            match shared.state {
                PeerState::NotStarted => shared.state = PeerState::Starting,
                PeerState::Closed => return Err(PeerError::Closed),
                PeerState::Starting | PeerState::Running => return Err(PeerError::AlreadyStarted),
            }
        }
        info!(peer = %self.inner.label, argv = ?self.inner.config.spawn.argv(), "starting peer");

        let established = tokio::select! {
            result = self.establish() => result,
            _ = self.inner.cancel.cancelled() => Err(PeerFailure::Cancelled),
        };

        match established {
            Ok(link) => self.run(link),
            Err(_) if self.inner.cancel.is_cancelled() => {
                self.finish(Problem::terminated());
                Err(PeerError::Closed)
            }
            Err(failure) => {
                let problem = match &self.inner.config.diagnose {
                    Some(diagnose) => diagnose(&failure),
                    None => default_diagnosis(&failure),
                };
                warn!(peer = %self.inner.label, ?failure, problem = %problem, "peer failed to start");
                self.finish(problem.clone());
                Err(PeerError::Failed(problem))
            }
        }
    }

    async fn establish(&self) -> Result<Link, PeerFailure> {
        let config = &self.inner.config;
        let mut spec = config.spawn.clone();

        // Kept alive until the child has sent init; prompts only happen before that.
        let mut _interaction = None;
        if let (Some(askpass), Some(handler)) = (&config.askpass, &config.prompts) {
            let (server, mut requests) = InteractionServer::bind().map_err(PeerFailure::Spawn)?;
            let askpass = askpass.to_string_lossy().into_owned();
            let (key, value) = server.env();
            spec = spec
                .env(key, value)
                .env("SUDO_ASKPASS", askpass.as_str())
                .env("SSH_ASKPASS", askpass.as_str())
                .env("SSH_ASKPASS_REQUIRE", "force");
            if std::env::var_os("DISPLAY").is_none() {
                spec = spec.env("DISPLAY", "x");
            }

            let handler = Arc::clone(handler);
            tokio::spawn(async move {
                while let Some(request) = requests.recv().await {
                    handler(request);
                }
            });
            _interaction = Some(server);
        }

        let ChildTransport {
            mut child,
            mut stdin,
            stdout,
            stderr,
        } = spawn(&spec).map_err(PeerFailure::Spawn)?;

        if let Some(bootstrap) = &config.bootstrap {
            if let Err(err) = stdin.write_all(bootstrap).await {
                debug!(peer = %self.inner.label, error = %err, "bootstrap write failed");
                return Err(exited(&mut child, &stderr).await);
            }
        }

        let mut reader = FrameReader::new(stdout);
        let mut writer = FrameWriter::new(stdin);

        let init = match tokio::time::timeout(config.init_timeout, wait_for_init(&mut reader)).await {
            Err(_) => return Err(PeerFailure::Timeout(config.init_timeout)),
            Ok(Ok(Some(init))) => init,
            Ok(Ok(None)) => return Err(exited(&mut child, &stderr).await),
            Ok(Err(message)) => return Err(PeerFailure::Protocol(message)),
        };
        debug!(peer = %self.inner.label, host = ?init.get_str("host"), "peer sent init");

        let reply = ControlMessage::new(COMMAND_INIT)
            .with("version", PROTOCOL_VERSION)
            .with("host", config.init_host.as_str());
        if writer.send_control(&reply).await.is_err() {
            return Err(exited(&mut child, &stderr).await);
        }

        Ok(Link {
            child,
            reader,
            writer,
            stderr,
        })
    }

    fn run(&self, link: Link) -> Result<(), PeerError> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut shared = self.lock();
            if shared.state == PeerState::Closed {
                return Err(PeerError::Closed);
            }
            shared.state = PeerState::Running;
            for frame in shared.queue.drain(..) {
                let _ = tx.send(frame);
            }
            shared.outbound = Some(tx);
        }
        info!(peer = %self.inner.label, "peer running");
        tokio::spawn(self.clone().drive(link, rx));
        Ok(())
    }

    async fn drive(self, link: Link, mut outbound: mpsc::UnboundedReceiver<Frame>) {
        let Link {
            mut child,
            mut reader,
            mut writer,
            stderr,
        } = link;

        let problem = loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break Problem::terminated(),
                frame = outbound.recv() => match frame {
                    Some(frame) => {
                        trace!(peer = %self.inner.label, channel = %frame.channel, len = frame.payload.len(), "to peer");
                        if let Err(err) = writer.write_frame(frame).await {
                            debug!(peer = %self.inner.label, error = %err, "write to peer failed");
                            break Problem::terminated();
                        }
                    }
                    None => break Problem::terminated(),
                },
                inbound = reader.next_frame() => match inbound {
                    Ok(Some(frame)) => match self.relay(frame) {
                        Relay::Forwarded => {}
                        Relay::Reply(reply) => {
                            if writer.write_frame(reply).await.is_err() {
                                break Problem::terminated();
                            }
                        }
                        Relay::Closed(problem) => break problem,
                    },
                    Ok(None) => break Problem::terminated(),
                    Err(err) if err.is_protocol_error() => {
                        warn!(peer = %self.inner.label, error = %err, "peer sent malformed frame");
                        break Problem::protocol_error(err.to_string());
                    }
                    Err(err) => {
                        debug!(peer = %self.inner.label, error = %err, "peer stream failed");
                        break Problem::terminated();
                    }
                },
            }
        };

        let _ = child.start_kill();
        let status = tokio::time::timeout(EXIT_WAIT, child.wait()).await;
        debug!(
            peer = %self.inner.label,
            status = ?status,
            stderr = ?stderr.last_line(),
            "peer exited"
        );
        self.finish(problem);
    }

    fn relay(&self, frame: Frame) -> Relay {
        let id = self.inner.id;
        if !frame.is_control() {
            self.inner.router.send_data(id, frame.channel, frame.payload);
            return Relay::Forwarded;
        }

        let message = match ControlMessage::parse(&frame.payload) {
            Ok(message) => message,
            Err(err) => return Relay::Closed(Problem::protocol_error(err.to_string())),
        };
        if message.channel().is_some() {
            self.inner.router.send_control(id, message);
            return Relay::Forwarded;
        }

        match message.command() {
            COMMAND_PING => {
                let mut pong = message;
                pong.set_command(COMMAND_PONG);
                Relay::Reply(pong.to_frame())
            }
            COMMAND_CLOSE => {
                let problem = Problem::from_close(&message).unwrap_or_else(Problem::terminated);
                info!(peer = %self.inner.label, problem = %problem, "peer closed the connection");
                Relay::Closed(problem)
            }
            COMMAND_AUTHORIZE => {
                debug!(peer = %self.inner.label, "ignoring authorize from peer");
                Relay::Forwarded
            }
            other => {
                debug!(peer = %self.inner.label, command = other, "ignoring connection message from peer");
                Relay::Forwarded
            }
        }
    }

    fn forward(&self, frame: Frame) {
        let mut shared = self.lock();
        match shared.state {
            PeerState::NotStarted | PeerState::Starting => shared.queue.push(frame),
            PeerState::Running => {
                if let Some(outbound) = &shared.outbound {
                    let _ = outbound.send(frame);
                }
            }
            PeerState::Closed => trace!(peer = %self.inner.label, "dropping frame for closed peer"),
        }
    }

    fn finish(&self, problem: Problem) {
        {
            let mut shared = self.lock();
            if shared.state == PeerState::Closed {
                return;
            }
            shared.state = PeerState::Closed;
            shared.queue.clear();
            shared.outbound = None;
        }
        self.inner.cancel.cancel();
        info!(peer = %self.inner.label, problem = %problem, "peer closed");
        self.inner.router.endpoint_closed(self.inner.id, problem);
    }

    /// Kill the child; every channel of this peer closes with `terminated`.
    ///
    /// Only the first call has an effect.
    pub fn close(&self) {
        self.finish(Problem::terminated());
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("id", &self.inner.id)
            .field("label", &self.inner.label)
            .field("state", &self.state())
            .finish()
    }
}

impl Endpoint for Peer {
    fn id(&self) -> EndpointId {
        self.inner.id
    }

    fn label(&self) -> String {
        format!("peer {}", self.inner.label)
    }

    fn deliver_control(&self, message: ControlMessage) {
        self.forward(message.to_frame());
    }

    fn deliver_data(&self, channel: &str, data: Bytes) {
        self.forward(Frame::new(channel, data));
    }

    fn kill(&self, _channels: &[String], message: &ControlMessage) {
        self.forward(message.to_frame());
    }

    fn shutdown(&self) {
        self.close();
    }
}

/// `Ok(None)` when the child closed stdout before sending anything.
async fn wait_for_init(
    reader: &mut FrameReader<ChildStdout>,
) -> Result<Option<ControlMessage>, String> {
    let frame = match reader.next_frame().await {
        Ok(Some(frame)) => frame,
        Ok(None) => return Ok(None),
        Err(err) if err.is_protocol_error() => return Err(err.to_string()),
        Err(_) => return Ok(None),
    };
    if !frame.is_control() {
        return Err("peer sent data before init".to_string());
    }
    let message = ControlMessage::parse(&frame.payload).map_err(|err| err.to_string())?;
    if !message.is(COMMAND_INIT) {
        return Err(format!("expected init from peer, got {}", message.command()));
    }
    match json::get_u64(message.as_object(), "version") {
        Some(PROTOCOL_VERSION) => Ok(Some(message)),
        _ => Err("unsupported version in init from peer".to_string()),
    }
}

async fn exited(child: &mut Child, stderr: &StderrCapture) -> PeerFailure {
    let status = tokio::time::timeout(EXIT_WAIT, child.wait())
        .await
        .ok()
        .and_then(Result::ok);
    PeerFailure::Exited {
        status,
        stderr: stderr.finish(STDERR_DRAIN).await,
    }
}
