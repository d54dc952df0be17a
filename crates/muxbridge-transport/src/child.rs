use std::collections::VecDeque;
use std::process::Stdio;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::error::{Result, TransportError};

/// Number of stderr lines kept for diagnosis.
const STDERR_LINES_KEPT: usize = 200;

/// What to run for a peer: argv plus environment adjustments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnSpec {
    /// Short name used in logs.
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub env_remove: Vec<String>,
}

impl SpawnSpec {
    /// Build a spec from a full argv (`argv[0]` is the program).
    pub fn from_argv(label: impl Into<String>, argv: &[String]) -> Result<Self> {
        let Some((program, args)) = argv.split_first() else {
            return Err(TransportError::Spawn {
                program: String::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };
        Ok(Self {
            label: label.into(),
            program: program.clone(),
            args: args.to_vec(),
            env: Vec::new(),
            env_remove: Vec::new(),
        })
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Add `KEY=VALUE` entries; entries without `=` are ignored.
    pub fn environ<'a>(mut self, entries: impl IntoIterator<Item = &'a String>) -> Self {
        for entry in entries {
            match entry.split_once('=') {
                Some((key, value)) => self.env.push((key.to_string(), value.to_string())),
                None => warn!(peer = %self.label, entry = %entry, "ignoring malformed environment entry"),
            }
        }
        self
    }

    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// The full command line, for logging.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }
}

/// A running child with piped stdio.
///
/// The child is killed when this value (or the [`Child`] taken out of it) is
/// dropped.
#[derive(Debug)]
pub struct ChildTransport {
    pub child: Child,
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: StderrCapture,
}

/// Spawn `spec` with stdin/stdout/stderr piped.
pub fn spawn(spec: &SpawnSpec) -> Result<ChildTransport> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for key in &spec.env_remove {
        command.env_remove(key);
    }
    command.envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())));

    let mut child = command.spawn().map_err(|source| TransportError::Spawn {
        program: spec.program.clone(),
        source,
    })?;
    debug!(peer = %spec.label, argv = ?spec.argv(), pid = ?child.id(), "spawned child");

    let missing = || TransportError::Io(std::io::Error::other("child stdio was not captured"));
    let stdin = child.stdin.take().ok_or_else(missing)?;
    let stdout = child.stdout.take().ok_or_else(missing)?;
    let stderr = child.stderr.take().ok_or_else(missing)?;

    Ok(ChildTransport {
        child,
        stdin,
        stdout,
        stderr: StderrCapture::start(&spec.label, stderr),
    })
}

/// Rolling capture of a child's stderr.
///
/// Every line is logged at `debug` and the most recent lines are kept so that
/// a failed start can be diagnosed from what the child printed.
#[derive(Debug, Clone)]
pub struct StderrCapture {
    lines: Arc<Mutex<VecDeque<String>>>,
    eof: watch::Receiver<bool>,
}

impl StderrCapture {
    fn start(label: &str, stderr: ChildStderr) -> Self {
        let lines = Arc::new(Mutex::new(VecDeque::new()));
        let (eof_tx, eof) = watch::channel(false);

        let sink = Arc::clone(&lines);
        let label = label.to_string();
        tokio::spawn(async move {
            let mut segments = BufReader::new(stderr).split(b'\n');
            loop {
                match segments.next_segment().await {
                    Ok(Some(raw)) => {
                        let line = String::from_utf8_lossy(&raw).trim_end().to_string();
                        debug!(peer = %label, stderr = %line);
                        let mut kept = sink.lock().unwrap_or_else(PoisonError::into_inner);
                        if kept.len() == STDERR_LINES_KEPT {
                            kept.pop_front();
                        }
                        kept.push_back(line);
                    }
                    Ok(None) => break,
                    Err(err) => {
                        debug!(peer = %label, error = %err, "stderr read failed");
                        break;
                    }
                }
            }
            let _ = eof_tx.send(true);
        });

        Self { lines, eof }
    }

    /// Lines captured so far.
    pub fn lines(&self) -> Vec<String> {
        let kept = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        kept.iter().cloned().collect()
    }

    /// The last non-empty line captured so far.
    pub fn last_line(&self) -> Option<String> {
        let kept = self.lines.lock().unwrap_or_else(PoisonError::into_inner);
        kept.iter().rev().find(|line| !line.is_empty()).cloned()
    }

    /// Wait (bounded) for the child to close stderr, then return what was captured.
    pub async fn finish(&self, limit: Duration) -> Vec<String> {
        let mut eof = self.eof.clone();
        let _ = tokio::time::timeout(limit, eof.wait_for(|done| *done)).await;
        self.lines()
    }
}
