//! Reaching another host over ssh: destinations, the ssh argv, prompt
//! answers and mapping ssh's complaints to problem codes.

use std::fmt;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use muxbridge_frame::JsonObject;
use muxbridge_transport::InteractionRequest;
use serde_json::Value;
use tracing::debug;

use crate::config::SshSettings;
use crate::error::{
    Problem, AUTHENTICATION_FAILED, INVALID_HOSTKEY, NO_COCKPIT, NO_HOST, UNKNOWN_HOST,
    UNKNOWN_HOSTKEY,
};
use crate::peer::{default_diagnosis, PeerFailure, PromptKind};

/// Prefix of the stderr line the askpass helper prints when ssh runs it as
/// `KnownHostsCommand`.
pub const HOSTKEY_REPORT: &str = "muxbridge-hostkey";

/// `[user@]host[:port]`, with `[addr]:port` for IPv6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Destination {
    pub user: Option<String>,
    pub host: String,
    pub port: Option<u16>,
}

impl Destination {
    pub fn parse(destination: &str) -> Result<Self, String> {
        if destination.is_empty() {
            return Err("empty host".to_string());
        }
        if destination.starts_with('-') {
            return Err(format!("invalid host: {destination}"));
        }

        let (user, rest) = match destination.rsplit_once('@') {
            Some((user, rest)) if !user.is_empty() => (Some(user.to_string()), rest),
            Some(_) => return Err(format!("invalid host: {destination}")),
            None => (None, destination),
        };

        let (host, port) = if let Some(bracketed) = rest.strip_prefix('[') {
            let (host, tail) = bracketed
                .split_once(']')
                .ok_or_else(|| format!("invalid host: {destination}"))?;
            match tail {
                "" => (host, None),
                tail => match tail.strip_prefix(':') {
                    Some(port) => (host, Some(port)),
                    None => return Err(format!("invalid host: {destination}")),
                },
            }
        } else if rest.matches(':').count() == 1 {
            let (host, port) = rest.split_once(':').unwrap_or((rest, ""));
            (host, Some(port))
        } else {
            // No colon, or a bare IPv6 address.
            (rest, None)
        };

        if host.is_empty() || host.starts_with('-') {
            return Err(format!("invalid host: {destination}"));
        }
        let port = port
            .map(|port| {
                port.parse::<u16>()
                    .map_err(|_| format!("invalid port in host: {destination}"))
            })
            .transpose()?;

        Ok(Self {
            user,
            host: host.to_string(),
            port,
        })
    }
}

/// Quote `arg` for a POSIX shell, leaving harmless words alone.
pub fn shell_quote(arg: &str) -> String {
    let safe = |c: char| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c);
    if !arg.is_empty() && arg.chars().all(safe) {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r#"'"'"'"#))
}

/// Per-connection switches for [`ssh_argv`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SshOptions<'a> {
    pub askpass: Option<&'a Path>,
    /// Known-hosts file supplied with the request.
    pub extra_known_hosts: Option<&'a Path>,
    /// Have the askpass helper report the offered host key.
    pub query_hostkey: bool,
    pub password: bool,
}

/// The full ssh command line for `destination`, ending with the remote
/// bridge command.
pub fn ssh_argv(
    settings: &SshSettings,
    destination: &Destination,
    user: Option<&str>,
    options: SshOptions<'_>,
) -> Vec<String> {
    let mut argv = settings.command.clone();
    let mut option = |value: String| {
        argv.push("-o".to_string());
        argv.push(value);
    };

    option("NumberOfPasswordPrompts=1".to_string());
    option("StrictHostKeyChecking=yes".to_string());
    if !options.password {
        option("PasswordAuthentication=no".to_string());
    }
    match options.askpass {
        Some(askpass) if options.query_hostkey => option(format!(
            "KnownHostsCommand={} %I %H %t %K %f",
            shell_quote(&askpass.to_string_lossy())
        )),
        Some(_) => {}
        None => option("BatchMode=yes".to_string()),
    }

    let known_hosts: Vec<&Path> = [settings.known_hosts_file.as_deref(), options.extra_known_hosts]
        .into_iter()
        .flatten()
        .collect();
    if !known_hosts.is_empty() {
        let mut files = String::from("UserKnownHostsFile=~/.ssh/known_hosts");
        for file in known_hosts {
            files.push(' ');
            files.push_str(&file.display().to_string());
        }
        option(files);
    }

    if let Some(user) = user {
        argv.push("-l".to_string());
        argv.push(user.to_string());
    }
    if let Some(port) = destination.port {
        argv.push("-p".to_string());
        argv.push(port.to_string());
    }
    argv.push(destination.host.clone());

    let remote: Vec<String> = settings.remote_bridge.iter().map(|arg| shell_quote(arg)).collect();
    argv.push(remote.join(" "));
    argv
}

/// What happened while answering ssh's prompts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthReport {
    pub password_attempts: usize,
    /// A private key that asked for a passphrase.
    pub locked_identity: Option<String>,
}

struct Password(String);

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<redacted:{} bytes>", self.0.len())
    }
}

/// Answers ssh's askpass prompts for one connection attempt.
///
/// The password, if any, is offered once. Key passphrases are never
/// prompted for; the locked key is remembered for the diagnosis instead.
#[derive(Debug)]
pub struct AuthResponder {
    password: Option<Password>,
    report: Mutex<AuthReport>,
}

impl AuthResponder {
    pub fn new(password: Option<String>) -> Self {
        Self {
            password: password.map(Password),
            report: Mutex::new(AuthReport::default()),
        }
    }

    pub fn has_password(&self) -> bool {
        self.password.is_some()
    }

    pub fn respond(&self, request: InteractionRequest) {
        let mut report = self.report.lock().unwrap_or_else(PoisonError::into_inner);
        match PromptKind::classify(&request.prompt) {
            PromptKind::Password => match &self.password {
                Some(password) if report.password_attempts == 0 => {
                    report.password_attempts += 1;
                    request.answer(password.0.clone());
                }
                _ => request.cancel(),
            },
            PromptKind::Passphrase { path } => {
                debug!(identity = %path, "refusing passphrase prompt");
                report.locked_identity = Some(path);
                request.cancel();
            }
            PromptKind::HostKey | PromptKind::Other => {
                debug!(prompt = %request.prompt, "unexpected ssh prompt refused");
                request.cancel();
            }
        }
    }

    pub fn report(&self) -> AuthReport {
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// The key ssh was offered, as reported through `KnownHostsCommand`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OfferedHostKey {
    /// A known_hosts line: `host type key`.
    pub line: String,
    pub fingerprint: String,
}

fn offered_host_key(stderr: &[String]) -> Option<OfferedHostKey> {
    stderr.iter().rev().find_map(|line| {
        let mut words = line.strip_prefix(HOSTKEY_REPORT)?.split_whitespace();
        let (host, kind, key, fingerprint) =
            (words.next()?, words.next()?, words.next()?, words.next()?);
        Some(OfferedHostKey {
            line: format!("{host} {kind} {key}"),
            fingerprint: fingerprint.to_string(),
        })
    })
}

fn auth_methods(line: &str) -> Option<Vec<&str>> {
    let start = line.find("Permission denied (")? + "Permission denied (".len();
    let end = line[start..].find(')')? + start;
    Some(line[start..end].split(',').map(str::trim).collect())
}

fn any_line<'a>(stderr: &'a [String], needles: &[&str]) -> Option<&'a str> {
    stderr
        .iter()
        .map(String::as_str)
        .find(|line| needles.iter().any(|needle| line.contains(needle)))
}

/// Map a failed ssh connection to the problem its channels close with.
pub fn diagnose(failure: &PeerFailure, report: &AuthReport, query_hostkey: bool) -> Problem {
    let stderr = failure.stderr();
    if stderr.is_empty() {
        return default_diagnosis(failure);
    }

    if any_line(stderr, &["REMOTE HOST IDENTIFICATION HAS CHANGED", "has changed and you have requested strict checking"]).is_some() {
        let problem = Problem::new(INVALID_HOSTKEY);
        return match offered_host_key(stderr) {
            Some(key) => problem
                .with_detail("host-key", key.line)
                .with_detail("host-fingerprint", key.fingerprint),
            None => problem,
        };
    }

    if let Some(line) = any_line(stderr, &["Host key verification failed", "host key is known for"]) {
        if query_hostkey {
            if let Some(key) = offered_host_key(stderr) {
                return Problem::new(UNKNOWN_HOSTKEY)
                    .with_message(line.trim())
                    .with_detail("host-key", key.line)
                    .with_detail("host-fingerprint", key.fingerprint);
            }
        }
        return Problem::new(UNKNOWN_HOST).with_message(line.trim());
    }

    if let Some(methods) = stderr.iter().find_map(|line| auth_methods(line)) {
        let mut results = JsonObject::new();
        for method in methods {
            let outcome = match method {
                "password" if report.password_attempts == 0 => "not-tried",
                "password" => "denied",
                _ => "not-provided",
            };
            results.insert(method.to_string(), Value::String(outcome.to_string()));
        }
        let problem = Problem::new(AUTHENTICATION_FAILED).with_detail("auth-method-results", results);
        return match &report.locked_identity {
            Some(path) => problem.with_message(format!("locked identity: {path}")),
            None => problem,
        };
    }

    if let Some(line) = any_line(
        stderr,
        &[
            "Could not resolve hostname",
            "Connection refused",
            "No route to host",
            "Network is unreachable",
            "Connection timed out",
            "Name or service not known",
        ],
    ) {
        return Problem::new(NO_HOST).with_message(line.trim());
    }

    if let Some(line) = any_line(stderr, &["command not found", "No such file or directory"]) {
        return Problem::new(NO_COCKPIT).with_message(line.trim());
    }

    default_diagnosis(failure)
}
