//! Channels for other hosts, forwarded to a bridge started there over ssh.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use muxbridge_frame::{json, JsonObject};
use muxbridge_transport::{InteractionRequest, SpawnSpec};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config::{BridgeSettings, ConfigError};
use crate::endpoint::{Endpoint, EndpointId};
use crate::error::Problem;
use crate::peer::{Diagnose, Peer, PeerConfig, PeerFailure};
use crate::rule::{RouteDecision, RoutingRule, RuleContext};
use crate::ssh::{self, AuthResponder, Destination, SshOptions};
use crate::system;

/// Identity of a cached host connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HostKey {
    pub host: String,
    /// `None` when it is the local user; the remote side picks its default.
    pub user: Option<String>,
    /// Set for `session: "private"` requests; unique per open.
    pub nonce: Option<u64>,
}

/// A known_hosts file holding the key supplied with a request; removed on drop.
///
/// Created exclusively with mode 0600, so a planted file or symlink under
/// the same name is never written through.
#[derive(Debug)]
struct KnownHostsFile {
    file: NamedTempFile,
}

impl KnownHostsFile {
    fn write(line: &str) -> std::io::Result<Self> {
        let mut file = tempfile::Builder::new()
            .prefix("muxbridge-known-hosts-")
            .tempfile()?;
        writeln!(file, "{}", line.trim_end())?;
        file.flush()?;
        Ok(Self { file })
    }

    fn path(&self) -> &Path {
        self.file.path()
    }
}

struct HostEntry {
    peer: Peer,
    _known_hosts: Option<KnownHostsFile>,
}

/// Routes `open` requests whose `host` names another machine.
pub struct HostRoutingRule {
    settings: Arc<BridgeSettings>,
    bootstrap: Option<Bytes>,
    local_user: Option<String>,
    peers: HashMap<HostKey, HostEntry>,
    next_session: u64,
}

impl HostRoutingRule {
    pub fn new(settings: Arc<BridgeSettings>) -> Result<Self, ConfigError> {
        let bootstrap = match &settings.ssh.bootstrap {
            Some(path) => Some(Bytes::from(std::fs::read(path).map_err(|source| {
                ConfigError::Read {
                    path: path.clone(),
                    source,
                }
            })?)),
            None => None,
        };
        Ok(Self {
            settings,
            bootstrap,
            local_user: system::username(),
            peers: HashMap::new(),
            next_session: 0,
        })
    }

    /// Number of cached connections.
    pub fn connections(&self) -> usize {
        self.peers.len()
    }

    fn connect(
        &self,
        destination: &Destination,
        key: &HostKey,
        options: &JsonObject,
        ctx: &RuleContext<'_>,
    ) -> Result<HostEntry, Problem> {
        let known_hosts = match json::typed_str(options, "host-key").map_err(Problem::protocol_error)? {
            Some(line) => Some(KnownHostsFile::write(line).map_err(|err| {
                Problem::internal(format!("cannot store host key: {err}"))
            })?),
            None => None,
        };
        let password = json::typed_str(options, "password")
            .map_err(Problem::protocol_error)?
            .map(str::to_owned);

        let responder = Arc::new(AuthResponder::new(password));
        let askpass = self.settings.askpass_path();
        let query_hostkey = key.nonce.is_some() || self.settings.ssh.connect_to_unknown_hosts;
        let argv = ssh::ssh_argv(
            &self.settings.ssh,
            destination,
            key.user.as_deref(),
            SshOptions {
                askpass: askpass.as_deref(),
                extra_known_hosts: known_hosts.as_ref().map(KnownHostsFile::path),
                query_hostkey,
                password: responder.has_password(),
            },
        );
        let spec = SpawnSpec::from_argv(format!("ssh {}", key.host), &argv)
            .map_err(|err| Problem::internal(err.to_string()))?;

        let diagnose: Diagnose = {
            let responder = Arc::clone(&responder);
            Arc::new(move |failure: &PeerFailure| {
                ssh::diagnose(failure, &responder.report(), query_hostkey)
            })
        };
        let mut config = PeerConfig::new(spec, key.host.as_str())
            .with_bootstrap(self.bootstrap.clone())
            .with_init_timeout(self.settings.peer_init_timeout())
            .with_diagnosis(diagnose);
        if askpass.is_some() {
            let responder = Arc::clone(&responder);
            config = config.with_prompts(
                askpass,
                Arc::new(move |request: InteractionRequest| responder.respond(request)),
            );
        }

        let peer = Peer::new(config, ctx.router.clone());
        let starter = peer.clone();
        tokio::spawn(async move {
            // Failures reach the router as EndpointClosed with the diagnosis.
            let _ = starter.start().await;
        });

        Ok(HostEntry {
            peer,
            _known_hosts: known_hosts,
        })
    }
}

impl RoutingRule for HostRoutingRule {
    fn name(&self) -> &'static str {
        "host"
    }

    fn apply_rule(&mut self, options: &JsonObject, ctx: &RuleContext<'_>) -> RouteDecision {
        let host = match json::typed_str(options, "host") {
            Ok(Some(host)) if host != ctx.init_host => host,
            Ok(_) => return RouteDecision::NoMatch,
            Err(message) => return RouteDecision::Reject(Problem::protocol_error(message)),
        };
        let destination = match Destination::parse(host) {
            Ok(destination) => destination,
            Err(message) => return RouteDecision::Reject(Problem::protocol_error(message)),
        };
        let user = match json::typed_str(options, "user") {
            Ok(user) => user.map(str::to_owned).or_else(|| destination.user.clone()),
            Err(message) => return RouteDecision::Reject(Problem::protocol_error(message)),
        };
        let private = json::get_str(options, "session") == Some("private");
        let nonce = private.then(|| {
            self.next_session += 1;
            self.next_session
        });

        let key = HostKey {
            host: host.to_string(),
            user: user.filter(|user| Some(user) != self.local_user.as_ref()),
            nonce,
        };

        if let Some(entry) = self.peers.get(&key) {
            debug!(host = %key.host, user = ?key.user, "reusing host connection");
            return RouteDecision::Endpoint(Arc::new(entry.peer.clone()));
        }

        match self.connect(&destination, &key, options, ctx) {
            Ok(entry) => {
                info!(host = %key.host, user = ?key.user, private, "connecting to host");
                let peer = entry.peer.clone();
                self.peers.insert(key, entry);
                RouteDecision::Endpoint(Arc::new(peer))
            }
            Err(problem) => {
                warn!(host = %key.host, problem = %problem, "cannot connect to host");
                RouteDecision::Reject(problem)
            }
        }
    }

    fn endpoint_closed(&mut self, endpoint: EndpointId) {
        self.peers.retain(|key, entry| {
            let keep = entry.peer.id() != endpoint;
            if !keep {
                debug!(host = %key.host, "host connection closed");
            }
            keep
        });
    }

    fn channel_unbound(&mut self, endpoint: EndpointId, remaining: usize) {
        if remaining > 0 {
            return;
        }
        // Private connections serve a single channel.
        let key = self
            .peers
            .iter()
            .find(|(key, entry)| key.nonce.is_some() && entry.peer.id() == endpoint)
            .map(|(key, _)| key.clone());
        if let Some(entry) = key.and_then(|key| self.peers.remove(&key)) {
            debug!("closing private host connection");
            entry.peer.close();
        }
    }

    fn shutdown(&mut self) {
        for entry in self.peers.values() {
            entry.peer.close();
        }
        self.peers.clear();
    }
}
