use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable naming the settings file.
pub const CONFIG_ENV: &str = "MUXBRIDGE_CONFIG";

pub const DEFAULT_WINDOW_SIZE: u64 = 2 * 1024 * 1024;
pub const DEFAULT_BLOCK_SIZE: u64 = 16 * 1024;
pub const DEFAULT_PEER_INIT_TIMEOUT_SECS: u64 = 60;

/// Everything the bridge reads from its settings file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BridgeSettings {
    /// Superuser bridges, in order of preference.
    pub superuser: Vec<SuperuserBridgeConfig>,
    pub ssh: SshSettings,
    pub flow_control: FlowControlConfig,
    pub packages: PackagesInfo,
    /// Path of the askpass helper. Defaults to `muxbridge-askpass` next to
    /// the running executable.
    pub askpass: Option<PathBuf>,
    pub peer_init_timeout_secs: Option<u64>,
}

/// One configured privilege-escalation helper.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SuperuserBridgeConfig {
    /// Name exposed through `bridges()` and accepted by `start(name)`.
    pub label: String,
    /// Full argv of the helper, e.g. `["sudo", "-A", "muxbridge", "bridge", "--privileged"]`.
    pub spawn: Vec<String>,
    /// Extra `KEY=VALUE` environment entries.
    #[serde(default)]
    pub environ: Vec<String>,
    #[serde(default)]
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SshSettings {
    /// The ssh client argv prefix.
    pub command: Vec<String>,
    /// Command run on the remote host to start a bridge.
    pub remote_bridge: Vec<String>,
    /// Known-hosts file consulted in addition to the user's own.
    pub known_hosts_file: Option<PathBuf>,
    /// Offer unknown host keys back to the client instead of failing flatly.
    pub connect_to_unknown_hosts: bool,
    /// File whose bytes are written to the child before any frame.
    pub bootstrap: Option<PathBuf>,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            command: vec!["ssh".to_string()],
            remote_bridge: vec!["muxbridge".to_string(), "bridge".to_string()],
            known_hosts_file: None,
            connect_to_unknown_hosts: false,
            bootstrap: None,
        }
    }
}

/// Per-channel flow-control policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct FlowControlConfig {
    pub window: u64,
    pub block_size: u64,
}

impl Default for FlowControlConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
        }
    }
}

/// Content announced in `init`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct PackagesInfo {
    pub checksum: Option<String>,
    pub names: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("invalid settings: {0}")]
    Invalid(String),
}

impl BridgeSettings {
    /// Load settings from a JSON file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = serde_json::from_slice(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load from `path` when given, defaults otherwise.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for bridge in &self.superuser {
            if bridge.label.is_empty() {
                return Err(ConfigError::Invalid("superuser bridge without a label".into()));
            }
            if bridge.spawn.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "superuser bridge '{}' has an empty spawn command",
                    bridge.label
                )));
            }
        }
        if self.ssh.command.is_empty() {
            return Err(ConfigError::Invalid("ssh command is empty".into()));
        }
        if self.flow_control.block_size == 0 || self.flow_control.window == 0 {
            return Err(ConfigError::Invalid(
                "flow-control window and block-size must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn peer_init_timeout(&self) -> Duration {
        Duration::from_secs(
            self.peer_init_timeout_secs
                .unwrap_or(DEFAULT_PEER_INIT_TIMEOUT_SECS),
        )
    }

    /// The configured askpass helper, or `muxbridge-askpass` next to the
    /// current executable when that exists.
    pub fn askpass_path(&self) -> Option<PathBuf> {
        if let Some(path) = &self.askpass {
            return Some(path.clone());
        }
        let exe = std::env::current_exe().ok()?;
        let sibling = exe.parent()?.join("muxbridge-askpass");
        sibling.is_file().then_some(sibling)
    }

    pub fn superuser_bridge(&self, label: &str) -> Option<&SuperuserBridgeConfig> {
        self.superuser.iter().find(|bridge| bridge.label == label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let settings = BridgeSettings::default();
        assert_eq!(settings.flow_control.window, 2 * 1024 * 1024);
        assert_eq!(settings.flow_control.block_size, 16 * 1024);
        assert_eq!(settings.ssh.command, vec!["ssh"]);
        assert_eq!(settings.peer_init_timeout(), Duration::from_secs(60));
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn parse_kebab_case() {
        let settings: BridgeSettings = serde_json::from_str(
            r#"{
                "superuser": [
                    {"label": "sudo", "spawn": ["sudo", "-A", "muxbridge", "bridge", "--privileged"],
                     "environ": ["SUDO_PROMPT=[sudo] "], "privileged": true}
                ],
                "ssh": {"known-hosts-file": "/etc/muxbridge/known_hosts", "connect-to-unknown-hosts": true},
                "flow-control": {"block-size": 4096},
                "peer-init-timeout-secs": 5
            }"#,
        )
        .unwrap();

        assert_eq!(settings.superuser[0].label, "sudo");
        assert!(settings.superuser_bridge("sudo").unwrap().privileged);
        assert!(settings.ssh.connect_to_unknown_hosts);
        assert_eq!(settings.ssh.command, vec!["ssh"]);
        assert_eq!(settings.flow_control.block_size, 4096);
        assert_eq!(settings.flow_control.window, DEFAULT_WINDOW_SIZE);
        assert_eq!(settings.peer_init_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn validate_rejects_empty_spawn() {
        let mut settings = BridgeSettings::default();
        settings.superuser.push(SuperuserBridgeConfig {
            label: "broken".into(),
            spawn: vec![],
            environ: vec![],
            privileged: false,
        });
        assert!(matches!(settings.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn load_missing_file() {
        let err = BridgeSettings::load("/nonexistent/muxbridge.json").unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn explicit_askpass_wins() {
        let settings = BridgeSettings {
            askpass: Some(PathBuf::from("/usr/libexec/muxbridge-askpass")),
            ..BridgeSettings::default()
        };
        assert_eq!(
            settings.askpass_path(),
            Some(PathBuf::from("/usr/libexec/muxbridge-askpass"))
        );
    }
}
