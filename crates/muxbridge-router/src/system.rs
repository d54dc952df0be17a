//! Host facts announced in `init` and used for routing decisions.

use std::collections::BTreeMap;
use std::path::Path;

use nix::unistd::{Uid, User};
use tracing::debug;

const OS_RELEASE_PATHS: &[&str] = &["/etc/os-release", "/usr/lib/os-release"];

/// The local host name, or `localhost` when it cannot be determined.
pub fn hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Name of the effective user, from the password database.
pub fn username() -> Option<String> {
    let uid = Uid::effective();
    match User::from_uid(uid) {
        Ok(Some(user)) => Some(user.name),
        Ok(None) => {
            debug!(uid = uid.as_raw(), "no password entry for effective uid");
            std::env::var("USER").ok()
        }
        Err(err) => {
            debug!(uid = uid.as_raw(), error = %err, "password database lookup failed");
            std::env::var("USER").ok()
        }
    }
}

/// Whether the process runs as root.
pub fn is_root() -> bool {
    Uid::effective().is_root()
}

/// Parse os-release(5) content.
pub fn parse_os_release(content: &str) -> BTreeMap<String, String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once('='))
        .map(|(key, value)| (key.trim().to_string(), unquote(value.trim())))
        .collect()
}

fn unquote(value: &str) -> String {
    let stripped = value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')));
    match stripped {
        Some(inner) => inner.replace("\\\"", "\"").replace("\\\\", "\\"),
        None => value.to_string(),
    }
}

/// The first readable os-release file, parsed; empty when none exists.
pub fn os_release() -> BTreeMap<String, String> {
    OS_RELEASE_PATHS
        .iter()
        .map(Path::new)
        .find_map(|path| std::fs::read_to_string(path).ok())
        .map(|content| parse_os_release(&content))
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_quoted_and_bare_values() {
        let release = parse_os_release(
            "# comment\nNAME=\"Fedora Linux\"\nID=fedora\nVERSION_ID=40\nPRETTY_NAME='Fedora 40'\n\nBROKEN\n",
        );
        assert_eq!(release.get("NAME").map(String::as_str), Some("Fedora Linux"));
        assert_eq!(release.get("ID").map(String::as_str), Some("fedora"));
        assert_eq!(release.get("PRETTY_NAME").map(String::as_str), Some("Fedora 40"));
        assert!(!release.contains_key("BROKEN"));
    }

    #[test]
    fn escaped_quotes() {
        let release = parse_os_release(r#"NAME="A \"quoted\" name""#);
        assert_eq!(release["NAME"], "A \"quoted\" name");
    }

    #[test]
    fn hostname_is_never_empty() {
        assert!(!hostname().is_empty());
    }

    #[test]
    fn root_is_looked_up_by_uid() {
        if is_root() {
            assert_eq!(username().as_deref(), Some("root"));
        } else {
            assert_ne!(username().as_deref(), Some("root"));
        }
    }
}
