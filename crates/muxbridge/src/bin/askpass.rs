//! Prompt helper for `sudo -A`, `SSH_ASKPASS` and ssh's `KnownHostsCommand`.
//!
//! Prompts are relayed to the bridge that spawned us over the socket named
//! in `MUXBRIDGE_ASKPASS_SOCKET`; the reply goes to stdout.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use muxbridge::router::ssh::HOSTKEY_REPORT;
use muxbridge::transport::{ask, ASKPASS_SOCKET_ENV};

/// ssh passes `%I %H %t %K %f` when run as `KnownHostsCommand`.
const KNOWN_HOSTS_ARGS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "muxbridge-askpass", version, about = "Relay a password prompt to muxbridge")]
struct Cli {
    /// Prompt text, or the `KnownHostsCommand` arguments.
    #[arg(num_args = 0..=KNOWN_HOSTS_ARGS, allow_hyphen_values = true)]
    args: Vec<String>,

    /// Socket of the prompting bridge.
    #[arg(long, env = ASKPASS_SOCKET_ENV, hide_env_values = true)]
    socket: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.args.len() == KNOWN_HOSTS_ARGS {
        // Known hosts lookup: report what was offered and know nothing.
        if cli.args[0] == "HOSTNAME" {
            eprintln!("{HOSTKEY_REPORT} {}", cli.args[1..].join(" "));
        }
        return ExitCode::SUCCESS;
    }

    let Some(socket) = cli.socket else {
        eprintln!("muxbridge-askpass: {ASKPASS_SOCKET_ENV} is not set");
        return ExitCode::FAILURE;
    };
    let prompt = cli.args.join(" ");
    match ask(&socket, &prompt) {
        Ok(Some(reply)) => {
            println!("{reply}");
            ExitCode::SUCCESS
        }
        Ok(None) => ExitCode::FAILURE,
        Err(err) => {
            eprintln!("muxbridge-askpass: {err}");
            ExitCode::FAILURE
        }
    }
}
