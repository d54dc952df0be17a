use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use muxbridge_router::{BridgeSettings, CONFIG_ENV};

use crate::exit::{config_error, CliResult};
use crate::output::OutputFormat;

pub mod bridge;
pub mod bridges;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Serve the protocol on stdin/stdout.
    Bridge(BridgeArgs),
    /// List configured superuser bridges.
    Bridges(BridgesArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Bridge(args) => bridge::run(args),
        Command::Bridges(args) => bridges::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug)]
pub struct BridgeArgs {
    /// Treat this bridge as already privileged; superuser requests route locally.
    #[arg(long)]
    pub privileged: bool,
    /// Settings file (JSON).
    #[arg(long, value_name = "FILE", env = CONFIG_ENV)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct BridgesArgs {
    /// Settings file (JSON).
    #[arg(long, value_name = "FILE", env = CONFIG_ENV)]
    pub config: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show build target and protocol details.
    #[arg(long)]
    pub extended: bool,
}

pub(crate) fn load_settings(path: Option<&Path>) -> CliResult<BridgeSettings> {
    BridgeSettings::load_or_default(path).map_err(config_error)
}
