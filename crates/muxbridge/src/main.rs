mod cmd;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::LoggingArgs;
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "muxbridge", version, about = "Multiplexing protocol bridge")]
struct Cli {
    /// Output format for listing commands.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    #[command(flatten)]
    logging: LoggingArgs,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    cli.logging.init();

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    match cmd::run(cli.command, format) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}
