use crate::cmd::{load_settings, BridgesArgs};
use crate::exit::{CliResult, SUCCESS};
use crate::output::{render_bridges, OutputFormat};

pub fn run(args: BridgesArgs, format: OutputFormat) -> CliResult<i32> {
    let settings = load_settings(args.config.as_deref())?;
    println!("{}", render_bridges(&settings.superuser, format));
    Ok(SUCCESS)
}
