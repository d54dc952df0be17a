use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("muxbridge {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: muxbridge");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!(
        "target: {}",
        option_env!("MUXBRIDGE_BUILD_TARGET").unwrap_or("unknown")
    );
    println!("protocol: 1");
    println!("capabilities: explicit-superuser");

    Ok(SUCCESS)
}
