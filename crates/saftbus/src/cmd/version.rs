use crate::cmd::VersionArgs;
use crate::exit::{CliResult, SUCCESS};

pub fn run(args: VersionArgs) -> CliResult<i32> {
    if !args.extended {
        println!("saftbus {}", env!("CARGO_PKG_VERSION"));
        return Ok(SUCCESS);
    }

    println!("name: saftbus");
    println!("version: {}", env!("CARGO_PKG_VERSION"));
    println!("protocol: {}", saftbus_core::PROTOCOL_VERSION);
    println!(
        "target: {}",
        option_env!("SAFTBUS_BUILD_TARGET").unwrap_or("unknown")
    );
    println!(
        "profile: {}",
        option_env!("SAFTBUS_BUILD_PROFILE").unwrap_or("unknown")
    );
    println!("target_os: {}", std::env::consts::OS);
    println!("target_arch: {}", std::env::consts::ARCH);
    println!("socket_base: {}", saftbus_transport::DEFAULT_SOCKET_BASE);
    println!("max_slots: {}", saftbus_transport::MAX_SLOTS);
    println!("features: fg={}, cli=true", cfg!(feature = "fg"));

    Ok(SUCCESS)
}
