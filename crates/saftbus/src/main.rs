mod cmd;
mod exit;
mod logging;
mod output;

use std::path::PathBuf;

use clap::Parser;

use crate::cmd::{Command, Globals};
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "saftbus", version, about = "saftbus daemon and control tool")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    /// Socket base name; slot N listens on <BASE>N.
    #[arg(
        long,
        value_name = "BASE",
        env = "SAFTBUS_SOCKET_BASE",
        default_value = saftbus_transport::DEFAULT_SOCKET_BASE,
        global = true
    )]
    socket_base: PathBuf,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let globals = Globals {
        format: cli.format.unwrap_or_else(OutputFormat::default_for_stdout),
        socket_base: cli.socket_base,
    };
    match cmd::run(cli.command, &globals) {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::{StatsAction, StatsArgs};

    #[test]
    fn parses_call_with_typed_arguments() {
        let cli = Cli::try_parse_from([
            "saftbus",
            "call",
            "de.gsi.saftlib.SAFTd",
            "/de/gsi/saftlib",
            "AttachDevice",
            "s",
            "tr1",
            "s",
            "/dev/sim1",
        ])
        .expect("call args should parse");

        match cli.command {
            Command::Call(args) => assert_eq!(args.args, vec!["s", "tr1", "s", "/dev/sim1"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn socket_base_defaults_to_tmp() {
        let cli = Cli::try_parse_from(["saftbus", "status"]).expect("status should parse");
        if std::env::var_os("SAFTBUS_SOCKET_BASE").is_none() {
            assert_eq!(cli.socket_base, PathBuf::from("/tmp/saftbus_"));
        }
        assert!(matches!(cli.command, Command::Status));
    }

    #[test]
    fn rejects_unknown_logging_switch() {
        let err = Cli::try_parse_from(["saftbus", "logging", "maybe"])
            .expect_err("only on/off are accepted");
        assert_eq!(err.kind(), clap::error::ErrorKind::InvalidValue);
    }

    #[test]
    fn parses_stats_download_output() {
        let cli = Cli::try_parse_from([
            "saftbus", "stats", "download", "--output", "/tmp/s.json", "--dat", "/tmp/dat",
        ])
        .expect("stats download should parse");
        match cli.command {
            Command::Stats(StatsArgs {
                action: StatsAction::Download { output, dat },
            }) => {
                assert_eq!(output, Some(PathBuf::from("/tmp/s.json")));
                assert_eq!(dat, Some(PathBuf::from("/tmp/dat")));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn parses_load_plugin() {
        let cli = Cli::try_parse_from(["saftbus", "load-plugin", "simulated"])
            .expect("load-plugin should parse");
        assert!(matches!(cli.command, Command::LoadPlugin(ref args) if args.name == "simulated"));
    }
}
