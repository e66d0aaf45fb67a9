//! Daemon control messages: logging, statistics, object removal, plugins and quit.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use saftbus_core::control::Buckets;
use saftbus_core::StatsReport;

use crate::cmd::{
    Globals, LoadPluginArgs, LoggingArgs, RemoveObjectArgs, StatsAction, StatsArgs, Switch,
};
use crate::exit::{bus_error, io_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_json, OutputFormat};

pub fn logging(args: LoggingArgs, globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    connection
        .enable_logging(args.state == Switch::On)
        .map_err(|err| bus_error("logging switch failed", err))?;
    Ok(SUCCESS)
}

pub fn stats(args: StatsArgs, globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    match args.action {
        StatsAction::Enable | StatsAction::Disable => {
            let on = matches!(args.action, StatsAction::Enable);
            connection
                .enable_stats(on)
                .map_err(|err| bus_error("stats switch failed", err))?;
        }
        StatsAction::Download { output, dat } => {
            let report = connection
                .get_stats()
                .map_err(|err| bus_error("stats download failed", err))?;
            if let Some(dir) = dat {
                write_dat_tables(&dir, &report)?;
            }
            match output {
                Some(path) => {
                    let json = serde_json::to_string_pretty(&report)
                        .map_err(|err| CliError::new(INTERNAL, format!("stats encode failed: {err}")))?;
                    fs::write(&path, json)
                        .map_err(|err| io_error(&format!("write {}", path.display()), err))?;
                }
                None => match globals.format {
                    OutputFormat::Json => print_json(&report),
                    _ => println!(
                        "{}",
                        serde_json::to_string_pretty(&report).unwrap_or_else(|_| "{}".to_string())
                    ),
                },
            }
        }
    }
    Ok(SUCCESS)
}

pub fn remove_object(args: RemoveObjectArgs, globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    connection
        .remove_object(&args.path)
        .map_err(|err| bus_error(&format!("remove {}", args.path), err))?;
    Ok(SUCCESS)
}

pub fn load_plugin(args: LoadPluginArgs, globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    connection
        .load_plugin(&args.name)
        .map_err(|err| bus_error(&format!("load {}", args.name), err))?;
    Ok(SUCCESS)
}

pub fn quit(globals: &Globals) -> CliResult<i32> {
    let (_context, connection) = globals.connect()?;
    connection
        .quit()
        .map_err(|err| bus_error("quit failed", err))?;
    Ok(SUCCESS)
}

/// One `bucket count` line per bucket.
fn dat_table(buckets: &Buckets) -> String {
    let mut table = String::new();
    for (bucket, count) in buckets {
        let _ = writeln!(table, "{bucket} {count}");
    }
    table
}

fn write_dat_tables(dir: &Path, report: &StatsReport) -> CliResult<()> {
    fs::create_dir_all(dir).map_err(|err| io_error(&format!("create {}", dir.display()), err))?;
    let mut tables = vec![("saftbus_timing.dat".to_string(), &report.flight_times)];
    tables.extend(
        report
            .function_times
            .iter()
            .map(|(function, buckets)| (format!("{function}.dat"), buckets)),
    );
    for (file, buckets) in tables {
        let path = dir.join(file);
        fs::write(&path, dat_table(buckets))
            .map_err(|err| io_error(&format!("write {}", path.display()), err))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dat_table_lists_buckets_in_order() {
        let buckets: Buckets = [(12, 3), (4, 1)].into_iter().collect();
        assert_eq!(dat_table(&buckets), "4 1\n12 3\n");
        assert_eq!(dat_table(&Buckets::new()), "");
    }
}
