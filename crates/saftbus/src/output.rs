use std::collections::BTreeMap;
use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use saftbus_core::{StateReport, StatusReport};
use saftbus_serial::Value;
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
    Raw,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

fn table(header: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(header);
    table
}

pub fn print_json<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
    );
}

fn print_json_pretty<T: Serialize + ?Sized>(value: &T) {
    println!(
        "{}",
        serde_json::to_string_pretty(value).unwrap_or_else(|_| "{}".to_string())
    );
}

/// Print the return values of a method call.
pub fn print_values(values: &[Value], format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(values),
        OutputFormat::Table => {
            if values.is_empty() {
                return;
            }
            let mut out = table(vec!["#", "TYPE", "VALUE"]);
            for (i, value) in values.iter().enumerate() {
                out.add_row(vec![i.to_string(), value.signature(), value.to_string()]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty => {
            for value in values {
                println!("{} {}", value.signature(), value);
            }
        }
        OutputFormat::Raw => {
            for value in values {
                println!("{value}");
            }
        }
    }
}

/// Print a property map from `Properties.GetAll`.
pub fn print_properties(properties: &BTreeMap<String, Value>, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(properties),
        OutputFormat::Table => {
            let mut out = table(vec!["PROPERTY", "TYPE", "VALUE"]);
            for (name, value) in properties {
                out.add_row(vec![name.clone(), value.signature(), value.to_string()]);
            }
            println!("{out}");
        }
        OutputFormat::Pretty | OutputFormat::Raw => {
            for (name, value) in properties {
                println!("{name} = {value}");
            }
        }
    }
}

pub fn print_status(report: &StatusReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Pretty => print_json_pretty(report),
        OutputFormat::Table => {
            let mut out = table(vec!["INDEX", "PATH", "INTERFACE", "ACTIVE"]);
            for (interface, paths) in &report.indices {
                for (path, index) in paths {
                    let active = if report.active_indices.contains(index) { "yes" } else { "" };
                    out.add_row(vec![index.to_string(), path.clone(), interface.clone(), active.to_string()]);
                }
            }
            println!("{out}");
        }
        OutputFormat::Raw => {
            for (interface, paths) in &report.indices {
                for (path, index) in paths {
                    println!("{index} {path} {interface}");
                }
            }
        }
    }
}

#[derive(Serialize)]
struct PipeRow<'a> {
    interface: &'a str,
    path: &'a str,
    proxy_id: u64,
    route: &'a str,
    connection: &'a str,
}

fn pipe_rows(report: &StateReport) -> Vec<PipeRow<'_>> {
    let mut rows = Vec::new();
    for (interface, paths) in &report.proxy_pipes {
        for (path, entries) in paths {
            for entry in entries {
                rows.push(PipeRow {
                    interface,
                    path,
                    proxy_id: entry.proxy_id,
                    route: &entry.route,
                    connection: &entry.connection,
                });
            }
        }
    }
    rows
}

pub fn print_pipes(report: &StateReport, format: OutputFormat) {
    let rows = pipe_rows(report);
    match format {
        OutputFormat::Json => print_json(&rows),
        OutputFormat::Pretty => print_json_pretty(&rows),
        OutputFormat::Table => {
            let mut out = table(vec!["INTERFACE", "PATH", "PROXY", "ROUTE", "CONNECTION"]);
            for row in &rows {
                out.add_row(vec![
                    row.interface.to_string(),
                    row.path.to_string(),
                    row.proxy_id.to_string(),
                    row.route.to_string(),
                    row.connection.to_string(),
                ]);
            }
            println!("{out}");
        }
        OutputFormat::Raw => {
            for row in &rows {
                println!("{} {} {} {}", row.proxy_id, row.route, row.interface, row.path);
            }
        }
    }
}

pub fn print_state(report: &StateReport, format: OutputFormat) {
    match format {
        OutputFormat::Json => print_json(report),
        OutputFormat::Pretty | OutputFormat::Raw => print_json_pretty(report),
        OutputFormat::Table => {
            let active = report.sockets_active.iter().filter(|&&a| a).count();
            let mut out = table(vec!["FIELD", "VALUE"]);
            out.add_row(vec!["objects".to_string(), report.object_counter.to_string()]);
            out.add_row(vec!["signals sent".to_string(), report.signal_counter.to_string()]);
            out.add_row(vec!["connections".to_string(), report.connection_counter.to_string()]);
            out.add_row(vec![
                "sockets active".to_string(),
                format!("{active}/{}", report.sockets_active.len()),
            ]);
            out.add_row(vec!["signal routes".to_string(), report.pipe_count().to_string()]);
            for (path, owner) in &report.owners {
                out.add_row(vec![format!("owner {path}"), owner.clone()]);
            }
            for (slot, pid) in &report.socket_owner {
                out.add_row(vec![format!("slot {slot}"), format!("pid {pid}")]);
            }
            for (plugin, loaded) in &report.plugins {
                out.add_row(vec![format!("plugin {plugin}"), loaded.to_string()]);
            }
            println!("{out}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use saftbus_core::PipeEntry;

    #[test]
    fn pipe_rows_flatten_every_route() {
        let mut report = StateReport::default();
        let entry = |id: u64, route: &str| PipeEntry {
            proxy_id: id,
            route: route.to_string(),
            connection: "c1".to_string(),
        };
        report
            .proxy_pipes
            .entry("de.gsi.saftlib.SAFTd".into())
            .or_default()
            .insert("/de/gsi/saftlib".into(), vec![entry(100, "pipe"), entry(200, "inband")]);

        let rows = pipe_rows(&report);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].route, "inband");
        assert_eq!(rows[1].path, "/de/gsi/saftlib");
    }
}
