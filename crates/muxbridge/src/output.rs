use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use muxbridge_router::SuperuserBridgeConfig;
use serde::Serialize;

#[derive(Clone, Debug, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
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

#[derive(Serialize)]
struct BridgeOutput<'a> {
    label: &'a str,
    command: String,
    environ: &'a [String],
    privileged: bool,
}

impl<'a> From<&'a SuperuserBridgeConfig> for BridgeOutput<'a> {
    fn from(bridge: &'a SuperuserBridgeConfig) -> Self {
        Self {
            label: &bridge.label,
            command: bridge.spawn.join(" "),
            environ: &bridge.environ,
            privileged: bridge.privileged,
        }
    }
}

pub fn render_bridges(bridges: &[SuperuserBridgeConfig], format: OutputFormat) -> String {
    let rows: Vec<BridgeOutput<'_>> = bridges.iter().map(BridgeOutput::from).collect();
    match format {
        OutputFormat::Json => serde_json::to_string(&rows).unwrap_or_else(|_| "[]".to_string()),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["LABEL", "COMMAND", "PRIVILEGED"]);
            for row in &rows {
                table.add_row(vec![
                    row.label.to_string(),
                    row.command.clone(),
                    row.privileged.to_string(),
                ]);
            }
            table.to_string()
        }
        OutputFormat::Pretty => rows
            .iter()
            .map(|row| format!("{}: {} (privileged={})", row.label, row.command, row.privileged))
            .collect::<Vec<_>>()
            .join("\n"),
    }
}
