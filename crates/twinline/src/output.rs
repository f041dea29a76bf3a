//! Output formatting: table, JSON, YAML, plain.
//!
//! Renders twin snapshots in the format selected by `--output`. Table
//! uses `tabled`, structured formats use serde, plain emits one
//! provider name per line.

use std::io::{self, Write};

use serde_json::Value;
use tabled::{Table, Tabled, settings::Style};

use twinline_core::{NotificationBatch, ProviderSnapshot};

use crate::cli::OutputFormat;
use crate::error::CliError;

// ── Rows ─────────────────────────────────────────────────────────────

#[derive(Tabled)]
struct ResourceRow {
    #[tabled(rename = "Provider")]
    provider: String,
    #[tabled(rename = "Model")]
    model: String,
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Resource")]
    resource: String,
    #[tabled(rename = "Kind")]
    kind: String,
    #[tabled(rename = "Value")]
    value: String,
    #[tabled(rename = "Updated")]
    updated: String,
}

fn display_value(value: &Value) -> String {
    match value {
        Value::Null => "-".into(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn rows(providers: &[ProviderSnapshot]) -> Vec<ResourceRow> {
    providers
        .iter()
        .flat_map(|provider| {
            provider.services.iter().flat_map(move |service| {
                service.resources.iter().map(move |resource| ResourceRow {
                    provider: provider.name.clone(),
                    model: provider.model.clone(),
                    service: service.name.clone(),
                    resource: resource.name.clone(),
                    kind: resource.kind.to_string(),
                    value: display_value(&resource.value.value),
                    updated: resource
                        .value
                        .timestamp
                        .map_or_else(|| "-".into(), |ts| ts.format("%Y-%m-%d %H:%M:%S").to_string()),
                })
            })
        })
        .collect()
}

// ── Render dispatchers ───────────────────────────────────────────────

/// Render a twin snapshot in the chosen format.
pub fn render_twin(format: OutputFormat, providers: &[ProviderSnapshot]) -> Result<String, CliError> {
    match format {
        OutputFormat::Table => Ok(render_table(&rows(providers))),
        OutputFormat::Json => render_json(providers, false),
        OutputFormat::JsonCompact => render_json(providers, true),
        OutputFormat::Yaml => render_yaml(providers),
        OutputFormat::Plain => Ok(providers
            .iter()
            .map(|p| p.name.as_str())
            .collect::<Vec<_>>()
            .join("\n")),
    }
}

/// One notification batch as a single JSON line.
pub fn render_batch(batch: &NotificationBatch) -> Result<String, CliError> {
    render_json(batch, true)
}

/// Print the rendered output to stdout, respecting quiet mode.
pub fn print_output(output: &str, quiet: bool) {
    if quiet || output.is_empty() {
        return;
    }
    let mut stdout = io::stdout().lock();
    let _ = writeln!(stdout, "{output}");
}

// ── Format-specific renderers ────────────────────────────────────────

fn render_table<R: Tabled>(rows: &[R]) -> String {
    if rows.is_empty() {
        return String::new();
    }
    Table::new(rows).with(Style::rounded()).to_string()
}

fn render_json<T: serde::Serialize + ?Sized>(data: &T, compact: bool) -> Result<String, CliError> {
    let rendered = if compact {
        serde_json::to_string(data)?
    } else {
        serde_json::to_string_pretty(data)?
    };
    Ok(rendered)
}

fn render_yaml<T: serde::Serialize + ?Sized>(data: &T) -> Result<String, CliError> {
    Ok(serde_yaml::to_string(data)?)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn values_render_without_json_quotes() {
        assert_eq!(display_value(&json!("on")), "on");
        assert_eq!(display_value(&json!(5)), "5");
        assert_eq!(display_value(&Value::Null), "-");
    }

    #[test]
    fn empty_twin_renders_nothing() {
        assert_eq!(render_twin(OutputFormat::Table, &[]).ok(), Some(String::new()));
        assert_eq!(render_twin(OutputFormat::Json, &[]).ok(), Some("[]".into()));
    }
}
