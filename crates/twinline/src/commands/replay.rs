//! `replay`: feed recorded data updates through a gateway.

use std::io;
use std::path::Path;

use tracing::{debug, warn};

use twinline_config::Config;
use twinline_core::{
    CoreError, DataUpdate, Gateway, NotificationBatch, Pending, ProviderFilter, ProviderSnapshot,
};

use crate::cli::{GlobalOpts, ReplayArgs};
use crate::error::CliError;
use crate::output;

/// Counts reported after a replay.
#[derive(Debug, Default, PartialEq, Eq)]
struct Summary {
    applied: usize,
    stale: usize,
    failed: usize,
    skipped: usize,
}

impl Summary {
    fn total(&self) -> usize {
        self.applied + self.stale + self.failed + self.skipped
    }
}

pub async fn handle(args: ReplayArgs, cfg: &Config, global: &GlobalOpts) -> Result<(), CliError> {
    let input = read_input(&args.input)?;
    let (updates, skipped) = parse_updates(&input);
    debug!(updates = updates.len(), skipped, "input parsed");

    let quiet = global.quiet;
    let (providers, mut summary) = Gateway::oneshot(cfg.gateway_config()?, |gateway| async move {
        if args.notifications {
            gateway
                .notifications()
                .add_listener(move |batch: &NotificationBatch| print_batch(batch, quiet));
        }

        let summary = if args.batch {
            submit_batch(&gateway, updates).await?
        } else {
            submit_each(&gateway, updates).await
        };

        let providers = match &args.model {
            Some(model) => gateway.filtered(&ProviderFilter::ByModel(model.clone())),
            None => gateway.snapshot(),
        };
        Ok::<_, CoreError>((providers, summary))
    })
    .await?;
    summary.skipped += skipped;

    output::print_output(&output::render_twin(global.output, &providers)?, quiet);
    report(&summary, &providers, quiet);
    Ok(())
}

fn read_input(path: &Path) -> Result<String, CliError> {
    if path.as_os_str() == "-" {
        Ok(io::read_to_string(io::stdin())?)
    } else {
        Ok(std::fs::read_to_string(path)?)
    }
}

/// Parse JSON lines. Blank lines and `#` comments are ignored; lines that
/// do not parse are reported and counted.
fn parse_updates(input: &str) -> (Vec<(usize, DataUpdate)>, usize) {
    let mut updates = Vec::new();
    let mut skipped = 0;
    for (index, line) in input.lines().enumerate() {
        let line_no = index + 1;
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with('#') {
            continue;
        }
        match serde_json::from_str::<DataUpdate>(trimmed) {
            Ok(update) => updates.push((line_no, update)),
            Err(error) => {
                eprintln!("line {line_no}: malformed update: {error}");
                skipped += 1;
            }
        }
    }
    (updates, skipped)
}

/// One command per update, all queued before any is awaited.
async fn submit_each(gateway: &Gateway, updates: Vec<(usize, DataUpdate)>) -> Summary {
    let mut summary = Summary::default();
    let mut queued: Vec<(usize, Pending<bool>)> = Vec::with_capacity(updates.len());
    for (line_no, update) in updates {
        match gateway.ingest(update) {
            Ok(pending) => queued.push((line_no, pending)),
            Err(error) => {
                eprintln!("line {line_no}: {error}");
                summary.skipped += 1;
            }
        }
    }

    for (line_no, pending) in queued {
        match pending.await {
            Ok(true) => summary.applied += 1,
            Ok(false) => summary.stale += 1,
            Err(error) => {
                eprintln!("line {line_no}: {error}");
                summary.failed += 1;
            }
        }
    }
    summary
}

/// All valid updates as one batch command; any member failure fails the
/// replay.
async fn submit_batch(
    gateway: &Gateway,
    updates: Vec<(usize, DataUpdate)>,
) -> Result<Summary, CoreError> {
    let mut summary = Summary::default();
    let mut valid = Vec::with_capacity(updates.len());
    for (line_no, update) in updates {
        match update.validate() {
            Ok(()) => valid.push(update),
            Err(error) => {
                eprintln!("line {line_no}: {error}");
                summary.skipped += 1;
            }
        }
    }

    let submitted = valid.len();
    let applied = gateway.ingest_all(valid)?.await?;
    summary.applied = applied;
    summary.stale = submitted - applied;
    Ok(summary)
}

fn print_batch(batch: &NotificationBatch, quiet: bool) {
    match output::render_batch(batch) {
        Ok(line) => output::print_output(&line, quiet),
        Err(error) => warn!(%error, command = batch.command_id, "could not render batch"),
    }
}

fn report(summary: &Summary, providers: &[ProviderSnapshot], quiet: bool) {
    if quiet {
        return;
    }
    eprintln!(
        "replayed {} updates: {} applied, {} stale, {} failed, {} skipped; {} providers",
        summary.total(),
        summary.applied,
        summary.stale,
        summary.failed,
        summary.skipped,
        providers.len()
    );
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let input = "# recorded 2024-05-01\n\n{\"provider\":\"p\",\"service\":\"s\",\"resource\":\"r\",\"value\":1}\n";
        let (updates, skipped) = parse_updates(input);
        assert_eq!(skipped, 0);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 3);
        assert_eq!(updates[0].1.value, json!(1));
    }

    #[test]
    fn malformed_lines_are_counted() {
        let input = "{\"provider\":\"p\"\nnot json\n{\"provider\":\"p\",\"service\":\"s\",\"resource\":\"r\",\"value\":true,\"type\":\"boolean\"}";
        let (updates, skipped) = parse_updates(input);
        assert_eq!(skipped, 2);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].0, 3);
    }
}
