//! Clap derive structures for the `twinline` CLI.

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};

// ── Top-Level CLI ────────────────────────────────────────────────────

/// twinline -- drive a digital twin gateway from recorded device data
#[derive(Debug, Parser)]
#[command(
    name = "twinline",
    version,
    about = "Replay device data into a digital twin gateway",
    long_about = "Feeds JSON-lines data updates through a twinline gateway, one \
        command per update, and prints the resulting twin.",
    propagate_version = true,
    subcommand_required = true,
    arg_required_else_help = true
)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalOpts,

    #[command(subcommand)]
    pub command: Command,
}

// ── Global Options ───────────────────────────────────────────────────

#[derive(Debug, Args)]
pub struct GlobalOpts {
    /// Config file (defaults to the platform config directory)
    #[arg(long, env = "TWINLINE_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Output format
    #[arg(
        long,
        short = 'o',
        env = "TWINLINE_OUTPUT",
        default_value = "table",
        global = true
    )]
    pub output: OutputFormat,

    /// Increase verbosity (-v, -vv, -vvv)
    #[arg(long, short = 'v', action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(long, short = 'q', global = true)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum OutputFormat {
    /// Pretty table (default, interactive)
    Table,
    /// Pretty-printed JSON
    Json,
    /// Compact single-line JSON
    JsonCompact,
    /// YAML
    Yaml,
    /// Plain text, one provider per line (scripting)
    Plain,
}

// ── Top-Level Command Enum ───────────────────────────────────────────

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Replay JSON-lines data updates and print the resulting twin
    #[command(alias = "r")]
    Replay(ReplayArgs),

    /// Inspect configuration
    Config(ConfigArgs),
}

#[derive(Debug, Args)]
pub struct ReplayArgs {
    /// Input file, or `-` for stdin
    pub input: PathBuf,

    /// Print every notification batch as a JSON line before the twin
    #[arg(long, short = 'n')]
    pub notifications: bool,

    /// Only show providers of this model
    #[arg(long, short = 'm')]
    pub model: Option<String>,

    /// Submit all updates as one batch command
    #[arg(long)]
    pub batch: bool,
}

#[derive(Debug, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub command: ConfigCommand,
}

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display the effective configuration as TOML
    Show,

    /// Print the config file path in use
    Path,
}
