//! Command handlers: bridge CLI args -> gateway -> output formatting.

pub mod config_cmd;
pub mod replay;
