//! Command-line interface module.
//!
//! This module provides the CLI functionality for:
//! - Configuration overrides and logging flags
//! - One subcommand per database operation

pub mod commands;
pub mod handlers;

pub use handlers::run_command;

use crate::cli::commands::{Commands, LoggingConfig};
use crate::config::ConfigArgs;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[command(flatten)]
    pub config: ConfigArgs,

    #[command(flatten)]
    pub logging: LoggingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_global_flags() {
        let cli = Cli::try_parse_from([
            "metricsdb",
            "count",
            "--backend",
            "embedded",
            "--connection",
            ":memory:",
            "-vv",
            r#"{"attributes": {"category": "A"}}"#,
        ])
        .unwrap();
        assert_eq!(cli.config.backend.as_deref(), Some("embedded"));
        assert_eq!(cli.logging.get_effective_level(), "trace");
        assert!(matches!(cli.command, Commands::Count { filter: Some(_) }));
    }

    #[test]
    fn test_delete_where_requires_filter() {
        assert!(Cli::try_parse_from(["metricsdb", "delete-where"]).is_err());
    }
}
