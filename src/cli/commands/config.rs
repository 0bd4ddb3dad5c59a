use clap::Args;
use std::path::PathBuf;

/// Logging configuration that can be set via CLI or env vars
#[derive(Debug, Clone, Default, Args)]
pub struct LoggingConfig {
    /// Enable verbose logging (-v for debug, -vv for trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long = "log-level", env = "METRICSDB_LOG_LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Log filter directives
    #[arg(long = "log-filter", env = "METRICSDB_LOG_FILTER", global = true)]
    pub log_filter: Option<String>,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long = "log-dir", env = "METRICSDB_LOG_DIR", global = true)]
    pub log_dir: Option<PathBuf>,
}

impl LoggingConfig {
    pub fn get_effective_level(&self) -> &str {
        match (self.verbose, self.log_level.as_deref()) {
            (v, _) if v >= 2 => "trace", // -vv flag
            (1, _) => "debug",           // -v flag
            (0, Some(level)) => level,   // Configured level
            _ => "info",                 // Default
        }
    }

    pub fn filter_directives(&self) -> &str {
        self.log_filter.as_deref().unwrap_or("metricsdb_core=info")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_level() {
        let mut logging = LoggingConfig::default();
        assert_eq!(logging.get_effective_level(), "info");
        logging.log_level = Some("warn".into());
        assert_eq!(logging.get_effective_level(), "warn");
        logging.verbose = 1;
        assert_eq!(logging.get_effective_level(), "debug");
        logging.verbose = 3;
        assert_eq!(logging.get_effective_level(), "trace");
    }
}
