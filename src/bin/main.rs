//! metricsdb binary.
//!
//! Runs one operation of the metrics database against the configured backend
//! (DuckDB, MongoDB or PostgreSQL over ADBC) and prints the result as JSON.

use clap::Parser;
use metricsdb_core::cli::{run_command, Cli};
use metricsdb_core::config::Settings;
use tracing::{debug, Level};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(
            cli.logging
                .get_effective_level()
                .parse()
                .unwrap_or(Level::INFO)
                .into(),
        )
        .parse_lossy(cli.logging.filter_directives());

    // Logs go to stderr so stdout stays machine-readable.
    let console = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true);

    let _guard = match &cli.logging.log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "metricsdb.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(console)
                .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(console).init();
            None
        }
    };

    let settings = Settings::load(&cli.config)?;
    debug!(backend = %settings.database.backend, "Configuration loaded");

    run_command(cli.command, settings).await
}
