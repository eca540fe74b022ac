/// Logging Module
///
/// `tracing-subscriber` setup. `RUST_LOG` wins when set; otherwise the crate
/// logs at `info`, or `debug` with `--verbose`.
use std::io;

use tracing::Level;
use tracing_subscriber::{fmt::writer::MakeWriterExt, EnvFilter};

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum LogDestination {
    /// Warnings and errors to stderr, everything else to stdout
    #[default]
    Split,
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
    pub verbose: bool,
    pub destination: LogDestination,
}

fn default_directives(verbose: bool) -> &'static str {
    if verbose {
        "info,ledger_indexer=debug"
    } else {
        "info"
    }
}

pub fn init_logging(config: &LogConfig) -> anyhow::Result<()> {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_directives(config.verbose)));
    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(config.verbose);

    let installed = match config.destination {
        LogDestination::Split => builder.with_writer(io::stderr.with_max_level(Level::WARN).or_else(io::stdout)).try_init(),
        LogDestination::Stdout => builder.with_writer(io::stdout).try_init(),
        LogDestination::Stderr => builder.with_writer(io::stderr).try_init(),
    };

    installed.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))
}
