/// CLI Module
///
/// Command-line interface configuration using clap. Every option can also be
/// set through the environment (or a `.env` file).
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::{ArgAction, Parser};

use crate::backfill::{BackfillConfig, DEFAULT_SMALL_GAP_THRESHOLD};
use crate::logging::{LogConfig, LogDestination};

/// First ledger of 2025-11-01 UTC; nothing earlier is ever backfilled
pub const DEFAULT_START_LEDGER: u64 = 99_984_580;

const DB_RETRY_DELAY: Duration = Duration::from_secs(2);

/// XRPL DEX Ledger Indexer
///
/// Follows validated ledgers from a rippled node and keeps AMM pools and
/// order-book offers up to date in PostgreSQL
#[derive(Parser, Debug)]
#[command(name = "ledger-indexer")]
#[command(author, about, long_about = None, disable_version_flag = true)]
pub struct Cli {
    /// rippled WebSocket endpoint
    #[arg(long = "rippled-ws", env = "RIPPLED_WS", value_name = "URL", default_value = "ws://localhost:6006")]
    pub rippled_ws: String,

    /// PostgreSQL connection URL (required)
    #[arg(long = "db", env = "DATABASE_URL", value_name = "URL")]
    pub database_url: Option<String>,

    /// Log every DEX transaction
    #[arg(short = 'v', long, env = "VERBOSE", action = ArgAction::SetTrue, value_parser = BoolishValueParser::new())]
    pub verbose: bool,

    /// Print version and build information
    #[arg(long)]
    pub version: bool,

    /// Log output streams
    #[arg(long, env = "LOG_DESTINATION", value_enum, default_value_t = LogDestination::Split)]
    pub log_destination: LogDestination,

    /// Never backfill ledgers before this index
    #[arg(long, value_name = "LEDGER", default_value_t = DEFAULT_START_LEDGER)]
    pub start_ledger: u64,

    /// Skip backfill when more ledgers than this are missing
    #[arg(long, value_name = "COUNT", default_value_t = DEFAULT_SMALL_GAP_THRESHOLD)]
    pub small_gap_threshold: u64,

    /// Fetch attempts per ledger during backfill
    #[arg(long, value_name = "COUNT", default_value = "3")]
    pub backfill_retries: usize,

    /// Base delay between backfill fetch attempts in seconds
    #[arg(long, value_name = "SECONDS", default_value = "1")]
    pub backfill_retry_delay: u64,

    /// rippled request timeout in seconds
    #[arg(long, value_name = "SECONDS", default_value = "30")]
    pub request_timeout: u64,

    /// Database connection attempts at startup
    #[arg(long, value_name = "COUNT", default_value = "5")]
    pub db_connect_retries: usize,
}

/// Runtime configuration, resolved from the CLI
#[derive(Debug, Clone)]
pub struct Config {
    pub rippled_ws: String,
    pub database_url: String,
    pub start_ledger: u64,
    pub small_gap_threshold: u64,
    pub request_timeout: Duration,
    pub db_connect_retries: usize,
    pub db_retry_delay: Duration,
    pub backfill: BackfillConfig,
    pub log: LogConfig,
}

impl Cli {
    /// Validate CLI arguments
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.rippled_ws.starts_with("ws://") || self.rippled_ws.starts_with("wss://")) {
            anyhow::bail!("rippled endpoint must be a ws:// or wss:// URL, got {}", self.rippled_ws);
        }

        if self.backfill_retries == 0 {
            anyhow::bail!("Backfill retries must be greater than 0");
        }

        if self.request_timeout == 0 {
            anyhow::bail!("Request timeout must be greater than 0");
        }

        if self.db_connect_retries == 0 {
            anyhow::bail!("Database connect retries must be greater than 0");
        }

        Ok(())
    }

    pub fn log_config(&self) -> LogConfig {
        LogConfig { verbose: self.verbose, destination: self.log_destination }
    }

    /// Resolve into a `Config`. Fails when no database URL was given.
    pub fn into_config(self) -> anyhow::Result<Config> {
        self.validate()?;
        let log = self.log_config();

        let database_url = match self.database_url {
            Some(url) if !url.trim().is_empty() => url,
            _ => anyhow::bail!("No database configured: pass --db or set DATABASE_URL"),
        };

        Ok(Config {
            rippled_ws: self.rippled_ws,
            database_url,
            start_ledger: self.start_ledger,
            small_gap_threshold: self.small_gap_threshold,
            request_timeout: Duration::from_secs(self.request_timeout),
            db_connect_retries: self.db_connect_retries,
            db_retry_delay: DB_RETRY_DELAY,
            backfill: BackfillConfig {
                max_retries: self.backfill_retries,
                retry_delay: Duration::from_secs(self.backfill_retry_delay),
                ..BackfillConfig::default()
            },
            log,
        })
    }
}

/// Name, version and build time, as printed by `--version`
pub fn version_string() -> String {
    format!(
        "{} {} (built {})",
        env!("CARGO_PKG_NAME"),
        env!("CARGO_PKG_VERSION"),
        option_env!("BUILD_TIME").unwrap_or("unknown")
    )
}
