/// XRPL DEX Ledger Indexer
///
/// Streams validated ledgers from rippled, extracts AMM pool and order-book
/// state, and stores it in PostgreSQL with a per-ledger checkpoint. Short
/// outages are backfilled on restart.
mod audit;
mod backfill;
mod cli;
mod db;
mod error;
mod etl;
mod logging;
mod models;
mod pipeline;
mod rpc;

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;

use audit::AuditSink;
use backfill::{plan_startup, BackfillWorker, StartupPlan};
use cli::Cli;
use db::{Database, MarketStore};
use pipeline::{BackfillHandle, LedgerProcessor};
use rpc::{LedgerClient, BACKFILL_BUFFER};

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let cli = Cli::parse();
    if cli.version {
        println!("{}", cli::version_string());
        return Ok(());
    }

    let config = cli.into_config().context("Invalid configuration")?;
    logging::init_logging(&config.log)?;

    println!("🚀 Starting {}...", cli::version_string());

    let (audit, audit_rx) = AuditSink::channel();

    println!("\n💾 Connecting to PostgreSQL database...");
    let database =
        Database::connect_with_retry(&config.database_url, config.db_connect_retries, config.db_retry_delay, &audit)
            .await
            .context("Failed to connect to PostgreSQL database")?;
    database.test_connection().await.context("Database connection test failed")?;

    println!("📋 Running database migrations...");
    database.migrate().await.context("Failed to run database migrations")?;
    println!("✅ Database ready");

    let store = Arc::new(database);
    let _audit_writer = audit::spawn_audit_writer(store.clone(), audit_rx);

    let last_checkpoint = store.get_last_checkpoint().await.context("Failed to read last checkpoint")?;
    match &last_checkpoint {
        Some(checkpoint) => println!("📍 Last checkpoint: ledger {}", format_number(checkpoint.ledger_index as u64)),
        None => println!("📍 No checkpoint yet, starting from the live stream"),
    }

    println!("\n🔌 Connecting to {}...", config.rippled_ws);
    let mut client = LedgerClient::new(config.rippled_ws.clone())
        .with_request_timeout(config.request_timeout)
        .with_audit(audit.clone(), "rippled-ws");
    client.connect().await.context("Failed to connect to rippled")?;

    let current = client.get_server_info().await.context("Failed to query rippled server_info")?;
    println!("🎯 Validated ledger: {}", format_number(current));

    let ledgers = client.take_ledger_receiver().context("Ledger feed already taken")?;
    let errors = client.take_error_receiver().context("Error feed already taken")?;
    client.subscribe().await.context("Failed to subscribe to the ledger stream")?;
    println!("✅ Subscribed to ledger stream");

    let plan = plan_startup(
        last_checkpoint.map(|c| c.ledger_index as u64),
        current,
        config.start_ledger,
        config.small_gap_threshold,
    );

    let backfill_task: Option<BackfillHandle> = match plan {
        StartupPlan::NoCheckpoint | StartupPlan::CaughtUp => None,
        StartupPlan::LargeGapSkipped { missing } => {
            tracing::warn!(
                "{} ledgers missing (threshold {}), skipping backfill and continuing live",
                missing,
                config.small_gap_threshold
            );
            None
        }
        StartupPlan::Backfill { start, end } => {
            println!("🔄 Backfilling ledgers {} to {}", format_number(start), format_number(end));

            let mut backfill_client = LedgerClient::with_buffer(config.rippled_ws.clone(), BACKFILL_BUFFER)
                .with_request_timeout(config.request_timeout)
                .with_audit(audit.clone(), "rippled-ws-backfill");

            match backfill_client.connect().await {
                Ok(()) => {
                    let worker = BackfillWorker::new(backfill_client, store.clone(), config.backfill.clone());
                    Some(tokio::spawn(worker.run(start, end)))
                }
                Err(e) => {
                    tracing::error!("Backfill connection failed, continuing live only: {}", e);
                    None
                }
            }
        }
    };

    tracing::info!("Ledger indexer initialized ({:?})", plan);

    let processor = LedgerProcessor::new(store.clone());
    let stats = processor.run_live(ledgers, errors, backfill_task, shutdown_signal()).await;

    client.close();
    pipeline::print_live_stats(&stats);
    println!("\n✨ Indexer stopped");

    Ok(())
}

/// Resolves on SIGINT, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();

    for (count, c) in s.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }

    result.chars().rev().collect()
}
