/// Database Module
///
/// This module handles all PostgreSQL database operations including:
/// - Connection pool management (with audited retries)
/// - Schema migrations
/// - The `MarketStore` contract the ingestion pipeline writes through
#[cfg(test)]
pub mod memory;

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};

use crate::audit::AuditSink;
use crate::error::PersistenceError;
use crate::etl::load;
use crate::models::{AmmPool, ConnectionEvent, ConnectionEventKind, LedgerCheckpoint, OrderbookOffer};

/// Durable market-state store
///
/// Every write must be safe to repeat: the live path and the backfill path
/// may apply the same ledger's effects in any order.
#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn get_checkpoint(&self, ledger_index: u64) -> Result<Option<LedgerCheckpoint>, PersistenceError>;

    async fn get_last_checkpoint(&self) -> Result<Option<LedgerCheckpoint>, PersistenceError>;

    async fn save_checkpoint(&self, checkpoint: &LedgerCheckpoint) -> Result<(), PersistenceError>;

    /// Replace the pool row unless it was written by a newer ledger
    async fn upsert_amm_pool(&self, pool: &AmmPool) -> Result<(), PersistenceError>;

    /// Insert or refresh an offer; a cancelled offer is never reopened
    async fn upsert_offer(&self, offer: &OrderbookOffer) -> Result<(), PersistenceError>;

    /// Move the active offer `owner:sequence` to cancelled.
    /// Returns `false` when no active offer matched.
    async fn cancel_offer(&self, owner: &str, sequence: u32, ledger_index: u64) -> Result<bool, PersistenceError>;

    async fn log_connection_event(&self, event: &ConnectionEvent) -> Result<(), PersistenceError>;
}

pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("Failed to connect to PostgreSQL database")?;

        Ok(Self { pool })
    }

    /// Connect with linear backoff, recording every attempt on the audit channel
    pub async fn connect_with_retry(
        database_url: &str,
        max_retries: usize,
        retry_delay: Duration,
        audit: &AuditSink,
    ) -> Result<Self> {
        let max_retries = max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            audit.record(ConnectionEvent::new("postgres", ConnectionEventKind::Attempt, attempt as u32));
            let started = Instant::now();

            match Self::new(database_url).await {
                Ok(database) => {
                    audit.record(
                        ConnectionEvent::new("postgres", ConnectionEventKind::Success, attempt as u32)
                            .with_duration(started.elapsed()),
                    );
                    return Ok(database);
                }
                Err(e) => {
                    audit.record(
                        ConnectionEvent::new("postgres", ConnectionEventKind::Failure, attempt as u32)
                            .with_error(format!("{:#}", e))
                            .with_duration(started.elapsed()),
                    );

                    if attempt >= max_retries {
                        return Err(e.context(format!("Giving up on PostgreSQL after {} attempts", attempt)));
                    }

                    let delay = retry_delay * attempt as u32;
                    tracing::warn!("Database connection failed, retrying ({}/{}) in {:?}: {:#}", attempt, max_retries, delay, e);
                    audit.record(
                        ConnectionEvent::new("postgres", ConnectionEventKind::Retry, attempt as u32 + 1)
                            .with_metadata(serde_json::json!({ "retry_delay_seconds": delay.as_secs() })),
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Run database migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await.context("Failed to run database migrations")?;

        tracing::info!("Database migrations completed successfully");
        Ok(())
    }

    /// Test the database connection
    pub async fn test_connection(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await.context("Database connection test failed")?;

        Ok(())
    }
}

#[async_trait]
impl MarketStore for Database {
    async fn get_checkpoint(&self, ledger_index: u64) -> Result<Option<LedgerCheckpoint>, PersistenceError> {
        load::get_checkpoint(&self.pool, ledger_index).await
    }

    async fn get_last_checkpoint(&self) -> Result<Option<LedgerCheckpoint>, PersistenceError> {
        load::get_last_checkpoint(&self.pool).await
    }

    async fn save_checkpoint(&self, checkpoint: &LedgerCheckpoint) -> Result<(), PersistenceError> {
        load::save_checkpoint(&self.pool, checkpoint).await
    }

    async fn upsert_amm_pool(&self, pool: &AmmPool) -> Result<(), PersistenceError> {
        load::upsert_amm_pool(&self.pool, pool).await
    }

    async fn upsert_offer(&self, offer: &OrderbookOffer) -> Result<(), PersistenceError> {
        load::upsert_offer(&self.pool, offer).await
    }

    async fn cancel_offer(&self, owner: &str, sequence: u32, ledger_index: u64) -> Result<bool, PersistenceError> {
        load::cancel_offer(&self.pool, owner, sequence, ledger_index).await
    }

    async fn log_connection_event(&self, event: &ConnectionEvent) -> Result<(), PersistenceError> {
        load::insert_connection_event(&self.pool, event).await
    }
}
