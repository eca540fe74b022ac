/// Pipeline Module
///
/// Applies ledgers to the market-state store: duplicate guard, continuity
/// check, per-transaction parse and upsert, then the checkpoint. The primary
/// live loop lives here too; backfill drives the same processor from
/// `crate::backfill`.
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};

use crate::backfill::BackfillReport;
use crate::db::MarketStore;
use crate::error::{BackfillError, PersistenceError, SourceError};
use crate::etl::parsers::{AmmParser, OrderbookParser};
use crate::etl::transform::is_dex_transaction_type;
use crate::models::{ripple_time_to_utc, LedgerCheckpoint, OfferStatus};
use crate::rpc::{LedgerResponse, LedgerTransaction};

pub type BackfillHandle = JoinHandle<Result<BackfillReport, BackfillError>>;

/// What happened to the transactions of one ledger
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessStats {
    pub transactions: usize,
    pub dex_transactions: usize,
    pub pools_updated: usize,
    pub offers_upserted: usize,
    pub invalid_offers: usize,
    pub offers_cancelled: usize,
    pub unmatched_cancels: usize,
    pub parse_errors: usize,
    pub store_errors: usize,
    pub duration: Duration,
}

impl ProcessStats {
    pub fn error_count(&self) -> usize {
        self.parse_errors + self.store_errors
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LedgerOutcome {
    /// A checkpoint already existed; nothing was written
    AlreadyIndexed,
    Indexed(ProcessStats),
}

/// Totals for a run of the live loop
#[derive(Debug, Clone, Default)]
pub struct LiveStats {
    pub ledgers_received: usize,
    pub ledgers_indexed: usize,
    pub ledgers_skipped: usize,
    pub ledgers_failed: usize,
    pub transactions_processed: usize,
    pub transaction_errors: usize,
    pub source_errors: usize,
    pub elapsed_time: Duration,
}

impl LiveStats {
    pub fn success_rate(&self) -> f64 {
        let attempted = self.ledgers_indexed + self.ledgers_failed;
        if attempted == 0 {
            0.0
        } else {
            (self.ledgers_indexed as f64 / attempted as f64) * 100.0
        }
    }
}

/// Applies ledgers to a store. Each ingestion path owns one, with its own parsers.
pub struct LedgerProcessor<S: MarketStore + ?Sized> {
    store: Arc<S>,
    amm_parser: AmmParser,
    orderbook_parser: OrderbookParser,
}

impl<S: MarketStore + ?Sized> LedgerProcessor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, amm_parser: AmmParser::new(), orderbook_parser: OrderbookParser::new() }
    }

    /// Index one ledger.
    ///
    /// Transaction-level failures are counted in the returned stats; only a
    /// failed checkpoint write is an error.
    pub async fn process_ledger(&self, ledger: &LedgerResponse) -> Result<LedgerOutcome, PersistenceError> {
        let started = Instant::now();
        let ledger_index = ledger.ledger_index;

        match self.store.get_checkpoint(ledger_index).await {
            Ok(Some(_)) => {
                tracing::debug!("Ledger {} already indexed, skipping", ledger_index);
                return Ok(LedgerOutcome::AlreadyIndexed);
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Checkpoint lookup for ledger {} failed, processing anyway: {}", ledger_index, e),
        }

        self.check_continuity(ledger).await;

        let mut stats = ProcessStats { transactions: ledger.transactions.len(), ..Default::default() };
        for tx in &ledger.transactions {
            self.apply_transaction(tx, ledger, &mut stats).await;
        }

        stats.duration = started.elapsed();
        let checkpoint = LedgerCheckpoint {
            ledger_index: ledger_index as i64,
            ledger_hash: ledger.ledger_hash.clone(),
            close_time: ledger.ledger_time as i64,
            close_time_human: ripple_time_to_utc(ledger.ledger_time),
            transaction_count: ledger.transactions.len() as i32,
            processing_duration_ms: stats.duration.as_millis() as i64,
        };
        self.store.save_checkpoint(&checkpoint).await?;

        Ok(LedgerOutcome::Indexed(stats))
    }

    /// Advisory only: a missing predecessor or a parent-hash mismatch never
    /// blocks the ledger.
    async fn check_continuity(&self, ledger: &LedgerResponse) {
        let Some(previous_index) = ledger.ledger_index.checked_sub(1) else {
            return;
        };

        match self.store.get_checkpoint(previous_index).await {
            Ok(Some(previous)) => {
                if let Some(parent_hash) = &ledger.parent_hash {
                    if !previous.ledger_hash.eq_ignore_ascii_case(parent_hash) {
                        tracing::warn!(
                            "Ledger {} parent hash {} does not match checkpointed ledger {} hash {}",
                            ledger.ledger_index,
                            parent_hash,
                            previous_index,
                            previous.ledger_hash
                        );
                    }
                }
            }
            Ok(None) => tracing::debug!("No checkpoint for ledger {} before {}", previous_index, ledger.ledger_index),
            Err(e) => tracing::debug!("Continuity check for ledger {} failed: {}", ledger.ledger_index, e),
        }
    }

    async fn apply_transaction(&self, tx: &LedgerTransaction, ledger: &LedgerResponse, stats: &mut ProcessStats) {
        let ledger_index = ledger.ledger_index;

        if is_dex_transaction_type(&tx.transaction_type) {
            stats.dex_transactions += 1;
            tracing::debug!(
                ledger = ledger_index,
                tx = %tx.hash,
                result = tx.result_code().unwrap_or("unknown"),
                "{}",
                tx.transaction_type
            );
        }

        match self.amm_parser.parse_transaction(tx, ledger_index, &ledger.ledger_hash) {
            Ok(Some(pool)) => match self.store.upsert_amm_pool(&pool).await {
                Ok(()) => {
                    stats.pools_updated += 1;
                    tracing::debug!(
                        "Pool {} at ledger {}: reserves {:?}/{:?}, fee {} bps",
                        pool.pool_id,
                        ledger_index,
                        pool.reserve1,
                        pool.reserve2,
                        pool.fee_bps
                    );
                }
                Err(e) => {
                    stats.store_errors += 1;
                    tracing::error!("Failed to store pool {} (ledger {}, tx {}): {}", pool.pool_id, ledger_index, tx.hash, e);
                }
            },
            Ok(None) => {}
            Err(e) => {
                stats.parse_errors += 1;
                tracing::warn!("Failed to parse {} {} in ledger {}: {}", tx.transaction_type, tx.hash, ledger_index, e);
            }
        }

        match self.orderbook_parser.parse_transaction(tx, ledger_index, &ledger.ledger_hash) {
            Ok(Some(offer)) => {
                if offer.status == OfferStatus::InvalidParse {
                    stats.invalid_offers += 1;
                    tracing::warn!("Recording unparseable offer {} from tx {} in ledger {}", offer.offer_id, tx.hash, ledger_index);
                }
                match self.store.upsert_offer(&offer).await {
                    Ok(()) => {
                        stats.offers_upserted += 1;
                        tracing::debug!(
                            "Offer {} at ledger {}: {} {:?} @ {:?} {}",
                            offer.offer_id,
                            ledger_index,
                            offer.base_asset,
                            offer.quantity,
                            offer.price,
                            offer.quote_asset
                        );
                    }
                    Err(e) => {
                        stats.store_errors += 1;
                        tracing::error!("Failed to store offer {} (ledger {}, tx {}): {}", offer.offer_id, ledger_index, tx.hash, e);
                    }
                }
            }
            Ok(None) => {}
            Err(e) => {
                stats.parse_errors += 1;
                tracing::warn!("Failed to parse {} {} in ledger {}: {}", tx.transaction_type, tx.hash, ledger_index, e);
            }
        }

        if let Some((owner, sequence)) = self.orderbook_parser.parse_offer_replacement(tx) {
            self.cancel_offer(&owner, sequence, tx, ledger_index, stats).await;
        }

        if tx.transaction_type == "OfferCancel" && tx.succeeded() {
            match self.orderbook_parser.parse_offer_cancel(tx) {
                Ok((owner, sequence)) => self.cancel_offer(&owner, sequence, tx, ledger_index, stats).await,
                Err(e) => {
                    stats.parse_errors += 1;
                    tracing::warn!("Failed to parse OfferCancel {} in ledger {}: {}", tx.hash, ledger_index, e);
                }
            }
        }
    }

    async fn cancel_offer(
        &self,
        owner: &str,
        sequence: u32,
        tx: &LedgerTransaction,
        ledger_index: u64,
        stats: &mut ProcessStats,
    ) {
        match self.store.cancel_offer(owner, sequence, ledger_index).await {
            Ok(true) => {
                stats.offers_cancelled += 1;
                tracing::debug!("Cancelled offer {}:{} (tx {}, ledger {})", owner, sequence, tx.hash, ledger_index);
            }
            Ok(false) => {
                stats.unmatched_cancels += 1;
                tracing::debug!("No active offer {}:{} to cancel (tx {}, ledger {})", owner, sequence, tx.hash, ledger_index);
            }
            Err(e) => {
                stats.store_errors += 1;
                tracing::error!("Failed to cancel offer {}:{} (ledger {}, tx {}): {}", owner, sequence, ledger_index, tx.hash, e);
            }
        }
    }

    /// Primary loop: consume the live feed until shutdown or until the feed
    /// closes, logging source errors and the backfill outcome as they arrive.
    pub async fn run_live<F>(
        &self,
        mut ledgers: mpsc::Receiver<LedgerResponse>,
        mut errors: mpsc::Receiver<SourceError>,
        mut backfill: Option<BackfillHandle>,
        shutdown: F,
    ) -> LiveStats
    where
        F: Future<Output = ()>,
    {
        let start_time = Instant::now();
        let mut stats = LiveStats::default();
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown signal received, stopping live ingestion");
                    break;
                }
                Some(error) = errors.recv() => {
                    stats.source_errors += 1;
                    tracing::error!("Ledger source error: {}", error);
                }
                ledger = ledgers.recv() => match ledger {
                    Some(ledger) => self.handle_live_ledger(&ledger, &mut stats).await,
                    None => {
                        tracing::warn!("Ledger feed closed, stopping live ingestion");
                        break;
                    }
                },
                outcome = join_backfill(&mut backfill), if backfill.is_some() => {
                    backfill = None;
                    log_backfill_outcome(outcome);
                }
            }
        }

        if let Some(handle) = backfill {
            if !handle.is_finished() {
                tracing::info!("Abandoning running backfill; the next start re-derives the gap");
            }
            handle.abort();
        }

        stats.elapsed_time = start_time.elapsed();
        stats
    }

    async fn handle_live_ledger(&self, ledger: &LedgerResponse, stats: &mut LiveStats) {
        stats.ledgers_received += 1;

        match self.process_ledger(ledger).await {
            Ok(LedgerOutcome::Indexed(processed)) => {
                stats.ledgers_indexed += 1;
                stats.transactions_processed += processed.transactions;
                stats.transaction_errors += processed.error_count();
                tracing::info!(
                    "Indexed ledger {} ({} txns, {} DEX, {} pools, {} offers, {} invalid, {} cancels, {} unmatched) in {}ms",
                    ledger.ledger_index,
                    processed.transactions,
                    processed.dex_transactions,
                    processed.pools_updated,
                    processed.offers_upserted,
                    processed.invalid_offers,
                    processed.offers_cancelled,
                    processed.unmatched_cancels,
                    processed.duration.as_millis()
                );
            }
            Ok(LedgerOutcome::AlreadyIndexed) => stats.ledgers_skipped += 1,
            Err(e) => {
                stats.ledgers_failed += 1;
                tracing::error!("Failed to checkpoint ledger {}: {}", ledger.ledger_index, e);
            }
        }
    }
}

async fn join_backfill(
    handle: &mut Option<BackfillHandle>,
) -> Result<Result<BackfillReport, BackfillError>, JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn log_backfill_outcome(outcome: Result<Result<BackfillReport, BackfillError>, JoinError>) {
    match outcome {
        Ok(Ok(report)) => tracing::info!(
            "✓ Backfill complete: {} ledgers processed, {} already indexed, {} failed in {:.1}s",
            report.processed,
            report.skipped,
            report.failed,
            report.elapsed.as_secs_f64()
        ),
        Ok(Err(e)) => tracing::error!("Backfill aborted: {}", e),
        Err(e) => tracing::error!("Backfill task did not finish: {}", e),
    }
}

/// Print a summary of a live run
pub fn print_live_stats(stats: &LiveStats) {
    println!("\n📊 Indexer Statistics:");
    println!("   ⏱️  Uptime: {:.2}s", stats.elapsed_time.as_secs_f64());
    println!(
        "   📦 Ledgers: {} received, {} indexed, {} already indexed, {} failed",
        stats.ledgers_received, stats.ledgers_indexed, stats.ledgers_skipped, stats.ledgers_failed
    );
    println!("   ✅ Success rate: {:.1}%", stats.success_rate());
    println!("   📝 Transactions processed: {}", stats.transactions_processed);

    if stats.transaction_errors > 0 || stats.source_errors > 0 {
        println!(
            "\n❌ Errors: {} transaction-level, {} ledger source",
            stats.transaction_errors, stats.source_errors
        );
    }
}
