/// Backfill Module
///
/// Decides at startup whether ledgers were missed while the indexer was down,
/// and fills small gaps from a dedicated connection while the live loop runs.
/// Both paths write through idempotent upserts guarded by checkpoints, so they
/// need no coordination.
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::db::MarketStore;
use crate::error::BackfillError;
use crate::pipeline::{LedgerOutcome, LedgerProcessor};
use crate::rpc::{LedgerFetcher, LedgerResponse};

/// Gaps with more missing ledgers than this are not backfilled
pub const DEFAULT_SMALL_GAP_THRESHOLD: u64 = 1000;

/// Outcome of comparing the last checkpoint with the node's validated ledger
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartupPlan {
    /// Fresh database: start from the first live ledger
    NoCheckpoint,
    CaughtUp,
    /// Fetch `start..=end` in ascending order
    Backfill { start: u64, end: u64 },
    LargeGapSkipped { missing: u64 },
}

/// First ledger to backfill: right after the checkpoint, but never before the
/// configured cutoff.
pub fn backfill_start(checkpoint: u64, start_ledger: u64) -> u64 {
    checkpoint.saturating_add(1).max(start_ledger)
}

pub fn plan_startup(checkpoint: Option<u64>, current: u64, start_ledger: u64, small_gap_threshold: u64) -> StartupPlan {
    let Some(checkpoint) = checkpoint else {
        return StartupPlan::NoCheckpoint;
    };

    let gap = current.saturating_sub(checkpoint);
    if gap <= 1 {
        return StartupPlan::CaughtUp;
    }

    let missing = gap - 1;
    if missing > small_gap_threshold {
        return StartupPlan::LargeGapSkipped { missing };
    }

    let start = backfill_start(checkpoint, start_ledger);
    if start >= current {
        // Everything missing predates the cutoff
        return StartupPlan::CaughtUp;
    }

    StartupPlan::Backfill { start, end: current - 1 }
}

#[derive(Debug, Clone)]
pub struct BackfillConfig {
    /// Fetch attempts per ledger before the whole backfill is abandoned
    pub max_retries: usize,
    pub retry_delay: Duration,
    pub progress_every: u64,
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self { max_retries: 3, retry_delay: Duration::from_secs(1), progress_every: 100 }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BackfillReport {
    pub processed: u64,
    /// Ledgers the live path had already checkpointed
    pub skipped: u64,
    /// Ledgers whose checkpoint could not be written
    pub failed: u64,
    pub elapsed: Duration,
}

/// Sequential backfill over its own fetcher and processor
pub struct BackfillWorker<F: LedgerFetcher, S: MarketStore + ?Sized> {
    fetcher: F,
    processor: LedgerProcessor<S>,
    config: BackfillConfig,
}

impl<F: LedgerFetcher, S: MarketStore + ?Sized> BackfillWorker<F, S> {
    pub fn new(fetcher: F, store: Arc<S>, config: BackfillConfig) -> Self {
        Self { fetcher, processor: LedgerProcessor::new(store), config }
    }

    /// Backfill `start..=end`. A ledger that cannot be fetched aborts the run.
    pub async fn run(self, start: u64, end: u64) -> Result<BackfillReport, BackfillError> {
        let started = Instant::now();
        let total = end.saturating_sub(start) + 1;
        let mut report = BackfillReport::default();

        tracing::info!("Backfilling ledgers {} to {} ({} ledgers)", start, end, total);

        for ledger_index in start..=end {
            let ledger = self.fetch_with_retry(ledger_index).await?;

            match self.processor.process_ledger(&ledger).await {
                Ok(LedgerOutcome::Indexed(stats)) => {
                    report.processed += 1;
                    if stats.error_count() > 0 {
                        tracing::warn!(
                            "Backfilled ledger {} with {} transaction errors",
                            ledger_index,
                            stats.error_count()
                        );
                    }
                }
                Ok(LedgerOutcome::AlreadyIndexed) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::error!("Failed to checkpoint backfilled ledger {}: {}", ledger_index, e);
                }
            }

            let done = ledger_index - start + 1;
            if self.config.progress_every > 0 && done % self.config.progress_every == 0 {
                log_progress(done, total, started.elapsed());
            }
        }

        report.elapsed = started.elapsed();
        Ok(report)
    }

    async fn fetch_with_retry(&self, ledger_index: u64) -> Result<LedgerResponse, BackfillError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            match self.fetcher.fetch_ledger(ledger_index).await {
                Ok(ledger) => return Ok(ledger),
                Err(e) if attempt >= max_attempts => {
                    return Err(BackfillError::FetchExhausted { ledger_index, attempts: attempt, source: e });
                }
                Err(e) => {
                    tracing::warn!(
                        "Fetch failed for ledger {}, retrying ({}/{}): {}",
                        ledger_index,
                        attempt,
                        max_attempts,
                        e
                    );
                    tokio::time::sleep(self.config.retry_delay * attempt as u32).await;
                }
            }
        }
    }
}

fn log_progress(done: u64, total: u64, elapsed: Duration) {
    let percent = (done as f64 / total as f64) * 100.0;
    let eta = elapsed.mul_f64(total.saturating_sub(done) as f64 / done as f64);
    tracing::info!(
        "Backfill progress: {}/{} ledgers ({:.1}%) | elapsed {:.0}s | ETA {:.0}s",
        done,
        total,
        percent,
        elapsed.as_secs_f64(),
        eta.as_secs_f64()
    );
}
