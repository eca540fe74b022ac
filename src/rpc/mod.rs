/// Ledger Source Module
///
/// Talks to a rippled node over its WebSocket API: node status, the live
/// ledger stream, and point fetches of historical ledgers for backfill.
mod client;
mod types;

use async_trait::async_trait;

use crate::error::SourceError;

pub use client::{LedgerClient, BACKFILL_BUFFER};
pub use types::{LedgerResponse, LedgerTransaction};

/// Source of historical ledgers. Implemented by `LedgerClient`; tests use a
/// scripted fetcher.
#[async_trait]
pub trait LedgerFetcher: Send + Sync {
    async fn fetch_ledger(&self, ledger_index: u64) -> Result<LedgerResponse, SourceError>;
}
