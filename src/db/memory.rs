/// In-memory `MarketStore` for tests. Mirrors the conflict rules of the SQL in
/// `etl::load`.
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::MarketStore;
use crate::error::PersistenceError;
use crate::models::{offer_id, AmmPool, ConnectionEvent, LedgerCheckpoint, OfferStatus, OrderbookOffer};

#[derive(Default)]
struct Tables {
    checkpoints: BTreeMap<i64, LedgerCheckpoint>,
    checkpoint_writes: Vec<i64>,
    pools: HashMap<String, AmmPool>,
    offers: HashMap<String, OrderbookOffer>,
    events: Vec<ConnectionEvent>,
}

#[derive(Default, Clone)]
pub struct MemoryStore {
    tables: Arc<Mutex<Tables>>,
    fail_pool_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every pool upsert fail, to exercise error paths
    pub fn fail_pool_writes(&self, fail: bool) {
        self.fail_pool_writes.store(fail, Ordering::SeqCst);
    }

    pub async fn insert_checkpoint(&self, ledger_index: i64, ledger_hash: &str) {
        let checkpoint = LedgerCheckpoint {
            ledger_index,
            ledger_hash: ledger_hash.to_string(),
            close_time: 0,
            close_time_human: crate::models::ripple_time_to_utc(0),
            transaction_count: 0,
            processing_duration_ms: 0,
        };
        self.tables.lock().await.checkpoints.insert(ledger_index, checkpoint);
    }

    pub async fn checkpoint_indexes(&self) -> Vec<i64> {
        self.tables.lock().await.checkpoints.keys().copied().collect()
    }

    /// Indexes in the order their checkpoints were written
    pub async fn checkpoint_writes(&self) -> Vec<i64> {
        self.tables.lock().await.checkpoint_writes.clone()
    }

    pub async fn pools(&self) -> Vec<AmmPool> {
        self.tables.lock().await.pools.values().cloned().collect()
    }

    pub async fn offer(&self, id: &str) -> Option<OrderbookOffer> {
        self.tables.lock().await.offers.get(id).cloned()
    }

    pub async fn offers(&self) -> Vec<OrderbookOffer> {
        self.tables.lock().await.offers.values().cloned().collect()
    }

    pub async fn connection_events(&self) -> Vec<ConnectionEvent> {
        self.tables.lock().await.events.clone()
    }
}

#[async_trait]
impl MarketStore for MemoryStore {
    async fn get_checkpoint(&self, ledger_index: u64) -> Result<Option<LedgerCheckpoint>, PersistenceError> {
        Ok(self.tables.lock().await.checkpoints.get(&(ledger_index as i64)).cloned())
    }

    async fn get_last_checkpoint(&self) -> Result<Option<LedgerCheckpoint>, PersistenceError> {
        Ok(self.tables.lock().await.checkpoints.values().next_back().cloned())
    }

    async fn save_checkpoint(&self, checkpoint: &LedgerCheckpoint) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock().await;
        tables.checkpoint_writes.push(checkpoint.ledger_index);
        tables.checkpoints.insert(checkpoint.ledger_index, checkpoint.clone());
        Ok(())
    }

    async fn upsert_amm_pool(&self, pool: &AmmPool) -> Result<(), PersistenceError> {
        if self.fail_pool_writes.load(Ordering::SeqCst) {
            return Err(PersistenceError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut tables = self.tables.lock().await;
        let mut merged = pool.clone();
        if let Some(existing) = tables.pools.get(&pool.pool_id) {
            if existing.last_updated_ledger > pool.last_updated_ledger {
                return Ok(());
            }
            merged.reserve1 = merged.reserve1.or(existing.reserve1);
            merged.reserve2 = merged.reserve2.or(existing.reserve2);
            merged.amm_account = merged.amm_account.or_else(|| existing.amm_account.clone());
        }
        tables.pools.insert(pool.pool_id.clone(), merged);
        Ok(())
    }

    async fn upsert_offer(&self, offer: &OrderbookOffer) -> Result<(), PersistenceError> {
        let mut tables = self.tables.lock().await;
        match tables.offers.get(&offer.offer_id) {
            Some(existing) if existing.status == OfferStatus::Cancelled => {}
            _ => {
                tables.offers.insert(offer.offer_id.clone(), offer.clone());
            }
        }
        Ok(())
    }

    async fn cancel_offer(&self, owner: &str, sequence: u32, _ledger_index: u64) -> Result<bool, PersistenceError> {
        let mut tables = self.tables.lock().await;
        match tables.offers.get_mut(&offer_id(owner, sequence)) {
            Some(offer) if offer.status == OfferStatus::Active => {
                offer.status = OfferStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn log_connection_event(&self, event: &ConnectionEvent) -> Result<(), PersistenceError> {
        self.tables.lock().await.events.push(event.clone());
        Ok(())
    }
}
