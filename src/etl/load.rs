/// Load Module
///
/// Handles storing market state into the PostgreSQL database.
///
/// Every write is an UPSERT (ON CONFLICT DO UPDATE) so that a ledger applied
/// twice, by the live stream and by backfill or after a reconnect replay,
/// converges on the same rows.
use sqlx::PgPool;

use crate::error::PersistenceError;
use crate::models::{AmmPool, ConnectionEvent, LedgerCheckpoint, OrderbookOffer};

fn to_i64(column: &'static str, value: u64) -> Result<i64, PersistenceError> {
    i64::try_from(value).map_err(|_| PersistenceError::OutOfRange { column, value: value.to_string() })
}

/// Fetch the checkpoint for one ledger, if it was processed
pub async fn get_checkpoint(pool: &PgPool, ledger_index: u64) -> Result<Option<LedgerCheckpoint>, PersistenceError> {
    let checkpoint = sqlx::query_as::<_, LedgerCheckpoint>(
        r#"
        SELECT ledger_index, ledger_hash, close_time, close_time_human, transaction_count, processing_duration_ms
        FROM ledger_checkpoints
        WHERE ledger_index = $1
        "#,
    )
    .bind(to_i64("ledger_index", ledger_index)?)
    .fetch_optional(pool)
    .await?;

    Ok(checkpoint)
}

/// Fetch the highest processed ledger
pub async fn get_last_checkpoint(pool: &PgPool) -> Result<Option<LedgerCheckpoint>, PersistenceError> {
    let checkpoint = sqlx::query_as::<_, LedgerCheckpoint>(
        r#"
        SELECT ledger_index, ledger_hash, close_time, close_time_human, transaction_count, processing_duration_ms
        FROM ledger_checkpoints
        ORDER BY ledger_index DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(pool)
    .await?;

    Ok(checkpoint)
}

/// Record that a ledger has been fully processed
pub async fn save_checkpoint(pool: &PgPool, checkpoint: &LedgerCheckpoint) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO ledger_checkpoints (
            ledger_index,
            ledger_hash,
            close_time,
            close_time_human,
            transaction_count,
            processing_duration_ms
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (ledger_index)
        DO UPDATE SET
            ledger_hash = EXCLUDED.ledger_hash,
            close_time = EXCLUDED.close_time,
            close_time_human = EXCLUDED.close_time_human,
            transaction_count = EXCLUDED.transaction_count,
            processing_duration_ms = EXCLUDED.processing_duration_ms,
            processed_at = NOW()
        "#,
    )
    .bind(checkpoint.ledger_index)
    .bind(&checkpoint.ledger_hash)
    .bind(checkpoint.close_time)
    .bind(checkpoint.close_time_human)
    .bind(checkpoint.transaction_count)
    .bind(checkpoint.processing_duration_ms)
    .execute(pool)
    .await?;

    tracing::debug!("Saved checkpoint for ledger {}", checkpoint.ledger_index);
    Ok(())
}

/// Replace the current reserves of a pool
///
/// The WHERE clause on the conflict branch keeps a late write from an older
/// ledger (backfill racing the live stream) from rolling the reserves back.
pub async fn upsert_amm_pool(pool: &PgPool, amm: &AmmPool) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO amm_pools (
            pool_id,
            amm_account,
            asset1,
            asset2,
            reserve1,
            reserve2,
            fee_bps,
            last_updated_ledger,
            ledger_hash
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        ON CONFLICT (pool_id)
        DO UPDATE SET
            amm_account = COALESCE(EXCLUDED.amm_account, amm_pools.amm_account),
            reserve1 = COALESCE(EXCLUDED.reserve1, amm_pools.reserve1),
            reserve2 = COALESCE(EXCLUDED.reserve2, amm_pools.reserve2),
            fee_bps = EXCLUDED.fee_bps,
            last_updated_ledger = EXCLUDED.last_updated_ledger,
            ledger_hash = EXCLUDED.ledger_hash,
            updated_at = NOW()
        WHERE amm_pools.last_updated_ledger <= EXCLUDED.last_updated_ledger
        "#,
    )
    .bind(&amm.pool_id)
    .bind(&amm.amm_account)
    .bind(&amm.asset1)
    .bind(&amm.asset2)
    .bind(amm.reserve1)
    .bind(amm.reserve2)
    .bind(amm.fee_bps)
    .bind(amm.last_updated_ledger)
    .bind(&amm.ledger_hash)
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert or refresh an offer. Cancelled rows are left untouched.
pub async fn upsert_offer(pool: &PgPool, offer: &OrderbookOffer) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO orderbook_offers (
            offer_id,
            owner,
            sequence,
            base_asset,
            quote_asset,
            price,
            quantity,
            status,
            ledger_index,
            tx_hash,
            meta
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
        ON CONFLICT (offer_id)
        DO UPDATE SET
            base_asset = EXCLUDED.base_asset,
            quote_asset = EXCLUDED.quote_asset,
            price = EXCLUDED.price,
            quantity = EXCLUDED.quantity,
            status = EXCLUDED.status,
            ledger_index = EXCLUDED.ledger_index,
            tx_hash = EXCLUDED.tx_hash,
            meta = EXCLUDED.meta,
            updated_at = NOW()
        WHERE orderbook_offers.status <> 'cancelled'
        "#,
    )
    .bind(&offer.offer_id)
    .bind(&offer.owner)
    .bind(offer.sequence)
    .bind(&offer.base_asset)
    .bind(&offer.quote_asset)
    .bind(offer.price)
    .bind(offer.quantity)
    .bind(offer.status.as_str())
    .bind(offer.ledger_index)
    .bind(&offer.tx_hash)
    .bind(&offer.meta)
    .execute(pool)
    .await?;

    Ok(())
}

/// Cancel the active offer identified by owner and sequence
pub async fn cancel_offer(
    pool: &PgPool,
    owner: &str,
    sequence: u32,
    ledger_index: u64,
) -> Result<bool, PersistenceError> {
    let result = sqlx::query(
        r#"
        UPDATE orderbook_offers
        SET status = 'cancelled',
            cancelled_ledger = $3,
            updated_at = NOW()
        WHERE owner = $1 AND sequence = $2 AND status = 'active'
        "#,
    )
    .bind(owner)
    .bind(sequence as i64)
    .bind(to_i64("cancelled_ledger", ledger_index)?)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Append one connection audit row
pub async fn insert_connection_event(pool: &PgPool, event: &ConnectionEvent) -> Result<(), PersistenceError> {
    sqlx::query(
        r#"
        INSERT INTO connection_audit_log (service, event, attempt, error, duration_ms, metadata)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(&event.service)
    .bind(event.event.as_str())
    .bind(event.attempt as i32)
    .bind(&event.error)
    .bind(event.duration_ms)
    .bind(&event.metadata)
    .execute(pool)
    .await?;

    Ok(())
}
