/// Data Models Module
///
/// This module defines the records the indexer materializes: ledger
/// checkpoints, AMM pool state, order-book offers and connection audit events.
/// They map one-to-one onto the tables in `migrations/`.
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Seconds between the Unix epoch and the Ripple epoch (2000-01-01T00:00:00Z)
pub const RIPPLE_EPOCH_OFFSET: i64 = 946_684_800;

/// Convert a ledger close time (seconds since the Ripple epoch) to UTC
pub fn ripple_time_to_utc(close_time: u64) -> DateTime<Utc> {
    let unix = close_time as i64 + RIPPLE_EPOCH_OFFSET;
    DateTime::<Utc>::from_timestamp(unix, 0).unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Durable record that every DEX side effect of a ledger has been applied
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct LedgerCheckpoint {
    pub ledger_index: i64,
    pub ledger_hash: String,
    /// Seconds since the Ripple epoch
    pub close_time: i64,
    pub close_time_human: DateTime<Utc>,
    pub transaction_count: i32,
    pub processing_duration_ms: i64,
}

/// Current reserve state of one AMM pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AmmPool {
    pub pool_id: String,
    pub amm_account: Option<String>,
    pub asset1: String,
    pub asset2: String,
    /// `None` when the update did not reveal this side; the stored value is kept
    pub reserve1: Option<Decimal>,
    pub reserve2: Option<Decimal>,
    pub fee_bps: i32,
    pub last_updated_ledger: i64,
    pub ledger_hash: String,
}

/// Offer lifecycle. `InvalidParse` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OfferStatus {
    Active,
    Cancelled,
    InvalidParse,
}

impl OfferStatus {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Active => "active",
            Self::Cancelled => "cancelled",
            Self::InvalidParse => "invalid_parse",
        }
    }
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Build the offer key from its owner and sequence
pub fn offer_id(owner: &str, sequence: u32) -> String {
    format!("{}:{}", owner, sequence)
}

/// A standing order-book offer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderbookOffer {
    pub offer_id: String,
    pub owner: String,
    pub sequence: i64,
    pub base_asset: String,
    pub quote_asset: String,
    /// Quote units per base unit; `None` only for `InvalidParse`
    pub price: Option<Decimal>,
    /// Base amount offered; `None` only for `InvalidParse`
    pub quantity: Option<Decimal>,
    pub status: OfferStatus,
    pub ledger_index: i64,
    pub tx_hash: String,
    /// Diagnostic payload (decode errors, raw amounts)
    pub meta: serde_json::Value,
}

/// Kind of connection audit entry
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionEventKind {
    Attempt,
    Success,
    Failure,
    Retry,
}

impl ConnectionEventKind {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Attempt => "attempt",
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Retry => "retry",
        }
    }
}

/// One append-only row of the connection audit log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionEvent {
    /// `postgres`, `rippled-ws`, `rippled-ws-backfill`
    pub service: String,
    pub event: ConnectionEventKind,
    /// 1-based attempt counter
    pub attempt: u32,
    pub error: Option<String>,
    pub duration_ms: Option<i64>,
    pub metadata: serde_json::Value,
}

impl ConnectionEvent {
    pub fn new(service: &str, event: ConnectionEventKind, attempt: u32) -> Self {
        Self {
            service: service.to_string(),
            event,
            attempt,
            error: None,
            duration_ms: None,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_error(mut self, err: impl std::fmt::Display) -> Self {
        self.error = Some(err.to_string());
        self
    }

    pub fn with_duration(mut self, duration: std::time::Duration) -> Self {
        self.duration_ms = Some(duration.as_millis() as i64);
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ripple_time_to_utc() {
        // Ledger close time 0 is the Ripple epoch itself
        assert_eq!(ripple_time_to_utc(0).to_rfc3339(), "2000-01-01T00:00:00+00:00");
        assert_eq!(ripple_time_to_utc(86_400).to_rfc3339(), "2000-01-02T00:00:00+00:00");
    }

    #[test]
    fn test_offer_status_matches_schema_values() {
        assert_eq!(OfferStatus::Active.to_string(), "active");
        assert_eq!(OfferStatus::InvalidParse.as_str(), "invalid_parse");
        assert_eq!(serde_json::to_value(OfferStatus::Cancelled).unwrap(), "cancelled");
    }

    #[test]
    fn test_offer_id() {
        assert_eq!(offer_id("rAlice", 42), "rAlice:42");
    }

    #[test]
    fn test_connection_event_builder() {
        let event = ConnectionEvent::new("postgres", ConnectionEventKind::Failure, 2)
            .with_error("connection refused")
            .with_duration(std::time::Duration::from_millis(500));

        assert_eq!(event.error.as_deref(), Some("connection refused"));
        assert_eq!(event.duration_ms, Some(500));
        assert_eq!(event.metadata, serde_json::Value::Null);
    }
}
