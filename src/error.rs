/// Error Module
///
/// Error taxonomy shared by the ledger source, the parsers, the store and the
/// backfill worker. Startup code wraps these in `anyhow` context; the steady
/// state paths match on them and log.
use thiserror::Error;

/// Failures coming from the upstream rippled session
#[derive(Error, Debug, Clone)]
pub enum SourceError {
    /// Transport-level failure (handshake, socket closed, send failed)
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed, missing or error-status response to a request
    #[error("rpc error: {0}")]
    Rpc(String),

    /// Historical point fetch failed
    #[error("failed to fetch ledger {ledger_index}: {reason}")]
    Fetch { ledger_index: u64, reason: String },
}

impl SourceError {
    pub fn connection(err: impl std::fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    pub fn rpc(err: impl std::fmt::Display) -> Self {
        Self::Rpc(err.to_string())
    }
}

/// Decode failure scoped to a single transaction
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("expected {expected} transaction, found {found}")]
    UnexpectedType { expected: &'static str, found: String },

    #[error("missing field {0}")]
    MissingField(&'static str),

    #[error("invalid amount in {field}: {value}")]
    InvalidAmount { field: &'static str, value: String },

    #[error("invalid {kind} payload: {reason}")]
    InvalidStructure { kind: &'static str, reason: String },
}

/// Store read or write failure
#[derive(Error, Debug)]
pub enum PersistenceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("failed to encode column: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("value out of range for column {column}: {value}")]
    OutOfRange { column: &'static str, value: String },
}

/// Terminal backfill failure; the live path is unaffected
#[derive(Error, Debug)]
pub enum BackfillError {
    #[error("gave up on ledger {ledger_index} after {attempts} attempts: {source}")]
    FetchExhausted {
        ledger_index: u64,
        attempts: usize,
        #[source]
        source: SourceError,
    },
}
