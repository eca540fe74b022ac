/// Parsers Module
///
/// Contains the transaction parsers for the two DEX surfaces of the ledger.
/// Each parser is stateless and maps one transaction to at most one record.
pub mod amm;
pub mod orderbook;

// Re-export commonly used parsers
pub use amm::AmmParser;
pub use orderbook::OrderbookParser;
