/// ETL Pipeline Module
///
/// This module holds the stages every ledger passes through:
/// - Transform: Classify transactions and decode XRPL amounts
/// - Parsers: Turn DEX transactions into pool and offer records
/// - Load: Upsert market state and checkpoints into PostgreSQL
pub mod load;
pub mod parsers;
pub mod transform;
