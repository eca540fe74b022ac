/// Order-book Transaction Parser
///
/// Decodes `OfferCreate` into an offer record and resolves `OfferCancel`
/// targets. The offer's base asset is what the owner gives (`TakerGets`), the
/// quote asset is what they ask for (`TakerPays`), and the price is quote per
/// base.
///
/// An `OfferCreate` whose amounts cannot be decoded is still returned, with
/// status `invalid_parse` and the decode error in `meta`, so that every DEX
/// transaction leaves an audit record.
use rust_decimal::Decimal;
use serde_json::json;

use crate::error::ParseError;
use crate::etl::transform::{Amount, DexTransaction, OfferCreate};
use crate::models::{offer_id, OfferStatus, OrderbookOffer};
use crate::rpc::LedgerTransaction;

const UNKNOWN_ASSET: &str = "unknown";

#[derive(Debug, Default, Clone, Copy)]
pub struct OrderbookParser;

impl OrderbookParser {
    pub fn new() -> Self {
        Self
    }

    /// Decode an offer from an `OfferCreate`.
    ///
    /// `Ok(None)` for any other transaction type or a transaction that did not
    /// apply. `Err` only when the offer cannot even be keyed (no account or
    /// sequence).
    pub fn parse_transaction(
        &self,
        tx: &LedgerTransaction,
        ledger_index: u64,
        ledger_hash: &str,
    ) -> Result<Option<OrderbookOffer>, ParseError> {
        if tx.transaction_type != "OfferCreate" || !tx.succeeded() {
            return Ok(None);
        }

        if tx.account.is_empty() {
            return Err(ParseError::MissingField("Account"));
        }
        let sequence = offer_sequence(tx)?;

        let offer = match DexTransaction::classify(tx) {
            Ok(DexTransaction::OfferCreate(create)) => match price_offer(&create) {
                Ok((price, quantity)) => OrderbookOffer {
                    offer_id: offer_id(&tx.account, sequence),
                    owner: tx.account.clone(),
                    sequence: sequence as i64,
                    base_asset: create.taker_gets.asset().to_string(),
                    quote_asset: create.taker_pays.asset().to_string(),
                    price: Some(price),
                    quantity: Some(quantity),
                    status: OfferStatus::Active,
                    ledger_index: ledger_index as i64,
                    tx_hash: tx.hash.clone(),
                    meta: json!({ "ledger_hash": ledger_hash }),
                },
                Err(e) => invalid_offer(tx, sequence, ledger_index, ledger_hash, Some(&create), &e),
            },
            Ok(_) => return Ok(None),
            Err(e) => invalid_offer(tx, sequence, ledger_index, ledger_hash, None, &e),
        };

        Ok(Some(offer))
    }

    /// Resolve the (account, sequence) an `OfferCancel` refers to
    pub fn parse_offer_cancel(&self, tx: &LedgerTransaction) -> Result<(String, u32), ParseError> {
        if tx.transaction_type != "OfferCancel" {
            return Err(ParseError::UnexpectedType { expected: "OfferCancel", found: tx.transaction_type.clone() });
        }
        if tx.account.is_empty() {
            return Err(ParseError::MissingField("Account"));
        }

        match DexTransaction::classify(tx)? {
            DexTransaction::OfferCancel(cancel) => Ok((tx.account.clone(), cancel.offer_sequence)),
            _ => Err(ParseError::MissingField("OfferSequence")),
        }
    }

    /// The earlier offer an `OfferCreate` replaces via `OfferSequence`, if any
    pub fn parse_offer_replacement(&self, tx: &LedgerTransaction) -> Option<(String, u32)> {
        if tx.transaction_type != "OfferCreate" || !tx.succeeded() || tx.account.is_empty() {
            return None;
        }

        match DexTransaction::classify(tx) {
            Ok(DexTransaction::OfferCreate(OfferCreate { offer_sequence: Some(sequence), .. })) => {
                Some((tx.account.clone(), sequence))
            }
            _ => None,
        }
    }
}

/// `Sequence`, or `TicketSequence` when the transaction consumed a ticket
fn offer_sequence(tx: &LedgerTransaction) -> Result<u32, ParseError> {
    let field = |name: &str| tx.field(name).and_then(|v| v.as_u64()).map(|v| v as u32);

    match field("Sequence") {
        Some(0) | None => field("TicketSequence").filter(|s| *s > 0).ok_or(ParseError::MissingField("Sequence")),
        Some(sequence) => Ok(sequence),
    }
}

fn price_offer(create: &OfferCreate) -> Result<(Decimal, Decimal), ParseError> {
    let base = create.taker_gets.value("TakerGets")?;
    let quote = create.taker_pays.value("TakerPays")?;

    if base <= Decimal::ZERO {
        return Err(ParseError::InvalidAmount { field: "TakerGets", value: create.taker_gets.raw_value().to_string() });
    }

    let price = quote
        .checked_div(base)
        .ok_or_else(|| ParseError::InvalidAmount { field: "TakerPays", value: quote.to_string() })?;

    Ok((price.normalize(), base))
}

fn invalid_offer(
    tx: &LedgerTransaction,
    sequence: u32,
    ledger_index: u64,
    ledger_hash: &str,
    create: Option<&OfferCreate>,
    error: &ParseError,
) -> OrderbookOffer {
    let asset_name = |amount: Option<&Amount>| amount.map(|a| a.asset().to_string());

    OrderbookOffer {
        offer_id: offer_id(&tx.account, sequence),
        owner: tx.account.clone(),
        sequence: sequence as i64,
        base_asset: asset_name(create.map(|c| &c.taker_gets)).unwrap_or_else(|| UNKNOWN_ASSET.to_string()),
        quote_asset: asset_name(create.map(|c| &c.taker_pays)).unwrap_or_else(|| UNKNOWN_ASSET.to_string()),
        price: None,
        quantity: None,
        status: OfferStatus::InvalidParse,
        ledger_index: ledger_index as i64,
        tx_hash: tx.hash.clone(),
        meta: json!({
            "error": error.to_string(),
            "ledger_hash": ledger_hash,
            "taker_gets": tx.field("TakerGets"),
            "taker_pays": tx.field("TakerPays"),
        }),
    }
}
