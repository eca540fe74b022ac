/// Transform Module
///
/// Classifies raw ledger transactions into the finite set of DEX transaction
/// kinds the indexer understands, and decodes XRPL amounts and assets.
use std::fmt;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::rpc::LedgerTransaction;

/// Drops per XRP
const DROPS_SCALE: u32 = 6;

/// Most fractional digits a `Decimal` holds
const MAX_SCALE: u32 = 28;

/// A currency on the ledger: XRP or an issued currency
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Asset {
    Xrp,
    Issued { currency: String, issuer: String },
}

impl fmt::Display for Asset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Asset::Xrp => f.write_str("XRP"),
            Asset::Issued { currency, issuer } => write!(f, "{}.{}", currency, issuer),
        }
    }
}

/// Amount as it appears on the wire: a drops string or an issued-currency object
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum Amount {
    Drops(String),
    Issued { currency: String, issuer: String, value: String },
}

impl Amount {
    pub fn asset(&self) -> Asset {
        match self {
            Amount::Drops(_) => Asset::Xrp,
            Amount::Issued { currency, issuer, .. } => {
                Asset::Issued { currency: currency.clone(), issuer: issuer.clone() }
            }
        }
    }

    /// Numeric value in whole units (XRP, not drops)
    pub fn value(&self, field: &'static str) -> Result<Decimal, ParseError> {
        match self {
            Amount::Drops(drops) => parse_drops(drops, field),
            Amount::Issued { value, .. } => parse_issued_value(value, field),
        }
    }

    pub fn raw_value(&self) -> &str {
        match self {
            Amount::Drops(drops) => drops,
            Amount::Issued { value, .. } => value,
        }
    }
}

/// Convert a drops string to XRP
pub fn parse_drops(drops: &str, field: &'static str) -> Result<Decimal, ParseError> {
    let invalid = || ParseError::InvalidAmount { field, value: drops.to_string() };
    let drops = drops.trim().parse::<i64>().map_err(|_| invalid())?;
    Ok(Decimal::new(drops, DROPS_SCALE))
}

/// Parse an issued-currency value, which may use scientific notation.
/// Values finer than `Decimal`'s 28 fractional digits are rounded to fit.
pub fn parse_issued_value(value: &str, field: &'static str) -> Result<Decimal, ParseError> {
    let trimmed = value.trim();
    Decimal::from_str(trimmed)
        .or_else(|_| Decimal::from_scientific(trimmed))
        .ok()
        .or_else(|| round_scientific(trimmed))
        .ok_or_else(|| ParseError::InvalidAmount { field, value: value.to_string() })
}

/// `mantissa e exponent` where the exponent pushes the scale past `MAX_SCALE`
fn round_scientific(value: &str) -> Option<Decimal> {
    let (mantissa, exponent) = value.split_once(|c| c == 'e' || c == 'E')?;
    let mantissa = Decimal::from_str(mantissa).ok()?;
    let exponent: i64 = exponent.parse().ok()?;

    let excess = i64::from(mantissa.scale()) - exponent - i64::from(MAX_SCALE);
    if excess <= 0 {
        return None;
    }
    if excess > i64::from(MAX_SCALE) {
        return Some(Decimal::ZERO);
    }

    let mut rounded = Decimal::try_from_i128_with_scale(mantissa.mantissa(), excess as u32).ok()?.round();
    rounded.set_scale(MAX_SCALE).ok()?;
    Some(rounded)
}

/// Asset specification without an amount (`Asset`/`Asset2` on AMM transactions)
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct AssetSpec {
    pub currency: String,
    #[serde(default)]
    pub issuer: Option<String>,
}

impl AssetSpec {
    pub fn to_asset(&self) -> Result<Asset, ParseError> {
        match (self.currency.as_str(), &self.issuer) {
            ("XRP", None) => Ok(Asset::Xrp),
            (_, Some(issuer)) => Ok(Asset::Issued { currency: self.currency.clone(), issuer: issuer.clone() }),
            (_, None) => Err(ParseError::InvalidStructure {
                kind: "asset",
                reason: format!("issued currency {} without issuer", self.currency),
            }),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AmmCreate {
    pub amount: Amount,
    pub amount2: Amount,
    #[serde(default)]
    pub trading_fee: u32,
}

/// Shared shape of `AMMDeposit` and `AMMWithdraw`
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AmmLiquidityChange {
    pub asset: AssetSpec,
    pub asset2: AssetSpec,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OfferCreate {
    pub taker_gets: Amount,
    pub taker_pays: Amount,
    #[serde(default)]
    pub offer_sequence: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct OfferCancel {
    pub offer_sequence: u32,
}

/// DEX transaction kinds. Anything else is `Unrecognized` and keeps its payload.
#[derive(Debug, Clone, PartialEq)]
pub enum DexTransaction<'a> {
    AmmCreate(AmmCreate),
    AmmDeposit(AmmLiquidityChange),
    AmmWithdraw(AmmLiquidityChange),
    OfferCreate(OfferCreate),
    OfferCancel(OfferCancel),
    Unrecognized { transaction_type: &'a str, raw: &'a Map<String, Value> },
}

impl<'a> DexTransaction<'a> {
    /// Classify a transaction and decode its DEX fields.
    ///
    /// Errors only for a recognized type whose payload does not match its shape.
    pub fn classify(tx: &'a LedgerTransaction) -> Result<Self, ParseError> {
        let classified = match tx.transaction_type.as_str() {
            "AMMCreate" => Self::AmmCreate(decode(tx, "AMMCreate")?),
            "AMMDeposit" => Self::AmmDeposit(decode(tx, "AMMDeposit")?),
            "AMMWithdraw" => Self::AmmWithdraw(decode(tx, "AMMWithdraw")?),
            "OfferCreate" => Self::OfferCreate(decode(tx, "OfferCreate")?),
            "OfferCancel" => Self::OfferCancel(decode(tx, "OfferCancel")?),
            other => Self::Unrecognized { transaction_type: other, raw: &tx.fields },
        };
        Ok(classified)
    }
}

fn decode<T: DeserializeOwned>(tx: &LedgerTransaction, kind: &'static str) -> Result<T, ParseError> {
    serde_json::from_value(Value::Object(tx.fields.clone()))
        .map_err(|e| ParseError::InvalidStructure { kind, reason: e.to_string() })
}

/// Whether a transaction type is one the parsers act on
pub fn is_dex_transaction_type(transaction_type: &str) -> bool {
    matches!(transaction_type, "AMMCreate" | "AMMDeposit" | "AMMWithdraw" | "OfferCreate" | "OfferCancel")
}
