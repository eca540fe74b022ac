/// AMM Transaction Parser
///
/// Turns `AMMCreate`, `AMMDeposit` and `AMMWithdraw` transactions into the
/// current reserve state of the affected pool.
///
/// Reserves are read from the transaction metadata: the AMM ledger entry names
/// the AMM account, whose `AccountRoot` balance (XRP) and `RippleState`
/// balances (issued currencies) are the pool reserves after the transaction.
/// An `AMMCreate` without usable metadata falls back to its own amounts.
use rust_decimal::Decimal;
use serde_json::{Map, Value};

use crate::error::ParseError;
use crate::etl::transform::{parse_drops, parse_issued_value, Asset, DexTransaction};
use crate::models::AmmPool;
use crate::rpc::LedgerTransaction;

/// `TradingFee` is in units of 1/100,000; basis points are 1/10,000
const TRADING_FEE_UNITS_PER_BPS: u32 = 10;

#[derive(Debug, Default, Clone, Copy)]
pub struct AmmParser;

impl AmmParser {
    pub fn new() -> Self {
        Self
    }

    /// Decode a pool update.
    ///
    /// `Ok(None)` means the transaction is not an AMM transaction (or did not
    /// apply); `Err` means it is one but could not be decoded.
    pub fn parse_transaction(
        &self,
        tx: &LedgerTransaction,
        ledger_index: u64,
        ledger_hash: &str,
    ) -> Result<Option<AmmPool>, ParseError> {
        if !matches!(tx.transaction_type.as_str(), "AMMCreate" | "AMMDeposit" | "AMMWithdraw") || !tx.succeeded() {
            return Ok(None);
        }

        let amm_node = tx.meta.as_ref().and_then(find_amm_node);

        let (asset_a, asset_b, reserves, fee) = match DexTransaction::classify(tx)? {
            DexTransaction::AmmCreate(create) => {
                let asset_a = create.amount.asset();
                let asset_b = create.amount2.asset();
                let reserves = match amm_node.as_ref().and_then(|node| node_reserves(tx, node, &asset_a, &asset_b)) {
                    Some(reserves) => reserves,
                    None => (Some(create.amount.value("Amount")?), Some(create.amount2.value("Amount2")?)),
                };
                let fee = amm_node.as_ref().and_then(|node| node.trading_fee).unwrap_or(create.trading_fee);
                (asset_a, asset_b, reserves, fee)
            }
            DexTransaction::AmmDeposit(change) | DexTransaction::AmmWithdraw(change) => {
                let asset_a = change.asset.to_asset()?;
                let asset_b = change.asset2.to_asset()?;
                let node = amm_node.as_ref().ok_or(ParseError::MissingField("AffectedNodes.AMM"))?;
                let reserves = node_reserves(tx, node, &asset_a, &asset_b)
                    .ok_or(ParseError::MissingField("AMM account balances"))?;
                // TradingFee is omitted from ledger entries when it is 0
                let fee = node.trading_fee.unwrap_or(0);
                (asset_a, asset_b, reserves, fee)
            }
            _ => return Ok(None),
        };

        if asset_a == asset_b {
            return Err(ParseError::InvalidStructure {
                kind: "AMM",
                reason: format!("pool with identical assets {}", asset_a),
            });
        }

        let ((asset1, reserve1), (asset2, reserve2)) = order_pair((asset_a, reserves.0), (asset_b, reserves.1));

        Ok(Some(AmmPool {
            pool_id: pool_id(&asset1, &asset2),
            amm_account: amm_node.map(|node| node.account),
            asset1: asset1.to_string(),
            asset2: asset2.to_string(),
            reserve1,
            reserve2,
            fee_bps: (fee / TRADING_FEE_UNITS_PER_BPS) as i32,
            last_updated_ledger: ledger_index as i64,
            ledger_hash: ledger_hash.to_string(),
        }))
    }
}

/// Deterministic pool key: both assets in canonical order
pub fn pool_id(asset1: &Asset, asset2: &Asset) -> String {
    format!("{}/{}", asset1, asset2)
}

fn order_pair<T>(a: (Asset, T), b: (Asset, T)) -> ((Asset, T), (Asset, T)) {
    if a.0 <= b.0 {
        (a, b)
    } else {
        (b, a)
    }
}

#[derive(Debug, Clone, PartialEq)]
struct AmmNode {
    account: String,
    trading_fee: Option<u32>,
    deleted: bool,
}

/// Walk `AffectedNodes`, yielding (entry type, node kind, fields).
/// Fields are `NewFields` for created nodes and `FinalFields` otherwise.
fn affected_nodes<'a>(meta: &'a Value) -> impl Iterator<Item = (&'a str, &'a str, &'a Map<String, Value>)> + 'a {
    meta.get("AffectedNodes").and_then(|nodes| nodes.as_array()).into_iter().flatten().filter_map(|wrapper| {
        let (kind, node) = wrapper.as_object()?.iter().next()?;
        let entry_type = node.get("LedgerEntryType")?.as_str()?;
        let fields = node.get("NewFields").or_else(|| node.get("FinalFields"))?.as_object()?;
        Some((entry_type, kind.as_str(), fields))
    })
}

fn find_amm_node(meta: &Value) -> Option<AmmNode> {
    affected_nodes(meta).find(|(entry_type, _, _)| *entry_type == "AMM").and_then(|(_, kind, fields)| {
        Some(AmmNode {
            account: fields.get("Account")?.as_str()?.to_string(),
            trading_fee: fields.get("TradingFee").and_then(|fee| fee.as_u64()).map(|fee| fee as u32),
            deleted: kind == "DeletedNode",
        })
    })
}

/// Reserves of both assets after the transaction, or `None` when the metadata
/// mentions neither. A side the transaction did not touch stays `None`.
fn node_reserves(
    tx: &LedgerTransaction,
    node: &AmmNode,
    asset_a: &Asset,
    asset_b: &Asset,
) -> Option<(Option<Decimal>, Option<Decimal>)> {
    if node.deleted {
        return Some((Some(Decimal::ZERO), Some(Decimal::ZERO)));
    }

    let meta = tx.meta.as_ref()?;
    let reserve_a = account_balance(meta, &node.account, asset_a);
    let reserve_b = account_balance(meta, &node.account, asset_b);

    if reserve_a.is_none() && reserve_b.is_none() {
        None
    } else {
        Some((reserve_a, reserve_b))
    }
}

/// Balance of `asset` held by `account` according to the affected nodes
fn account_balance(meta: &Value, account: &str, asset: &Asset) -> Option<Decimal> {
    affected_nodes(meta).find_map(|(entry_type, _, fields)| match (entry_type, asset) {
        ("AccountRoot", Asset::Xrp) if str_field(fields, "Account") == Some(account) => {
            parse_drops(str_field(fields, "Balance")?, "AccountRoot.Balance").ok()
        }
        ("RippleState", Asset::Issued { currency, issuer }) => trust_line_balance(fields, account, currency, issuer),
        _ => None,
    })
}

/// RippleState balances are stored from the low account's side; flip the sign
/// when the holder is the high account.
fn trust_line_balance(fields: &Map<String, Value>, holder: &str, currency: &str, issuer: &str) -> Option<Decimal> {
    let balance = fields.get("Balance")?;
    if balance.get("currency")?.as_str()? != currency {
        return None;
    }

    let low = fields.get("LowLimit")?.get("issuer")?.as_str()?;
    let high = fields.get("HighLimit")?.get("issuer")?.as_str()?;
    let value = parse_issued_value(balance.get("value")?.as_str()?, "RippleState.Balance").ok()?;

    if low == holder && high == issuer {
        Some(value)
    } else if high == holder && low == issuer {
        Some(-value)
    } else {
        None
    }
}

fn str_field<'a>(fields: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    fields.get(key)?.as_str()
}
