/// rippled Wire Types
///
/// Decoding of the JSON messages exchanged with rippled: command responses,
/// `ledgerClosed` stream notifications and expanded ledgers.
use serde::{Deserialize, Deserializer};
use serde_json::{Map, Value};

use crate::error::SourceError;

/// A closed ledger with its expanded transactions
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerResponse {
    pub ledger_index: u64,
    pub ledger_hash: String,
    /// Present in full ledger headers; used only as an advisory continuity signal
    pub parent_hash: Option<String>,
    /// Seconds since the Ripple epoch
    pub ledger_time: u64,
    pub txn_count: u32,
    pub transactions: Vec<LedgerTransaction>,
}

/// One transaction of a ledger with its metadata
///
/// Only the envelope fields are typed; the rest of the payload is kept as-is
/// for the parsers.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerTransaction {
    pub hash: String,
    pub transaction_type: String,
    pub account: String,
    pub fields: Map<String, Value>,
    pub meta: Option<Value>,
}

impl LedgerTransaction {
    /// Decode either the API v1 shape (fields inline, `metaData`) or the API v2
    /// shape (`tx_json`, `meta`, `hash` side by side)
    pub fn from_value(value: Value) -> Result<Self, SourceError> {
        let Value::Object(mut outer) = value else {
            return Err(SourceError::rpc("transaction entry is not an object"));
        };

        let (mut fields, meta) = match outer.remove("tx_json") {
            Some(Value::Object(tx_json)) => {
                let meta = outer.remove("meta").or_else(|| outer.remove("metaData"));
                let mut fields = tx_json;
                if let Some(hash) = outer.remove("hash") {
                    fields.entry("hash").or_insert(hash);
                }
                (fields, meta)
            }
            Some(_) => return Err(SourceError::rpc("tx_json is not an object")),
            None => {
                let meta = outer.remove("metaData").or_else(|| outer.remove("meta"));
                (outer, meta)
            }
        };

        let hash = take_string(&mut fields, "hash").unwrap_or_default();
        let transaction_type =
            take_string(&mut fields, "TransactionType").ok_or_else(|| SourceError::rpc("transaction without type"))?;
        let account = fields.get("Account").and_then(|a| a.as_str()).unwrap_or_default().to_string();

        Ok(Self { hash, transaction_type, account, fields, meta })
    }

    /// Engine result recorded in the metadata, if any
    pub fn result_code(&self) -> Option<&str> {
        self.meta.as_ref()?.get("TransactionResult")?.as_str()
    }

    /// Whether the transaction applied. Missing metadata counts as applied.
    pub fn succeeded(&self) -> bool {
        self.result_code().map(|code| code == "tesSUCCESS").unwrap_or(true)
    }

    pub fn field(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }
}

fn take_string(map: &mut Map<String, Value>, key: &str) -> Option<String> {
    match map.remove(key) {
        Some(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// rippled reports ledger indexes as numbers in some places and as decimal
/// strings in others
pub(crate) fn deserialize_index<'de, D>(deserializer: D) -> Result<u64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Index {
        Number(u64),
        Text(String),
    }

    match Index::deserialize(deserializer)? {
        Index::Number(n) => Ok(n),
        Index::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

#[derive(Debug, Deserialize)]
struct RawLedger {
    #[serde(deserialize_with = "deserialize_index")]
    ledger_index: u64,
    #[serde(default)]
    ledger_hash: Option<String>,
    #[serde(default)]
    hash: Option<String>,
    #[serde(default)]
    parent_hash: Option<String>,
    #[serde(default)]
    close_time: u64,
    #[serde(default)]
    transactions: Vec<Value>,
}

impl LedgerResponse {
    /// Decode the `result` object of a `ledger` command
    pub fn from_result(result: &Value) -> Result<Self, SourceError> {
        let ledger = result.get("ledger").ok_or_else(|| SourceError::rpc("ledger response without ledger"))?;
        let raw: RawLedger = serde_json::from_value(ledger.clone()).map_err(SourceError::rpc)?;

        let ledger_hash = raw
            .ledger_hash
            .or(raw.hash)
            .or_else(|| result.get("ledger_hash").and_then(|h| h.as_str()).map(str::to_string))
            .ok_or_else(|| SourceError::rpc(format!("ledger {} without hash", raw.ledger_index)))?;

        // An entry we cannot decode is skipped so the rest of the ledger still lands
        let txn_count = raw.transactions.len() as u32;
        let mut transactions = Vec::with_capacity(raw.transactions.len());
        for entry in raw.transactions {
            let hash = entry.get("hash").and_then(|h| h.as_str()).unwrap_or("unknown").to_string();
            match LedgerTransaction::from_value(entry) {
                Ok(tx) => transactions.push(tx),
                Err(e) => tracing::warn!("Skipping transaction {} in ledger {}: {}", hash, raw.ledger_index, e),
            }
        }

        Ok(Self {
            ledger_index: raw.ledger_index,
            ledger_hash,
            parent_hash: raw.parent_hash,
            ledger_time: raw.close_time,
            txn_count,
            transactions,
        })
    }
}

/// `ledgerClosed` stream notification
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct LedgerClosed {
    #[serde(deserialize_with = "deserialize_index")]
    pub ledger_index: u64,
    pub ledger_hash: String,
    #[serde(default)]
    pub ledger_time: u64,
    #[serde(default)]
    pub txn_count: u32,
}

/// Classified inbound WebSocket text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Reply to a request we sent, keyed by the request id
    Response { id: u64, outcome: Result<Value, String> },
    LedgerClosed(LedgerClosed),
    /// Anything else (other streams, unknown message types)
    Other(String),
}

impl Inbound {
    pub fn decode(text: &str) -> Result<Self, SourceError> {
        let value: Value = serde_json::from_str(text).map_err(SourceError::rpc)?;

        let kind = value.get("type").and_then(|t| t.as_str()).map(str::to_string);

        match kind.as_deref() {
            Some("ledgerClosed") => {
                let closed: LedgerClosed = serde_json::from_value(value).map_err(SourceError::rpc)?;
                Ok(Self::LedgerClosed(closed))
            }
            Some("response") | None if value.get("id").is_some() => {
                let id = value
                    .get("id")
                    .and_then(|id| id.as_u64())
                    .ok_or_else(|| SourceError::rpc("response id is not an integer"))?;
                Ok(Self::Response { id, outcome: response_outcome(value) })
            }
            Some(other) => Ok(Self::Other(other.to_string())),
            None => Ok(Self::Other("untyped".to_string())),
        }
    }
}

fn response_outcome(mut value: Value) -> Result<Value, String> {
    let status = value.get("status").and_then(|s| s.as_str()).unwrap_or("success");
    if status != "success" {
        let error = value.get("error").and_then(|e| e.as_str()).unwrap_or("unknown");
        let message = value.get("error_message").and_then(|m| m.as_str()).unwrap_or("");
        return Err(if message.is_empty() { error.to_string() } else { format!("{}: {}", error, message) });
    }

    match value.get_mut("result").map(Value::take) {
        Some(result) => Ok(result),
        None => Err("response without result".to_string()),
    }
}

/// Extract the validated ledger sequence from a `server_info` result
pub fn validated_ledger_seq(result: &Value) -> Result<u64, SourceError> {
    result
        .get("info")
        .and_then(|info| info.get("validated_ledger"))
        .and_then(|ledger| ledger.get("seq"))
        .and_then(|seq| seq.as_u64())
        .ok_or_else(|| SourceError::rpc("server_info response without info.validated_ledger.seq"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_ledger_closed() {
        let text = r#"{"type":"ledgerClosed","fee_base":10,"ledger_hash":"ABC","ledger_index":100,
            "ledger_time":750000000,"txn_count":3,"validated_ledgers":"32570-100"}"#;

        let inbound = Inbound::decode(text).unwrap();
        assert_eq!(
            inbound,
            Inbound::LedgerClosed(LedgerClosed {
                ledger_index: 100,
                ledger_hash: "ABC".into(),
                ledger_time: 750000000,
                txn_count: 3
            })
        );
    }

    #[test]
    fn test_decode_error_response() {
        let text = r#"{"id":7,"status":"error","type":"response","error":"lgrNotFound","error_message":"ledgerNotFound"}"#;

        match Inbound::decode(text).unwrap() {
            Inbound::Response { id, outcome } => {
                assert_eq!(id, 7);
                assert_eq!(outcome, Err("lgrNotFound: ledgerNotFound".to_string()));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_decode_other_stream_message() {
        let inbound = Inbound::decode(r#"{"type":"validationReceived","ledger_index":"5"}"#).unwrap();
        assert_eq!(inbound, Inbound::Other("validationReceived".into()));
    }

    #[test]
    fn test_validated_ledger_seq() {
        let result = json!({"info": {"validated_ledger": {"seq": 99984600, "hash": "X"}}});
        assert_eq!(validated_ledger_seq(&result).unwrap(), 99984600);

        assert!(matches!(validated_ledger_seq(&json!({"info": {}})), Err(SourceError::Rpc(_))));
    }

    #[test]
    fn test_ledger_from_v1_result() {
        let result = json!({
            "ledger": {
                "ledger_index": "100",
                "ledger_hash": "HASH100",
                "parent_hash": "HASH99",
                "close_time": 750000000,
                "transactions": [{
                    "Account": "rAlice",
                    "TransactionType": "Payment",
                    "hash": "TX1",
                    "metaData": {"TransactionResult": "tesSUCCESS"}
                }]
            },
            "validated": true
        });

        let ledger = LedgerResponse::from_result(&result).unwrap();
        assert_eq!(ledger.ledger_index, 100);
        assert_eq!(ledger.ledger_hash, "HASH100");
        assert_eq!(ledger.parent_hash.as_deref(), Some("HASH99"));
        assert_eq!(ledger.txn_count, 1);
        assert_eq!(ledger.transactions[0].hash, "TX1");
        assert_eq!(ledger.transactions[0].transaction_type, "Payment");
        assert!(ledger.transactions[0].succeeded());
    }

    #[test]
    fn test_undecodable_transaction_is_skipped() {
        let result = json!({
            "ledger": {
                "ledger_index": 101,
                "ledger_hash": "HASH101",
                "transactions": [
                    {
                        "Account": "rAlice",
                        "TransactionType": "OfferCreate",
                        "TakerGets": "1000000",
                        "TakerPays": {"currency": "USD", "issuer": "rIssuer", "value": "2"},
                        "hash": "TX1"
                    },
                    {"Account": "rBob", "hash": "BROKEN"}
                ]
            }
        });

        let ledger = LedgerResponse::from_result(&result).unwrap();
        assert_eq!(ledger.ledger_index, 101);
        assert_eq!(ledger.txn_count, 2);
        assert_eq!(ledger.transactions.len(), 1);
        assert_eq!(ledger.transactions[0].hash, "TX1");
    }

    #[test]
    fn test_transaction_from_v2_shape() {
        let tx = LedgerTransaction::from_value(json!({
            "hash": "TX2",
            "tx_json": {"Account": "rBob", "TransactionType": "OfferCancel", "OfferSequence": 5},
            "meta": {"TransactionResult": "tecNO_ENTRY"}
        }))
        .unwrap();

        assert_eq!(tx.hash, "TX2");
        assert_eq!(tx.account, "rBob");
        assert_eq!(tx.field("OfferSequence"), Some(&json!(5)));
        assert!(!tx.succeeded());
    }
}
