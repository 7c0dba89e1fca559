use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

use crate::error::{Error, Result};

/// Stored in place of a missing time or total.
pub const SENTINEL: i64 = -1;

/// Feed-defined trade direction. Unknown kinds are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TradeKind {
    Buy,
    Sell,
    Other(String),
}

impl TradeKind {
    pub fn as_str(&self) -> &str {
        match self {
            TradeKind::Buy => "buy",
            TradeKind::Sell => "sell",
            TradeKind::Other(s) => s,
        }
    }
}

impl From<String> for TradeKind {
    fn from(s: String) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "buy" => TradeKind::Buy,
            "sell" => TradeKind::Sell,
            _ => TradeKind::Other(s),
        }
    }
}

impl From<TradeKind> for String {
    fn from(k: TradeKind) -> Self {
        k.as_str().to_string()
    }
}

/// A trade-history record. Deserializes straight from a feed page entry.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    #[serde(deserialize_with = "de::integer")]
    pub block_number: u64,
    /// Kept as text: it doubles as the feed cursor.
    #[serde(deserialize_with = "de::text")]
    pub block_timestamp: String,
    pub txn_hash: String,
    #[serde(deserialize_with = "de::integer")]
    pub log_index: u64,
    #[serde(rename = "type")]
    pub kind: TradeKind,
    #[serde(deserialize_with = "de::decimal")]
    pub price_usd: Decimal,
    #[serde(deserialize_with = "de::decimal")]
    pub volume_usd: Decimal,
    #[serde(deserialize_with = "de::decimal")]
    pub amount0: Decimal,
    #[serde(deserialize_with = "de::decimal")]
    pub amount1: Decimal,
    /// Set once the sender wallet has been derived.
    #[serde(skip)]
    pub processed: bool,
}

/// Result of a write against a unique key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    Duplicate,
}

/// One active node as held by a wallet.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeHolding {
    pub name: String,
    pub amount: Decimal,
}

/// Raw node record as returned by the storage contract.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub creation_time: i64,
    pub last_claim_time: i64,
    pub last_compound_time: i64,
    /// Fixed-point, 18 decimals.
    pub amount: u128,
    pub deleted: bool,
}

/// Aggregated on-chain state of one wallet.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeBalances {
    pub nodes: Vec<NodeHolding>,
    /// `None` when the wallet has no active node.
    pub total: Option<Decimal>,
    pub creation_time: Option<i64>,
    pub last_claim_time: Option<i64>,
    pub last_compound_time: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Wallet {
    /// Store row id, used to break ranking ties.
    #[serde(skip)]
    pub id: i64,
    pub address: String,
    pub nodes: Vec<NodeHolding>,
    pub total: Option<Decimal>,
    pub creation_time: Option<i64>,
    pub last_claim_time: Option<i64>,
    pub last_compound_time: Option<i64>,
    pub first_seen: i64,
    pub last_synced: Option<i64>,
}

impl Wallet {
    pub fn is_address(&self, address: &str) -> bool {
        self.address.eq_ignore_ascii_case(address)
    }
}

/// Answer to a rank query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankResult {
    pub address: String,
    pub rank: usize,
    pub out_of: usize,
    pub total: Decimal,
    /// Value needed to reach the next better rank; zero at rank 1.
    pub distance_to_better: Decimal,
    /// Lead over the next worse rank; absent for the last wallet.
    pub distance_to_worse: Option<Decimal>,
    pub cost_to_better: Decimal,
    pub cost_to_worse: Option<Decimal>,
    pub price: Decimal,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankedWallet {
    pub rank: usize,
    #[serde(flatten)]
    pub wallet: Wallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WalletCount {
    /// Wallets with at least one active node.
    pub ranked: usize,
    /// Every wallet discovered from the feed.
    pub known: usize,
}

/// Accepts `0x` followed by 40 hex digits, any case.
pub fn validate_address(raw: &str) -> Result<&str> {
    let raw = raw.trim();
    let valid = raw
        .strip_prefix("0x")
        .or_else(|| raw.strip_prefix("0X"))
        .map(|hex| hex.len() == 40 && hex.chars().all(|c| c.is_ascii_hexdigit()))
        .unwrap_or(false);
    if valid {
        Ok(raw)
    } else {
        Err(Error::InvalidInput(format!(
            "{raw} is not a valid address, expected 0x followed by 40 hex digits"
        )))
    }
}

/// Parses feed numbers such as `"1,234.56"` or `"1.2e-7"`.
pub fn parse_grouped_decimal(raw: &str) -> std::result::Result<Decimal, rust_decimal::Error> {
    let cleaned: String = raw.chars().filter(|c| *c != ',').collect();
    let cleaned = cleaned.trim();
    if cleaned.contains(['e', 'E']) {
        Decimal::from_scientific(cleaned)
    } else {
        Decimal::from_str(cleaned)
    }
}

pub fn to_sentinel(value: Option<i64>) -> i64 {
    value.unwrap_or(SENTINEL)
}

pub fn from_sentinel(value: i64) -> Option<i64> {
    (value != SENTINEL).then_some(value)
}

/// Lenient field decoders for the feed: numbers may arrive as JSON numbers
/// or comma-grouped strings.
mod de {
    use rust_decimal::Decimal;
    use serde::{de::Error as _, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Int(u64),
        Float(f64),
        Text(String),
    }

    pub fn integer<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Int(n) => Ok(n),
            Raw::Float(f) if f >= 0.0 && f.fract() == 0.0 => Ok(f as u64),
            Raw::Float(f) => Err(D::Error::custom(format!("expected an integer, got {f}"))),
            Raw::Text(s) => s
                .replace(',', "")
                .trim()
                .parse()
                .map_err(|e| D::Error::custom(format!("bad integer {s:?}: {e}"))),
        }
    }

    pub fn text<'de, D: Deserializer<'de>>(d: D) -> Result<String, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Int(n) => Ok(n.to_string()),
            Raw::Float(f) => Ok(format!("{f:.0}")),
            Raw::Text(s) => Ok(s.replace(',', "").trim().to_string()),
        }
    }

    pub fn decimal<'de, D: Deserializer<'de>>(d: D) -> Result<Decimal, D::Error> {
        match Raw::deserialize(d)? {
            Raw::Int(n) => Ok(Decimal::from(n)),
            Raw::Float(f) => Decimal::try_from(f).map_err(D::Error::custom),
            Raw::Text(s) => super::parse_grouped_decimal(&s)
                .map_err(|e| D::Error::custom(format!("bad decimal {s:?}: {e}"))),
        }
    }
}
