//! Doubles for the feed, chain and price collaborators.

use async_trait::async_trait;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use crate::chain::ChainClient;
use crate::error::{Error, Result};
use crate::feed::{FeedClient, FeedPage};
use crate::models::{NodeRecord, TradeKind, Transaction, Wallet};
use crate::price::PriceSource;
use crate::retry::RetryPolicy;

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        attempts: 2,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
        timeout: Duration::from_secs(5),
    }
}

pub fn trade(hash: &str, timestamp: &str) -> Transaction {
    Transaction {
        block_number: 16_000_000,
        block_timestamp: timestamp.to_string(),
        txn_hash: hash.to_string(),
        log_index: 0,
        kind: TradeKind::Buy,
        price_usd: Decimal::new(245, 2),
        volume_usd: Decimal::new(1_000, 0),
        amount0: Decimal::new(408_16, 2),
        amount1: Decimal::new(10, 0),
        processed: false,
    }
}

pub fn page(trades: Vec<Transaction>) -> FeedPage {
    FeedPage { trades }
}

pub fn node(name: &str, amount: u128, deleted: bool) -> NodeRecord {
    NodeRecord {
        name: name.to_string(),
        creation_time: 1_650_000_000,
        last_claim_time: 1_650_000_000,
        last_compound_time: 1_650_000_000,
        amount,
        deleted,
    }
}

pub fn wallet(id: i64, address: &str, total: Option<Decimal>) -> Wallet {
    Wallet {
        id,
        address: address.to_string(),
        nodes: Vec::new(),
        total,
        creation_time: None,
        last_claim_time: None,
        last_compound_time: None,
        first_seen: 0,
        last_synced: None,
    }
}

/// Serves scripted pages in order, then empty pages.
pub struct ScriptedFeed {
    pages: Mutex<VecDeque<Result<FeedPage>>>,
    cursors: Mutex<Vec<String>>,
    down: bool,
}

impl ScriptedFeed {
    pub fn new(pages: Vec<Result<FeedPage>>) -> Self {
        ScriptedFeed { pages: Mutex::new(pages.into()), cursors: Mutex::new(Vec::new()), down: false }
    }

    /// Every request fails as if the feed host were unreachable.
    pub fn unreachable() -> Self {
        ScriptedFeed { down: true, ..Self::new(Vec::new()) }
    }

    /// Cursors requested so far.
    pub fn cursors(&self) -> Vec<String> {
        self.cursors.lock().clone()
    }
}

#[async_trait]
impl FeedClient for ScriptedFeed {
    async fn fetch_page(&self, cursor: &str) -> Result<FeedPage> {
        self.cursors.lock().push(cursor.to_string());
        if self.down {
            return Err(Error::NetworkUnavailable("feed unreachable".into()));
        }
        let next = self.pages.lock().pop_front();
        next.unwrap_or_else(|| Ok(page(Vec::new())))
    }
}

#[derive(Default)]
pub struct MockChain {
    nodes: HashMap<String, Vec<NodeRecord>>,
    senders: HashMap<String, String>,
    failing: HashSet<String>,
    node_lookups: Mutex<Vec<String>>,
    sender_lookups: Mutex<Vec<String>>,
}

impl MockChain {
    pub fn with_nodes(mut self, address: &str, nodes: Vec<NodeRecord>) -> Self {
        self.nodes.insert(address.to_lowercase(), nodes);
        self
    }

    pub fn with_sender(mut self, txn_hash: &str, sender: &str) -> Self {
        self.senders.insert(txn_hash.to_string(), sender.to_string());
        self
    }

    /// Node reads for `address` fail as if the RPC were down.
    pub fn failing(mut self, address: &str) -> Self {
        self.failing.insert(address.to_lowercase());
        self
    }

    pub fn node_lookups(&self) -> Vec<String> {
        self.node_lookups.lock().clone()
    }

    pub fn sender_lookups(&self) -> Vec<String> {
        self.sender_lookups.lock().clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_all_nodes(&self, address: &str) -> Result<Vec<NodeRecord>> {
        self.node_lookups.lock().push(address.to_string());
        let key = address.to_lowercase();
        if self.failing.contains(&key) {
            return Err(Error::NetworkUnavailable(format!("rpc down for {address}")));
        }
        Ok(self.nodes.get(&key).cloned().unwrap_or_default())
    }

    async fn get_transaction_sender(&self, txn_hash: &str) -> Result<Option<String>> {
        self.sender_lookups.lock().push(txn_hash.to_string());
        Ok(self.senders.get(txn_hash).cloned())
    }
}

/// Answers with the scripted prices in order; `None` or exhaustion is a failed fetch.
pub struct ScriptedPrice {
    prices: Mutex<VecDeque<Option<Decimal>>>,
}

impl ScriptedPrice {
    pub fn new(prices: Vec<Option<Decimal>>) -> Self {
        ScriptedPrice { prices: Mutex::new(prices.into()) }
    }
}

#[async_trait]
impl PriceSource for ScriptedPrice {
    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let next = self.prices.lock().pop_front().flatten();
        next.ok_or_else(|| Error::NetworkUnavailable("price source unreachable".into()))
    }
}
