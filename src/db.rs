use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Row};
use rust_decimal::Decimal;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::models::{
    from_sentinel, to_sentinel, InsertOutcome, NodeBalances, NodeHolding, Transaction, Wallet,
};

const SYNC_CHECKPOINT_KEY: &str = "sync_checkpoint";
const SENTINEL_TOTAL: &str = "-1";

const WALLET_COLUMNS: &str = "rowid, address, nodes, node_amounts, total_amount, creation_time,
    last_claim_time, last_compound_time, first_seen, last_synced";

/// SQLite-backed store. One connection, every statement serialized behind a mutex.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create the database at `path`.
    pub fn open(path: &str) -> Result<Self> {
        Self::with_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(include_str!("../sql/schema.sql"))?;
        Ok(Store { conn: Mutex::new(conn) })
    }

    /// Insert a transaction; a known hash is ignored (unique constraint).
    pub fn insert_transaction(&self, tx: &Transaction) -> Result<InsertOutcome> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "INSERT OR IGNORE INTO transactions
            (block_number, block_timestamp, txn_hash, log_index, type, price_usd, volume_usd, amount0, amount1, scraped)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                tx.block_number as i64,
                tx.block_timestamp,
                tx.txn_hash,
                tx.log_index as i64,
                tx.kind.as_str(),
                tx.price_usd.to_string(),
                tx.volume_usd.to_string(),
                tx.amount0.to_string(),
                tx.amount1.to_string(),
                tx.processed,
            ],
        )?;
        Ok(if changed == 0 { InsertOutcome::Duplicate } else { InsertOutcome::Inserted })
    }

    pub fn transaction_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM transactions", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Transactions whose sender has not been derived yet, oldest first.
    pub fn unprocessed_transactions(&self) -> Result<Vec<Transaction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT block_number, block_timestamp, txn_hash, log_index, type, price_usd, volume_usd,
                amount0, amount1, scraped
            FROM transactions WHERE scraped = 0
            ORDER BY CAST(block_timestamp AS INTEGER) ASC, block_number ASC, log_index ASC",
        )?;
        let rows = stmt.query_map([], transaction_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// Insert a wallet skeleton for `sender` if absent and mark `txn_hash`
    /// processed, atomically.
    pub fn record_sender(&self, txn_hash: &str, sender: &str, first_seen: i64) -> Result<InsertOutcome> {
        let mut conn = self.conn.lock();
        let db_tx = conn.transaction()?;
        let changed = db_tx.execute(
            "INSERT OR IGNORE INTO wallets (address, first_seen) VALUES (?1, ?2)",
            params![sender, first_seen],
        )?;
        db_tx.execute("UPDATE transactions SET scraped = 1 WHERE txn_hash = ?1", [txn_hash])?;
        db_tx.commit()?;
        Ok(if changed == 0 { InsertOutcome::Duplicate } else { InsertOutcome::Inserted })
    }

    /// Write the synchronized node state of a wallet. Returns `false` when
    /// the address is unknown.
    pub fn update_wallet_balances(&self, address: &str, balances: &NodeBalances, synced_at: i64) -> Result<bool> {
        let names: Vec<&str> = balances.nodes.iter().map(|n| n.name.as_str()).collect();
        let amounts: Vec<Decimal> = balances.nodes.iter().map(|n| n.amount).collect();
        let names = serde_json::to_string(&names).map_err(|e| corrupt(address, e))?;
        let amounts = serde_json::to_string(&amounts).map_err(|e| corrupt(address, e))?;
        let total = balances
            .total
            .map(|t| t.to_string())
            .unwrap_or_else(|| SENTINEL_TOTAL.to_string());

        let mut conn = self.conn.lock();
        let db_tx = conn.transaction()?;
        let changed = db_tx.execute(
            "UPDATE wallets SET nodes = ?1, node_amounts = ?2, total_amount = ?3, creation_time = ?4,
                last_claim_time = ?5, last_compound_time = ?6, last_synced = ?7
            WHERE address = ?8",
            params![
                names,
                amounts,
                total,
                to_sentinel(balances.creation_time),
                to_sentinel(balances.last_claim_time),
                to_sentinel(balances.last_compound_time),
                synced_at,
                address,
            ],
        )?;
        db_tx.commit()?;
        Ok(changed > 0)
    }

    /// Case-insensitive exact match.
    pub fn find_wallet(&self, address: &str) -> Result<Option<Wallet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {WALLET_COLUMNS} FROM wallets WHERE address = ?1"))?;
        let raw = stmt.query_row([address], RawWallet::from_row).optional()?;
        raw.map(RawWallet::decode).transpose()
    }

    /// Every wallet in insertion order.
    pub fn load_wallets(&self) -> Result<Vec<Wallet>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!("SELECT {WALLET_COLUMNS} FROM wallets ORDER BY rowid ASC"))?;
        let rows = stmt.query_map([], RawWallet::from_row)?;
        let raws = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        raws.into_iter().map(RawWallet::decode).collect()
    }

    pub fn wallet_addresses(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT address FROM wallets ORDER BY rowid ASC")?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        Ok(rows.collect::<rusqlite::Result<Vec<String>>>()?)
    }

    pub fn wallet_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM wallets", [], |r| r.get(0))?;
        Ok(n as usize)
    }

    /// Index of the next wallet of an interrupted sync pass.
    pub fn sync_checkpoint(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let value: Option<String> = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [SYNC_CHECKPOINT_KEY], |r| r.get(0))
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    pub fn set_sync_checkpoint(&self, index: usize) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO metadata (key, value) VALUES (?1, ?2)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![SYNC_CHECKPOINT_KEY, index.to_string()],
        )?;
        Ok(())
    }
}

fn transaction_from_row(r: &Row<'_>) -> rusqlite::Result<Transaction> {
    let block_number: i64 = r.get(0)?;
    let log_index: i64 = r.get(3)?;
    let kind: String = r.get(4)?;
    Ok(Transaction {
        block_number: block_number as u64,
        block_timestamp: r.get(1)?,
        txn_hash: r.get(2)?,
        log_index: log_index as u64,
        kind: kind.into(),
        price_usd: decimal_column(r, 5)?,
        volume_usd: decimal_column(r, 6)?,
        amount0: decimal_column(r, 7)?,
        amount1: decimal_column(r, 8)?,
        processed: r.get(9)?,
    })
}

fn decimal_column(r: &Row<'_>, idx: usize) -> rusqlite::Result<Decimal> {
    let text: String = r.get(idx)?;
    Decimal::from_str(&text)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

fn corrupt(address: &str, e: impl std::fmt::Display) -> Error {
    Error::Corrupt { address: address.to_string(), reason: e.to_string() }
}

/// Wallet row before its JSON columns are decoded.
struct RawWallet {
    id: i64,
    address: String,
    nodes: String,
    node_amounts: String,
    total_amount: String,
    creation_time: i64,
    last_claim_time: i64,
    last_compound_time: i64,
    first_seen: i64,
    last_synced: i64,
}

impl RawWallet {
    fn from_row(r: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RawWallet {
            id: r.get(0)?,
            address: r.get(1)?,
            nodes: r.get(2)?,
            node_amounts: r.get(3)?,
            total_amount: r.get(4)?,
            creation_time: r.get(5)?,
            last_claim_time: r.get(6)?,
            last_compound_time: r.get(7)?,
            first_seen: r.get(8)?,
            last_synced: r.get(9)?,
        })
    }

    fn decode(self) -> Result<Wallet> {
        let names: Vec<String> = serde_json::from_str(&self.nodes).map_err(|e| corrupt(&self.address, e))?;
        let amounts: Vec<Decimal> =
            serde_json::from_str(&self.node_amounts).map_err(|e| corrupt(&self.address, e))?;
        if names.len() != amounts.len() {
            return Err(corrupt(
                &self.address,
                format!("{} node names but {} amounts", names.len(), amounts.len()),
            ));
        }
        let total = Decimal::from_str(&self.total_amount).map_err(|e| corrupt(&self.address, e))?;

        Ok(Wallet {
            id: self.id,
            nodes: names
                .into_iter()
                .zip(amounts)
                .map(|(name, amount)| NodeHolding { name, amount })
                .collect(),
            total: (total != Decimal::NEGATIVE_ONE).then_some(total),
            creation_time: from_sentinel(self.creation_time),
            last_claim_time: from_sentinel(self.last_claim_time),
            last_compound_time: from_sentinel(self.last_compound_time),
            first_seen: self.first_seen,
            last_synced: from_sentinel(self.last_synced),
            address: self.address,
        })
    }
}
