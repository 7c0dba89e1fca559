use chrono::Utc;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainClient;
use crate::db::Store;
use crate::error::Result;
use crate::feed::{FeedClient, FeedPage};
use crate::models::InsertOutcome;
use crate::retry::{pause, RetryPolicy};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestReport {
    pub pages: usize,
    pub inserted: usize,
    pub duplicates: usize,
}

impl IngestReport {
    fn add(&mut self, other: IngestReport) {
        self.pages += other.pages;
        self.inserted += other.inserted;
        self.duplicates += other.duplicates;
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DerivationReport {
    pub processed: usize,
    pub new_wallets: usize,
    pub failed: usize,
}

/// Pulls the trade-history feed into the store and derives the wallet universe.
pub struct Indexer {
    feed: Arc<dyn FeedClient>,
    chain: Arc<dyn ChainClient>,
    store: Arc<Store>,
    /// Hashes stored by this process and still awaiting derivation.
    seen: Mutex<HashSet<String>>,
    cursor: Mutex<String>,
    retry: RetryPolicy,
    /// Consecutive page failures, across drains, tolerated before giving up;
    /// 0 never gives up.
    failure_budget: u32,
    consecutive_failures: AtomicU32,
}

impl Indexer {
    pub fn new(
        feed: Arc<dyn FeedClient>,
        chain: Arc<dyn ChainClient>,
        store: Arc<Store>,
        retry: RetryPolicy,
        failure_budget: u32,
    ) -> Self {
        Indexer {
            feed,
            chain,
            store,
            seen: Mutex::new(HashSet::new()),
            // only forward-moving data unless a backfill cursor is set
            cursor: Mutex::new(format!("{}000", Utc::now().timestamp())),
            retry,
            failure_budget,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    pub fn cursor(&self) -> String {
        self.cursor.lock().clone()
    }

    pub fn set_cursor(&self, cursor: impl Into<String>) {
        *self.cursor.lock() = cursor.into();
    }

    /// Persist the new records of a page and advance the cursor to the
    /// timestamp of its last record.
    pub fn integrate_page(&self, page: &FeedPage) -> Result<IngestReport> {
        let mut report = IngestReport { pages: 1, ..Default::default() };
        for tx in &page.trades {
            if self.seen.lock().contains(&tx.txn_hash) {
                report.duplicates += 1;
                continue;
            }
            match self.store.insert_transaction(tx)? {
                InsertOutcome::Inserted => report.inserted += 1,
                InsertOutcome::Duplicate => report.duplicates += 1,
            }
            self.seen.lock().insert(tx.txn_hash.clone());
        }
        if let Some(ts) = page.last_timestamp() {
            self.set_cursor(ts);
        }
        Ok(report)
    }

    /// Fetch and integrate one page after the current cursor.
    pub async fn ingest_page(&self) -> Result<IngestReport> {
        let cursor = self.cursor();
        let (feed, after) = (&self.feed, cursor.as_str());
        let page = self
            .retry
            .run("feed page", move || feed.fetch_page(after))
            .await?;
        let report = self.integrate_page(&page)?;
        debug!(
            "page after {cursor}: {} new, {} duplicate, cursor now {}",
            report.inserted,
            report.duplicates,
            self.cursor()
        );
        Ok(report)
    }

    /// Ingest pages until the feed is caught up: an empty page, or one that
    /// leaves the cursor where it was. Failed pages are dropped and retried
    /// after a backoff. After `retry.attempts` failed pages in a row the drain
    /// returns what it has; only an exhausted failure budget is an error.
    pub async fn drain(&self, shutdown: &CancellationToken) -> Result<IngestReport> {
        let mut total = IngestReport::default();
        let mut failures = 0u32;
        while !shutdown.is_cancelled() {
            let before = self.cursor();
            match self.ingest_page().await {
                Ok(report) => {
                    failures = 0;
                    self.consecutive_failures.store(0, Ordering::Relaxed);
                    total.add(report);
                    if report.inserted + report.duplicates == 0 || self.cursor() == before {
                        break;
                    }
                }
                Err(e) => {
                    failures += 1;
                    let in_a_row = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
                    if self.failure_budget > 0 && in_a_row >= self.failure_budget {
                        error!("feed ingestion giving up after {in_a_row} failed pages: {e}");
                        return Err(e);
                    }
                    if failures >= self.retry.attempts.max(1) {
                        warn!("feed unavailable after {failures} attempts, continuing without it: {e}");
                        break;
                    }
                    let delay = self.retry.backoff(failures - 1);
                    warn!("feed page failed ({failures} in a row), retrying in {delay:?}: {e}");
                    if !pause(delay, shutdown).await {
                        break;
                    }
                }
            }
        }
        if total.inserted > 0 {
            info!("ingested {} new transactions over {} pages", total.inserted, total.pages);
        }
        Ok(total)
    }

    /// Poll the feed until shutdown, pausing `poll_interval` once caught up.
    pub async fn run(&self, poll_interval: std::time::Duration, shutdown: &CancellationToken) -> Result<()> {
        loop {
            self.drain(shutdown).await?;
            if !pause(poll_interval, shutdown).await {
                return Ok(());
            }
        }
    }

    /// Resolve the sender of every unprocessed transaction, oldest first, and
    /// register it as a wallet. Failed lookups stay queued for the next cycle.
    pub async fn derive_wallets(&self, shutdown: &CancellationToken) -> Result<DerivationReport> {
        let mut report = DerivationReport::default();
        for tx in self.store.unprocessed_transactions()? {
            if shutdown.is_cancelled() {
                break;
            }
            let chain = &self.chain;
            let hash = tx.txn_hash.as_str();
            match self.retry.run("sender lookup", move || chain.get_transaction_sender(hash)).await {
                Ok(Some(sender)) => {
                    if self.store.record_sender(hash, &sender, Utc::now().timestamp())? == InsertOutcome::Inserted {
                        debug!("new wallet {sender} from {hash}");
                        report.new_wallets += 1;
                    }
                    // the store rejects it from here on
                    self.seen.lock().remove(hash);
                    report.processed += 1;
                }
                Ok(None) => {
                    warn!("transaction {hash} not found on chain, will retry");
                    report.failed += 1;
                }
                Err(e) => {
                    warn!("sender lookup for {hash} failed: {e}");
                    report.failed += 1;
                }
            }
        }
        if report.processed > 0 || report.failed > 0 {
            info!(
                "wallet derivation: {} processed, {} new wallets, {} failed",
                report.processed, report.new_wallets, report.failed
            );
        }
        Ok(report)
    }
}
