use chrono::Utc;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::chain::{read_node_balances, ChainClient};
use crate::db::Store;
use crate::error::{Error, Result};
use crate::models::{NodeBalances, Wallet};
use crate::ranking::RankingEngine;
use crate::retry::RetryPolicy;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub synced: usize,
    pub failed: usize,
    /// Wallets skipped because an earlier interrupted pass already covered them.
    pub resumed_from: usize,
    pub completed: bool,
}

/// Keeps stored wallet balances and the ranking view in line with the chain.
pub struct BalanceSynchronizer {
    chain: Arc<dyn ChainClient>,
    store: Arc<Store>,
    ranking: Arc<RankingEngine>,
    retry: RetryPolicy,
    /// Persist the resume checkpoint every this many wallets.
    checkpoint_every: usize,
}

impl BalanceSynchronizer {
    pub fn new(
        chain: Arc<dyn ChainClient>,
        store: Arc<Store>,
        ranking: Arc<RankingEngine>,
        retry: RetryPolicy,
        checkpoint_every: usize,
    ) -> Self {
        BalanceSynchronizer { chain, store, ranking, retry, checkpoint_every: checkpoint_every.max(1) }
    }

    /// Read one wallet's nodes from chain and write them to the store and ranking view.
    pub async fn sync_wallet(&self, address: &str) -> Result<NodeBalances> {
        let chain = &self.chain;
        let balances = self
            .retry
            .run("getAllNodes", move || read_node_balances(chain.as_ref(), address))
            .await?;

        let synced_at = Utc::now().timestamp();
        if !self.store.update_wallet_balances(address, &balances, synced_at)? {
            return Err(Error::NotFound(format!("{address} is not a known wallet")));
        }
        if let Some(wallet) = self.store.find_wallet(address)? {
            self.ranking.apply(&wallet);
        }
        debug!("synced {address}: total {:?}", balances.total);
        Ok(balances)
    }

    /// Sync the wallet unless it was synced within `freshness_secs`.
    pub async fn sync_if_stale(&self, wallet: &Wallet, freshness_secs: u64) -> Result<()> {
        let now = Utc::now().timestamp();
        let fresh = wallet
            .last_synced
            .map_or(false, |t| now.saturating_sub(t) < freshness_secs as i64);
        if fresh {
            debug!("{} synced {}s ago, skipping chain read", wallet.address, now - wallet.last_synced.unwrap_or(now));
            return Ok(());
        }
        self.sync_wallet(&wallet.address).await.map(|_| ())
    }

    /// One pass over every known wallet (one epoch), resuming an interrupted
    /// pass from the stored checkpoint. Failed wallets are skipped until the
    /// next epoch.
    pub async fn sync_all(&self, shutdown: &CancellationToken) -> Result<SyncReport> {
        let addresses = self.store.wallet_addresses()?;
        let start = self.store.sync_checkpoint()?;
        let start = if start >= addresses.len() { 0 } else { start };
        if start > 0 {
            info!("resuming balance sync at wallet {start} of {}", addresses.len());
        }

        let mut report = SyncReport { resumed_from: start, ..Default::default() };
        for (i, address) in addresses.iter().enumerate().skip(start) {
            if shutdown.is_cancelled() {
                self.store.set_sync_checkpoint(i)?;
                info!("balance sync interrupted at wallet {i}");
                return Ok(report);
            }
            self.sync_one(address, &mut report).await;
            if (i + 1) % self.checkpoint_every == 0 {
                self.store.set_sync_checkpoint(i + 1)?;
            }
        }

        self.store.set_sync_checkpoint(0)?;
        let ranked = self.ranking.reload(&self.store)?;
        report.completed = true;
        info!(
            "node update complete: {} synced, {} failed, {ranked} wallets ranked",
            report.synced, report.failed
        );
        Ok(report)
    }

    /// Sync an explicit list of addresses. Does not touch the checkpoint.
    pub async fn sync_addresses(&self, addresses: &[String], shutdown: &CancellationToken) -> SyncReport {
        let mut report = SyncReport::default();
        for address in addresses {
            if shutdown.is_cancelled() {
                return report;
            }
            self.sync_one(address, &mut report).await;
        }
        report.completed = true;
        report
    }

    async fn sync_one(&self, address: &str, report: &mut SyncReport) {
        match self.sync_wallet(address).await {
            Ok(_) => report.synced += 1,
            Err(e) => {
                warn!("node sync for {address} failed: {e}");
                report.failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{fast_retry, node, MockChain};
    use rust_decimal::Decimal;

    const WEI: u128 = 1_000_000_000_000_000_000;

    fn setup(chain: MockChain, wallets: &[&str]) -> (BalanceSynchronizer, Arc<Store>, Arc<RankingEngine>, Arc<MockChain>) {
        let store = Arc::new(Store::open_in_memory().unwrap());
        for (i, w) in wallets.iter().enumerate() {
            store.record_sender(&format!("0xtx{i}"), w, 1).unwrap();
        }
        let ranking = Arc::new(RankingEngine::new());
        let chain = Arc::new(chain);
        let sync = BalanceSynchronizer::new(chain.clone(), store.clone(), ranking.clone(), fast_retry(), 2);
        (sync, store, ranking, chain)
    }

    #[tokio::test]
    async fn deleted_nodes_do_not_count() {
        let chain = MockChain::default()
            .with_nodes("0xWallet1", vec![node("n1", 2 * WEI, false), node("n2", 3 * WEI, true)]);
        let (sync, store, ranking, _) = setup(chain, &["0xWallet1"]);

        let balances = sync.sync_wallet("0xWallet1").await.unwrap();
        assert_eq!(balances.total, Some(Decimal::TWO));
        let wallet = store.find_wallet("0xWallet1").unwrap().unwrap();
        assert_eq!(wallet.total, Some(Decimal::TWO));
        assert!(wallet.last_synced.is_some());
        assert_eq!(ranking.rank("0xwallet1", Decimal::ONE).unwrap().rank, 1);
    }

    #[tokio::test]
    async fn wallet_without_active_nodes_leaves_the_ranking() {
        let chain = MockChain::default()
            .with_nodes("0xA", vec![node("n1", WEI, false)])
            .with_nodes("0xB", vec![node("n2", WEI, true)]);
        let (sync, store, ranking, _) = setup(chain, &["0xA", "0xB"]);

        let report = sync.sync_all(&CancellationToken::new()).await.unwrap();
        assert!(report.completed);
        assert_eq!(report.synced, 2);
        assert_eq!(store.find_wallet("0xB").unwrap().unwrap().total, None);
        assert_eq!(ranking.snapshot().len(), 1);
        assert!(ranking.top(10).unwrap().iter().all(|w| w.wallet.address == "0xA"));
    }

    #[tokio::test]
    async fn chain_failure_skips_only_that_wallet() {
        let chain = MockChain::default()
            .with_nodes("0xA", vec![node("n1", WEI, false)])
            .failing("0xB")
            .with_nodes("0xC", vec![node("n3", 3 * WEI, false)]);
        let (sync, store, ranking, _) = setup(chain, &["0xA", "0xB", "0xC"]);

        let report = sync.sync_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.synced, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(store.find_wallet("0xB").unwrap().unwrap().last_synced, None);
        assert_eq!(ranking.rank("0xC", Decimal::ONE).unwrap().rank, 1);
    }

    #[tokio::test]
    async fn interrupted_pass_resumes_from_checkpoint() {
        let chain = MockChain::default();
        let (sync, store, _, chain) = setup(chain, &["0xA", "0xB", "0xC", "0xD", "0xE"]);
        store.set_sync_checkpoint(3).unwrap();

        let report = sync.sync_all(&CancellationToken::new()).await.unwrap();
        assert_eq!(report.resumed_from, 3);
        assert_eq!(report.synced, 2);
        assert_eq!(chain.node_lookups(), ["0xD", "0xE"]);
        assert_eq!(store.sync_checkpoint().unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_pass_records_checkpoint() {
        let (sync, store, _, chain) = setup(MockChain::default(), &["0xA", "0xB"]);
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let report = sync.sync_all(&shutdown).await.unwrap();
        assert!(!report.completed);
        assert!(chain.node_lookups().is_empty());
        assert_eq!(store.sync_checkpoint().unwrap(), 0);
    }

    #[tokio::test]
    async fn explicit_subset_ignores_checkpoint() {
        let (sync, store, _, chain) = setup(MockChain::default(), &["0xA", "0xB", "0xC"]);
        store.set_sync_checkpoint(2).unwrap();

        let report = sync.sync_addresses(&["0xA".to_string()], &CancellationToken::new()).await;
        assert_eq!(report.synced, 1);
        assert_eq!(chain.node_lookups(), ["0xA"]);
        assert_eq!(store.sync_checkpoint().unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_wallet_is_not_found() {
        let (sync, _, _, _) = setup(MockChain::default(), &[]);
        let err = sync.sync_wallet("0xNobody").await.unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn fresh_wallet_is_not_reread() {
        let chain = MockChain::default().with_nodes("0xA", vec![node("n1", WEI, false)]);
        let (sync, store, _, chain) = setup(chain, &["0xA"]);
        sync.sync_wallet("0xA").await.unwrap();
        let wallet = store.find_wallet("0xA").unwrap().unwrap();

        sync.sync_if_stale(&wallet, 600).await.unwrap();
        assert_eq!(chain.node_lookups().len(), 1);
        sync.sync_if_stale(&wallet, 0).await.unwrap();
        assert_eq!(chain.node_lookups().len(), 2);
    }
}
