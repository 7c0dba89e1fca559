use log::{error, info, warn};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::chain::ChainClient;
use crate::config::Settings;
use crate::db::Store;
use crate::error::{Error, Result};
use crate::feed::FeedClient;
use crate::indexer::Indexer;
use crate::models::{validate_address, RankResult, RankedWallet, Wallet, WalletCount};
use crate::price::{PriceOracle, PriceSource};
use crate::ranking::RankingEngine;
use crate::retry::{pause, RetryPolicy};
use crate::sync::BalanceSynchronizer;

#[derive(Debug, Clone, Copy)]
pub struct ManagerOptions {
    pub retry: RetryPolicy,
    pub feed_failure_budget: u32,
    pub checkpoint_every: usize,
    pub rank_sync_freshness_secs: u64,
    pub epoch_pause: Duration,
    pub ingest: bool,
}

impl From<&Settings> for ManagerOptions {
    fn from(s: &Settings) -> Self {
        ManagerOptions {
            retry: s.retry_policy(),
            feed_failure_budget: s.feed_failure_budget,
            checkpoint_every: s.checkpoint_every,
            rank_sync_freshness_secs: s.rank_sync_freshness_secs,
            epoch_pause: s.epoch_pause(),
            ingest: !s.no_ingest,
        }
    }
}

/// Owns the store, the in-memory caches and the cancellation token. Shared
/// between the background loop and the query callers.
pub struct DataManager {
    store: Arc<Store>,
    indexer: Indexer,
    synchronizer: BalanceSynchronizer,
    ranking: Arc<RankingEngine>,
    price: PriceOracle,
    options: ManagerOptions,
    shutdown: CancellationToken,
}

impl DataManager {
    pub fn new(
        store: Arc<Store>,
        feed: Arc<dyn FeedClient>,
        chain: Arc<dyn ChainClient>,
        price_source: Arc<dyn PriceSource>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let ranking = Arc::new(RankingEngine::new());
        let ranked = ranking.reload(&store)?;
        info!("loaded {ranked} ranked wallets from the store");

        Ok(DataManager {
            indexer: Indexer::new(
                feed,
                chain.clone(),
                store.clone(),
                options.retry,
                options.feed_failure_budget,
            ),
            synchronizer: BalanceSynchronizer::new(
                chain,
                store.clone(),
                ranking.clone(),
                options.retry,
                options.checkpoint_every,
            ),
            price: PriceOracle::new(price_source, options.retry),
            store,
            ranking,
            options,
            shutdown: CancellationToken::new(),
        })
    }

    pub fn indexer(&self) -> &Indexer {
        &self.indexer
    }

    pub fn synchronizer(&self) -> &BalanceSynchronizer {
        &self.synchronizer
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask the background loop to stop after its current call.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Rank of `address` with the value and cost to the neighboring ranks.
    /// The wallet is re-read from chain first unless it is fresh enough.
    pub async fn get_rank(&self, address: &str) -> Result<RankResult> {
        let address = validate_address(address)?;
        if let Some(wallet) = self.store.find_wallet(address)? {
            if let Err(e) = self
                .synchronizer
                .sync_if_stale(&wallet, self.options.rank_sync_freshness_secs)
                .await
            {
                warn!("on-demand sync for {address} failed, answering from cache: {e}");
            }
        }

        let view = self.ranking.snapshot();
        // fail before paying for a price fetch
        view.rank(address, Decimal::ONE)?;
        let price = self.price.current_price().await;
        view.rank(address, price)
    }

    pub fn get_top_n(&self, n: usize) -> Result<Vec<RankedWallet>> {
        self.ranking.top(n)
    }

    /// Case-insensitive exact match on the address.
    pub fn search_address(&self, address: &str) -> Result<Wallet> {
        let address = validate_address(address)?;
        self.store
            .find_wallet(address)?
            .ok_or_else(|| Error::NotFound(format!("{address} was not found")))
    }

    pub fn get_wallet_count(&self) -> Result<WalletCount> {
        Ok(WalletCount {
            ranked: self.ranking.snapshot().len(),
            known: self.store.wallet_count()?,
        })
    }

    /// Pin the reward-token price, or resume fetching it with `None`.
    pub fn set_price_override(&self, price: Option<Decimal>) -> Result<()> {
        self.price.set_override(price)
    }

    pub async fn current_price(&self) -> Decimal {
        self.price.current_price().await
    }

    /// One epoch: drain the feed, derive new wallets, resync every balance.
    pub async fn run_epoch(&self) -> Result<()> {
        if self.options.ingest {
            self.indexer.drain(&self.shutdown).await?;
            self.indexer.derive_wallets(&self.shutdown).await?;
        }
        self.synchronizer.sync_all(&self.shutdown).await?;
        Ok(())
    }

    /// Background loop, until shutdown. Only an exhausted feed failure budget
    /// ends it early.
    pub async fn run_background(&self) -> Result<()> {
        info!("background synchronization started");
        while !self.shutdown.is_cancelled() {
            match self.run_epoch().await {
                Ok(()) => {}
                Err(e @ (Error::NetworkUnavailable(_) | Error::MalformedResponse(_))) => {
                    error!("feed ingestion abandoned: {e}");
                    return Err(e);
                }
                Err(e) => error!("epoch failed: {e}"),
            }
            if !pause(self.options.epoch_pause, &self.shutdown).await {
                break;
            }
        }
        info!("background synchronization stopped");
        Ok(())
    }
}
