use clap::Args;
use std::time::Duration;

use crate::retry::RetryPolicy;

pub const DEFAULT_FEED_URL: &str =
    "https://io.dexscreener.com/u/trading-history/recent/avalanche/0x4cd20F3e2894Ed1A0F4668d953a98E689c647bfE";
pub const DEFAULT_PRICE_URL: &str =
    "https://api.coingecko.com/api/v3/simple/price?ids=vapornodes&vs_currencies=usd";

/// Settings shared by every subcommand. Each one can also come from the
/// environment or a `.env` file.
#[derive(Args, Debug, Clone)]
pub struct Settings {
    /// SQLite DB path
    #[arg(long, env = "NODE_RANKER_DB", default_value = "data.db", global = true)]
    pub db_path: String,

    /// JSON-RPC endpoint of the chain holding the node storage contract
    #[arg(long, env = "RPC_URL", default_value = "https://api.avax.network/ext/bc/C/rpc", global = true)]
    pub rpc_url: String,

    /// Node storage contract exposing getAllNodes(address)
    #[arg(long, env = "STORAGE_CONTRACT", default_value = "0xCd5E168dA3456cD2d5A8ab400f9cebdDC453720d", global = true)]
    pub storage_contract: String,

    /// Trade-history feed, queried as <url>?tb=<cursor>
    #[arg(long, env = "FEED_URL", default_value = DEFAULT_FEED_URL, global = true)]
    pub feed_url: String,

    #[arg(long, env = "PRICE_URL", default_value = DEFAULT_PRICE_URL, global = true)]
    pub price_url: String,

    /// Key of the reward token in the price response
    #[arg(long, env = "PRICE_TOKEN_ID", default_value = "vapornodes", global = true)]
    pub price_token_id: String,

    /// Timeout of every feed, RPC and price request, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value = "15", global = true)]
    pub request_timeout_secs: u64,

    /// Attempts per network call before it counts as failed
    #[arg(long, env = "RETRY_ATTEMPTS", default_value = "3", global = true)]
    pub retry_attempts: u32,

    /// First retry delay in milliseconds; doubles on each retry
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value = "500", global = true)]
    pub retry_base_delay_ms: u64,

    #[arg(long, env = "RETRY_MAX_DELAY_SECS", default_value = "30", global = true)]
    pub retry_max_delay_secs: u64,

    /// Pause after the feed is caught up, in seconds
    #[arg(long, env = "POLL_INTERVAL_SECS", default_value = "30", global = true)]
    pub poll_interval_secs: u64,

    /// Consecutive failed feed pages before ingestion gives up (0 = never)
    #[arg(long, env = "FEED_FAILURE_BUDGET", default_value = "0", global = true)]
    pub feed_failure_budget: u32,

    /// Persist the sync resume checkpoint every N wallets
    #[arg(long, env = "CHECKPOINT_EVERY", default_value = "25", global = true)]
    pub checkpoint_every: usize,

    /// Skip the on-demand chain read of a rank query when the wallet was
    /// synced less than this many seconds ago (0 = always read)
    #[arg(long, env = "RANK_SYNC_FRESHNESS_SECS", default_value = "0", global = true)]
    pub rank_sync_freshness_secs: u64,

    /// Pause between background epochs, in seconds
    #[arg(long, env = "EPOCH_PAUSE_SECS", default_value = "5", global = true)]
    pub epoch_pause_secs: u64,

    /// Only resynchronize balances in the background loop, skip the feed
    #[arg(long, env = "NO_INGEST", global = true)]
    pub no_ingest: bool,
}

impl Settings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_secs(self.retry_max_delay_secs),
            timeout: self.request_timeout(),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn epoch_pause(&self) -> Duration {
        Duration::from_secs(self.epoch_pause_secs)
    }
}
