mod chain;
mod config;
mod db;
mod error;
mod feed;
mod indexer;
mod manager;
mod models;
mod price;
mod ranking;
mod retry;
mod sync;
#[cfg(test)]
mod testutil;

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenv::dotenv;
use log::info;
use rust_decimal::Decimal;
use serde::Serialize;

use crate::chain::EthersChainClient;
use crate::config::Settings;
use crate::db::Store;
use crate::error::ErrorReport;
use crate::feed::HttpFeedClient;
use crate::manager::{DataManager, ManagerOptions};
use crate::price::HttpPriceSource;

#[derive(Parser)]
#[command(author, version, about = "Tracks node ownership per wallet and ranks wallets by node value")]
struct Cli {
    #[command(flatten)]
    settings: Settings,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the background ingestion and balance sync loop until Ctrl-C
    Run,
    /// Drain the trade feed once, then register the new wallets
    Ingest {
        /// Start after this feed timestamp (milliseconds) instead of now, to backfill
        #[arg(long)]
        cursor: Option<String>,
        /// Keep polling the feed until Ctrl-C, without deriving wallets
        #[arg(long)]
        follow: bool,
    },
    /// Resynchronize node balances, of every wallet or of the given ones
    Sync { addresses: Vec<String> },
    /// Rank of an address and the distance to its neighbors
    Rank {
        address: String,
        /// Use this token price instead of fetching one
        #[arg(long)]
        price: Option<Decimal>,
    },
    /// Top wallets by node value (1 to 6000)
    Top { count: usize },
    /// Stored node data of one address
    Search { address: String },
    /// Number of ranked and known wallets
    Count,
    /// Current reward-token price in USD
    Price,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let settings = &cli.settings;

    let store = Arc::new(Store::open(&settings.db_path).with_context(|| format!("opening {}", settings.db_path))?);
    let feed = HttpFeedClient::new(&settings.feed_url, settings.request_timeout())?;
    let chain = EthersChainClient::new(&settings.rpc_url, &settings.storage_contract, settings.request_timeout())?;
    let price = HttpPriceSource::new(&settings.price_url, &settings.price_token_id, settings.request_timeout())?;
    let manager = Arc::new(DataManager::new(
        store.clone(),
        Arc::new(feed),
        Arc::new(chain),
        Arc::new(price),
        ManagerOptions::from(settings),
    )?);

    match cli.command {
        Commands::Run => {
            let mut background = {
                let manager = manager.clone();
                tokio::spawn(async move { manager.run_background().await })
            };
            info!("running, press Ctrl-C to stop");
            tokio::select! {
                res = tokio::signal::ctrl_c() => {
                    res.context("listening for Ctrl-C")?;
                    info!("shutdown requested, finishing in-flight calls");
                    manager.shutdown();
                }
                res = &mut background => return Ok(res??),
            }
            background.await??;
        }

        Commands::Ingest { cursor, follow } => {
            if let Some(cursor) = cursor {
                manager.indexer().set_cursor(cursor);
            }
            let shutdown = manager.shutdown_token();
            if follow {
                let poll = {
                    let manager = manager.clone();
                    let interval = settings.poll_interval();
                    tokio::spawn(async move { manager.indexer().run(interval, &manager.shutdown_token()).await })
                };
                tokio::signal::ctrl_c().await.context("listening for Ctrl-C")?;
                manager.shutdown();
                poll.await??;
                println!("Stopped at cursor {}", manager.indexer().cursor());
                return Ok(());
            }
            let ingested = manager.indexer().drain(&shutdown).await?;
            let derived = manager.indexer().derive_wallets(&shutdown).await?;
            println!(
                "Ingested {} new transactions ({} duplicates) over {} pages, {} stored in total",
                ingested.inserted,
                ingested.duplicates,
                ingested.pages,
                store.transaction_count()?
            );
            println!(
                "Resolved {} senders: {} new wallets, {} lookups failed. Cursor: {}",
                derived.processed,
                derived.new_wallets,
                derived.failed,
                manager.indexer().cursor()
            );
        }

        Commands::Sync { addresses } => {
            let shutdown = manager.shutdown_token();
            let report = if addresses.is_empty() {
                manager.synchronizer().sync_all(&shutdown).await?
            } else {
                manager.synchronizer().sync_addresses(&addresses, &shutdown).await
            };
            println!("Synced {} wallets, {} failed", report.synced, report.failed);
            if report.resumed_from > 0 {
                println!("Resumed an interrupted pass at wallet {}", report.resumed_from);
            }
            if !report.completed {
                println!("Interrupted, the next pass resumes where this one stopped");
            }
        }

        Commands::Rank { address, price } => {
            if price.is_some() {
                manager.set_price_override(price)?;
            }
            print_result(manager.get_rank(&address).await)?;
        }

        Commands::Top { count } => print_result(manager.get_top_n(count))?,

        Commands::Search { address } => print_result(manager.search_address(&address))?,

        Commands::Count => print_result(manager.get_wallet_count())?,

        Commands::Price => {
            let price = manager.current_price().await;
            print_result(Ok(serde_json::json!({ "usd": price })))?;
        }
    }

    Ok(())
}

/// Print a query answer, or its structured error, as JSON.
fn print_result<T: Serialize>(res: error::Result<T>) -> anyhow::Result<()> {
    let json = match &res {
        Ok(value) => serde_json::to_string_pretty(value)?,
        Err(e) => serde_json::to_string_pretty(&ErrorReport::from(e))?,
    };
    println!("{json}");
    Ok(())
}
