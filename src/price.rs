use async_trait::async_trait;
use log::{debug, warn};
use parking_lot::RwLock;
use reqwest::Client;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::retry::RetryPolicy;

#[async_trait]
pub trait PriceSource: Send + Sync {
    /// Current USD price of the reward token.
    async fn fetch_usd_price(&self) -> Result<Decimal>;
}

/// `GET <url>` answering `{ "<token-id>": { "usd": <number> } }`.
pub struct HttpPriceSource {
    client: Client,
    url: String,
    token_id: String,
}

#[derive(Deserialize)]
struct Quote {
    usd: f64,
}

impl HttpPriceSource {
    pub fn new(url: impl Into<String>, token_id: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot build price client: {e}")))?;
        Ok(HttpPriceSource { client, url: url.into(), token_id: token_id.into() })
    }
}

#[async_trait]
impl PriceSource for HttpPriceSource {
    async fn fetch_usd_price(&self) -> Result<Decimal> {
        let quotes: HashMap<String, Quote> = self
            .client
            .get(&self.url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let quote = quotes
            .get(&self.token_id)
            .ok_or_else(|| Error::MalformedResponse(format!("no quote for {}", self.token_id)))?;
        Decimal::try_from(quote.usd)
            .map_err(|e| Error::MalformedResponse(format!("bad price {}: {e}", quote.usd)))
    }
}

/// Last known price with a fallback of 1.0. Never fails.
pub struct PriceOracle {
    source: Arc<dyn PriceSource>,
    retry: RetryPolicy,
    last: RwLock<Option<Decimal>>,
    /// Operator-set price, served instead of fetching while present.
    pinned: RwLock<Option<Decimal>>,
}

impl PriceOracle {
    pub fn new(source: Arc<dyn PriceSource>, retry: RetryPolicy) -> Self {
        PriceOracle { source, retry, last: RwLock::new(None), pinned: RwLock::new(None) }
    }

    pub async fn current_price(&self) -> Decimal {
        let pinned = *self.pinned.read();
        if let Some(price) = pinned {
            return price;
        }
        let source = &self.source;
        match self.retry.run("price fetch", move || source.fetch_usd_price()).await {
            Ok(price) => {
                debug!("price refreshed: {price}");
                *self.last.write() = Some(price);
                price
            }
            Err(e) => {
                let cached = self.cached();
                warn!("price fetch failed, using {cached}: {e}");
                cached
            }
        }
    }

    /// Cached value without touching the network.
    pub fn cached(&self) -> Decimal {
        let pinned = *self.pinned.read();
        let last = *self.last.read();
        pinned.or(last).unwrap_or(Decimal::ONE)
    }

    /// Pin the price to `price`; `None` resumes fetching.
    pub fn set_override(&self, price: Option<Decimal>) -> Result<()> {
        if let Some(p) = price.filter(|p| p.is_sign_negative()) {
            return Err(Error::InvalidInput(format!("price {p} must not be negative")));
        }
        *self.pinned.write() = price;
        if let Some(p) = price {
            *self.last.write() = Some(p);
        }
        Ok(())
    }
}
