use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, ACCEPT_LANGUAGE, ORIGIN, USER_AGENT};
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::models::Transaction;

/// One page of the trade-history feed, in feed order.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPage {
    #[serde(rename = "tradingHistory")]
    pub trades: Vec<Transaction>,
}

impl FeedPage {
    pub fn parse(body: &str) -> Result<Self> {
        serde_json::from_str(body).map_err(|e| Error::MalformedResponse(format!("feed page: {e}")))
    }

    /// Block timestamp of the last record; the next cursor.
    pub fn last_timestamp(&self) -> Option<&str> {
        self.trades.last().map(|t| t.block_timestamp.as_str())
    }
}

#[async_trait]
pub trait FeedClient: Send + Sync {
    /// Fetch the records following `cursor`.
    async fn fetch_page(&self, cursor: &str) -> Result<FeedPage>;
}

/// Feed served over HTTP as `GET <url>?tb=<cursor>`.
pub struct HttpFeedClient {
    client: Client,
    url: String,
}

impl HttpFeedClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        // the feed rejects requests that do not look like a browser
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static("Mozilla/5.0 (Windows NT 10.0; rv:91.0) Gecko/20100101 Firefox/91.0"),
        );
        headers.insert(ORIGIN, HeaderValue::from_static("https://dexscreener.com"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json,text/html;q=0.9,*/*;q=0.8"));
        headers.insert(ACCEPT_LANGUAGE, HeaderValue::from_static("en-US,en;q=0.5"));

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| Error::InvalidInput(format!("cannot build feed client: {e}")))?;
        Ok(HttpFeedClient { client, url: url.into() })
    }
}

#[async_trait]
impl FeedClient for HttpFeedClient {
    async fn fetch_page(&self, cursor: &str) -> Result<FeedPage> {
        let resp = self
            .client
            .get(&self.url)
            .query(&[("tb", cursor)])
            .send()
            .await?
            .error_for_status()?;
        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Err(Error::MalformedResponse("empty feed body".into()));
        }
        FeedPage::parse(&body)
    }
}
