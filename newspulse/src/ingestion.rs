use anyhow::{Context, Result};
use feed_rs::model::Feed;
use feed_rs::parser;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

use crate::aggregator::FeedItem;

/// Anything that can turn a feed URL into candidate items.
#[async_trait::async_trait]
pub trait FeedSource: Send + Sync {
    /// Fetch and parse one source. Errors cover network, HTTP status, timeout and
    /// malformed feeds alike; the caller decides what to do with them.
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>>;
}

/// Feed source backed by reqwest + feed-rs.
pub struct HttpFeedSource {
    client: Client,
    timeout: Duration,
    summary_chars: usize,
}

impl HttpFeedSource {
    pub fn new(timeout_secs: u64, user_agent: &str, summary_chars: usize) -> Result<Self> {
        let timeout = Duration::from_secs(timeout_secs);
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(user_agent)
            .build()
            .context("failed to build reqwest client")?;

        Ok(Self {
            client,
            timeout,
            summary_chars,
        })
    }
}

#[async_trait::async_trait]
impl FeedSource for HttpFeedSource {
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>> {
        let feed = fetch_and_parse_feed(&self.client, url, self.timeout).await?;
        let items = items_from_feed(&feed, self.summary_chars);
        debug!(source = %url, entries = feed.entries.len(), items = items.len(), "parsed feed");
        Ok(items)
    }
}

/// Fetches a feed from the given URL and parses it.
/// The whole exchange (headers and body) must complete within `timeout`.
/// There is no retry: a failed source is simply skipped for this cycle.
pub async fn fetch_and_parse_feed(client: &Client, url: &str, timeout: Duration) -> Result<Feed> {
    let exchange = async {
        let response = client
            .get(url)
            .send()
            .await
            .context("network error during fetch")?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("feed fetch failed with status: {}", status);
        }

        let bytes = response.bytes().await.context("failed to read response body")?;
        Ok::<_, anyhow::Error>(bytes)
    };

    let bytes = tokio::time::timeout(timeout, exchange)
        .await
        .with_context(|| format!("feed fetch timed out after {:?}", timeout))??;

    parser::parse(bytes.as_ref()).context("failed to parse feed")
}

/// Parse raw feed bytes into display items.
pub fn parse_items(bytes: &[u8], summary_chars: usize) -> Result<Vec<FeedItem>> {
    let feed = parser::parse(bytes).context("failed to parse feed")?;
    Ok(items_from_feed(&feed, summary_chars))
}

fn items_from_feed(feed: &Feed, summary_chars: usize) -> Vec<FeedItem> {
    feed.entries
        .iter()
        .filter_map(|entry| {
            let item = FeedItem::from_entry(entry, summary_chars);
            if item.is_none() {
                debug!(
                    title = ?entry.title.as_ref().map(|t| &t.content),
                    "skipping entry without link"
                );
            }
            item
        })
        .collect()
}
