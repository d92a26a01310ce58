use feed_rs::model::Entry;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::history::HistoryStore;
use crate::ingestion::FeedSource;

/// One candidate news item, as shown to the model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    /// Plain text, truncated to the configured display length.
    pub summary: String,
    /// Identity of the item for deduplication.
    pub link: String,
}

impl FeedItem {
    pub fn new(title: impl Into<String>, summary: &str, link: impl Into<String>, summary_chars: usize) -> Self {
        Self {
            title: title.into().trim().to_string(),
            summary: display_summary(summary, summary_chars),
            link: link.into().trim().to_string(),
        }
    }

    /// Build an item from a parsed feed entry. Entries without a link are
    /// rejected since they cannot be deduplicated.
    ///
    /// The link is the entry's page: the `alternate` (or untyped) link, not a
    /// `replies`/`edit`/`self` one. The summary falls back to the full content
    /// when the entry has no summary.
    pub fn from_entry(entry: &Entry, summary_chars: usize) -> Option<Self> {
        let link = page_link(entry)?;
        let title = entry.title.as_ref().map(|t| t.content.as_str()).unwrap_or_default();
        let summary = entry
            .summary
            .as_ref()
            .map(|s| s.content.as_str())
            .filter(|s| !s.trim().is_empty())
            .or_else(|| entry.content.as_ref().and_then(|c| c.body.as_deref()))
            .unwrap_or_default();

        Some(Self::new(title, summary, link, summary_chars))
    }

    /// `**title**`, summary and link on separate lines.
    pub fn display(&self) -> String {
        format!("**{}**\n{}\n{}", self.title, self.summary, self.link)
    }
}

fn page_link(entry: &Entry) -> Option<&str> {
    let non_empty = |href: &str| !href.trim().is_empty();
    entry
        .links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("alternate")) && non_empty(&l.href))
        .or_else(|| entry.links.iter().find(|l| non_empty(&l.href)))
        .map(|l| l.href.trim())
}

/// Reduce markup to plain text, collapse whitespace and cut to `max_chars`.
fn display_summary(raw: &str, max_chars: usize) -> String {
    let text = if raw.contains('<') {
        html2text::from_read(raw.as_bytes(), 1000).unwrap_or_else(|_| raw.to_string())
    } else {
        raw.to_string()
    };

    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(max_chars).collect()
}

/// Fresh items selected for one cycle, in delivery order.
#[derive(Debug, Clone, Default)]
pub struct NewsBatch {
    items: Vec<FeedItem>,
}

impl NewsBatch {
    pub fn new(items: Vec<FeedItem>) -> Self {
        Self { items }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn items(&self) -> &[FeedItem] {
        &self.items
    }

    /// Display strings of every item, in order.
    pub fn entries(&self) -> Vec<String> {
        self.items.iter().map(FeedItem::display).collect()
    }

    pub fn links(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|item| item.link.as_str())
    }
}

/// What happened to one configured source during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Fetched { source: String, items: usize, fresh: usize },
    Failed { source: String, error: String },
    /// The batch was already full before this source came up.
    NotVisited { source: String },
}

impl SourceOutcome {
    pub fn source(&self) -> &str {
        match self {
            SourceOutcome::Fetched { source, .. }
            | SourceOutcome::Failed { source, .. }
            | SourceOutcome::NotVisited { source } => source,
        }
    }
}

/// Result of one aggregation pass.
#[derive(Debug, Clone, Default)]
pub struct FetchReport {
    pub batch: NewsBatch,
    pub outcomes: Vec<SourceOutcome>,
}

impl FetchReport {
    pub fn failed_sources(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SourceOutcome::Failed { .. }))
            .count()
    }

    pub fn visited_sources(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| !matches!(o, SourceOutcome::NotVisited { .. }))
            .count()
    }
}

/// Walk `sources` in order and collect up to `limit` items whose link is not in
/// `history`.
///
/// Every selected link is added to `history` immediately, so a link seen twice
/// in the same pass (even from two different sources) is only selected once.
/// Sources are fetched lazily and the walk stops as soon as the batch is full;
/// a source that fails is recorded and skipped.
pub async fn fetch_fresh(
    sources: &[String],
    feeds: &dyn FeedSource,
    history: &mut HistoryStore,
    limit: usize,
) -> FetchReport {
    let mut items = Vec::with_capacity(limit.min(64));
    let mut outcomes = Vec::with_capacity(sources.len());

    for (idx, source) in sources.iter().enumerate() {
        if items.len() >= limit {
            outcomes.extend(
                sources[idx..]
                    .iter()
                    .map(|s| SourceOutcome::NotVisited { source: s.clone() }),
            );
            break;
        }

        let candidates = match feeds.fetch_items(source).await {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(source = %source, error = %format!("{:#}", e), "feed source skipped");
                outcomes.push(SourceOutcome::Failed {
                    source: source.clone(),
                    error: format!("{:#}", e),
                });
                continue;
            }
        };

        let total = candidates.len();
        let mut fresh = 0;
        for item in candidates {
            if history.contains(&item.link) {
                continue;
            }
            history.add(item.link.clone());
            items.push(item);
            fresh += 1;

            if items.len() >= limit {
                break;
            }
        }

        debug!(source = %source, items = total, fresh, "source scanned");
        outcomes.push(SourceOutcome::Fetched {
            source: source.clone(),
            items: total,
            fresh,
        });
    }

    let report = FetchReport {
        batch: NewsBatch::new(items),
        outcomes,
    };
    info!(
        fresh = report.batch.len(),
        visited = report.visited_sources(),
        failed = report.failed_sources(),
        "aggregation pass finished"
    );
    report
}
