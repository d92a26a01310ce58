// Hand-written collaborators shared by the integration tests.
#![allow(dead_code)]

use anyhow::Result;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use newspulse::aggregator::FeedItem;
use newspulse::delivery::Deliverer;
use newspulse::ingestion::FeedSource;
use newspulse::llm::{LlmProvider, LlmRequest, LlmResponse, UsageMetadata};

pub fn item(link: &str) -> FeedItem {
    FeedItem::new(format!("Title {}", link), "summary", link, 180)
}

pub fn link(n: usize) -> String {
    format!("https://news.example/{}", n)
}

/// Serves canned items per source URL and counts calls.
#[derive(Default)]
pub struct StubFeeds {
    feeds: HashMap<String, Vec<FeedItem>>,
    failing: HashSet<String>,
    calls: Mutex<Vec<String>>,
}

impl StubFeeds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_feed(mut self, source: &str, links: &[&str]) -> Self {
        self.feeds
            .insert(source.to_string(), links.iter().map(|l| item(l)).collect());
        self
    }

    pub fn with_failing(mut self, source: &str) -> Self {
        self.failing.insert(source.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_to(&self, source: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|s| *s == source).count()
    }
}

#[async_trait::async_trait]
impl FeedSource for StubFeeds {
    async fn fetch_items(&self, url: &str) -> Result<Vec<FeedItem>> {
        self.calls.lock().unwrap().push(url.to_string());
        if self.failing.contains(url) {
            anyhow::bail!("connection refused: {}", url);
        }
        Ok(self.feeds.get(url).cloned().unwrap_or_default())
    }
}

/// LLM stand-in that either echoes a fixed digest or fails.
pub struct StubLlm {
    reply: Option<String>,
    delay: Option<Duration>,
    calls: AtomicUsize,
    prompts: Mutex<Vec<String>>,
}

impl StubLlm {
    pub fn replying(text: &str) -> Self {
        Self {
            reply: Some(text.to_string()),
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn failing() -> Self {
        Self {
            reply: None,
            delay: None,
            calls: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    /// Answer only after `delay`, to keep a cycle busy.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl LlmProvider for StubLlm {
    async fn generate(&self, request: LlmRequest) -> Result<LlmResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.prompts.lock().unwrap().push(request.prompt);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        match &self.reply {
            Some(text) => Ok(LlmResponse {
                content: text.clone(),
                usage: UsageMetadata::default(),
                model: "stub".to_string(),
            }),
            None => anyhow::bail!("LLM API error 503 Service Unavailable: overloaded"),
        }
    }
}

/// Records every delivery; chats listed in `failing` reject the send.
#[derive(Default)]
pub struct RecordingDeliverer {
    failing: HashSet<i64>,
    sent: Mutex<Vec<(i64, String)>>,
}

impl RecordingDeliverer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_for(chats: &[i64]) -> Self {
        Self {
            failing: chats.iter().copied().collect(),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, chat_id: i64) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| *c == chat_id)
            .map(|(_, t)| t.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl Deliverer for RecordingDeliverer {
    async fn deliver(&self, chat_id: i64, text: &str) -> Result<()> {
        if self.failing.contains(&chat_id) {
            anyhow::bail!("Bad Request: chat not found");
        }
        self.sent.lock().unwrap().push((chat_id, text.to_string()));
        Ok(())
    }
}
