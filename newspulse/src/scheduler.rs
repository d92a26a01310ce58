use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::select;
use tokio::sync::{watch, Mutex};
use tokio::time::{Duration, Instant, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::aggregator::{fetch_fresh, SourceOutcome};
use crate::delivery::{deliver_all, Deliverer, DeliveryOutcome};
use crate::digest::DigestComposer;
use crate::history::HistoryStore;
use crate::ingestion::FeedSource;
use crate::recipients::RecipientRegistry;

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Scheduled,
    OnDemand,
}

/// Who receives the digest of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Every registered recipient.
    Broadcast,
    /// Only the chat that asked for it.
    Chat(i64),
}

/// Summary of one completed cycle.
#[derive(Debug)]
pub struct CycleReport {
    pub trigger: Trigger,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Fresh items that went into the digest.
    pub items: usize,
    pub is_fallback: bool,
    pub outcomes: Vec<SourceOutcome>,
    pub deliveries: Vec<DeliveryOutcome>,
    /// Whether the history file was written.
    pub persisted: bool,
}

impl CycleReport {
    pub fn delivered(&self) -> usize {
        self.deliveries.iter().filter(|d| d.is_ok()).count()
    }

    pub fn failed_deliveries(&self) -> usize {
        self.deliveries.len() - self.delivered()
    }

    pub fn failed_sources(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o, SourceOutcome::Failed { .. }))
            .count()
    }
}

/// Owns the history and runs aggregate → compose → deliver → persist cycles.
///
/// The history mutex is held for the whole cycle, so a `/pulse` arriving while
/// a scheduled cycle runs waits for it to finish.
pub struct Dispatcher {
    sources: Vec<String>,
    feeds: Arc<dyn FeedSource>,
    history: Mutex<HistoryStore>,
    composer: DigestComposer,
    deliverer: Arc<dyn Deliverer>,
    recipients: Arc<RecipientRegistry>,
    limit: usize,
}

impl Dispatcher {
    pub fn new(
        sources: Vec<String>,
        feeds: Arc<dyn FeedSource>,
        history: HistoryStore,
        composer: DigestComposer,
        deliverer: Arc<dyn Deliverer>,
        recipients: Arc<RecipientRegistry>,
        limit: usize,
    ) -> Self {
        Self {
            sources,
            feeds,
            history: Mutex::new(history),
            composer,
            deliverer,
            recipients,
            limit,
        }
    }

    pub fn recipients(&self) -> &Arc<RecipientRegistry> {
        &self.recipients
    }

    pub fn deliverer(&self) -> &Arc<dyn Deliverer> {
        &self.deliverer
    }

    pub fn composer(&self) -> &DigestComposer {
        &self.composer
    }

    pub fn sources(&self) -> &[String] {
        &self.sources
    }

    /// Number of links currently remembered as delivered.
    pub async fn history_len(&self) -> usize {
        self.history.lock().await.len()
    }

    /// Run one cycle.
    ///
    /// If the digest cannot be composed, the links selected in this cycle are
    /// forgotten, nothing is sent and the history file is left untouched.
    /// Delivery and persistence failures are logged and reported, not returned.
    pub async fn run_cycle(&self, trigger: Trigger, target: Target) -> Result<CycleReport> {
        let mut history = self.history.lock().await;
        let started_at = Utc::now();
        info!(?trigger, ?target, sources = self.sources.len(), "cycle started");

        let fetched = fetch_fresh(&self.sources, self.feeds.as_ref(), &mut history, self.limit).await;

        let message = match self.composer.compose(&fetched.batch).await {
            Ok(message) => message,
            Err(e) => {
                let forgotten = history.forget(fetched.batch.links());
                warn!(?trigger, forgotten, "digest not composed, selection rolled back");
                return Err(e.context("cycle aborted"));
            }
        };

        let recipients = match target {
            Target::Broadcast => self.recipients.list().await,
            Target::Chat(chat_id) => vec![chat_id],
        };
        if recipients.is_empty() {
            warn!("no recipients registered, digest not sent");
        }
        let deliveries = deliver_all(self.deliverer.as_ref(), &recipients, &message.text).await;

        let persisted = match history.persist().await {
            Ok(()) => true,
            Err(e) => {
                warn!(path = %history.path().display(), error = %format!("{:#}", e), "failed to persist history");
                false
            }
        };

        let report = CycleReport {
            trigger,
            started_at,
            finished_at: Utc::now(),
            items: fetched.batch.len(),
            is_fallback: message.is_fallback,
            outcomes: fetched.outcomes,
            deliveries,
            persisted,
        };

        info!(
            ?trigger,
            items = report.items,
            fallback = report.is_fallback,
            failed_sources = report.failed_sources(),
            delivered = report.delivered(),
            failed_deliveries = report.failed_deliveries(),
            persisted = report.persisted,
            history = history.len(),
            elapsed_ms = (report.finished_at - report.started_at).num_milliseconds(),
            "cycle finished"
        );

        Ok(report)
    }
}

/// Resolves once shutdown has been requested, even if the request was sent
/// while the caller was busy elsewhere. A dropped sender counts as a request.
pub async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Broadcast a cycle after `first_delay`, then every `interval`, until
/// shutdown is requested. A failed cycle is logged and the loop carries on.
pub async fn run_schedule(
    dispatcher: Arc<Dispatcher>,
    interval: Duration,
    first_delay: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    info!(
        interval_minutes = interval.as_secs() / 60,
        first_delay_seconds = first_delay.as_secs(),
        "scheduler: started"
    );

    // interval_at panics on a zero period.
    let interval = interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval_at(Instant::now() + first_delay, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        select! {
            // A pending shutdown wins over an overdue tick.
            biased;
            _ = shutdown_requested(&mut shutdown) => {
                info!("scheduler: shutdown requested, exiting loop");
                break;
            }
            _ = ticker.tick() => {
                if let Err(e) = dispatcher.run_cycle(Trigger::Scheduled, Target::Broadcast).await {
                    error!(error = %format!("{:#}", e), "scheduled cycle failed");
                }
            },
        }
    }
}
