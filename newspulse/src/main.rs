/*
newspulse - single-binary main.rs
This binary runs the periodic digest scheduler and the Telegram command poller in the same process.
*/

use anyhow::{Context, Result};
use clap::Parser;
use common::Config;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use newspulse::commands::CommandLoop;
use newspulse::delivery::{TelegramClient, TELEGRAM_API_BASE};
use newspulse::digest::{DigestComposer, Persona, Sampling};
use newspulse::history::HistoryStore;
use newspulse::ingestion::HttpFeedSource;
use newspulse::llm::remote::{RemoteLlmProvider, DEFAULT_API_URL, DEFAULT_MODEL};
use newspulse::llm::LlmProvider;
use newspulse::recipients::{chat_id_from_env, RecipientRegistry};
use newspulse::scheduler::{run_schedule, Dispatcher, Target, Trigger};

const DEFAULT_LLM_TIMEOUT_SECONDS: u64 = 60;
const DEFAULT_LLM_MAX_TOKENS: usize = 900;
const DEFAULT_LLM_TEMPERATURE: f32 = 0.85;

#[derive(Parser, Debug)]
#[command(name = "newspulse", about = "Newspulse periodic news digest bot")]
struct Args {
    /// Path to config.toml
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Override log level (info, debug, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Run a single broadcast cycle and exit
    #[arg(long)]
    once: bool,

    /// Do not poll Telegram for chat commands (scheduler only)
    #[arg(long)]
    no_commands: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Secrets may live in a local .env file
    dotenv::dotenv().ok();

    let args = Args::parse();

    let filter = EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    // Resolve config paths
    let default_path = PathBuf::from("config.default.toml");

    let override_path = if let Some(p) = args.config {
        if !p.exists() {
            error!(path = ?p, "specified config file not found");
            return Err(anyhow::anyhow!("Config file not found: {}", p.display()));
        }
        Some(p)
    } else {
        let p = PathBuf::from("config.toml");
        if p.exists() { Some(p) } else { None }
    };

    let config = match Config::load_with_defaults(
        if default_path.exists() { Some(&default_path) } else { None },
        override_path.as_deref(),
    )
    .await
    {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %format!("{:#}", e), "failed to load configuration");
            return Err(e);
        }
    };
    info!(default = ?default_path, override = ?override_path, "configuration loaded");

    let sources = config.resolve_sources().await?;
    if sources.is_empty() {
        warn!("no feed sources configured; every digest will be the fallback message");
    }
    info!(sources = sources.len(), "feed sources resolved");

    let history = HistoryStore::load(config.history.path(), config.history.max_entries()).await;

    let token_env = config.telegram.bot_token_env();
    let token = std::env::var(token_env)
        .with_context(|| format!("Telegram bot token env var '{}' not set", token_env))?;
    let telegram = TelegramClient::new(token)
        .with_api_base(config.telegram.api_url.as_deref().unwrap_or(TELEGRAM_API_BASE))
        .with_send_timeout(Duration::from_secs(config.telegram.send_timeout_seconds()));

    let seed: Vec<i64> = config
        .telegram
        .chat_ids
        .iter()
        .copied()
        .chain(chat_id_from_env("TELEGRAM_CHAT_ID"))
        .collect();
    let recipients = Arc::new(RecipientRegistry::load(config.telegram.recipients_path(), seed).await);

    let llm = create_llm_provider(config.llm.as_ref())?;
    let composer = DigestComposer::new(llm, Persona::from_config(&config.persona)).with_sampling(sampling(&config));

    let feeds = HttpFeedSource::new(
        config.fetch_timeout_seconds(),
        config.user_agent(),
        config.digest.summary_chars(),
    )?;

    let dispatcher = Arc::new(Dispatcher::new(
        sources,
        Arc::new(feeds),
        history,
        composer,
        Arc::new(telegram.clone()),
        recipients,
        config.digest.limit(),
    ));

    if args.once {
        info!("Running a single cycle (--once)");
        let report = dispatcher.run_cycle(Trigger::Scheduled, Target::Broadcast).await?;
        info!(
            items = report.items,
            delivered = report.delivered(),
            persisted = report.persisted,
            "single cycle finished"
        );
        return Ok(());
    }

    // The flag stays set, so a task that is mid-cycle sees it when it gets back
    // to its select loop.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    info!("Spawning scheduler task");
    let scheduler_handle = tokio::spawn(run_schedule(
        dispatcher.clone(),
        Duration::from_secs(config.scheduler.interval_minutes() * 60),
        Duration::from_secs(config.scheduler.first_delay_seconds()),
        shutdown_rx.clone(),
    ));

    let mut commands_handle = None;
    if !args.no_commands {
        info!("Spawning command poller task");
        let commands = CommandLoop::new(
            telegram,
            dispatcher.clone(),
            &config.persona,
            config.telegram.poll_timeout_seconds(),
        );
        let c_shutdown = shutdown_rx.clone();
        commands_handle = Some(tokio::spawn(async move { commands.run(c_shutdown).await }));
    } else {
        info!("Command poller disabled via CLI (--no-commands)");
    }

    tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
    info!("ctrl-c received, notifying tasks to shutdown");
    let _ = shutdown_tx.send(true);

    // A task busy in a cycle exits once that cycle ends; give it a grace
    // period, then move on.
    for (name, handle) in [("scheduler", Some(scheduler_handle)), ("commands", commands_handle)] {
        let Some(handle) = handle else { continue };
        match tokio::time::timeout(Duration::from_secs(20), handle).await {
            Ok(Ok(())) => info!(task = name, "task exited cleanly"),
            Ok(Err(join_err)) => error!(task = name, %join_err, "task panicked"),
            Err(_) => info!(task = name, "Timed out waiting for task to exit; continuing shutdown"),
        }
    }

    info!("Shutdown complete");
    Ok(())
}

fn sampling(config: &Config) -> Sampling {
    let remote = config.llm.as_ref().and_then(|l| l.remote.as_ref());
    Sampling {
        temperature: remote.and_then(|r| r.temperature).unwrap_or(DEFAULT_LLM_TEMPERATURE),
        max_tokens: remote.and_then(|r| r.max_tokens),
        timeout_seconds: remote.and_then(|r| r.timeout_seconds),
    }
}

/// Create the LLM provider from configuration. A missing `[llm]` section means
/// the remote adapter with its defaults.
fn create_llm_provider(llm_config: Option<&common::LlmConfig>) -> Result<Arc<dyn LlmProvider>> {
    let adapter = llm_config.and_then(|l| l.adapter.as_deref()).unwrap_or("remote");
    match adapter {
        "remote" => {
            let remote_config = llm_config.and_then(|l| l.remote.as_ref());

            let api_key_env = remote_config
                .and_then(|r| r.api_key_env.as_deref())
                .unwrap_or("OPENAI_API_KEY");
            let api_key = std::env::var(api_key_env)
                .with_context(|| format!("LLM API key env var '{}' not set", api_key_env))?;

            let model = remote_config
                .and_then(|r| r.model.clone())
                .unwrap_or_else(|| DEFAULT_MODEL.to_string());
            let api_url = remote_config
                .and_then(|r| r.api_url.clone())
                .unwrap_or_else(|| DEFAULT_API_URL.to_string());
            let timeout_secs = remote_config
                .and_then(|r| r.timeout_seconds)
                .unwrap_or(DEFAULT_LLM_TIMEOUT_SECONDS);
            let max_tokens = remote_config.and_then(|r| r.max_tokens).unwrap_or(DEFAULT_LLM_MAX_TOKENS);
            let temperature = remote_config.and_then(|r| r.temperature).unwrap_or(DEFAULT_LLM_TEMPERATURE);

            info!(model = %model, api_url = %api_url, "LLM provider initialized");
            let provider = RemoteLlmProvider::new(api_url, api_key, model).with_defaults(
                timeout_secs,
                max_tokens,
                temperature,
            );
            Ok(Arc::new(provider))
        }
        _ => anyhow::bail!("Unknown LLM adapter type: {}", adapter),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::LlmConfig;

    #[test]
    fn only_the_remote_llm_adapter_is_accepted() {
        for adapter in ["none", "local"] {
            let cfg = LlmConfig {
                adapter: Some(adapter.to_string()),
                remote: None,
            };
            let err = create_llm_provider(Some(&cfg)).err().expect("adapter must be rejected");
            assert!(err.to_string().contains("Unknown LLM adapter type"), "{}", err);
        }
    }
}
