/*!
common/src/lib.rs

Shared configuration types for newspulse.

This file provides:
- Config data structures (deserialized from TOML)
- An async loader that merges a defaults file with an override file
- Resolution of the ordered feed source list (inline and/or a JSON file)
*/

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::warn;
use url::Url;

pub const DEFAULT_HISTORY_PATH: &str = "sent_links.json";
pub const DEFAULT_MAX_HISTORY: usize = 500;
pub const DEFAULT_BATCH_LIMIT: usize = 7;
pub const DEFAULT_SUMMARY_CHARS: usize = 180;
pub const DEFAULT_INTERVAL_MINUTES: u64 = 240;
pub const DEFAULT_FIRST_DELAY_SECONDS: u64 = 40;
pub const DEFAULT_FETCH_TIMEOUT_SECONDS: u64 = 20;
pub const DEFAULT_USER_AGENT: &str = "newspulse/0.1.0";
pub const DEFAULT_RECIPIENTS_PATH: &str = "chats.json";
pub const DEFAULT_SEND_TIMEOUT_SECONDS: u64 = 15;

const DEFAULT_PERSONA_SYSTEM: &str = "You are Akane, a light-hearted tsundere companion who reads \
the AI news so your reader does not have to. You tease a little, but you clearly care.";

const DEFAULT_PERSONA_INSTRUCTIONS: &str = "Based on the news below, write a digest for your reader:\n\
• an emotional opening line\n\
• the 3-4 most important points, short, each with your own comment\n\
• an overall takeaway\n\
Format: Markdown.\n\n\
News:\n\n{news}";

const DEFAULT_PERSONA_FALLBACK: &str = "It's quiet today… but I'm thinking of you ♥";
const DEFAULT_PERSONA_GREETING: &str = "Akane is here, silly! ♥ Send /pulse if you missed me.";
const DEFAULT_PERSONA_APOLOGY: &str =
    "Hmph… I couldn't put the digest together right now. Try /pulse again a bit later.";

/// Feed sources, in delivery-priority order
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedsConfig {
    /// Inline list of feed URLs
    #[serde(default)]
    pub sources: Vec<String>,
    /// Optional JSON file holding an array of feed URLs (appended after `sources`)
    pub sources_file: Option<String>,
}

/// Delivered-link history
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Path to the JSON history file (e.g. "sent_links.json")
    pub path: Option<String>,
    /// Maximum number of links kept across restarts
    pub max_entries: Option<usize>,
}

impl HistoryConfig {
    pub fn path(&self) -> &str {
        self.path.as_deref().unwrap_or(DEFAULT_HISTORY_PATH)
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries.unwrap_or(DEFAULT_MAX_HISTORY)
    }
}

/// Batch selection and item formatting
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DigestConfig {
    /// Maximum number of fresh items per cycle
    pub limit: Option<usize>,
    /// Display length of an item summary, in characters
    pub summary_chars: Option<usize>,
}

impl DigestConfig {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_BATCH_LIMIT)
    }

    pub fn summary_chars(&self) -> usize {
        self.summary_chars.unwrap_or(DEFAULT_SUMMARY_CHARS)
    }
}

/// Persona texts used by the composer and the chat commands.
///
/// `instructions` must contain a `{news}` placeholder; it is replaced by the
/// numbered list of fresh items.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersonaConfig {
    pub system_prompt: Option<String>,
    pub instructions: Option<String>,
    pub fallback: Option<String>,
    pub greeting: Option<String>,
    pub apology: Option<String>,
}

impl PersonaConfig {
    pub fn system_prompt(&self) -> &str {
        self.system_prompt.as_deref().unwrap_or(DEFAULT_PERSONA_SYSTEM)
    }

    pub fn instructions(&self) -> &str {
        self.instructions.as_deref().unwrap_or(DEFAULT_PERSONA_INSTRUCTIONS)
    }

    pub fn fallback(&self) -> &str {
        self.fallback.as_deref().unwrap_or(DEFAULT_PERSONA_FALLBACK)
    }

    pub fn greeting(&self) -> &str {
        self.greeting.as_deref().unwrap_or(DEFAULT_PERSONA_GREETING)
    }

    pub fn apology(&self) -> &str {
        self.apology.as_deref().unwrap_or(DEFAULT_PERSONA_APOLOGY)
    }
}

/// Scheduler (repeating pulse) configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Minutes between two scheduled pulses
    pub interval_minutes: Option<u64>,
    /// Delay before the first scheduled pulse after startup
    pub first_delay_seconds: Option<u64>,
}

impl SchedulerConfig {
    pub fn interval_minutes(&self) -> u64 {
        self.interval_minutes.unwrap_or(DEFAULT_INTERVAL_MINUTES)
    }

    pub fn first_delay_seconds(&self) -> u64 {
        self.first_delay_seconds.unwrap_or(DEFAULT_FIRST_DELAY_SECONDS)
    }
}

/// Politeness / fetching configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolitenessConfig {
    pub fetch_timeout_seconds: Option<u64>,
    pub user_agent: Option<String>,
}

/// Remote LLM config (used if `llm.adapter = "remote"`)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteLlmConfig {
    pub api_url: Option<String>,
    pub api_key_env: Option<String>,
    pub model: Option<String>,
    pub timeout_seconds: Option<u64>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
}

/// LLM top-level config
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub adapter: Option<String>, // "remote"
    pub remote: Option<RemoteLlmConfig>,
}

/// Telegram bot configuration. The token itself is read from the environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TelegramConfig {
    /// Name of the env var holding the bot token (default TELEGRAM_BOT_TOKEN)
    pub bot_token_env: Option<String>,
    /// Bot API base URL, overridable for local bot API servers
    pub api_url: Option<String>,
    /// Chats that always receive the scheduled pulse
    #[serde(default)]
    pub chat_ids: Vec<i64>,
    /// JSON file where chats registered through /start are kept
    pub recipients_path: Option<String>,
    /// Long-poll timeout for getUpdates, in seconds
    pub poll_timeout_seconds: Option<u64>,
    /// Deadline for one sendMessage request, in seconds
    pub send_timeout_seconds: Option<u64>,
}

impl TelegramConfig {
    pub fn bot_token_env(&self) -> &str {
        self.bot_token_env.as_deref().unwrap_or("TELEGRAM_BOT_TOKEN")
    }

    pub fn recipients_path(&self) -> &str {
        self.recipients_path.as_deref().unwrap_or(DEFAULT_RECIPIENTS_PATH)
    }

    pub fn poll_timeout_seconds(&self) -> u64 {
        self.poll_timeout_seconds.unwrap_or(30)
    }

    pub fn send_timeout_seconds(&self) -> u64 {
        self.send_timeout_seconds.unwrap_or(DEFAULT_SEND_TIMEOUT_SECONDS).max(1)
    }
}

/// Top-level application configuration (deserialized from config.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub feeds: FeedsConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub digest: DigestConfig,
    #[serde(default)]
    pub persona: PersonaConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    pub politeness: Option<PolitenessConfig>,
    pub llm: Option<LlmConfig>,
    #[serde(default)]
    pub telegram: TelegramConfig,
}

impl Config {
    /// Load configuration from a TOML file asynchronously.
    ///
    /// Example:
    ///   let cfg = Config::from_file("config.toml").await?;
    pub async fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let data = tokio::fs::read_to_string(path.as_ref())
            .await
            .with_context(|| format!("Failed to read config file: {}", path.as_ref().display()))?;
        let cfg: Config = toml::from_str(&data).context("Failed to parse TOML configuration")?;
        Ok(cfg)
    }

    /// Load configuration with an optional default file and an optional override file.
    /// If both are present, they are merged (override takes precedence).
    pub async fn load_with_defaults(default_path: Option<&Path>, override_path: Option<&Path>) -> Result<Self> {
        let mut config_value = toml::Value::Table(toml::map::Map::new());

        for path in [default_path, override_path].into_iter().flatten() {
            if !path.exists() {
                continue;
            }
            let data = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("Failed to read config: {}", path.display()))?;
            let val: toml::Value = toml::from_str(&data)
                .with_context(|| format!("Failed to parse configuration: {}", path.display()))?;
            merge_toml(&mut config_value, val);
        }

        let cfg: Config = config_value.try_into().context("Failed to parse merged configuration")?;
        Ok(cfg)
    }

    pub fn fetch_timeout_seconds(&self) -> u64 {
        self.politeness
            .as_ref()
            .and_then(|p| p.fetch_timeout_seconds)
            .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECONDS)
    }

    pub fn user_agent(&self) -> &str {
        self.politeness
            .as_ref()
            .and_then(|p| p.user_agent.as_deref())
            .unwrap_or(DEFAULT_USER_AGENT)
    }

    /// Resolve the ordered source list: inline `feeds.sources` first, then the
    /// entries of `feeds.sources_file`. Invalid URLs are dropped with a warning and
    /// repeated URLs keep their first position.
    pub async fn resolve_sources(&self) -> Result<Vec<String>> {
        let mut raw = self.feeds.sources.clone();

        if let Some(file) = &self.feeds.sources_file {
            let data = tokio::fs::read_to_string(file)
                .await
                .with_context(|| format!("Failed to read sources file: {}", file))?;
            let listed: Vec<String> = serde_json::from_str(&data)
                .with_context(|| format!("Sources file is not a JSON array of URLs: {}", file))?;
            raw.extend(listed);
        }

        Ok(normalize_sources(raw))
    }
}

fn normalize_sources(raw: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    let mut sources = Vec::with_capacity(raw.len());

    for candidate in raw {
        let candidate = candidate.trim().to_string();
        match Url::parse(&candidate) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {
                if seen.insert(candidate.clone()) {
                    sources.push(candidate);
                }
            }
            Ok(url) => warn!(source = %candidate, scheme = url.scheme(), "ignoring feed source with unsupported scheme"),
            Err(e) => warn!(source = %candidate, %e, "ignoring invalid feed source URL"),
        }
    }

    sources
}

fn merge_toml(a: &mut toml::Value, b: toml::Value) {
    match (a, b) {
        (toml::Value::Table(a_map), toml::Value::Table(b_map)) => {
            for (k, v) in b_map {
                if let Some(a_val) = a_map.get_mut(&k) {
                    merge_toml(a_val, v);
                } else {
                    a_map.insert(k, v);
                }
            }
        }
        (a_val, b_val) => *a_val = b_val,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn config_from_string_uses_defaults_for_missing_sections() {
        let toml = r#"
            [feeds]
            sources = ["https://example.com/a.xml"]

            [history]
            max_entries = 42

            [telegram]
            chat_ids = [1001, -2002]
        "#;

        let cfg: Config = toml::from_str(toml).expect("parse config");
        assert_eq!(cfg.feeds.sources.len(), 1);
        assert_eq!(cfg.history.max_entries(), 42);
        assert_eq!(cfg.history.path(), DEFAULT_HISTORY_PATH);
        assert_eq!(cfg.digest.limit(), DEFAULT_BATCH_LIMIT);
        assert_eq!(cfg.digest.summary_chars(), 180);
        assert_eq!(cfg.scheduler.interval_minutes(), 240);
        assert_eq!(cfg.telegram.chat_ids, vec![1001, -2002]);
        assert_eq!(cfg.telegram.bot_token_env(), "TELEGRAM_BOT_TOKEN");
        assert_eq!(cfg.telegram.send_timeout_seconds(), DEFAULT_SEND_TIMEOUT_SECONDS);
        assert_eq!(cfg.fetch_timeout_seconds(), DEFAULT_FETCH_TIMEOUT_SECONDS);
        assert!(cfg.persona.instructions().contains("{news}"));
    }

    #[tokio::test]
    async fn override_file_wins_over_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let default_path = dir.path().join("config.default.toml");
        let override_path = dir.path().join("config.toml");

        std::fs::write(
            &default_path,
            "[digest]\nlimit = 7\nsummary_chars = 180\n[scheduler]\ninterval_minutes = 240\n",
        )
        .expect("write defaults");
        std::fs::write(&override_path, "[digest]\nlimit = 3\n").expect("write override");

        let cfg = Config::load_with_defaults(Some(&default_path), Some(&override_path))
            .await
            .expect("load config");

        assert_eq!(cfg.digest.limit(), 3);
        assert_eq!(cfg.digest.summary_chars(), 180);
        assert_eq!(cfg.scheduler.interval_minutes(), 240);
    }

    #[tokio::test]
    async fn missing_files_yield_default_config() {
        let dir = tempfile::tempdir().expect("tempdir");
        let absent = dir.path().join("nope.toml");

        let cfg = Config::load_with_defaults(Some(&absent), None)
            .await
            .expect("load config");
        assert!(cfg.feeds.sources.is_empty());
        assert_eq!(cfg.history.max_entries(), DEFAULT_MAX_HISTORY);
    }

    #[tokio::test]
    async fn sources_are_merged_deduplicated_and_validated() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        write!(
            file,
            r#"["https://b.example/rss", "https://a.example/feed", "not a url", "ftp://c.example/x"]"#
        )
        .expect("write sources");

        let cfg = Config {
            feeds: FeedsConfig {
                sources: vec!["https://a.example/feed".to_string()],
                sources_file: Some(file.path().to_string_lossy().to_string()),
            },
            ..Config::default()
        };

        let sources = cfg.resolve_sources().await.expect("resolve");
        assert_eq!(sources, vec!["https://a.example/feed", "https://b.example/rss"]);
    }

    #[tokio::test]
    async fn unreadable_sources_file_is_an_error() {
        let cfg = Config {
            feeds: FeedsConfig {
                sources: Vec::new(),
                sources_file: Some("/definitely/not/here.json".to_string()),
            },
            ..Config::default()
        };

        assert!(cfg.resolve_sources().await.is_err());
    }
}
