use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Flat set of chat ids that receive the scheduled digest.
///
/// Chats come from config, the environment and `/start`. The whole set is
/// written back whenever `/start` adds a new chat.
pub struct RecipientRegistry {
    path: PathBuf,
    chats: RwLock<BTreeSet<i64>>,
}

impl RecipientRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chats: RwLock::new(BTreeSet::new()),
        }
    }

    /// Load the registry file, then merge in `seed` chats. A missing or
    /// malformed file yields just the seeds.
    pub async fn load(path: impl Into<PathBuf>, seed: impl IntoIterator<Item = i64>) -> Self {
        let path = path.into();
        let mut chats: BTreeSet<i64> = match read_chats(&path).await {
            Ok(Some(chats)) => chats.into_iter().collect(),
            Ok(None) => BTreeSet::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "ignoring unreadable recipients file");
                BTreeSet::new()
            }
        };
        chats.extend(seed);
        info!(path = %path.display(), recipients = chats.len(), "recipients loaded");

        Self {
            path,
            chats: RwLock::new(chats),
        }
    }

    /// Add a chat. Returns true if it was new, in which case the registry is
    /// written back to disk.
    pub async fn register(&self, chat_id: i64) -> Result<bool> {
        let snapshot = {
            let mut chats = self.chats.write().await;
            if !chats.insert(chat_id) {
                return Ok(false);
            }
            chats.iter().copied().collect::<Vec<_>>()
        };

        info!(chat_id, "recipient registered");
        write_chats(&self.path, &snapshot).await?;
        Ok(true)
    }

    pub async fn contains(&self, chat_id: i64) -> bool {
        self.chats.read().await.contains(&chat_id)
    }

    /// All recipients, in ascending id order.
    pub async fn list(&self) -> Vec<i64> {
        self.chats.read().await.iter().copied().collect()
    }

    pub async fn len(&self) -> usize {
        self.chats.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.chats.read().await.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Parse the optional single-chat environment override (`TELEGRAM_CHAT_ID`).
pub fn chat_id_from_env(var: &str) -> Option<i64> {
    let raw = std::env::var(var).ok()?;
    match raw.trim().parse::<i64>() {
        Ok(id) => Some(id),
        Err(_) => {
            warn!(var, value = %raw, "ignoring non-numeric chat id");
            None
        }
    }
}

async fn read_chats(path: &Path) -> Result<Option<Vec<i64>>> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e).with_context(|| format!("failed to read {}", path.display())),
    };
    let chats = serde_json::from_str(&raw).with_context(|| format!("malformed recipients file {}", path.display()))?;
    Ok(Some(chats))
}

async fn write_chats(path: &Path, chats: &[i64]) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let json = serde_json::to_string_pretty(chats).context("failed to serialize recipients")?;
    tokio::fs::write(path, json)
        .await
        .with_context(|| format!("failed to write {}", path.display()))
}
