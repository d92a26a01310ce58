use anyhow::{Context, Result};
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Bounded, insertion-ordered set of links that were already delivered.
///
/// The on-disk form is a JSON array of strings, oldest first. Eviction always
/// drops the oldest links, so after `persist` the file holds the newest
/// `max_entries` links.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    path: PathBuf,
    max_entries: usize,
    order: VecDeque<String>,
    index: HashSet<String>,
}

impl HistoryStore {
    /// Empty store bound to `path`. Nothing is read or written.
    pub fn new(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        Self {
            path: path.into(),
            max_entries,
            order: VecDeque::new(),
            index: HashSet::new(),
        }
    }

    /// Read the history file. A missing, unreadable or malformed file yields an
    /// empty store; this never fails.
    pub async fn load(path: impl Into<PathBuf>, max_entries: usize) -> Self {
        let mut store = Self::new(path, max_entries);

        let data = match tokio::fs::read_to_string(&store.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %store.path.display(), "no history file yet, starting empty");
                return store;
            }
            Err(e) => {
                warn!(path = %store.path.display(), %e, "failed to read history file, starting empty");
                return store;
            }
        };

        let links: Vec<String> = match serde_json::from_str(&data) {
            Ok(links) => links,
            Err(e) => {
                warn!(path = %store.path.display(), %e, "history file is malformed, starting empty");
                return store;
            }
        };

        for link in links {
            store.add(link);
        }
        let evicted = store.enforce_bound(max_entries);
        info!(
            path = %store.path.display(),
            links = store.len(),
            evicted,
            "loaded delivery history"
        );
        store
    }

    pub fn contains(&self, link: &str) -> bool {
        self.index.contains(link)
    }

    /// Record `link` as the newest entry. Returns false (and leaves the order
    /// untouched) if it was already known.
    pub fn add(&mut self, link: impl Into<String>) -> bool {
        let link = link.into();
        if self.index.contains(&link) {
            return false;
        }
        self.index.insert(link.clone());
        self.order.push_back(link);
        true
    }

    /// Drop the given links from the history. Returns how many were present.
    pub fn forget<'a, I>(&mut self, links: I) -> usize
    where
        I: IntoIterator<Item = &'a str>,
    {
        let doomed: HashSet<&str> = links
            .into_iter()
            .filter(|link| self.index.contains(*link))
            .collect();
        if doomed.is_empty() {
            return 0;
        }

        self.order.retain(|link| !doomed.contains(link.as_str()));
        for link in &doomed {
            self.index.remove(*link);
        }
        doomed.len()
    }

    /// Evict the oldest links until at most `max` remain. Returns the number evicted.
    pub fn enforce_bound(&mut self, max: usize) -> usize {
        let mut evicted = 0;
        while self.order.len() > max {
            if let Some(oldest) = self.order.pop_front() {
                self.index.remove(&oldest);
                evicted += 1;
            }
        }
        evicted
    }

    /// Apply the configured bound and write the history file.
    ///
    /// The file is replaced through a sibling temp file so a crash mid-write
    /// leaves the previous history intact.
    pub async fn persist(&mut self) -> Result<()> {
        let evicted = self.enforce_bound(self.max_entries);
        let body = serde_json::to_string_pretty(&self.order).context("failed to serialize history")?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("failed to create history directory: {}", parent.display()))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, body)
            .await
            .with_context(|| format!("failed to write history temp file: {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("failed to replace history file: {}", self.path.display()))?;

        debug!(path = %self.path.display(), links = self.order.len(), evicted, "history persisted");
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Links from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(String::as_str)
    }
}
