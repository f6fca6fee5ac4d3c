use std::collections::VecDeque;
use std::path::PathBuf;

use anyhow::{Context, Result};
use gitops_core::deployment::Deployment;
use tokio::sync::Mutex;
use tracing::warn;

/// Newest-last list of finished deployments, optionally persisted as JSON.
pub struct History {
    path: Option<PathBuf>,
    capacity: usize,
    entries: Mutex<VecDeque<Deployment>>,
}

impl History {
    /// History that is never written to disk.
    pub fn in_memory(capacity: usize) -> Self {
        Self {
            path: None,
            capacity: capacity.max(1),
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Loads `path` if it exists. An unreadable file is logged and ignored.
    pub async fn load(path: impl Into<PathBuf>, capacity: usize) -> Self {
        let path = path.into();
        let capacity = capacity.max(1);
        let mut entries: VecDeque<Deployment> = match tokio::fs::read(&path).await {
            Ok(bytes) => match serde_json::from_slice(&bytes) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "ignoring unreadable history");
                    VecDeque::new()
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => VecDeque::new(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "ignoring unreadable history");
                VecDeque::new()
            }
        };
        while entries.len() > capacity {
            entries.pop_front();
        }
        Self {
            path: Some(path),
            capacity,
            entries: Mutex::new(entries),
        }
    }

    /// Appends a finished deployment, dropping the oldest past capacity.
    /// Persisting is best effort.
    pub async fn record(&self, deployment: Deployment) {
        let snapshot = {
            let mut entries = self.entries.lock().await;
            entries.push_back(deployment);
            while entries.len() > self.capacity {
                entries.pop_front();
            }
            entries.clone()
        };
        if let Err(e) = self.persist(&snapshot).await {
            warn!(error = %format!("{e:#}"), "failed to persist history");
        }
    }

    async fn persist(&self, entries: &VecDeque<Deployment>) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let json = serde_json::to_vec_pretty(entries).context("serializing history")?;
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("writing {}", tmp.display()))?;
        tokio::fs::rename(&tmp, path)
            .await
            .with_context(|| format!("renaming {}", tmp.display()))?;
        Ok(())
    }

    /// Oldest first.
    pub async fn list(&self) -> Vec<Deployment> {
        self.entries.lock().await.iter().cloned().collect()
    }

    /// Most recent entry.
    pub async fn last(&self) -> Option<Deployment> {
        self.entries.lock().await.back().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::built_generation;

    fn finished(commit: &str) -> Deployment {
        let mut d = Deployment::start(built_generation(commit, false));
        d.succeed(false, None);
        d
    }

    #[tokio::test]
    async fn keeps_newest_entries() {
        let history = History::in_memory(2);
        for c in ["c1", "c2", "c3"] {
            history.record(finished(c)).await;
        }
        let commits: Vec<_> = history
            .list()
            .await
            .iter()
            .map(|d| d.generation.commit_id().to_string())
            .collect();
        assert_eq!(commits, vec!["c2", "c3"]);
        assert_eq!(history.last().await.unwrap().generation.commit_id(), "c3");
    }

    #[tokio::test]
    async fn survives_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/history.json");

        let history = History::load(&path, 10).await;
        history.record(finished("c1")).await;
        history.record(finished("c2")).await;

        let reloaded = History::load(&path, 10).await;
        assert_eq!(reloaded.list().await, history.list().await);
    }

    #[tokio::test]
    async fn corrupt_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, "not json").unwrap();

        let history = History::load(&path, 10).await;
        assert!(history.list().await.is_empty());
    }
}
