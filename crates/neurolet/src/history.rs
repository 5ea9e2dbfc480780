//! Persistence of finished batches.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::batch::BatchRun;

/// Entries kept by [`JsonFileHistory`] before the oldest are dropped.
pub const DEFAULT_HISTORY_LIMIT: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("history file {path} is not valid JSON: {source}")]
    Format {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Receives every terminal batch snapshot exactly once.
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn record(&self, run: &BatchRun) -> Result<(), HistoryError>;
}

/// One page of recorded batches, oldest first.
#[derive(Debug, Clone)]
pub struct HistoryPage {
    pub entries: Vec<BatchRun>,
    pub total: usize,
}

/// Keeps finished batches in a single JSON array file.
pub struct JsonFileHistory {
    path: PathBuf,
    max_entries: usize,
    lock: Mutex<()>,
}

impl JsonFileHistory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            max_entries: DEFAULT_HISTORY_LIMIT,
            lock: Mutex::new(()),
        }
    }

    pub fn with_max_entries(mut self, max_entries: usize) -> Self {
        self.max_entries = max_entries.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list(&self, offset: usize, limit: usize) -> Result<HistoryPage, HistoryError> {
        let _guard = self.lock.lock().await;
        let entries = self.load().await?;
        let total = entries.len();
        Ok(HistoryPage {
            entries: entries.into_iter().skip(offset).take(limit).collect(),
            total,
        })
    }

    /// Remove a batch. Returns whether anything was removed.
    pub async fn delete(&self, batch_id: &str) -> Result<bool, HistoryError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|run| run.batch_id != batch_id);
        if entries.len() == before {
            return Ok(false);
        }
        self.store(&entries).await?;
        tracing::debug!(batch_id, "Deleted batch from history");
        Ok(true)
    }

    async fn load(&self) -> Result<Vec<BatchRun>, HistoryError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(HistoryError::Io {
                    path: self.path.clone(),
                    source,
                });
            }
        };
        serde_json::from_slice(&raw).map_err(|source| HistoryError::Format {
            path: self.path.clone(),
            source,
        })
    }

    /// Write via a sibling temp file so readers never see a torn file.
    async fn store(&self, entries: &[BatchRun]) -> Result<(), HistoryError> {
        let io_err = |source| HistoryError::Io {
            path: self.path.clone(),
            source,
        };
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let json = serde_json::to_vec_pretty(entries).map_err(|source| HistoryError::Format {
            path: self.path.clone(),
            source,
        })?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &self.path).await.map_err(io_err)
    }
}

#[async_trait]
impl HistorySink for JsonFileHistory {
    async fn record(&self, run: &BatchRun) -> Result<(), HistoryError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.push(run.clone());
        if entries.len() > self.max_entries {
            let excess = entries.len() - self.max_entries;
            entries.drain(..excess);
        }
        self.store(&entries).await?;
        tracing::debug!(
            batch_id = %run.batch_id,
            path = %self.path.display(),
            entries = entries.len(),
            "Recorded batch in history"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::ResultAggregator;
    use crate::request::{AnalysisOutcome, AnalysisRequest, ErrorKind, ImageSource, Modality};

    fn finished(batch_id: &str) -> BatchRun {
        let request =
            AnalysisRequest::with_id("req_1", ImageSource::path("scan.png"), Modality::Chest);
        let mut aggregator =
            ResultAggregator::new(batch_id, std::slice::from_ref(&request)).unwrap();
        aggregator
            .record(AnalysisOutcome::failed(&request, ErrorKind::Timeout, "timed out", 1))
            .unwrap();
        aggregator.into_run()
    }

    #[tokio::test]
    async fn list_on_missing_file_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonFileHistory::new(dir.path().join("history.json"));
        let page = history.list(0, 50).await.unwrap();
        assert_eq!(page.total, 0);
        assert!(page.entries.is_empty());
    }

    #[tokio::test]
    async fn records_and_pages_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonFileHistory::new(dir.path().join("data").join("history.json"));
        for i in 0..5 {
            history.record(&finished(&format!("batch_{i}"))).await.unwrap();
        }

        let page = history.list(1, 2).await.unwrap();
        assert_eq!(page.total, 5);
        let ids: Vec<&str> = page.entries.iter().map(|r| r.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["batch_1", "batch_2"]);

        let first = history.list(0, 1).await.unwrap();
        let reloaded = &first.entries[0];
        assert_eq!(reloaded.outcomes["req_1"].error_kind, Some(ErrorKind::Timeout));
        assert!(reloaded.finished_at.is_some());
        assert!(!dir.path().join("data").join("history.json.tmp").exists());
    }

    #[tokio::test]
    async fn keeps_only_most_recent_entries() {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonFileHistory::new(dir.path().join("history.json")).with_max_entries(3);
        for i in 0..5 {
            history.record(&finished(&format!("batch_{i}"))).await.unwrap();
        }

        let page = history.list(0, 10).await.unwrap();
        let ids: Vec<&str> = page.entries.iter().map(|r| r.batch_id.as_str()).collect();
        assert_eq!(ids, vec!["batch_2", "batch_3", "batch_4"]);
    }

    #[tokio::test]
    async fn delete_removes_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let history = JsonFileHistory::new(dir.path().join("history.json"));
        history.record(&finished("batch_a")).await.unwrap();
        history.record(&finished("batch_b")).await.unwrap();

        assert!(history.delete("batch_a").await.unwrap());
        assert!(!history.delete("batch_a").await.unwrap());
        let page = history.list(0, 10).await.unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.entries[0].batch_id, "batch_b");
    }

    #[tokio::test]
    async fn corrupt_file_is_a_format_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.json");
        std::fs::write(&path, b"{not json").unwrap();
        let history = JsonFileHistory::new(&path);

        let err = history.record(&finished("batch_a")).await.unwrap_err();
        assert!(matches!(err, HistoryError::Format { .. }));
    }
}
