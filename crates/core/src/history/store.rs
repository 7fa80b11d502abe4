//! History persistence
//!
//! Directory structure:
//! ```text
//! <data_dir>/
//!   history/
//!     {session_id}.jsonl   # one HistoryEntry per line
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::warn;

use super::model::HistoryEntry;
use crate::{Error, Result};

/// Append-only destination for history records
#[async_trait]
pub trait HistorySink: Send + Sync {
    async fn add_entry(&self, entry: HistoryEntry) -> Result<()>;
}

/// History store writing one JSONL file per session
#[derive(Debug, Clone)]
pub struct JsonlHistoryStore {
    base_dir: PathBuf,
}

impl JsonlHistoryStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().join("history"),
        }
    }

    fn session_path(&self, session_id: &str) -> Result<PathBuf> {
        let valid = !session_id.is_empty()
            && session_id
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            && !session_id.starts_with('.');
        if !valid {
            return Err(Error::InvalidInput(format!(
                "Invalid session id for history: {session_id:?}"
            )));
        }
        Ok(self.base_dir.join(format!("{session_id}.jsonl")))
    }

    /// Load every entry recorded for a session, oldest first
    pub async fn list(&self, session_id: &str) -> Result<Vec<HistoryEntry>> {
        let path = self.session_path(session_id)?;
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for (line_num, line) in content.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<HistoryEntry>(line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(
                    "Failed to parse history entry at line {} in {}: {}",
                    line_num,
                    path.display(),
                    e
                ),
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl HistorySink for JsonlHistoryStore {
    async fn add_entry(&self, entry: HistoryEntry) -> Result<()> {
        let path = self.session_path(&entry.session_id)?;
        tokio::fs::create_dir_all(&self.base_dir).await?;

        let mut line = serde_json::to_string(&entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }
}
