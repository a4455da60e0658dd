//! Append-only JSON lines log of completed operations.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::config::Config;
use crate::error::Result;

/// One line of the run log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunLogEntry {
    pub operation: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub config_hash: String,
    pub summary: JsonValue,
}

#[derive(Debug, Clone)]
pub struct RunLog {
    path: PathBuf,
}

impl RunLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one entry, creating the file and its directory if needed.
    pub async fn append(&self, entry: &RunLogEntry) -> Result<()> {
        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(dir).await?;
        }
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Every entry in the file, oldest first. A missing file is empty.
    pub async fn entries(&self) -> Result<Vec<RunLogEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }
}

/// Append `operation` to the run log configured in `config`, if any.
/// Failures only warn.
pub async fn record_run<S: Serialize>(
    config: &Config,
    operation: &str,
    started_at: DateTime<Utc>,
    summary: &S,
) {
    let Some(path) = &config.sync.run_log else {
        return;
    };
    let summary = match serde_json::to_value(summary) {
        Ok(v) => v,
        Err(e) => {
            warn!("Could not serialize {} summary for the run log: {}", operation, e);
            return;
        }
    };
    let entry = RunLogEntry {
        operation: operation.to_string(),
        started_at,
        finished_at: Utc::now(),
        config_hash: config.hash(),
        summary,
    };
    if let Err(e) = RunLog::new(path).append(&entry).await {
        warn!("Could not write run log {}: {}", path.display(), e);
    }
}
