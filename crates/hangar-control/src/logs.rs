//! Per-deployment log sink.
//!
//! Each deployment gets `<dir>/<deployment-id>.log`, holding the output of
//! the infrastructure tool and of every remote step, prefixed by stage.

use std::path::{Path, PathBuf};

use chrono::Utc;
use tokio::io::AsyncWriteExt;
use tracing::warn;

use crate::error::ControlResult;
use crate::types::DeploymentId;

/// Text returned when a deployment has not logged anything.
pub const NO_LOGS: &str = "No logs available";

/// Directory of deployment logs.
#[derive(Debug, Clone)]
pub struct DeploymentLogs {
    dir: PathBuf,
}

impl DeploymentLogs {
    /// Logs stored under `dir`.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Log directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Sink for one deployment.
    #[must_use]
    pub fn sink(&self, id: &DeploymentId) -> DeploymentLog {
        DeploymentLog {
            path: self.dir.join(format!("{id}.log")),
        }
    }

    /// Full log text of a deployment, or [`NO_LOGS`].
    pub async fn read(&self, id: &DeploymentId) -> ControlResult<String> {
        match tokio::fs::read_to_string(self.sink(id).path()).await {
            Ok(text) if !text.is_empty() => Ok(text),
            Ok(_) => Ok(NO_LOGS.to_owned()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(NO_LOGS.to_owned()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Append-only log file of one deployment.
#[derive(Debug, Clone)]
pub struct DeploymentLog {
    path: PathBuf,
}

impl DeploymentLog {
    /// A sink that writes to `path`.
    #[must_use]
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the log file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append `text` line by line, each prefixed with `[stage]`.
    ///
    /// Write failures are reported through tracing and otherwise ignored.
    pub async fn append(&self, stage: &str, text: &str) {
        if let Err(e) = self.try_append(stage, text).await {
            warn!(path = %self.path.display(), error = %e, "failed to write deployment log");
        }
    }

    async fn try_append(&self, stage: &str, text: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
        let mut buffer = String::new();
        for line in text.lines() {
            buffer.push_str(&format!("{timestamp} [{stage}] {line}\n"));
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(buffer.as_bytes()).await?;
        file.flush().await
    }
}
