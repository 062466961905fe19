//! Durable destinations for audit entries
//!
//! A sink receives entries in chain order from the chain's forwarding task.
//! Sinks store entries exactly as appended (hashes included) so that a
//! reloaded chain can be verified offline.

use super::chain::AuditEntry;
use crate::error::{GateError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};

/// Receives audit entries for storage
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Store one entry
    async fn persist(&self, entry: &AuditEntry) -> Result<()>;

    /// Sink name for logs
    fn name(&self) -> &str;
}

/// In-memory sink for development and testing
#[derive(Default)]
pub struct MemoryAuditSink {
    entries: Arc<RwLock<Vec<AuditEntry>>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything persisted so far
    pub async fn entries(&self) -> Vec<AuditEntry> {
        self.entries.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn persist(&self, entry: &AuditEntry) -> Result<()> {
        self.entries.write().await.push(entry.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Append-only JSONL file sink, one entry per line
///
/// The file is opened once in append mode and shared by every write.
pub struct JsonlAuditSink {
    path: PathBuf,
    file: Mutex<fs::File>,
}

impl JsonlAuditSink {
    /// Create a sink writing to `<dir>/audit.jsonl`, creating `dir` if needed
    pub async fn new(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).await.map_err(|e| {
            GateError::Internal(format!(
                "Failed to create audit directory {}: {}",
                dir.display(),
                e
            ))
        })?;

        let path = dir.join("audit.jsonl");
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| {
                GateError::Internal(format!(
                    "Failed to open audit file {}: {}",
                    path.display(),
                    e
                ))
            })?;
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    /// Path of the JSONL file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every persisted entry back, in file order
    ///
    /// A line that does not parse is an error rather than being skipped:
    /// a silently dropped line would hide tampering from `verify`.
    pub async fn load(&self) -> Result<Vec<AuditEntry>> {
        let file = match fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut lines = BufReader::new(file).lines();
        let mut entries = Vec::new();
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(serde_json::from_str(&line)?);
        }
        Ok(entries)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn persist(&self, entry: &AuditEntry) -> Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn name(&self) -> &str {
        "jsonl"
    }
}
