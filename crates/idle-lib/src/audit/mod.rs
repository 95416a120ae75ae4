//! Append-only audit trail
//!
//! Every classification, skip, claim and action outcome is recorded here.
//! Entries are kept in a bounded in-memory ring for queries and, when a
//! path is configured, appended to a JSON-lines file. The file is tailed,
//! so processes sharing one path see each other's entries.

use crate::error::IdleResult;
use crate::models::AuditEntry;
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Default number of entries kept in memory
const DEFAULT_MAX_ENTRIES: usize = 50_000;

/// Configuration for the audit log
#[derive(Debug, Clone)]
pub struct AuditConfig {
    pub max_entries: usize,
    /// JSON-lines file for durable entries
    pub path: Option<PathBuf>,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MAX_ENTRIES,
            path: None,
        }
    }
}

pub struct AuditLog {
    entries: RwLock<VecDeque<AuditEntry>>,
    tail: Mutex<Option<Tail>>,
    max_entries: usize,
}

/// Shared JSON-lines file and how far into it the ring has read
struct Tail {
    path: PathBuf,
    writer: File,
    offset: u64,
}

impl AuditLog {
    /// Memory-only log
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(VecDeque::new()),
            tail: Mutex::new(None),
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }

    /// Open the log, replaying any existing file.
    ///
    /// The file may be shared with other processes; their entries are
    /// picked up on every later read or append.
    pub async fn open(config: AuditConfig) -> IdleResult<Self> {
        let log = Self {
            entries: RwLock::new(VecDeque::new()),
            tail: Mutex::new(None),
            max_entries: config.max_entries.max(1),
        };

        if let Some(path) = config.path {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            let writer = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;

            let mut tail = Tail {
                path,
                writer,
                offset: 0,
            };
            log.catch_up(&mut tail).await?;
            info!(
                path = %tail.path.display(),
                entries = log.entries.read().await.len(),
                "Loaded audit log"
            );
            *log.tail.lock().await = Some(tail);
        }

        Ok(log)
    }

    /// Append one entry.
    ///
    /// A failed file append is logged; the in-memory entry is still kept.
    pub async fn record(&self, entry: AuditEntry) {
        debug!(
            instance_id = %entry.instance_id,
            actor = %entry.actor,
            outcome = ?entry.outcome,
            reason = %entry.reason,
            "Audit entry"
        );

        let mut tail = self.tail.lock().await;
        if let Some(tail) = tail.as_mut() {
            match append_line(&mut tail.writer, &entry).await {
                Ok(()) => match self.catch_up(tail).await {
                    Ok(()) => return,
                    Err(e) => warn!(error = %e, "Failed to read back audit log"),
                },
                Err(e) => {
                    warn!(instance_id = %entry.instance_id, error = %e, "Failed to persist audit entry")
                }
            }
        }

        self.push(entry).await;
    }

    /// Pull in entries other writers appended since the last read
    async fn refresh(&self) {
        let mut tail = self.tail.lock().await;
        if let Some(tail) = tail.as_mut() {
            if let Err(e) = self.catch_up(tail).await {
                warn!(path = %tail.path.display(), error = %e, "Failed to read audit log");
            }
        }
    }

    /// Read complete lines past `tail.offset` into the ring
    async fn catch_up(&self, tail: &mut Tail) -> IdleResult<()> {
        let mut file = match File::open(&tail.path).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let len = file.metadata().await?.len();
        if len < tail.offset {
            warn!(path = %tail.path.display(), "Audit log shrank, reading from the start");
            tail.offset = 0;
        }
        if len == tail.offset {
            return Ok(());
        }

        file.seek(SeekFrom::Start(tail.offset)).await?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf).await?;

        // A line still being written by another process is left for next time
        let Some(complete) = buf.iter().rposition(|b| *b == b'\n').map(|i| i + 1) else {
            return Ok(());
        };

        let mut entries = self.entries.write().await;
        for line in buf[..complete].split(|b| *b == b'\n') {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            match serde_json::from_slice::<AuditEntry>(line) {
                Ok(entry) => {
                    while entries.len() >= self.max_entries {
                        entries.pop_front();
                    }
                    entries.push_back(entry);
                }
                Err(e) => warn!(
                    path = %tail.path.display(),
                    error = %e,
                    "Skipping malformed audit line"
                ),
            }
        }
        tail.offset += complete as u64;
        Ok(())
    }

    async fn push(&self, entry: AuditEntry) {
        let mut entries = self.entries.write().await;
        while entries.len() >= self.max_entries {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries for one instance within an optional time range, oldest first
    pub async fn query(
        &self,
        instance_id: &str,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Vec<AuditEntry> {
        self.refresh().await;
        let entries = self.entries.read().await;
        let mut matched: Vec<AuditEntry> = entries
            .iter()
            .filter(|e| e.instance_id == instance_id)
            .filter(|e| from.map_or(true, |from| e.timestamp >= from))
            .filter(|e| to.map_or(true, |to| e.timestamp <= to))
            .cloned()
            .collect();
        matched.sort_by_key(|e| e.timestamp);
        matched
    }

    /// Most recent entries across all instances, newest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditEntry> {
        self.refresh().await;
        let entries = self.entries.read().await;
        entries.iter().rev().take(limit).cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.refresh().await;
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

async fn append_line(file: &mut File, entry: &AuditEntry) -> IdleResult<()> {
    let mut line = serde_json::to_vec(entry)?;
    line.push(b'\n');
    file.write_all(&line).await?;
    file.flush().await?;
    Ok(())
}
