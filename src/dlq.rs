//! Dead-letter queue: on-disk store of terminally failed operations.
//!
//! Every entry is one JSON file under `data/dlq/{operation_type}/{dlq_id}.json`,
//! written atomically. A DLQ entry is the terminal user-facing signal of
//! failure: the email is parked, not lost, and `dlq retry` replays it once
//! the target service recovers.
//!
//! Replay idempotency rests on the `.processed_ids` index: a dlq_id present
//! there is never written to the workspace again, so replaying a completed
//! entry is a no-op. Concurrent replays of the same entry are excluded by a
//! `.lock` marker file next to the entry.
//!
//! Parking is itself resilient: if the DLQ file cannot be written, the
//! failure is logged at ERROR and the pipeline continues; the worst case
//! degrades from "recorded in DLQ" to "recorded only in logs".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tokio::fs;

use crate::breaker::ServiceBreakers;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::internals::fs::{atomic_write_bytes, atomic_write_json, read_json};
use crate::logging::{log_error, log_info, log_warn};

/// Which pipeline step the failed operation belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationType {
    MailFetch,
    LlmExtract,
    WorkspaceWrite,
    SecretFetch,
}

impl OperationType {
    /// Directory name under the DLQ root.
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::MailFetch => "mail_fetch",
            Self::LlmExtract => "llm_extract",
            Self::WorkspaceWrite => "workspace_write",
            Self::SecretFetch => "secret_fetch",
        }
    }

    pub fn all() -> [OperationType; 4] {
        [
            Self::MailFetch,
            Self::LlmExtract,
            Self::WorkspaceWrite,
            Self::SecretFetch,
        ]
    }
}

/// Entry lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Pending,
    Replaying,
    Completed,
    Failed,
}

/// Classified error context captured at park time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ErrorDetails {
    /// Error class label (TRANSIENT / PERMANENT / CRITICAL).
    #[serde(rename = "type")]
    pub error_type: String,
    pub message: String,
    /// Source chain, outermost first.
    pub stack: Vec<String>,
    pub retry_count: u32,
}

impl ErrorDetails {
    pub fn from_error(error: &PipelineError) -> Self {
        let mut stack = Vec::new();
        let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(error);
        while let Some(err) = source {
            stack.push(err.to_string());
            source = err.source();
        }
        Self {
            error_type: error.class().to_string(),
            message: error.to_string(),
            stack,
            retry_count: 0,
        }
    }
}

/// One parked operation with enough context to replay it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DlqEntry {
    pub dlq_id: String,
    pub message_id: String,
    pub operation_type: OperationType,
    pub status: DlqStatus,
    /// Everything the replayer needs to retry the operation.
    pub original_payload: serde_json::Value,
    pub error_details: ErrorDetails,
    pub created_at: DateTime<Utc>,
    pub last_attempt_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replayed_at: Option<DateTime<Utc>>,
    /// Idempotency guard mirrored in the `.processed_ids` index.
    pub processed: bool,
}

impl DlqEntry {
    pub fn new(
        operation_type: OperationType,
        message_id: &str,
        payload: serde_json::Value,
        error: &PipelineError,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            dlq_id: format!(
                "dlq_{}_{}",
                created_at.timestamp_millis(),
                sanitize_id(message_id)
            ),
            message_id: message_id.to_string(),
            operation_type,
            status: DlqStatus::Pending,
            original_payload: payload,
            error_details: ErrorDetails::from_error(error),
            created_at,
            last_attempt_at: created_at,
            replayed_at: None,
            processed: false,
        }
    }
}

/// Keep dlq_ids filesystem-safe regardless of what the mail provider sends.
fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}

/// Outcome of replaying one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayOutcome {
    /// Replayed and recorded; entry marked completed.
    Completed,
    /// Transient failure; retry_count incremented, entry stays pending.
    Updated,
    /// Permanent/critical failure; entry marked failed.
    Failed,
    /// Target breaker open or entry locked by a concurrent replay.
    Skipped,
    /// Entry was already completed; replay is a no-op.
    Noop,
}

/// Totals for a batch replay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReplaySummary {
    pub completed: usize,
    pub updated: usize,
    pub failed: usize,
    pub skipped: usize,
    pub noop: usize,
}

impl ReplaySummary {
    fn count(&mut self, outcome: ReplayOutcome) {
        match outcome {
            ReplayOutcome::Completed => self.completed += 1,
            ReplayOutcome::Updated => self.updated += 1,
            ReplayOutcome::Failed => self.failed += 1,
            ReplayOutcome::Skipped => self.skipped += 1,
            ReplayOutcome::Noop => self.noop += 1,
        }
    }
}

/// Something that can re-execute a parked operation.
#[async_trait]
pub trait ReplayTarget: Send + Sync {
    /// Service key gating this replay (consulted against the breakers).
    fn service(&self) -> &str;

    /// Which operation type this target can replay.
    fn operation_type(&self) -> OperationType;

    /// Re-execute the operation described by `entry`.
    async fn replay(&self, entry: &DlqEntry) -> PipelineResult<()>;
}

/// File-backed dead-letter queue.
#[derive(Debug, Clone)]
pub struct DeadLetterQueue {
    root: PathBuf,
}

impl DeadLetterQueue {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn entry_path(&self, operation_type: OperationType, dlq_id: &str) -> PathBuf {
        self.root
            .join(operation_type.dir_name())
            .join(format!("{dlq_id}.json"))
    }

    fn index_path(&self) -> PathBuf {
        self.root.join(".processed_ids")
    }

    /// Persist an entry atomically.
    pub async fn save(&self, entry: &DlqEntry) -> PipelineResult<()> {
        let path = self.entry_path(entry.operation_type, &entry.dlq_id);
        atomic_write_json(&path, entry).await
    }

    /// Park a failed operation; never fails the caller.
    ///
    /// Returns the entry when it was durably written, `None` when even the
    /// DLQ write failed (already logged at ERROR).
    pub async fn park(
        &self,
        operation_type: OperationType,
        message_id: &str,
        payload: serde_json::Value,
        error: &PipelineError,
    ) -> Option<DlqEntry> {
        let entry = DlqEntry::new(operation_type, message_id, payload, error);
        match self.save(&entry).await {
            Ok(()) => {
                log_info!(
                    dlq_id = %entry.dlq_id,
                    email_id = %message_id,
                    operation = operation_type.dir_name(),
                    category = %error.class(),
                    "Operation parked in DLQ"
                );
                Some(entry)
            }
            Err(save_err) => {
                log_error!(
                    email_id = %message_id,
                    operation = operation_type.dir_name(),
                    original_error = %error,
                    dlq_error = %save_err,
                    "DLQ write failed; operation recorded only in logs"
                );
                None
            }
        }
    }

    /// All entries across operation types, in modification-time order.
    pub async fn list(&self) -> PipelineResult<Vec<DlqEntry>> {
        let mut found: Vec<(std::time::SystemTime, DlqEntry)> = Vec::new();
        for op in OperationType::all() {
            let dir = self.root.join(op.dir_name());
            let mut reader = match fs::read_dir(&dir).await {
                Ok(reader) => reader,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => continue,
                Err(e) => {
                    return Err(PipelineError::storage(dir.display().to_string(), e.to_string()))
                }
            };
            while let Some(dirent) = reader
                .next_entry()
                .await
                .map_err(|e| PipelineError::storage(dir.display().to_string(), e.to_string()))?
            {
                let path = dirent.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let mtime = dirent
                    .metadata()
                    .await
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH);
                match read_json::<DlqEntry>(&path).await {
                    Ok(Some(entry)) => found.push((mtime, entry)),
                    Ok(None) => {}
                    Err(e) => {
                        // One corrupt entry must not hide the rest of the queue.
                        log_warn!(path = %path.display(), error = %e, "Skipping unreadable DLQ entry");
                    }
                }
            }
        }
        found.sort_by_key(|(mtime, _)| *mtime);
        Ok(found.into_iter().map(|(_, entry)| entry).collect())
    }

    /// Look up one entry by id.
    pub async fn get(&self, dlq_id: &str) -> PipelineResult<Option<DlqEntry>> {
        for op in OperationType::all() {
            let path = self.entry_path(op, dlq_id);
            if let Some(entry) = read_json::<DlqEntry>(&path).await? {
                return Ok(Some(entry));
            }
        }
        Ok(None)
    }

    async fn load_processed_ids(&self) -> HashSet<String> {
        match fs::read_to_string(self.index_path()).await {
            Ok(contents) => contents.lines().map(str::to_string).collect(),
            Err(_) => HashSet::new(),
        }
    }

    async fn mark_processed(&self, dlq_id: &str) -> PipelineResult<()> {
        let mut ids = self.load_processed_ids().await;
        ids.insert(dlq_id.to_string());
        let mut lines: Vec<&str> = ids.iter().map(String::as_str).collect();
        lines.sort_unstable();
        atomic_write_bytes(&self.index_path(), format!("{}\n", lines.join("\n")).as_bytes()).await
    }

    /// Replay one entry against `target`, honoring the target's breaker.
    pub async fn replay_entry(
        &self,
        entry: &DlqEntry,
        target: &dyn ReplayTarget,
        breakers: &ServiceBreakers,
    ) -> PipelineResult<ReplayOutcome> {
        if entry.processed
            || entry.status == DlqStatus::Completed
            || self.load_processed_ids().await.contains(&entry.dlq_id)
        {
            return Ok(ReplayOutcome::Noop);
        }

        // A type mismatch must never burn an entry into Failed; skip it and
        // leave it for the right target.
        if entry.operation_type != target.operation_type() {
            log_warn!(
                dlq_id = %entry.dlq_id,
                entry_type = entry.operation_type.dir_name(),
                target_type = target.operation_type().dir_name(),
                "Replay target cannot handle this entry"
            );
            return Ok(ReplayOutcome::Skipped);
        }

        if !breakers.allow(target.service()) {
            log_warn!(
                dlq_id = %entry.dlq_id,
                service = %target.service(),
                circuit_state = %breakers.state(target.service()),
                "Replay skipped, breaker open"
            );
            return Ok(ReplayOutcome::Skipped);
        }

        let lock_path = self
            .entry_path(entry.operation_type, &entry.dlq_id)
            .with_extension("lock");
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&lock_path)
            .await
        {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                log_warn!(dlq_id = %entry.dlq_id, "Replay skipped, entry locked");
                return Ok(ReplayOutcome::Skipped);
            }
            Err(e) => {
                return Err(PipelineError::storage(
                    lock_path.display().to_string(),
                    e.to_string(),
                ))
            }
        }

        let outcome = self.replay_locked(entry, target, breakers).await;
        let _ = fs::remove_file(&lock_path).await;
        outcome
    }

    async fn replay_locked(
        &self,
        entry: &DlqEntry,
        target: &dyn ReplayTarget,
        breakers: &ServiceBreakers,
    ) -> PipelineResult<ReplayOutcome> {
        let mut current = entry.clone();
        current.status = DlqStatus::Replaying;
        current.last_attempt_at = Utc::now();
        self.save(&current).await?;

        match target.replay(&current).await {
            Ok(()) => {
                breakers.record_success(target.service());
                current.status = DlqStatus::Completed;
                current.processed = true;
                current.replayed_at = Some(Utc::now());
                self.mark_processed(&current.dlq_id).await?;
                self.save(&current).await?;
                log_info!(
                    dlq_id = %current.dlq_id,
                    email_id = %current.message_id,
                    "DLQ entry replayed successfully"
                );
                Ok(ReplayOutcome::Completed)
            }
            Err(replay_err) => {
                breakers.record_failure(target.service());
                current.error_details.retry_count += 1;
                current.error_details.message = replay_err.to_string();
                current.error_details.error_type = replay_err.class().to_string();
                let outcome = if replay_err.class() == ErrorClass::Transient {
                    current.status = DlqStatus::Pending;
                    ReplayOutcome::Updated
                } else {
                    current.status = DlqStatus::Failed;
                    ReplayOutcome::Failed
                };
                self.save(&current).await?;
                log_warn!(
                    dlq_id = %current.dlq_id,
                    email_id = %current.message_id,
                    retry_count = current.error_details.retry_count,
                    error = %replay_err,
                    "DLQ replay attempt failed"
                );
                Ok(outcome)
            }
        }
    }

    /// Replay every non-completed entry in modification-time order.
    pub async fn replay_all(
        &self,
        target: &dyn ReplayTarget,
        breakers: &ServiceBreakers,
    ) -> PipelineResult<ReplaySummary> {
        let mut summary = ReplaySummary::default();
        for entry in self.list().await? {
            if entry.operation_type != target.operation_type() {
                continue;
            }
            let outcome = self.replay_entry(&entry, target, breakers).await?;
            summary.count(outcome);
        }
        Ok(summary)
    }
}

/// Expose the DLQ root for status output.
impl DeadLetterQueue {
    pub fn root(&self) -> &Path {
        &self.root
    }
}
