//! Daemon controller: the scheduler loop with a crash-safe cursor.
//!
//! One process, one cooperative loop. Each cycle fetches mail after the
//! persisted cursor and walks every message through extract → match →
//! classify → map → write, in order. The cursor only advances past a
//! message once its step has concluded (written, skipped, or parked in the
//! DLQ), so a crash at any point reprocesses at most the in-flight message,
//! and duplicate detection makes that reprocessing idempotent.
//!
//! Shutdown: SIGINT and SIGTERM both request a graceful exit; the loop
//! finishes the current email, persists state, and returns. A second signal
//! during shutdown forces immediate exit without advancing the cursor.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::dlq::{DeadLetterQueue, OperationType};
use crate::entities::EmailMessage;
use crate::error::{ErrorClass, PipelineError, PipelineResult};
use crate::internals::fs::{atomic_write_json, read_json};
use crate::logging::{log_critical, log_error, log_info, log_warn};
use crate::mail::MailAdapter;
use crate::orchestrator::Orchestrator;
use crate::workspace::{
    person_confidence_level, CollabRecord, CompanyMatcher, PersonMatcher, WorkspaceCaches,
    WriteStatus, Writer,
};

/// Daemon lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DaemonStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
    Error,
}

/// Crash-safe daemon state, persisted atomically after every cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonState {
    pub last_processed_message_id: Option<String>,
    pub last_cycle_at: Option<DateTime<Utc>>,
    pub cycles_completed: u64,
    pub emails_processed: u64,
    pub error_count: u64,
    pub current_status: DaemonStatus,
    pub pid: u32,
    pub cycle_interval_ms: u64,
}

impl DaemonState {
    fn fresh(cycle_interval_ms: u64) -> Self {
        Self {
            last_processed_message_id: None,
            last_cycle_at: None,
            cycles_completed: 0,
            emails_processed: 0,
            error_count: 0,
            current_status: DaemonStatus::Starting,
            pid: std::process::id(),
            cycle_interval_ms,
        }
    }

    /// Read persisted state as-is, without adopting it for a new process.
    /// Used by the status command.
    pub async fn peek(path: &std::path::Path) -> Option<Self> {
        read_json::<DaemonState>(path).await.ok().flatten()
    }

    /// Load persisted state or start fresh. A state file still marked
    /// running/stopping means the previous process crashed; the cursor
    /// remains authoritative and reprocessing from it is safe.
    pub async fn load_or_new(path: &std::path::Path, cycle_interval_ms: u64) -> Self {
        match read_json::<DaemonState>(path).await {
            Ok(Some(mut state)) => {
                if matches!(
                    state.current_status,
                    DaemonStatus::Running | DaemonStatus::Stopping
                ) {
                    log_warn!(
                        previous_pid = state.pid,
                        cursor = state.last_processed_message_id.as_deref().unwrap_or("-"),
                        "Previous daemon did not shut down cleanly, resuming from cursor"
                    );
                }
                state.current_status = DaemonStatus::Starting;
                state.pid = std::process::id();
                state.cycle_interval_ms = cycle_interval_ms;
                state
            }
            Ok(None) => Self::fresh(cycle_interval_ms),
            Err(e) => {
                log_error!(path = %path.display(), error = %e, "Daemon state unreadable, starting fresh");
                Self::fresh(cycle_interval_ms)
            }
        }
    }
}

/// What happened to one message in a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    /// Written (created or updated) to the workspace.
    Written,
    /// Duplicate skipped.
    Skipped,
    /// Parked in the DLQ; still terminal for cursor purposes.
    Parked,
    /// Not terminal: the DLQ write itself failed. The cursor must not
    /// advance past this message.
    NotAdvanced,
}

/// Per-cycle totals for the summary log line.
#[derive(Debug, Default, Clone, Copy)]
pub struct CycleReport {
    pub fetched: usize,
    pub written: usize,
    pub skipped: usize,
    pub parked: usize,
    pub stalled: usize,
}

/// Owns the loop, the state file, and the shutdown channel.
pub struct DaemonController {
    config: AppConfig,
    mail: Arc<dyn MailAdapter>,
    orchestrator: Arc<Orchestrator>,
    caches: Arc<WorkspaceCaches>,
    company_matcher: CompanyMatcher,
    person_matcher: PersonMatcher,
    writer: Writer,
    dlq: DeadLetterQueue,
    state_path: PathBuf,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl DaemonController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: AppConfig,
        mail: Arc<dyn MailAdapter>,
        orchestrator: Arc<Orchestrator>,
        caches: Arc<WorkspaceCaches>,
        company_matcher: CompanyMatcher,
        person_matcher: PersonMatcher,
        writer: Writer,
        dlq: DeadLetterQueue,
        shutdown_tx: watch::Sender<bool>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        let state_path = config.daemon.state_path();
        Self {
            config,
            mail,
            orchestrator,
            caches,
            company_matcher,
            person_matcher,
            writer,
            dlq,
            state_path,
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Sender half of the shutdown channel, for signal handlers and tests.
    pub fn shutdown_handle(&self) -> watch::Sender<bool> {
        self.shutdown_tx.clone()
    }

    fn shutdown_requested(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    async fn persist_state(&self, state: &DaemonState) {
        if let Err(e) = atomic_write_json(&self.state_path, state).await {
            log_error!(path = %self.state_path.display(), error = %e, "Daemon state persistence failed");
        }
    }

    /// Discover the workspace schema once per session. Failure is not
    /// fatal: select-option validation is server-side anyway, and the
    /// cache retries lazily on the next read.
    async fn warm_schema(&self) {
        match self.caches.schema().await {
            Ok(tree) => log_info!(
                properties = tree.root.properties.len(),
                related_databases = tree.related.len(),
                "Workspace schema discovered"
            ),
            Err(e) => log_warn!(error = %e, "Schema discovery failed, continuing"),
        }
    }

    /// Run exactly one cycle and return its report.
    pub async fn run_once(&self) -> PipelineResult<CycleReport> {
        let mut state = DaemonState::load_or_new(
            &self.state_path,
            self.config.daemon.cycle_interval_ms,
        )
        .await;
        state.current_status = DaemonStatus::Running;
        self.persist_state(&state).await;
        self.warm_schema().await;

        let report = self.run_cycle(&mut state).await;

        state.current_status = DaemonStatus::Stopped;
        self.persist_state(&state).await;
        report
    }

    /// Run the scheduler loop until shutdown.
    pub async fn run_forever(&self) -> PipelineResult<()> {
        let mut state = DaemonState::load_or_new(
            &self.state_path,
            self.config.daemon.cycle_interval_ms,
        )
        .await;
        state.current_status = DaemonStatus::Running;
        self.persist_state(&state).await;
        log_info!(
            pid = state.pid,
            cycle_interval_ms = self.config.daemon.cycle_interval_ms,
            cursor = state.last_processed_message_id.as_deref().unwrap_or("-"),
            "Daemon started"
        );
        self.warm_schema().await;

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            if let Err(e) = self.run_cycle(&mut state).await {
                state.error_count += 1;
                state.current_status = DaemonStatus::Error;
                self.persist_state(&state).await;
                log_error!(error = %e, "Cycle failed");
                state.current_status = DaemonStatus::Running;
            }

            if self.shutdown_requested() {
                break;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.daemon.cycle_interval()) => {}
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        state.current_status = DaemonStatus::Stopping;
        self.persist_state(&state).await;
        log_info!("Daemon stopping gracefully");
        state.current_status = DaemonStatus::Stopped;
        self.persist_state(&state).await;
        Ok(())
    }

    async fn run_cycle(&self, state: &mut DaemonState) -> PipelineResult<CycleReport> {
        let cycle_id = Uuid::new_v4();
        let cycle_started = std::time::Instant::now();
        let mut report = CycleReport::default();

        let messages = self
            .mail
            .fetch(state.last_processed_message_id.as_deref())
            .await?;
        report.fetched = messages.len();
        log_info!(
            cycle_id = %cycle_id,
            fetched = messages.len(),
            cursor = state.last_processed_message_id.as_deref().unwrap_or("-"),
            "Cycle started"
        );

        for email in &messages {
            let outcome = self.process_message(cycle_id, email).await;
            match outcome {
                ItemOutcome::Written => {
                    report.written += 1;
                    state.emails_processed += 1;
                }
                ItemOutcome::Skipped => {
                    report.skipped += 1;
                    state.emails_processed += 1;
                }
                ItemOutcome::Parked => {
                    report.parked += 1;
                    state.error_count += 1;
                }
                ItemOutcome::NotAdvanced => {
                    // The cursor cannot legally pass this message; later
                    // messages wait for the next cycle.
                    report.stalled = messages.len() - (report.written + report.skipped + report.parked);
                    state.error_count += 1;
                    break;
                }
            }
            state.last_processed_message_id = Some(email.message_id.clone());

            if self.shutdown_requested() {
                log_info!(cycle_id = %cycle_id, "Shutdown requested, ending cycle early");
                break;
            }
        }

        state.cycles_completed += 1;
        state.last_cycle_at = Some(Utc::now());
        self.persist_state(state).await;

        log_info!(
            cycle_id = %cycle_id,
            duration_ms = cycle_started.elapsed().as_millis() as u64,
            fetched = report.fetched,
            written = report.written,
            skipped = report.skipped,
            parked = report.parked,
            stalled = report.stalled,
            "Cycle completed"
        );
        Ok(report)
    }

    /// Steps b–f for one message. Never returns an error: every failure
    /// path resolves to a terminal outcome or an explicit NotAdvanced.
    async fn process_message(&self, cycle_id: Uuid, email: &EmailMessage) -> ItemOutcome {
        let strategy = self.config.orchestrator.strategy;

        // b. Extract entities.
        let entities = match self.orchestrator.extract(email, strategy).await {
            Ok(entities) => entities,
            Err(e) => {
                return self
                    .park_or_stall(
                        OperationType::LlmExtract,
                        email,
                        serde_json::json!({ "email": email }),
                        e,
                    )
                    .await;
            }
        };

        // c. Resolve companies and the person in charge.
        let matched = async {
            let company = self
                .company_matcher
                .match_company(
                    entities.company_name.as_deref(),
                    true,
                    crate::workspace::matcher::COMPANY_THRESHOLD,
                )
                .await?;
            let partner = self
                .company_matcher
                .match_company(
                    entities.partner_org.as_deref(),
                    true,
                    crate::workspace::matcher::COMPANY_THRESHOLD,
                )
                .await?;
            let person = self
                .person_matcher
                .match_person(
                    entities.person_in_charge.as_deref(),
                    crate::workspace::matcher::PERSON_THRESHOLD,
                )
                .await?;
            Ok::<_, PipelineError>((company, partner, person))
        }
        .await;
        let (company_match, partner_match, person_match) = match matched {
            Ok(matches) => matches,
            Err(e) => {
                return self
                    .park_or_stall(
                        OperationType::WorkspaceWrite,
                        email,
                        serde_json::json!({ "email": email, "entities": entities }),
                        e,
                    )
                    .await;
            }
        };

        // d. Classification and summary.
        let companies = match self.caches.companies().await {
            Ok(companies) => companies,
            Err(e) => {
                return self
                    .park_or_stall(
                        OperationType::WorkspaceWrite,
                        email,
                        serde_json::json!({ "email": email, "entities": entities }),
                        e,
                    )
                    .await;
            }
        };
        let classified = async {
            let classification = crate::classify::classify(
                &self.orchestrator,
                &entities,
                &company_match,
                &partner_match,
                &companies,
                strategy,
            )
            .await?;
            let summary =
                crate::classify::summarize(&self.orchestrator, email, &entities, strategy).await?;
            Ok::<_, PipelineError>((classification, summary))
        }
        .await;
        let (classification, summary) = match classified {
            Ok(result) => result,
            Err(e) => {
                return self
                    .park_or_stall(
                        OperationType::LlmExtract,
                        email,
                        serde_json::json!({ "email": email, "entities": entities }),
                        e,
                    )
                    .await;
            }
        };

        // e. Map and write.
        let record = CollabRecord {
            email: email.clone(),
            entities,
            classification,
            summary,
            company_match: company_match.clone(),
            partner_match,
            person_match: person_match.clone(),
        };
        let result = match self.writer.create_entry(&record).await {
            Ok(result) => result,
            Err(e) => {
                log_error!(
                    cycle_id = %cycle_id,
                    email_id = %email.message_id,
                    category = %e.class(),
                    error = %e,
                    "Write not concluded, message retained for next cycle"
                );
                return ItemOutcome::NotAdvanced;
            }
        };

        // f. Cycle-item log line.
        log_info!(
            cycle_id = %cycle_id,
            email_id = %email.message_id,
            strategy = %strategy,
            provider = %record.entities.provenance.provider_name,
            collab_type = record.classification.collab_type.code(),
            intensity = record.classification.intensity.label(),
            company = %record.company_match.matched_name,
            company_confidence = ?record.company_match.confidence_level,
            person_confidence = ?person_confidence_level(
                person_match.match_type,
                person_match.similarity,
                person_match.is_ambiguous,
            ),
            write_status = ?result.status,
            page_id = result.page_id.as_deref().unwrap_or("-"),
            "Message processed"
        );

        match result.status {
            WriteStatus::Created | WriteStatus::Updated => ItemOutcome::Written,
            WriteStatus::Skipped => ItemOutcome::Skipped,
            WriteStatus::Parked => ItemOutcome::Parked,
        }
    }

    /// Park a failed step; if even the DLQ write fails, hold the cursor.
    async fn park_or_stall(
        &self,
        operation_type: OperationType,
        email: &EmailMessage,
        payload: serde_json::Value,
        error: PipelineError,
    ) -> ItemOutcome {
        if error.class() == ErrorClass::Critical {
            log_critical!(
                email_id = %email.message_id,
                category = "CRITICAL",
                error = %error,
                "Critical failure in pipeline step"
            );
        }
        match self
            .dlq
            .park(operation_type, &email.message_id, payload, &error)
            .await
        {
            Some(_) => ItemOutcome::Parked,
            None => ItemOutcome::NotAdvanced,
        }
    }
}

/// Install SIGINT/SIGTERM handling: first signal requests graceful
/// shutdown, a second forces immediate exit.
pub fn install_signal_handlers(shutdown_tx: watch::Sender<bool>) {
    tokio::spawn(async move {
        wait_for_signal().await;
        log_warn!("Shutdown signal received, finishing current email");
        let _ = shutdown_tx.send(true);
        wait_for_signal().await;
        log_error!("Second shutdown signal, forcing exit");
        std::process::exit(130);
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut interrupt = match signal(SignalKind::interrupt()) {
        Ok(stream) => stream,
        Err(e) => {
            log_error!(error = %e, "SIGINT handler unavailable");
            return std::future::pending().await;
        }
    };
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(stream) => stream,
        Err(e) => {
            log_error!(error = %e, "SIGTERM handler unavailable");
            return std::future::pending().await;
        }
    };
    tokio::select! {
        _ = interrupt.recv() => {}
        _ = terminate.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    if tokio::signal::ctrl_c().await.is_err() {
        std::future::pending::<()>().await;
    }
}
