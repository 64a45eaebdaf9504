//! Replay of parked pipeline operations.
//!
//! A DLQ entry's payload is the context that existed when the step failed:
//! a finished `properties` object (with `page_id` when an update failed),
//! a full `record`, or just the `email` plus whatever `entities` had been
//! extracted. [`PipelineReplayer`] resumes from whichever of those it
//! finds, re-running the remaining pipeline steps, and the duplicate check
//! keeps every path idempotent.
//!
//! Two [`ReplayTarget`]s share the core: [`WorkspaceWriteReplayer`] for
//! `workspace_write` entries and [`LlmExtractReplayer`] for `llm_extract`
//! entries. Both gate on the workspace breaker (the write destination);
//! per-provider LLM breakers are enforced inside the orchestrator itself.
//! `mail_fetch` and `secret_fetch` entries are not replayed here: those
//! operations re-enter naturally on the daemon's next cycle.

use async_trait::async_trait;
use std::sync::Arc;

use crate::classify::{classify, summarize};
use crate::config::WorkspaceSettings;
use crate::dlq::{DlqEntry, OperationType, ReplayTarget};
use crate::entities::{EmailMessage, ExtractedEntities, Strategy};
use crate::error::{service, PipelineError, PipelineResult};
use crate::logging::log_info;
use crate::orchestrator::Orchestrator;
use crate::workspace::mapper::{build_properties, PROP_MESSAGE_ID};
use crate::workspace::matcher::{COMPANY_THRESHOLD, PERSON_THRESHOLD};
use crate::workspace::{
    CollabRecord, CompanyMatcher, PersonMatcher, WorkspaceCaches, WorkspaceClient,
};

/// Shared machinery for resuming a parked email from any pipeline stage.
pub struct PipelineReplayer {
    orchestrator: Arc<Orchestrator>,
    caches: Arc<WorkspaceCaches>,
    company_matcher: CompanyMatcher,
    person_matcher: PersonMatcher,
    client: Arc<WorkspaceClient>,
    settings: WorkspaceSettings,
    strategy: Strategy,
}

impl PipelineReplayer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        orchestrator: Arc<Orchestrator>,
        caches: Arc<WorkspaceCaches>,
        company_matcher: CompanyMatcher,
        person_matcher: PersonMatcher,
        client: Arc<WorkspaceClient>,
        settings: WorkspaceSettings,
        strategy: Strategy,
    ) -> Self {
        Self {
            orchestrator,
            caches,
            company_matcher,
            person_matcher,
            client,
            settings,
            strategy,
        }
    }

    async fn find_existing(&self, message_id: &str) -> PipelineResult<Option<String>> {
        Ok(self
            .client
            .find_by_message_id(&self.settings.collaborations_db_id, PROP_MESSAGE_ID, message_id)
            .await?
            .map(|page| page.id))
    }

    /// Land a finished properties payload: update in place when the failed
    /// operation was an update, otherwise duplicate-check then create.
    async fn write_properties(
        &self,
        entry: &DlqEntry,
        properties: serde_json::Value,
        page_id: Option<&str>,
    ) -> PipelineResult<()> {
        if let Some(page_id) = page_id {
            self.client.update_page(page_id, properties).await?;
            log_info!(
                dlq_id = %entry.dlq_id,
                email_id = %entry.message_id,
                page_id = %page_id,
                "Parked update written on replay"
            );
            return Ok(());
        }

        if let Some(existing) = self.find_existing(&entry.message_id).await? {
            log_info!(
                dlq_id = %entry.dlq_id,
                email_id = %entry.message_id,
                page_id = %existing,
                "Record already present, replay is a no-op"
            );
            return Ok(());
        }

        let page = self
            .client
            .create_page(&self.settings.collaborations_db_id, properties)
            .await?;
        log_info!(
            dlq_id = %entry.dlq_id,
            email_id = %entry.message_id,
            page_id = %page.id,
            "Parked record written on replay"
        );
        Ok(())
    }

    /// Resume steps b–e from an email, reusing extracted entities when the
    /// payload carried them. Errors propagate so the DLQ can update the
    /// entry instead of parking a park.
    async fn complete_from_email(
        &self,
        entry: &DlqEntry,
        email: EmailMessage,
        entities: Option<ExtractedEntities>,
    ) -> PipelineResult<()> {
        if let Some(existing) = self.find_existing(&entry.message_id).await? {
            log_info!(
                dlq_id = %entry.dlq_id,
                email_id = %entry.message_id,
                page_id = %existing,
                "Record already present, replay is a no-op"
            );
            return Ok(());
        }

        let entities = match entities {
            Some(entities) => entities,
            None => self.orchestrator.extract(&email, self.strategy).await?,
        };

        let company_match = self
            .company_matcher
            .match_company(entities.company_name.as_deref(), true, COMPANY_THRESHOLD)
            .await?;
        let partner_match = self
            .company_matcher
            .match_company(entities.partner_org.as_deref(), true, COMPANY_THRESHOLD)
            .await?;
        let person_match = self
            .person_matcher
            .match_person(entities.person_in_charge.as_deref(), PERSON_THRESHOLD)
            .await?;

        let companies = self.caches.companies().await?;
        let classification = classify(
            &self.orchestrator,
            &entities,
            &company_match,
            &partner_match,
            &companies,
            self.strategy,
        )
        .await?;
        let summary = summarize(&self.orchestrator, &email, &entities, self.strategy).await?;

        let record = CollabRecord {
            email,
            entities,
            classification,
            summary,
            company_match,
            partner_match,
            person_match,
        };
        let properties = build_properties(&record)?;
        self.write_properties(entry, properties, None).await
    }

    /// Resume from whatever context the payload holds.
    async fn replay_payload(&self, entry: &DlqEntry) -> PipelineResult<()> {
        let payload = &entry.original_payload;

        if let Some(properties) = payload.get("properties") {
            let page_id = payload.get("page_id").and_then(|p| p.as_str());
            return self
                .write_properties(entry, properties.clone(), page_id)
                .await;
        }

        if let Some(record) = payload.get("record") {
            let record: CollabRecord = serde_json::from_value(record.clone()).map_err(|e| {
                PipelineError::validation(format!(
                    "DLQ entry {} carries an unreadable record: {e}",
                    entry.dlq_id
                ))
            })?;
            let properties = build_properties(&record)?;
            return self.write_properties(entry, properties, None).await;
        }

        if let Some(email) = payload.get("email") {
            let email: EmailMessage = serde_json::from_value(email.clone()).map_err(|e| {
                PipelineError::validation(format!(
                    "DLQ entry {} carries an unreadable email: {e}",
                    entry.dlq_id
                ))
            })?;
            let entities = match payload.get("entities") {
                Some(value) => Some(serde_json::from_value(value.clone()).map_err(|e| {
                    PipelineError::validation(format!(
                        "DLQ entry {} carries unreadable entities: {e}",
                        entry.dlq_id
                    ))
                })?),
                None => None,
            };
            return self.complete_from_email(entry, email, entities).await;
        }

        Err(PipelineError::validation(format!(
            "DLQ entry {} carries no replayable payload",
            entry.dlq_id
        )))
    }
}

/// Replays `workspace_write` entries.
pub struct WorkspaceWriteReplayer {
    core: Arc<PipelineReplayer>,
}

impl WorkspaceWriteReplayer {
    pub fn new(core: Arc<PipelineReplayer>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ReplayTarget for WorkspaceWriteReplayer {
    fn service(&self) -> &str {
        service::WORKSPACE
    }

    fn operation_type(&self) -> OperationType {
        OperationType::WorkspaceWrite
    }

    async fn replay(&self, entry: &DlqEntry) -> PipelineResult<()> {
        self.core.replay_payload(entry).await
    }
}

/// Replays `llm_extract` entries by re-running the pipeline from the email.
pub struct LlmExtractReplayer {
    core: Arc<PipelineReplayer>,
}

impl LlmExtractReplayer {
    pub fn new(core: Arc<PipelineReplayer>) -> Self {
        Self { core }
    }
}

#[async_trait]
impl ReplayTarget for LlmExtractReplayer {
    fn service(&self) -> &str {
        service::WORKSPACE
    }

    fn operation_type(&self) -> OperationType {
        OperationType::LlmExtract
    }

    async fn replay(&self, entry: &DlqEntry) -> PipelineResult<()> {
        self.core.replay_payload(entry).await
    }
}
