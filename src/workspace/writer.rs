//! Duplicate-aware workspace writes.
//!
//! The writer is the last pipeline step and the one that seals the
//! exactly-once invariant: a record either lands as exactly one page
//! carrying its message id, or it is parked in the DLQ. A failed duplicate
//! check degrades to a possible duplicate rather than aborting the write,
//! acceptable at current volumes and logged when it happens.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::client::WorkspaceClient;
use super::mapper::{build_properties, CollabRecord, PROP_MESSAGE_ID};
use crate::breaker::ServiceBreakers;
use crate::config::{DuplicateBehavior, WorkspaceSettings};
use crate::dlq::{DeadLetterQueue, OperationType};
use crate::error::{service, PipelineError, PipelineResult};
use crate::logging::{log_info, log_warn};
use crate::retry::{retry, RetryPolicy};

/// Final disposition of one write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriteStatus {
    Created,
    Updated,
    Skipped,
    /// Terminal failure, parked in the DLQ; the cycle step still counts as
    /// concluded and the cursor may advance.
    Parked,
}

/// Result of one write.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteResult {
    pub page_id: Option<String>,
    pub status: WriteStatus,
}

/// Writes collaboration records, parking terminal failures.
pub struct Writer {
    client: Arc<WorkspaceClient>,
    settings: WorkspaceSettings,
    breakers: Arc<ServiceBreakers>,
    dlq: DeadLetterQueue,
}

impl Writer {
    pub fn new(
        client: Arc<WorkspaceClient>,
        settings: WorkspaceSettings,
        breakers: Arc<ServiceBreakers>,
        dlq: DeadLetterQueue,
    ) -> Self {
        Self {
            client,
            settings,
            breakers,
            dlq,
        }
    }

    /// Write one record to the Collaborations database.
    ///
    /// On terminal failure the full payload is parked as a
    /// `workspace_write` DLQ entry and `Parked` is returned; the caller
    /// treats that as a concluded step. An error return means even the DLQ
    /// write failed and the cursor must not advance.
    pub async fn create_entry(&self, record: &CollabRecord) -> PipelineResult<WriteResult> {
        let message_id = record.email.message_id.as_str();
        // A record without a message id cannot participate in exactly-once
        // accounting; reaching here without one is a programmer error.
        debug_assert!(!message_id.is_empty(), "record missing message_id");
        if message_id.is_empty() {
            return Err(PipelineError::validation("record missing message_id"));
        }

        let existing = match self.find_duplicate(message_id).await {
            Ok(existing) => existing,
            Err(e) => {
                log_warn!(
                    email_id = %message_id,
                    error = %e,
                    "Duplicate check failed, proceeding with write"
                );
                None
            }
        };

        let properties = build_properties(record);
        let properties = match properties {
            Ok(properties) => properties,
            Err(e) => return self.park(message_id, json!({"record": record}), e).await,
        };

        if let Some(page_id) = existing {
            return match self.settings.duplicate_behavior {
                DuplicateBehavior::Skip => {
                    log_info!(
                        email_id = %message_id,
                        page_id = %page_id,
                        "Duplicate message, skipping write"
                    );
                    Ok(WriteResult {
                        page_id: Some(page_id),
                        status: WriteStatus::Skipped,
                    })
                }
                DuplicateBehavior::Update => {
                    match self.guarded_update(&page_id, properties.clone()).await {
                        Ok(()) => Ok(WriteResult {
                            page_id: Some(page_id),
                            status: WriteStatus::Updated,
                        }),
                        Err(e) => {
                            self.park(
                                message_id,
                                json!({"properties": properties, "page_id": page_id}),
                                e,
                            )
                            .await
                        }
                    }
                }
            };
        }

        match self.guarded_create(properties.clone()).await {
            Ok(page_id) => {
                log_info!(
                    email_id = %message_id,
                    page_id = %page_id,
                    "Collaboration record created"
                );
                Ok(WriteResult {
                    page_id: Some(page_id),
                    status: WriteStatus::Created,
                })
            }
            Err(e) => {
                self.park(message_id, json!({"properties": properties}), e)
                    .await
            }
        }
    }

    async fn find_duplicate(&self, message_id: &str) -> PipelineResult<Option<String>> {
        let client = Arc::clone(&self.client);
        let db_id = self.settings.collaborations_db_id.clone();
        let message_id = message_id.to_string();
        let outcome = retry(service::WORKSPACE, &RetryPolicy::workspace(), || {
            let client = Arc::clone(&client);
            let db_id = db_id.clone();
            let message_id = message_id.clone();
            async move {
                client
                    .find_by_message_id(&db_id, PROP_MESSAGE_ID, &message_id)
                    .await
            }
        })
        .await?;
        Ok(outcome.value.map(|page| page.id))
    }

    async fn guarded_create(&self, properties: serde_json::Value) -> PipelineResult<String> {
        if !self.breakers.allow(service::WORKSPACE) {
            return Err(PipelineError::circuit_open(service::WORKSPACE));
        }
        let client = Arc::clone(&self.client);
        let db_id = self.settings.collaborations_db_id.clone();
        let breakers = Arc::clone(&self.breakers);
        let result = retry(service::WORKSPACE, &RetryPolicy::workspace(), || {
            let client = Arc::clone(&client);
            let db_id = db_id.clone();
            let properties = properties.clone();
            let breakers = Arc::clone(&breakers);
            async move {
                match client.create_page(&db_id, properties).await {
                    Ok(page) => {
                        breakers.record_success(service::WORKSPACE);
                        Ok(page.id)
                    }
                    Err(e) => {
                        breakers.record_failure(service::WORKSPACE);
                        Err(e)
                    }
                }
            }
        })
        .await?;
        Ok(result.value)
    }

    async fn guarded_update(
        &self,
        page_id: &str,
        properties: serde_json::Value,
    ) -> PipelineResult<()> {
        if !self.breakers.allow(service::WORKSPACE) {
            return Err(PipelineError::circuit_open(service::WORKSPACE));
        }
        let client = Arc::clone(&self.client);
        let page_id = page_id.to_string();
        let breakers = Arc::clone(&self.breakers);
        retry(service::WORKSPACE, &RetryPolicy::workspace(), || {
            let client = Arc::clone(&client);
            let page_id = page_id.clone();
            let properties = properties.clone();
            let breakers = Arc::clone(&breakers);
            async move {
                match client.update_page(&page_id, properties).await {
                    Ok(_) => {
                        breakers.record_success(service::WORKSPACE);
                        Ok(())
                    }
                    Err(e) => {
                        breakers.record_failure(service::WORKSPACE);
                        Err(e)
                    }
                }
            }
        })
        .await?;
        Ok(())
    }

    /// Park a terminally failed write; DLQ success concludes the step.
    async fn park(
        &self,
        message_id: &str,
        payload: serde_json::Value,
        error: PipelineError,
    ) -> PipelineResult<WriteResult> {
        match self
            .dlq
            .park(OperationType::WorkspaceWrite, message_id, payload, &error)
            .await
        {
            Some(_) => Ok(WriteResult {
                page_id: None,
                status: WriteStatus::Parked,
            }),
            None => Err(error),
        }
    }
}
