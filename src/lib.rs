//! # collabiq
//!
//! Autonomous pipeline that ingests business-collaboration emails, extracts
//! structured entities with multiple LLM providers, resolves entities
//! against a Notion-style workspace, classifies each collaboration, and
//! writes a durable record back, exactly once per email.
//!
//! ## Key Features
//!
//! - **Multi-provider orchestration**: failover, consensus, and best-match
//!   strategies over Gemini, OpenAI, and Anthropic adapters
//! - **Fault tolerance**: classified retries, per-service circuit breakers,
//!   and a replayable on-disk dead-letter queue
//! - **Exactly-once writes**: crash-safe cursor plus duplicate detection;
//!   every email ends up recorded once or parked, never lost
//! - **Observability**: per-provider health, cost, and quality tracking
//!   persisted across restarts
//!
//! ## Example
//!
//! ```rust,no_run
//! use collabiq::config::AppConfig;
//! use collabiq::secrets::SecretStore;
//! use collabiq::providers::build_providers;
//!
//! # fn example() -> collabiq::error::PipelineResult<()> {
//! let config = AppConfig::from_env()?;
//! let secrets = SecretStore::default();
//! let providers = build_providers(&config.providers, &secrets)?;
//! // Wire the orchestrator, workspace, and daemon; see `main.rs`.
//! # Ok(())
//! # }
//! ```

// =============================================================================
// Module declarations
// =============================================================================

// Public modules
pub mod breaker;
pub mod classify;
pub mod config;
pub mod daemon;
pub mod dlq;
pub mod entities;
pub mod error;
pub mod mail;
pub mod orchestrator;
pub mod providers;
pub mod replay;
pub mod retry;
pub mod secrets;
pub mod trackers;
pub mod workspace;

// Internal modules
pub(crate) mod internals;
pub(crate) mod logging;

#[cfg(test)]
pub mod tests;

// =============================================================================
// Public API re-exports
// =============================================================================

// Errors
pub use error::{ErrorClass, PipelineError, PipelineResult};

// Domain types
pub use entities::{
    Classification, CollabType, EmailMessage, ExtractedEntities, Intensity, Provenance, Strategy,
};

// Configuration
pub use config::{
    AppConfig, DaemonSettings, DuplicateBehavior, OrchestratorSettings, ProviderSettings,
    WorkspaceSettings,
};

// Resilience
pub use breaker::{BreakerSnapshot, CircuitState, ServiceBreakers};
pub use dlq::{DeadLetterQueue, DlqEntry, DlqStatus, OperationType, ReplayOutcome, ReplaySummary};
pub use retry::{retry, RetryOutcome, RetryPolicy};

// Tracking
pub use trackers::{CostTracker, HealthTracker, ProviderHealth, QualityTracker};

// Providers and orchestration
pub use orchestrator::Orchestrator;
pub use providers::{build_providers, EntityExtractor, ProviderHandle};

// Replay
pub use replay::{LlmExtractReplayer, PipelineReplayer, WorkspaceWriteReplayer};

// Workspace
pub use workspace::{
    CollabRecord, CompanyMatch, CompanyMatcher, PersonMatch, PersonMatcher, WorkspaceCaches,
    WorkspaceClient, WriteResult, WriteStatus, Writer,
};

// Daemon
pub use daemon::{DaemonController, DaemonState, DaemonStatus};

// Mail
pub use mail::{JsonDropAdapter, MailAdapter};
