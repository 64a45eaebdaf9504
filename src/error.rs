//! Error types for the collabiq pipeline.
//!
//! Every failure raised anywhere in the pipeline is a [`PipelineError`], and
//! every `PipelineError` is classified exactly once at the boundary where it
//! originates into one of three [`ErrorClass`]es:
//!
//! - **Transient**: network trouble, timeouts, 408/429/5xx. Retried under the
//!   service's retry policy.
//! - **Permanent**: bad requests, validation failures, schema violations,
//!   exhausted retries. Never retried; parked in the dead-letter queue at the
//!   closest pipeline step.
//! - **Critical**: authentication failures and missing secrets. Never retried;
//!   raised to the daemon loop and logged at CRITICAL.
//!
//! Downstream decisions are pattern matches on [`PipelineError::class`],
//! never string inspection.
//!
//! # Example
//!
//! ```rust,no_run
//! use collabiq::error::{ErrorClass, PipelineError};
//!
//! fn route(err: &PipelineError) {
//!     match err.class() {
//!         ErrorClass::Transient => { /* retry with backoff */ }
//!         ErrorClass::Permanent => { /* park in DLQ */ }
//!         ErrorClass::Critical => { /* alert, do not retry */ }
//!     }
//! }
//! ```

use crate::logging::{log_critical, log_error, log_warn};
use thiserror::Error;

/// Convenient result type for pipeline operations.
pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

/// Retry classification attached to every pipeline error.
///
/// The class is decided once, where the error is constructed, and drives all
/// retry / DLQ / alerting behavior downstream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum ErrorClass {
    /// Temporary failure. Retry with exponential backoff.
    Transient,
    /// Will not succeed on retry. Surface immediately, park in the DLQ.
    Permanent,
    /// Authentication or configuration failure requiring operator attention.
    Critical,
}

impl std::fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Transient => "TRANSIENT",
            Self::Permanent => "PERMANENT",
            Self::Critical => "CRITICAL",
        };
        f.write_str(label)
    }
}

/// Errors raised by pipeline components.
///
/// Construct variants through the helper methods below; they log at the
/// appropriate level as a side effect, so an error is visible in the logs
/// even when a caller swallows it.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// The HTTP request could not be completed (DNS, connect, reset).
    #[error("{service}: network failure: {message}")]
    Network {
        /// Service key (`mail`, `llm.<provider>`, `workspace`, `secrets`).
        service: String,
        /// Description of the failure.
        message: String,
        /// The underlying transport error, if available.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// A single attempt exceeded its request timeout.
    #[error("{service}: request timed out after {timeout_ms}ms")]
    Timeout {
        service: String,
        /// The per-attempt timeout that was exceeded.
        timeout_ms: u64,
    },

    /// The service responded 429 (or 408) and asked us to slow down.
    #[error("{service}: rate limited")]
    RateLimited {
        service: String,
        /// Server-provided `Retry-After`, when present.
        retry_after_seconds: Option<u64>,
    },

    /// 5xx from the remote service.
    #[error("{service}: server error {status}: {message}")]
    ServerError {
        service: String,
        status: u16,
        message: String,
    },

    /// 400/403/404: the request itself is wrong and will stay wrong.
    #[error("{service}: rejected with {status}: {message}")]
    Rejected {
        service: String,
        status: u16,
        message: String,
    },

    /// Domain validation failed (payload shape, id length, field bounds).
    #[error("validation failed: {message}")]
    Validation {
        /// What was violated.
        message: String,
    },

    /// An LLM response did not conform to the strict extraction schema.
    #[error("{provider}: extraction schema violation: {message}")]
    SchemaViolation { provider: String, message: String },

    /// 401 / expired token / bad credentials.
    #[error("{service}: authentication failed: {message}")]
    AuthFailure { service: String, message: String },

    /// A required secret is absent from the store and the environment.
    #[error("missing secret: {key}")]
    MissingSecret { key: String },

    /// Short-circuited because the service's breaker is open.
    #[error("{service}: circuit breaker open")]
    CircuitOpen { service: String },

    /// The retry budget for one operation is spent.
    ///
    /// Carries the full attempt history for the cycle-item log line.
    #[error("{service}: retries exhausted after {attempts} attempts: {last}")]
    RetriesExhausted {
        service: String,
        attempts: u32,
        /// One line per failed attempt.
        history: Vec<String>,
        #[source]
        last: Box<PipelineError>,
    },

    /// Every enabled provider failed (or was gated) for one extraction.
    #[error("all providers failed: {}", attempted.join(", "))]
    AllProvidersFailed {
        /// Providers that were attempted or skipped, in order.
        attempted: Vec<String>,
    },

    /// Consensus could not collect enough successful responses.
    #[error("insufficient agreement: {got} responses, need {required}")]
    InsufficientAgreement { got: usize, required: usize },

    /// Invalid or incomplete startup configuration. Fatal.
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Local persistence failure (state, cache, DLQ, tracker files).
    #[error("storage failure at {path}: {message}")]
    Storage { path: String, message: String },
}

impl PipelineError {
    /// The retry class for this error.
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network { .. }
            | Self::Timeout { .. }
            | Self::RateLimited { .. }
            | Self::ServerError { .. }
            | Self::CircuitOpen { .. }
            | Self::Storage { .. } => ErrorClass::Transient,
            Self::Rejected { .. }
            | Self::Validation { .. }
            | Self::SchemaViolation { .. }
            | Self::RetriesExhausted { .. }
            | Self::AllProvidersFailed { .. }
            | Self::InsufficientAgreement { .. } => ErrorClass::Permanent,
            Self::AuthFailure { .. } | Self::MissingSecret { .. } | Self::Configuration { .. } => {
                ErrorClass::Critical
            }
        }
    }

    /// Whether the retry executor may try this operation again.
    pub fn is_retryable(&self) -> bool {
        self.class() == ErrorClass::Transient
    }

    /// The `Retry-After` hint, when the server provided one.
    pub fn retry_after(&self) -> Option<u64> {
        match self {
            Self::RateLimited {
                retry_after_seconds,
                ..
            } => *retry_after_seconds,
            _ => None,
        }
    }

    /// Classify an HTTP error status per the pipeline taxonomy.
    ///
    /// `retry_after` is only consulted for 429 responses.
    pub fn from_status(
        service: impl Into<String>,
        status: u16,
        message: impl Into<String>,
        retry_after: Option<u64>,
    ) -> Self {
        let service = service.into();
        let message = message.into();
        match status {
            401 => Self::auth_failure(service, message),
            429 => Self::rate_limited(service, retry_after),
            408 => Self::RateLimited {
                service,
                retry_after_seconds: None,
            },
            400 | 403 | 404 => Self::rejected(service, status, message),
            s if s >= 500 => Self::server_error(service, status, message),
            s => Self::rejected(service, s, message),
        }
    }

    // =========================================================================
    // Constructor methods with automatic logging
    // =========================================================================
    //
    // These methods log the error at the appropriate level on creation.
    // Use them instead of constructing variants directly.

    pub fn network(
        service: impl Into<String>,
        message: impl Into<String>,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        let service = service.into();
        let message = message.into();
        log_warn!(
            service = %service,
            category = "TRANSIENT",
            error_type = "network",
            message = %message,
            "Network failure"
        );
        Self::Network {
            service,
            message,
            source,
        }
    }

    pub fn timeout(service: impl Into<String>, timeout_ms: u64) -> Self {
        let service = service.into();
        log_warn!(
            service = %service,
            category = "TRANSIENT",
            error_type = "timeout",
            timeout_ms = timeout_ms,
            "Request timed out"
        );
        Self::Timeout {
            service,
            timeout_ms,
        }
    }

    pub fn rate_limited(service: impl Into<String>, retry_after_seconds: Option<u64>) -> Self {
        let service = service.into();
        log_warn!(
            service = %service,
            category = "TRANSIENT",
            error_type = "rate_limited",
            retry_after_seconds = retry_after_seconds,
            "Rate limit hit"
        );
        Self::RateLimited {
            service,
            retry_after_seconds,
        }
    }

    pub fn server_error(
        service: impl Into<String>,
        status: u16,
        message: impl Into<String>,
    ) -> Self {
        let service = service.into();
        let message = message.into();
        log_warn!(
            service = %service,
            category = "TRANSIENT",
            error_type = "server_error",
            status = status,
            message = %message,
            "Upstream server error"
        );
        Self::ServerError {
            service,
            status,
            message,
        }
    }

    pub fn rejected(service: impl Into<String>, status: u16, message: impl Into<String>) -> Self {
        let service = service.into();
        let message = message.into();
        log_error!(
            service = %service,
            category = "PERMANENT",
            error_type = "rejected",
            status = status,
            message = %message,
            "Request rejected by upstream"
        );
        Self::Rejected {
            service,
            status,
            message,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        let message = message.into();
        log_error!(
            category = "PERMANENT",
            error_type = "validation",
            message = %message,
            "Domain validation failed"
        );
        Self::Validation { message }
    }

    pub fn schema_violation(provider: impl Into<String>, message: impl Into<String>) -> Self {
        let provider = provider.into();
        let message = message.into();
        log_error!(
            provider = %provider,
            category = "PERMANENT",
            error_type = "schema_violation",
            message = %message,
            "LLM response violated extraction schema"
        );
        Self::SchemaViolation { provider, message }
    }

    pub fn auth_failure(service: impl Into<String>, message: impl Into<String>) -> Self {
        let service = service.into();
        let message = message.into();
        log_critical!(
            service = %service,
            category = "CRITICAL",
            error_type = "auth_failure",
            message = %message,
            "Authentication failed"
        );
        Self::AuthFailure { service, message }
    }

    pub fn missing_secret(key: impl Into<String>) -> Self {
        let key = key.into();
        log_critical!(
            category = "CRITICAL",
            error_type = "missing_secret",
            key = %key,
            "Required secret is not available"
        );
        Self::MissingSecret { key }
    }

    pub fn circuit_open(service: impl Into<String>) -> Self {
        let service = service.into();
        log_warn!(
            service = %service,
            category = "TRANSIENT",
            error_type = "circuit_open",
            "Call short-circuited by open breaker"
        );
        Self::CircuitOpen { service }
    }

    pub fn retries_exhausted(
        service: impl Into<String>,
        attempts: u32,
        history: Vec<String>,
        last: PipelineError,
    ) -> Self {
        let service = service.into();
        log_error!(
            service = %service,
            category = "PERMANENT",
            error_type = "retries_exhausted",
            attempts = attempts,
            last_error = %last,
            "Retry budget exhausted"
        );
        Self::RetriesExhausted {
            service,
            attempts,
            history,
            last: Box::new(last),
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        let message = message.into();
        log_critical!(
            category = "CRITICAL",
            error_type = "configuration",
            message = %message,
            "Configuration validation failed"
        );
        Self::Configuration { message }
    }

    pub fn storage(path: impl Into<String>, message: impl Into<String>) -> Self {
        let path = path.into();
        let message = message.into();
        log_warn!(
            category = "TRANSIENT",
            error_type = "storage",
            path = %path,
            message = %message,
            "Local persistence failure"
        );
        Self::Storage { path, message }
    }
}

/// Service keys used for breakers, retry policies, and log fields.
pub mod service {
    pub const MAIL: &str = "mail";
    pub const WORKSPACE: &str = "workspace";
    pub const SECRETS: &str = "secrets";

    /// Key for a specific LLM provider, e.g. `llm.gemini`.
    pub fn llm(provider: &str) -> String {
        format!("llm.{provider}")
    }
}
