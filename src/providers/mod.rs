//! LLM provider adapters.
//!
//! Three concrete adapters share one contract, [`EntityExtractor`]: turn a
//! cleaned email into validated [`ExtractedEntities`], and answer short
//! closed-vocabulary prompts for classification and summarization. Each
//! adapter pulls its API key from the [`SecretStore`](crate::secrets::SecretStore)
//! at construction, enforces its own request timeout, and maps provider
//! errors onto the pipeline's Transient/Permanent/Critical taxonomy.
//!
//! The extraction prompt and the strict response schema live here so all
//! providers are held to the same contract; provider files only handle
//! their wire formats.

pub mod anthropic;
pub mod gemini;
pub mod openai;

pub use anthropic::AnthropicExtractor;
pub use gemini::GeminiExtractor;
pub use openai::OpenAiExtractor;

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::ProviderSettings;
use crate::entities::{EmailMessage, ExtractedEntities, Provenance, EXTRACTION_FIELDS};
use crate::error::{service, PipelineError, PipelineResult};
use crate::internals::{dates, tokens};
use crate::logging::log_warn;
use crate::secrets::SecretStore;

/// Plain-text completion used for intensity labels and summaries.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionResponse {
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub usage_estimated: bool,
    pub latency_ms: u64,
}

/// Contract every provider adapter satisfies.
///
/// Dispatch is trait-object polymorphism; there is no abstract base to
/// instantiate and the shared contract-test battery runs unchanged against
/// each implementation.
#[async_trait]
pub trait EntityExtractor: Send + Sync {
    /// Extract structured entities from one email.
    async fn extract(&self, email: &EmailMessage) -> PipelineResult<ExtractedEntities>;

    /// Answer a short prompt with plain text (labels, summaries).
    async fn complete(&self, prompt: &str) -> PipelineResult<CompletionResponse>;

    /// Provider identifier used in service keys and provenance.
    fn provider_name(&self) -> &'static str;

    /// The pinned model id.
    fn model_id(&self) -> &str;
}

/// A configured adapter paired with its settings block.
#[derive(Clone)]
pub struct ProviderHandle {
    pub settings: ProviderSettings,
    pub extractor: Arc<dyn EntityExtractor>,
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

/// Construct adapters for every enabled provider in priority order.
pub fn build_providers(
    configured: &[ProviderSettings],
    secrets: &SecretStore,
) -> PipelineResult<Vec<ProviderHandle>> {
    let mut handles: Vec<ProviderHandle> = Vec::new();
    let mut ordered: Vec<&ProviderSettings> = configured.iter().filter(|p| p.enabled).collect();
    ordered.sort_by_key(|p| p.priority);

    for settings in ordered {
        let extractor: Arc<dyn EntityExtractor> = match settings.name.as_str() {
            "gemini" => Arc::new(GeminiExtractor::new(settings.clone(), secrets)?),
            "openai" => Arc::new(OpenAiExtractor::new(settings.clone(), secrets)?),
            "anthropic" => Arc::new(AnthropicExtractor::new(settings.clone(), secrets)?),
            other => {
                return Err(PipelineError::configuration(format!(
                    "unknown provider: {other}"
                )))
            }
        };
        handles.push(ProviderHandle {
            settings: settings.clone(),
            extractor,
        });
    }
    Ok(handles)
}

// ============================================================================
// Shared prompt
// ============================================================================

/// JSON schema the extraction prompt demands; also handed to providers that
/// support structured-output enforcement.
pub(crate) fn extraction_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "object",
        "properties": {
            "person_in_charge": {"type": ["string", "null"]},
            "company_name": {"type": ["string", "null"]},
            "partner_org": {"type": ["string", "null"]},
            "details": {"type": "string"},
            "collab_date": {"type": ["string", "null"]},
            "confidence": {
                "type": "object",
                "properties": {
                    "person_in_charge": {"type": "number"},
                    "company_name": {"type": "number"},
                    "partner_org": {"type": "number"},
                    "details": {"type": "number"},
                    "collab_date": {"type": "number"}
                },
                "required": ["person_in_charge", "company_name", "partner_org", "details", "collab_date"]
            }
        },
        "required": ["details", "confidence"]
    })
}

/// Build the shared extraction prompt for one email.
pub(crate) fn extraction_prompt(email: &EmailMessage) -> String {
    format!(
        r#"You are an analyst extracting collaboration facts from a business email.
The email may be in Korean, English, or a mix; names of people and companies
may appear in either language. Return ONLY a JSON object with this exact shape:

{{
  "person_in_charge": string or null,   // the person driving this collaboration
  "company_name": string or null,       // our side's company as written in the email
  "partner_org": string or null,        // the counterpart organization
  "details": string,                    // 1-3 sentence factual description, required
  "collab_date": string or null,        // the collaboration date as written
  "confidence": {{                      // one score in [0.0, 1.0] per field above
    "person_in_charge": number,
    "company_name": number,
    "partner_org": number,
    "details": number,
    "collab_date": number
  }}
}}

Rules:
- A field you cannot determine is null, and its confidence is exactly 0.0.
- collab_date may be absolute (2025-03-14, 2025.3.14), a month/day (3월 14일),
  or a Korean relative expression (어제, 지난주 금요일). Copy it as written;
  do not resolve relative dates yourself. The email was received at {received_at}.
- Keep Korean text exactly as written. Do not translate names.
- No markdown, no commentary, JSON only.

Email:
{body}"#,
        received_at = email.received_at.to_rfc3339(),
        body = email.body_text
    )
}

// ============================================================================
// Shared response validation
// ============================================================================

/// The wire shape every provider must produce.
#[derive(Debug, Deserialize)]
pub(crate) struct RawExtraction {
    #[serde(default)]
    person_in_charge: Option<String>,
    #[serde(default)]
    company_name: Option<String>,
    #[serde(default)]
    partner_org: Option<String>,
    details: String,
    #[serde(default)]
    collab_date: Option<String>,
    confidence: BTreeMap<String, f64>,
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

/// Validate a provider's JSON against the strict extraction schema and
/// assemble the domain type.
///
/// Schema violations are Permanent: the same request will keep producing
/// the same malformed answer. Fields the adapter itself nulls (empty
/// strings, unresolvable dates) get their confidence forced to 0.0 so the
/// confidence law holds; a populated optional field scored 0.0 is dropped
/// to null rather than rejected.
#[allow(clippy::too_many_arguments)]
pub(crate) fn finish_extraction(
    provider: &'static str,
    model_id: &str,
    value: serde_json::Value,
    email: &EmailMessage,
    input_tokens: u32,
    output_tokens: u32,
    usage_estimated: bool,
    latency_ms: u64,
) -> PipelineResult<ExtractedEntities> {
    let raw: RawExtraction = serde_json::from_value(value)
        .map_err(|e| PipelineError::schema_violation(provider, e.to_string()))?;

    for field in EXTRACTION_FIELDS {
        match raw.confidence.get(field) {
            Some(conf) if (0.0..=1.0).contains(conf) => {}
            Some(conf) => {
                return Err(PipelineError::schema_violation(
                    provider,
                    format!("confidence for `{field}` out of range: {conf}"),
                ))
            }
            None => {
                return Err(PipelineError::schema_violation(
                    provider,
                    format!("confidence for `{field}` missing"),
                ))
            }
        }
    }

    let details = raw.details.trim().to_string();
    if details.is_empty() {
        return Err(PipelineError::schema_violation(
            provider,
            "required field `details` is empty",
        ));
    }
    let details_conf = raw.confidence["details"];
    if details_conf == 0.0 {
        return Err(PipelineError::schema_violation(
            provider,
            "populated field `details` reported confidence 0.0",
        ));
    }

    let mut confidence = raw.confidence.clone();
    let mut take = |field: &str, value: Option<String>| -> Option<String> {
        let value = non_empty(value);
        let conf = confidence.get_mut(field).expect("validated above");
        if value.is_none() || *conf == 0.0 {
            *conf = 0.0;
            return None;
        }
        value
    };

    let person_in_charge = take("person_in_charge", raw.person_in_charge);
    let company_name = take("company_name", raw.company_name);
    let partner_org = take("partner_org", raw.partner_org);

    let raw_date = non_empty(raw.collab_date);
    let mut collab_date = raw_date
        .as_deref()
        .and_then(|text| dates::normalize(text, email.received_at));
    {
        let conf = confidence.get_mut("collab_date").expect("validated above");
        if collab_date.is_none() {
            if raw_date.is_some() {
                log_warn!(
                    provider = %provider,
                    email_id = %email.message_id,
                    raw_date = %raw_date.as_deref().unwrap_or_default(),
                    "Unresolvable collaboration date dropped"
                );
            }
            *conf = 0.0;
        } else if *conf == 0.0 {
            // Resolved but scored zero: the law drops the value.
            collab_date = None;
        }
    }

    let entities = ExtractedEntities {
        person_in_charge,
        company_name,
        partner_org,
        details,
        collab_date,
        per_field_confidence: confidence,
        provenance: Provenance {
            provider_name: provider.to_string(),
            model_id: model_id.to_string(),
            input_tokens,
            output_tokens,
            latency_ms,
            strategy: None,
            fallback_used: false,
            usage_estimated,
        },
    };
    entities.validate()?;
    Ok(entities)
}

// ============================================================================
// Shared HTTP plumbing
// ============================================================================

/// Map a reqwest transport error onto the taxonomy.
pub(crate) fn map_transport_error(provider: &str, err: reqwest::Error, timeout_ms: u64) -> PipelineError {
    let svc = service::llm(provider);
    if err.is_timeout() {
        PipelineError::timeout(svc, timeout_ms)
    } else {
        PipelineError::network(svc, err.to_string(), Some(Box::new(err)))
    }
}

/// Check an HTTP response, returning its body on success or a classified
/// error otherwise. `Retry-After` is honored on 429.
pub(crate) async fn check_response(
    provider: &str,
    response: reqwest::Response,
) -> PipelineResult<String> {
    let status = response.status();
    let retry_after = response
        .headers()
        .get("retry-after")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.parse::<u64>().ok());

    let body = response.text().await.map_err(|e| {
        PipelineError::network(service::llm(provider), e.to_string(), Some(Box::new(e)))
    })?;

    if status.is_success() {
        Ok(body)
    } else {
        Err(PipelineError::from_status(
            service::llm(provider),
            status.as_u16(),
            body.chars().take(500).collect::<String>(),
            retry_after,
        ))
    }
}

/// Token usage for one call, estimated locally when the provider omitted it.
pub(crate) fn usage_or_estimate(
    reported: Option<(u32, u32)>,
    prompt: &str,
    completion: &str,
) -> (u32, u32, bool) {
    match reported {
        Some((input, output)) => (input, output, false),
        None => (tokens::estimate(prompt), tokens::estimate(completion), true),
    }
}
