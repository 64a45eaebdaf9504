//! Google Gemini provider implementation.
//!
//! Uses the `generateContent` endpoint with JSON response mode for
//! extraction and plain text mode for completions. Gemini authenticates via
//! a `key` query parameter rather than a header.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{
    check_response, extraction_prompt, finish_extraction, map_transport_error, usage_or_estimate,
    CompletionResponse, EntityExtractor,
};
use crate::config::ProviderSettings;
use crate::entities::{EmailMessage, ExtractedEntities};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_debug;
use crate::secrets::SecretStore;

const PROVIDER: &str = "gemini";

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: &'static str,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize, Deserialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<GeminiUsage>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Deserialize)]
struct GeminiUsage {
    #[serde(rename = "promptTokenCount")]
    prompt_token_count: Option<u32>,
    #[serde(rename = "candidatesTokenCount")]
    candidates_token_count: Option<u32>,
}

/// Gemini adapter.
#[derive(Debug)]
pub struct GeminiExtractor {
    client: reqwest::Client,
    settings: ProviderSettings,
    api_key: String,
}

impl GeminiExtractor {
    /// Create the adapter, pulling the API key from the secret store.
    pub fn new(settings: ProviderSettings, secrets: &SecretStore) -> PipelineResult<Self> {
        let api_key = secrets.get(&settings.api_key_env())?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| PipelineError::configuration(format!("gemini http client: {e}")))?;

        log_debug!(
            provider = PROVIDER,
            model = %settings.model_id,
            timeout_ms = settings.timeout_ms,
            "Gemini provider initialized"
        );
        Ok(Self {
            client,
            settings,
            api_key,
        })
    }

    async fn generate(&self, prompt: &str, json_mode: bool) -> PipelineResult<(String, Option<(u32, u32)>)> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.settings.base_url, self.settings.model_id, self.api_key
        );
        let request = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user",
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig {
                temperature: 0.1,
                response_mime_type: json_mode.then_some("application/json"),
            },
        };

        let response = self
            .client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_transport_error(PROVIDER, e, self.settings.timeout_ms))?;
        let body = check_response(PROVIDER, response).await?;

        let parsed: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::schema_violation(PROVIDER, format!("response envelope: {e}")))?;
        let text = parsed
            .candidates
            .first()
            .and_then(|c| c.content.parts.first())
            .map(|p| p.text.clone())
            .ok_or_else(|| PipelineError::schema_violation(PROVIDER, "response carried no candidates"))?;
        let usage = parsed.usage_metadata.and_then(|u| {
            Some((u.prompt_token_count?, u.candidates_token_count?))
        });
        Ok((text, usage))
    }
}

#[async_trait]
impl EntityExtractor for GeminiExtractor {
    async fn extract(&self, email: &EmailMessage) -> PipelineResult<ExtractedEntities> {
        let prompt = extraction_prompt(email);
        let started = Instant::now();
        let (text, usage) = self.generate(&prompt, true).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let value: serde_json::Value = serde_json::from_str(text.trim())
            .map_err(|e| PipelineError::schema_violation(PROVIDER, format!("extraction JSON: {e}")))?;
        let (input_tokens, output_tokens, usage_estimated) =
            usage_or_estimate(usage, &prompt, &text);
        finish_extraction(
            PROVIDER,
            &self.settings.model_id,
            value,
            email,
            input_tokens,
            output_tokens,
            usage_estimated,
            latency_ms,
        )
    }

    async fn complete(&self, prompt: &str) -> PipelineResult<CompletionResponse> {
        let started = Instant::now();
        let (text, usage) = self.generate(prompt, false).await?;
        let latency_ms = started.elapsed().as_millis() as u64;
        let (input_tokens, output_tokens, usage_estimated) = usage_or_estimate(usage, prompt, &text);
        Ok(CompletionResponse {
            text,
            input_tokens,
            output_tokens,
            usage_estimated,
            latency_ms,
        })
    }

    fn provider_name(&self) -> &'static str {
        PROVIDER
    }

    fn model_id(&self) -> &str {
        &self.settings.model_id
    }
}
