//! OpenAI provider implementation.
//!
//! Uses `chat/completions` with `response_format: json_object` for
//! extraction so the model is held to JSON output at the API level.

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

const PROVIDER: &str = "openai";

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u32>,
    completion_tokens: Option<u32>,
}

/// OpenAI adapter.
#[derive(Debug)]
pub struct OpenAiExtractor {
    client: reqwest::Client,
    settings: ProviderSettings,
    api_key: String,
}

impl OpenAiExtractor {
    /// Create the adapter, pulling the API key from the secret store.
    pub fn new(settings: ProviderSettings, secrets: &SecretStore) -> PipelineResult<Self> {
        let api_key = secrets.get(&settings.api_key_env())?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| PipelineError::configuration(format!("openai http client: {e}")))?;

        log_debug!(
            provider = PROVIDER,
            model = %settings.model_id,
            timeout_ms = settings.timeout_ms,
            "OpenAI provider initialized"
        );
        Ok(Self {
            client,
            settings,
            api_key,
        })
    }

    async fn chat(
        &self,
        prompt: &str,
        json_mode: bool,
    ) -> PipelineResult<(String, Option<(u32, u32)>)> {
        let url = format!("{}/v1/chat/completions", self.settings.base_url);
        let request = ChatRequest {
            model: self.settings.model_id.clone(),
            messages: vec![ChatMessage {
                role: "user",
                content: prompt.to_string(),
            }],
            temperature: 0.1,
            response_format: json_mode.then_some(ResponseFormat {
                format_type: "json_object",
            }),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(|e| map_transport_error(PROVIDER, e, self.settings.timeout_ms))?;
        let body = check_response(PROVIDER, response).await?;

        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| PipelineError::schema_violation(PROVIDER, format!("response envelope: {e}")))?;
        let text = parsed
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .ok_or_else(|| PipelineError::schema_violation(PROVIDER, "response carried no choices"))?;
        let usage = parsed
            .usage
            .and_then(|u| Some((u.prompt_tokens?, u.completion_tokens?)));
        Ok((text, usage))
    }
}

#[async_trait]
impl EntityExtractor for OpenAiExtractor {
    async fn extract(&self, email: &EmailMessage) -> PipelineResult<ExtractedEntities> {
        let prompt = extraction_prompt(email);
        let started = Instant::now();
        let (text, usage) = self.chat(&prompt, true).await?;
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
        let (text, usage) = self.chat(prompt, false).await?;
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
