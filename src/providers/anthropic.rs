//! Anthropic provider implementation.
//!
//! Extraction rides a forced tool call (`record_extraction`) so the model's
//! answer arrives as schema-checked JSON in the tool input rather than free
//! text. Completions use the plain Messages API.

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::time::Instant;

use super::{
    check_response, extraction_prompt, extraction_schema, finish_extraction, map_transport_error,
    usage_or_estimate, CompletionResponse, EntityExtractor,
};
use crate::config::ProviderSettings;
use crate::entities::{EmailMessage, ExtractedEntities};
use crate::error::{PipelineError, PipelineResult};
use crate::logging::log_debug;
use crate::secrets::SecretStore;

const PROVIDER: &str = "anthropic";
const API_VERSION: &str = "2023-06-01";
const EXTRACTION_TOOL: &str = "record_extraction";

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    messages: Vec<Message>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<serde_json::Value>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        name: String,
        input: serde_json::Value,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

/// Anthropic adapter.
#[derive(Debug)]
pub struct AnthropicExtractor {
    client: reqwest::Client,
    settings: ProviderSettings,
    api_key: String,
}

impl AnthropicExtractor {
    /// Create the adapter, pulling the API key from the secret store.
    pub fn new(settings: ProviderSettings, secrets: &SecretStore) -> PipelineResult<Self> {
        let api_key = secrets.get(&settings.api_key_env())?;
        let client = reqwest::Client::builder()
            .timeout(settings.timeout())
            .build()
            .map_err(|e| PipelineError::configuration(format!("anthropic http client: {e}")))?;

        log_debug!(
            provider = PROVIDER,
            model = %settings.model_id,
            timeout_ms = settings.timeout_ms,
            "Anthropic provider initialized"
        );
        Ok(Self {
            client,
            settings,
            api_key,
        })
    }

    fn headers(&self) -> PipelineResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            "x-api-key",
            HeaderValue::from_str(&self.api_key).map_err(|e| {
                PipelineError::configuration(format!("invalid anthropic API key format: {e}"))
            })?,
        );
        headers.insert("anthropic-version", HeaderValue::from_static(API_VERSION));
        Ok(headers)
    }

    async fn send(&self, request: &MessagesRequest) -> PipelineResult<MessagesResponse> {
        let url = format!("{}/v1/messages", self.settings.base_url);
        let response = self
            .client
            .post(&url)
            .headers(self.headers()?)
            .json(request)
            .send()
            .await
            .map_err(|e| map_transport_error(PROVIDER, e, self.settings.timeout_ms))?;
        let body = check_response(PROVIDER, response).await?;
        serde_json::from_str(&body)
            .map_err(|e| PipelineError::schema_violation(PROVIDER, format!("response envelope: {e}")))
    }

    fn usage_pair(usage: Option<&Usage>) -> Option<(u32, u32)> {
        usage.and_then(|u| Some((u.input_tokens?, u.output_tokens?)))
    }
}

#[async_trait]
impl EntityExtractor for AnthropicExtractor {
    async fn extract(&self, email: &EmailMessage) -> PipelineResult<ExtractedEntities> {
        let prompt = extraction_prompt(email);
        let request = MessagesRequest {
            model: self.settings.model_id.clone(),
            max_tokens: 1024,
            messages: vec![Message {
                role: "user",
                content: prompt.clone(),
            }],
            temperature: 0.1,
            tools: Some(vec![serde_json::json!({
                "name": EXTRACTION_TOOL,
                "description": "Record the entities extracted from the email",
                "input_schema": extraction_schema(),
            })]),
            tool_choice: Some(serde_json::json!({"type": "tool", "name": EXTRACTION_TOOL})),
        };

        let started = Instant::now();
        let response = self.send(&request).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let value = response
            .content
            .iter()
            .find_map(|block| match block {
                ContentBlock::ToolUse { name, input } if name == EXTRACTION_TOOL => {
                    Some(input.clone())
                }
                _ => None,
            })
            .ok_or_else(|| {
                PipelineError::schema_violation(PROVIDER, "response carried no extraction tool call")
            })?;

        let completion_text = value.to_string();
        let (input_tokens, output_tokens, usage_estimated) = usage_or_estimate(
            Self::usage_pair(response.usage.as_ref()),
            &prompt,
            &completion_text,
        );
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
        let request = MessagesRequest {
            model: self.settings.model_id.clone(),
            max_tokens: 1024,
            messages: vec![Message {
                role: "user",
                content: prompt.to_string(),
            }],
            temperature: 0.1,
            tools: None,
            tool_choice: None,
        };

        let started = Instant::now();
        let response = self.send(&request).await?;
        let latency_ms = started.elapsed().as_millis() as u64;

        let text = response
            .content
            .iter()
            .find_map(|block| match block {
                ContentBlock::Text { text } => Some(text.clone()),
                _ => None,
            })
            .ok_or_else(|| {
                PipelineError::schema_violation(PROVIDER, "response carried no text content")
            })?;
        let (input_tokens, output_tokens, usage_estimated) =
            usage_or_estimate(Self::usage_pair(response.usage.as_ref()), prompt, &text);
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
