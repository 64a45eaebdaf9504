//! Test helper utilities for collabiq integration tests.
//!
//! Provides provider/workspace HTTP stubs, configuration builders pointing
//! at mock servers, and cache/inbox seeding for end-to-end scenarios.
//!
//! IMPORTANT: These helpers are test-only and should NEVER be used in
//! production code.

// Allow dead code in test utilities - functions are used across different test files
#![allow(dead_code)]

use chrono::{TimeZone, Utc};
use serde_json::{json, Value};
use std::path::Path;
use std::sync::Arc;
use wiremock::matchers::{body_string_contains, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use collabiq::config::{
    AppConfig, DaemonSettings, OrchestratorSettings, ProviderSettings, WorkspaceSettings,
};
use collabiq::providers::{
    AnthropicExtractor, EntityExtractor, GeminiExtractor, OpenAiExtractor, ProviderHandle,
};
use collabiq::secrets::SecretStore;
use collabiq::EmailMessage;

pub const COLLABS_DB: &str = "collabs-db";
pub const COMPANIES_DB: &str = "companies-db";
pub const USERS_DB: &str = "users-db";

pub const PAGE_ID: &str = "p0000000-0000-0000-0000-000000000001";
pub const COMPANY_BONBOM: &str = "c0000000-0000-0000-0000-00000000bb01";
pub const COMPANY_SHINSEGAE: &str = "c0000000-0000-0000-0000-00000000ss02";
pub const USER_KIM: &str = "u0000000-0000-0000-0000-000000000k01";

/// Providers pull API keys from the environment; give every test process
/// the same fixed test keys.
pub fn ensure_api_keys() {
    std::env::set_var("GEMINI_API_KEY", "test-gemini-key");
    std::env::set_var("OPENAI_API_KEY", "test-openai-key");
    std::env::set_var("ANTHROPIC_API_KEY", "test-anthropic-key");
    std::env::set_var("WORKSPACE_API_TOKEN", "test-workspace-token");
}

pub fn fixture_received_at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).unwrap()
}

pub fn fixture_email(message_id: &str, body: &str) -> EmailMessage {
    EmailMessage {
        message_id: message_id.to_string(),
        body_text: body.to_string(),
        received_at: fixture_received_at(),
    }
}

/// Provider settings with fast retries pointed at a mock server.
pub fn provider_settings(name: &str, base_url: &str, priority: u8) -> ProviderSettings {
    ProviderSettings {
        name: name.to_string(),
        model_id: match name {
            "gemini" => "gemini-2.0-flash".to_string(),
            "openai" => "gpt-4o-mini".to_string(),
            _ => "claude-3-5-haiku-latest".to_string(),
        },
        base_url: base_url.to_string(),
        enabled: true,
        priority,
        timeout_ms: 5_000,
        max_retries: 3,
        input_price_per_mtok: 0.10,
        output_price_per_mtok: 0.40,
        free_tier: name == "gemini",
    }
}

/// Full pipeline configuration against mock servers and a temp data dir.
pub fn test_config(provider_url: &str, workspace_url: &str, data_dir: &Path) -> AppConfig {
    AppConfig {
        providers: vec![
            provider_settings("gemini", provider_url, 1),
            provider_settings("openai", provider_url, 2),
            provider_settings("anthropic", provider_url, 3),
        ],
        orchestrator: OrchestratorSettings::default(),
        workspace: WorkspaceSettings {
            base_url: workspace_url.to_string(),
            companies_db_id: COMPANIES_DB.to_string(),
            users_db_id: USERS_DB.to_string(),
            collaborations_db_id: COLLABS_DB.to_string(),
            requests_per_second: 50,
            ..WorkspaceSettings::default()
        },
        daemon: DaemonSettings {
            cycle_interval_ms: 1_000,
            data_dir: data_dir.to_path_buf(),
        },
    }
}

// ============================================================================
// Provider stubs
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Gemini,
    OpenAi,
    Anthropic,
}

impl ProviderKind {
    pub fn all() -> [ProviderKind; 3] {
        [Self::Gemini, Self::OpenAi, Self::Anthropic]
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Gemini => "gemini",
            Self::OpenAi => "openai",
            Self::Anthropic => "anthropic",
        }
    }

    pub fn endpoint(self) -> &'static str {
        match self {
            Self::Gemini => "/v1beta/models/gemini-2.0-flash:generateContent",
            Self::OpenAi => "/v1/chat/completions",
            Self::Anthropic => "/v1/messages",
        }
    }

    /// Wrap an extraction object in this provider's response envelope.
    pub fn extraction_body(self, extraction: &Value) -> Value {
        match self {
            Self::Gemini => json!({
                "candidates": [
                    { "content": { "parts": [ { "text": extraction.to_string() } ] } }
                ],
                "usageMetadata": { "promptTokenCount": 500, "candidatesTokenCount": 60 }
            }),
            Self::OpenAi => json!({
                "choices": [ { "message": { "content": extraction.to_string() } } ],
                "usage": { "prompt_tokens": 500, "completion_tokens": 60 }
            }),
            Self::Anthropic => json!({
                "content": [
                    { "type": "tool_use", "name": "record_extraction", "input": extraction }
                ],
                "usage": { "input_tokens": 500, "output_tokens": 60 }
            }),
        }
    }

    /// Wrap plain text in this provider's response envelope.
    pub fn text_body(self, text: &str) -> Value {
        match self {
            Self::Gemini => json!({
                "candidates": [ { "content": { "parts": [ { "text": text } ] } } ],
                "usageMetadata": { "promptTokenCount": 200, "candidatesTokenCount": 30 }
            }),
            Self::OpenAi => json!({
                "choices": [ { "message": { "content": text } } ],
                "usage": { "prompt_tokens": 200, "completion_tokens": 30 }
            }),
            Self::Anthropic => json!({
                "content": [ { "type": "text", "text": text } ],
                "usage": { "input_tokens": 200, "output_tokens": 30 }
            }),
        }
    }

    pub fn build(self, base_url: &str) -> Arc<dyn EntityExtractor> {
        ensure_api_keys();
        let secrets = SecretStore::default();
        let settings = provider_settings(self.name(), base_url, 1);
        match self {
            Self::Gemini => Arc::new(GeminiExtractor::new(settings, &secrets).unwrap()),
            Self::OpenAi => Arc::new(OpenAiExtractor::new(settings, &secrets).unwrap()),
            Self::Anthropic => Arc::new(AnthropicExtractor::new(settings, &secrets).unwrap()),
        }
    }

    pub fn handle(self, base_url: &str, priority: u8) -> ProviderHandle {
        ProviderHandle {
            settings: provider_settings(self.name(), base_url, priority),
            extractor: self.build(base_url),
        }
    }
}

/// The canonical happy-path extraction for "어제 신세계와 본봄 파일럿 킥오프 미팅".
pub fn bonbom_extraction() -> Value {
    json!({
        "person_in_charge": "김철수",
        "company_name": "본봄",
        "partner_org": "신세계",
        "details": "어제 신세계와 본봄 파일럿 킥오프 미팅을 진행했다.",
        "collab_date": "어제",
        "confidence": {
            "person_in_charge": 0.9,
            "company_name": 0.95,
            "partner_org": 0.9,
            "details": 0.9,
            "collab_date": 0.85
        }
    })
}

/// Mount the three prompt-discriminated responses one provider needs to
/// carry a full pipeline run: extraction, intensity label, and summary.
pub async fn mount_full_provider(server: &MockServer, kind: ProviderKind, extraction: &Value) {
    Mock::given(method("POST"))
        .and(path(kind.endpoint()))
        .and(body_string_contains("analyst extracting collaboration facts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kind.extraction_body(extraction)))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(kind.endpoint()))
        .and(body_string_contains("Classify the depth"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kind.text_body("Cooperation")))
        .mount(server)
        .await;
    Mock::given(method("POST"))
        .and(path(kind.endpoint()))
        .and(body_string_contains("Summarize this business collaboration email"))
        .respond_with(ResponseTemplate::new(200).set_body_json(kind.text_body(
            "본봄과 신세계가 어제 파일럿 킥오프 미팅을 진행하고 향후 협업 일정을 논의했다. 김철수가 실무를 맡는다.",
        )))
        .mount(server)
        .await;
}

// ============================================================================
// Workspace cache / inbox seeding
// ============================================================================

/// Pre-seed the companies cache so scenarios control the match universe
/// without stubbing the paginated fetch.
pub async fn seed_companies_cache(data_dir: &Path, companies: &[(&str, &str, Option<&str>)]) {
    let rows: Vec<Value> = companies
        .iter()
        .map(|(id, name, group)| {
            json!({ "id": id, "name": name, "group": group.map(str::to_string) })
        })
        .collect();
    write_cache(data_dir, "companies.json", json!(rows), 6 * 60 * 60).await;
}

pub async fn seed_users_cache(data_dir: &Path, users: &[(&str, &str)]) {
    let rows: Vec<Value> = users
        .iter()
        .map(|(id, name)| {
            json!({ "id": id, "name": name, "user_type": "person", "email": null })
        })
        .collect();
    write_cache(data_dir, "users.json", json!(rows), 24 * 60 * 60).await;
}

async fn write_cache(data_dir: &Path, file: &str, data: Value, ttl_seconds: u64) {
    let envelope = json!({
        "cached_at": Utc::now().to_rfc3339(),
        "ttl_seconds": ttl_seconds,
        "data": data,
    });
    let dir = data_dir.join("cache");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(dir.join(file), serde_json::to_vec_pretty(&envelope).unwrap())
        .await
        .unwrap();
}

/// Drop an email into the JSON inbox the development mail adapter reads.
pub async fn seed_inbox(data_dir: &Path, sequence: u32, email: &EmailMessage) {
    let dir = data_dir.join("inbox");
    tokio::fs::create_dir_all(&dir).await.unwrap();
    tokio::fs::write(
        dir.join(format!("{sequence:04}.json")),
        serde_json::to_vec_pretty(email).unwrap(),
    )
    .await
    .unwrap();
}

// ============================================================================
// Workspace stubs
// ============================================================================

/// Duplicate check returning no existing page.
pub async fn mount_no_duplicate(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/v1/databases/{COLLABS_DB}/query")))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(json!({ "results": [], "has_more": false })),
        )
        .mount(server)
        .await;
}

/// Page creation succeeding with a fixed id.
pub async fn mount_create_page(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path("/v1/pages"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "id": PAGE_ID, "properties": {} })),
        )
        .mount(server)
        .await;
}
