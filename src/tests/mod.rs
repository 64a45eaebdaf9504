//! Unit test modules.
//!
//! Integration tests that exercise real HTTP flows live under `tests/`;
//! everything here runs against in-process components only.

mod breaker;
mod classify;
mod config;
mod entities;
mod mapper;
mod trackers;

use crate::entities::{EmailMessage, ExtractedEntities, Provenance};
use chrono::{TimeZone, Utc};
use std::collections::BTreeMap;

/// A received-at timestamp shared by the fixtures (a Friday).
pub(crate) fn fixture_received_at() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 3, 14, 9, 30, 0).unwrap()
}

pub(crate) fn fixture_email(message_id: &str, body: &str) -> EmailMessage {
    EmailMessage {
        message_id: message_id.to_string(),
        body_text: body.to_string(),
        received_at: fixture_received_at(),
    }
}

/// A fully populated extraction from one named provider.
pub(crate) fn fixture_entities(provider: &str, confidence: f64) -> ExtractedEntities {
    let mut per_field_confidence = BTreeMap::new();
    for field in crate::entities::EXTRACTION_FIELDS {
        per_field_confidence.insert(field.to_string(), confidence);
    }
    ExtractedEntities {
        person_in_charge: Some("김철수".to_string()),
        company_name: Some("본봄".to_string()),
        partner_org: Some("신세계".to_string()),
        details: "본봄과 신세계가 파일럿 킥오프 미팅을 진행했다.".to_string(),
        collab_date: Some(chrono::NaiveDate::from_ymd_opt(2025, 3, 13).unwrap()),
        per_field_confidence,
        provenance: Provenance {
            provider_name: provider.to_string(),
            model_id: format!("{provider}-model"),
            input_tokens: 500,
            output_tokens: 80,
            latency_ms: 420,
            strategy: None,
            fallback_used: false,
            usage_estimated: false,
        },
    }
}
