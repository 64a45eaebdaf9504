//! Mapping extraction results onto workspace property payloads.
//!
//! Stateless: one [`CollabRecord`] in, one properties object out. The rules
//! the workspace API cares about are enforced here (null omission, rich
//! text truncation, relation id shape), while select option validity is
//! left to the server (a 400 comes back Permanent and parks the email).

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::matcher::{CompanyMatch, PersonMatch};
use crate::entities::{Classification, EmailMessage, ExtractedEntities};
use crate::error::{PipelineError, PipelineResult};

/// Rich text fields are cut at this many characters, ellipsis included.
const RICH_TEXT_LIMIT: usize = 2000;

// Property names in the Collaborations database.
pub const PROP_TITLE: &str = "Name";
pub const PROP_SUMMARY: &str = "Summary";
pub const PROP_DETAILS: &str = "Details";
pub const PROP_COLLAB_TYPE: &str = "Collab Type";
pub const PROP_INTENSITY: &str = "Intensity";
pub const PROP_COMPANY: &str = "Company";
pub const PROP_PARTNER: &str = "Partner";
pub const PROP_PERSON: &str = "Person in Charge";
pub const PROP_COLLAB_DATE: &str = "Collab Date";
pub const PROP_MESSAGE_ID: &str = "Message ID";
pub const PROP_CONFIDENCE: &str = "Confidence";

/// Everything known about one email at write time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CollabRecord {
    pub email: EmailMessage,
    pub entities: ExtractedEntities,
    pub classification: Classification,
    pub summary: String,
    pub company_match: CompanyMatch,
    pub partner_match: CompanyMatch,
    pub person_match: PersonMatch,
}

/// Truncate to the rich text limit, appending an ellipsis when cut.
fn truncate_rich_text(text: &str) -> String {
    if text.chars().count() <= RICH_TEXT_LIMIT {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(RICH_TEXT_LIMIT - 1).collect();
    cut.push('…');
    cut
}

fn rich_text_value(text: &str) -> Value {
    json!({ "rich_text": [ { "text": { "content": truncate_rich_text(text) } } ] })
}

fn title_value(text: &str) -> Value {
    json!({ "title": [ { "text": { "content": truncate_rich_text(text) } } ] })
}

fn select_value(option: &str) -> Value {
    json!({ "select": { "name": option } })
}

/// Relation ids are UUIDs: 32 chars bare or 36 with hyphens. Anything else
/// would be rejected server-side anyway; fail fast as Permanent.
fn relation_value(page_id: &str) -> PipelineResult<Value> {
    if page_id.len() != 32 && page_id.len() != 36 {
        return Err(PipelineError::validation(format!(
            "relation id has invalid length {}: {page_id}",
            page_id.len()
        )));
    }
    Ok(json!({ "relation": [ { "id": page_id } ] }))
}

fn people_value(user_id: &str) -> PipelineResult<Value> {
    if user_id.len() != 32 && user_id.len() != 36 {
        return Err(PipelineError::validation(format!(
            "user id has invalid length {}: {user_id}",
            user_id.len()
        )));
    }
    Ok(json!({ "people": [ { "id": user_id } ] }))
}

/// Build the properties payload for one record.
///
/// Null, empty, and empty-list fields are omitted entirely; numeric zero is
/// emitted (a 0.0 confidence is meaningful). Korean text passes through
/// untouched; serde_json does no normalization beyond UTF-8 escaping the
/// transport requires.
pub fn build_properties(record: &CollabRecord) -> PipelineResult<Value> {
    let mut properties = Map::new();

    let subject = format!(
        "{}-{}",
        record.entities.company_name.as_deref().unwrap_or("unknown"),
        record.entities.partner_org.as_deref().unwrap_or("unknown"),
    );
    properties.insert(PROP_TITLE.to_string(), title_value(&subject));

    if !record.summary.trim().is_empty() {
        properties.insert(PROP_SUMMARY.to_string(), rich_text_value(&record.summary));
    }
    if !record.entities.details.trim().is_empty() {
        properties.insert(
            PROP_DETAILS.to_string(),
            rich_text_value(&record.entities.details),
        );
    }

    properties.insert(
        PROP_COLLAB_TYPE.to_string(),
        select_value(record.classification.collab_type.code()),
    );
    properties.insert(
        PROP_INTENSITY.to_string(),
        select_value(record.classification.intensity.label()),
    );

    if let Some(page_id) = record.company_match.page_id.as_deref() {
        properties.insert(PROP_COMPANY.to_string(), relation_value(page_id)?);
    }
    if let Some(page_id) = record.partner_match.page_id.as_deref() {
        properties.insert(PROP_PARTNER.to_string(), relation_value(page_id)?);
    }
    if let Some(user_id) = record.person_match.user_id.as_deref() {
        properties.insert(PROP_PERSON.to_string(), people_value(user_id)?);
    }

    if let Some(date) = record.entities.collab_date {
        // ISO date only; time and zone are discarded by construction.
        properties.insert(
            PROP_COLLAB_DATE.to_string(),
            json!({ "date": { "start": date.format("%Y-%m-%d").to_string() } }),
        );
    }

    properties.insert(
        PROP_MESSAGE_ID.to_string(),
        rich_text_value(&record.email.message_id),
    );
    properties.insert(
        PROP_CONFIDENCE.to_string(),
        json!({ "number": record.entities.aggregate_confidence() }),
    );

    Ok(Value::Object(properties))
}
