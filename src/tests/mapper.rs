use crate::entities::{Classification, CollabType, Intensity};
use crate::tests::{fixture_email, fixture_entities};
use crate::workspace::mapper::{
    build_properties, PROP_COLLAB_DATE, PROP_COMPANY, PROP_CONFIDENCE, PROP_MESSAGE_ID,
    PROP_PARTNER, PROP_PERSON, PROP_SUMMARY, PROP_TITLE,
};
use crate::workspace::{CollabRecord, CompanyMatch, ConfidenceLevel, MatchType, PersonMatch};

// Unit Tests for the field mapper
//
// UNIT UNDER TEST: build_properties (record → workspace property payload)
//
// BUSINESS RESPONSIBILITY:
//   - Omits null/empty fields instead of emitting explicit nulls
//   - Emits numeric zero (it is meaningful)
//   - Truncates rich text at 2000 chars with an ellipsis
//   - Rejects relation ids that are not 32 or 36 chars
//   - Produces the synthetic "{company}-{partner}" subject
//   - Round-trips Korean text byte-identically
//
// TEST COVERAGE: each rule, plus the serialization identity for Korean.

const PAGE_ID: &str = "c0000000-0000-0000-0000-000000000001";
const USER_ID: &str = "u0000000-0000-0000-0000-000000000001";

fn company_match(page_id: &str) -> CompanyMatch {
    CompanyMatch {
        page_id: Some(page_id.to_string()),
        matched_name: "본봄".to_string(),
        similarity: 1.0,
        match_type: MatchType::Exact,
        confidence_level: ConfidenceLevel::High,
        was_created: false,
    }
}

fn person_match(user_id: &str) -> PersonMatch {
    PersonMatch {
        user_id: Some(user_id.to_string()),
        user_name: "김철수".to_string(),
        similarity: 1.0,
        match_type: MatchType::Exact,
        is_ambiguous: false,
        alternatives: Vec::new(),
    }
}

fn record() -> CollabRecord {
    CollabRecord {
        email: fixture_email("m-100", "본봄과 신세계 협업"),
        entities: fixture_entities("gemini", 0.9),
        classification: Classification {
            collab_type: CollabType::PortfolioAffiliate,
            intensity: Intensity::Cooperation,
            type_confidence: 1.0,
            intensity_confidence: 0.9,
        },
        summary: "본봄과 신세계가 지난주 파일럿 킥오프 미팅을 진행하며 협업 범위를 논의했다."
            .to_string(),
        company_match: company_match(PAGE_ID),
        partner_match: company_match(PAGE_ID),
        person_match: person_match(USER_ID),
    }
}

#[test]
fn test_full_record_maps_every_property() {
    let properties = build_properties(&record()).unwrap();
    let obj = properties.as_object().unwrap();
    for key in [
        PROP_TITLE,
        PROP_SUMMARY,
        PROP_COMPANY,
        PROP_PARTNER,
        PROP_PERSON,
        PROP_COLLAB_DATE,
        PROP_MESSAGE_ID,
        PROP_CONFIDENCE,
    ] {
        assert!(obj.contains_key(key), "missing property {key}");
    }
}

#[test]
fn test_synthetic_subject_joins_company_and_partner() {
    let properties = build_properties(&record()).unwrap();
    let title = properties[PROP_TITLE]["title"][0]["text"]["content"]
        .as_str()
        .unwrap();
    assert_eq!(title, "본봄-신세계");
}

#[test]
fn test_null_fields_are_omitted_not_nulled() {
    let mut record = record();
    record.person_match = PersonMatch::none();
    record.partner_match = CompanyMatch::none();
    record.entities.collab_date = None;
    record
        .entities
        .per_field_confidence
        .insert("collab_date".to_string(), 0.0);
    record.summary = String::new();

    let properties = build_properties(&record).unwrap();
    let obj = properties.as_object().unwrap();
    assert!(!obj.contains_key(PROP_PERSON));
    assert!(!obj.contains_key(PROP_PARTNER));
    assert!(!obj.contains_key(PROP_COLLAB_DATE));
    assert!(!obj.contains_key(PROP_SUMMARY));
}

#[test]
fn test_numeric_zero_confidence_is_emitted() {
    let mut record = record();
    // Every optional field nulled, details barely confident: aggregate can
    // legitimately be very low, and must still be emitted.
    record.entities.person_in_charge = None;
    record.entities.company_name = None;
    record.entities.partner_org = None;
    record.entities.collab_date = None;
    for field in ["person_in_charge", "company_name", "partner_org", "collab_date"] {
        record
            .entities
            .per_field_confidence
            .insert(field.to_string(), 0.0);
    }

    let properties = build_properties(&record).unwrap();
    assert!(
        properties[PROP_CONFIDENCE]["number"].is_number(),
        "zero-ish numbers are meaningful and must be present"
    );
}

#[test]
fn test_rich_text_is_truncated_with_ellipsis() {
    let mut record = record();
    record.summary = "가".repeat(2500);
    let properties = build_properties(&record).unwrap();
    let summary = properties[PROP_SUMMARY]["rich_text"][0]["text"]["content"]
        .as_str()
        .unwrap();
    assert_eq!(summary.chars().count(), 2000);
    assert!(summary.ends_with('…'));
}

#[test]
fn test_invalid_relation_id_length_fails_validation() {
    let mut record = record();
    record.company_match = company_match("short-id");
    let err = build_properties(&record).expect_err("bad relation id");
    assert!(matches!(err, crate::error::PipelineError::Validation { .. }));
}

#[test]
fn test_date_is_iso_without_time() {
    let properties = build_properties(&record()).unwrap();
    assert_eq!(
        properties[PROP_COLLAB_DATE]["date"]["start"].as_str().unwrap(),
        "2025-03-13"
    );
}

#[test]
fn test_korean_text_round_trips_identically() {
    let properties = build_properties(&record()).unwrap();
    let serialized = serde_json::to_string(&properties).unwrap();
    let reparsed: serde_json::Value = serde_json::from_str(&serialized).unwrap();
    assert_eq!(properties, reparsed);
    assert_eq!(
        reparsed[PROP_MESSAGE_ID]["rich_text"][0]["text"]["content"]
            .as_str()
            .unwrap(),
        "m-100"
    );
    let summary = reparsed[PROP_SUMMARY]["rich_text"][0]["text"]["content"]
        .as_str()
        .unwrap();
    assert!(summary.contains("본봄과 신세계"));
}
