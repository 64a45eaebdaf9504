use crate::error::PipelineError;
use crate::tests::fixture_entities;

// Unit Tests for ExtractedEntities
//
// UNIT UNDER TEST: ExtractedEntities validation and derived scores
//
// BUSINESS RESPONSIBILITY:
//   - Enforces the confidence law: a field is null iff its confidence is 0.0
//   - Aggregate confidence averages only the non-null fields
//   - Completeness is the filled fraction of the five extraction fields
//
// TEST COVERAGE: the law in both directions, bounds checking, and the
// derived score arithmetic.

#[test]
fn test_valid_extraction_passes() {
    fixture_entities("gemini", 0.9).validate().expect("fixture is valid");
}

#[test]
fn test_null_field_with_confidence_is_rejected() {
    let mut entities = fixture_entities("gemini", 0.9);
    entities.partner_org = None; // confidence stays 0.9
    let err = entities.validate().expect_err("law violated");
    assert!(matches!(err, PipelineError::SchemaViolation { .. }));
}

#[test]
fn test_populated_field_with_zero_confidence_is_rejected() {
    let mut entities = fixture_entities("gemini", 0.9);
    entities
        .per_field_confidence
        .insert("company_name".to_string(), 0.0);
    let err = entities.validate().expect_err("law violated");
    assert!(matches!(err, PipelineError::SchemaViolation { .. }));
}

#[test]
fn test_out_of_range_confidence_is_rejected() {
    let mut entities = fixture_entities("gemini", 0.9);
    entities
        .per_field_confidence
        .insert("details".to_string(), 1.5);
    assert!(entities.validate().is_err());
}

#[test]
fn test_empty_details_is_rejected() {
    let mut entities = fixture_entities("gemini", 0.9);
    entities.details = "   ".to_string();
    assert!(entities.validate().is_err());
}

#[test]
fn test_null_field_with_zero_confidence_passes() {
    let mut entities = fixture_entities("gemini", 0.9);
    entities.collab_date = None;
    entities
        .per_field_confidence
        .insert("collab_date".to_string(), 0.0);
    entities.validate().expect("null with 0.0 satisfies the law");
}

#[test]
fn test_aggregate_confidence_averages_non_null_fields() {
    let mut entities = fixture_entities("gemini", 0.8);
    entities.collab_date = None;
    entities
        .per_field_confidence
        .insert("collab_date".to_string(), 0.0);
    // Four populated fields at 0.8; the null date is excluded, not averaged
    // in as zero.
    assert!((entities.aggregate_confidence() - 0.8).abs() < 1e-9);
}

#[test]
fn test_field_completeness_counts_filled_fields() {
    let mut entities = fixture_entities("gemini", 0.9);
    entities.person_in_charge = None;
    entities
        .per_field_confidence
        .insert("person_in_charge".to_string(), 0.0);
    entities.collab_date = None;
    entities
        .per_field_confidence
        .insert("collab_date".to_string(), 0.0);
    assert!((entities.field_completeness() - 0.6).abs() < 1e-9);
}
