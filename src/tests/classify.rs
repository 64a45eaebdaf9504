use crate::classify::{classify_type, sentence_count, summary_is_valid};
use crate::entities::CollabType;
use crate::workspace::cache::{CompanyGroup, CompanyRow};
use crate::workspace::{CompanyMatch, ConfidenceLevel, MatchType};

// Unit Tests for classification and summary shape checking
//
// UNIT UNDER TEST: classify_type / sentence_count / summary_is_valid
//
// BUSINESS RESPONSIBILITY:
//   - Type A/B/C/D is deterministic from portfolio/affiliate membership
//   - Undecidable membership degrades to D at half confidence
//   - Summaries are 1-4 sentences of 50-400 characters
//
// TEST COVERAGE: the four types, the undecidable path, sentence counting
// over Korean and English punctuation, and the summary bounds.

const ID_A: &str = "a0000000-0000-0000-0000-000000000001";
const ID_B: &str = "b0000000-0000-0000-0000-000000000002";

fn row(id: &str, name: &str, group: Option<CompanyGroup>) -> CompanyRow {
    CompanyRow {
        id: id.to_string(),
        name: name.to_string(),
        group,
    }
}

fn matched(id: &str, name: &str) -> CompanyMatch {
    CompanyMatch {
        page_id: Some(id.to_string()),
        matched_name: name.to_string(),
        similarity: 1.0,
        match_type: MatchType::Exact,
        confidence_level: ConfidenceLevel::High,
        was_created: false,
    }
}

#[test]
fn test_portfolio_affiliate_is_type_a() {
    let companies = vec![
        row(ID_A, "본봄", Some(CompanyGroup::Portfolio)),
        row(ID_B, "신세계", Some(CompanyGroup::Affiliate)),
    ];
    let (collab_type, confidence) = classify_type(
        &matched(ID_A, "본봄"),
        &matched(ID_B, "신세계"),
        &companies,
    );
    assert_eq!(collab_type, CollabType::PortfolioAffiliate);
    assert_eq!(confidence, 1.0);
}

#[test]
fn test_affiliate_portfolio_order_is_still_type_a() {
    let companies = vec![
        row(ID_A, "신세계", Some(CompanyGroup::Affiliate)),
        row(ID_B, "본봄", Some(CompanyGroup::Portfolio)),
    ];
    let (collab_type, _) = classify_type(
        &matched(ID_A, "신세계"),
        &matched(ID_B, "본봄"),
        &companies,
    );
    assert_eq!(collab_type, CollabType::PortfolioAffiliate);
}

#[test]
fn test_portfolio_portfolio_is_type_c() {
    let companies = vec![
        row(ID_A, "본봄", Some(CompanyGroup::Portfolio)),
        row(ID_B, "웨이크", Some(CompanyGroup::Portfolio)),
    ];
    let (collab_type, _) = classify_type(
        &matched(ID_A, "본봄"),
        &matched(ID_B, "웨이크"),
        &companies,
    );
    assert_eq!(collab_type, CollabType::PortfolioPortfolio);
}

#[test]
fn test_ungrouped_company_with_affiliate_partner_is_type_b() {
    let companies = vec![
        row(ID_A, "외부사", None),
        row(ID_B, "신세계", Some(CompanyGroup::Affiliate)),
    ];
    let (collab_type, confidence) = classify_type(
        &matched(ID_A, "외부사"),
        &matched(ID_B, "신세계"),
        &companies,
    );
    assert_eq!(collab_type, CollabType::NonPortfolioAffiliate);
    assert_eq!(confidence, 1.0);
}

#[test]
fn test_unmatched_company_defaults_to_d_at_half_confidence() {
    let companies = vec![row(ID_B, "신세계", Some(CompanyGroup::Affiliate))];
    let (collab_type, confidence) = classify_type(
        &CompanyMatch::none(),
        &CompanyMatch::none(),
        &companies,
    );
    assert_eq!(collab_type, CollabType::Other);
    assert_eq!(confidence, 0.5);
}

#[test]
fn test_sentence_count_handles_korean_and_english() {
    assert_eq!(sentence_count("한 문장입니다."), 1);
    assert_eq!(sentence_count("첫 문장. 두 번째 문장."), 2);
    assert_eq!(sentence_count("One. Two! Three?"), 3);
    assert_eq!(sentence_count("끝맺음 없는 문장"), 1);
    assert_eq!(sentence_count("마침표 뒤 추가 텍스트. 그리고 더"), 2);
}

#[test]
fn test_summary_shape_bounds() {
    let good = "본봄과 신세계가 파일럿 킥오프 미팅을 진행하고 다음 분기 협업 일정을 확정했다. 양사 실무진이 모두 참석했다.";
    assert!(summary_is_valid(good));

    assert!(!summary_is_valid("너무 짧다."), "below 50 chars");

    let too_long = "가".repeat(401);
    assert!(!summary_is_valid(&too_long), "above 400 chars");

    let five_sentences = "이것은 대략 오십 글자를 넘기기 위한 첫 문장입니다. 둘째. 셋째. 넷째. 다섯째 문장입니다.";
    assert!(
        !summary_is_valid(five_sentences),
        "five sentences exceed the limit"
    );
}
