//! Collaboration classification and summarization.
//!
//! Type is deterministic from the portfolio/affiliate membership of the two
//! matched companies; intensity and the summary come from the orchestrator.
//! Both LLM-derived outputs are held to closed contracts: intensity to a
//! four-word vocabulary, the summary to 1–4 sentences of 50–400 characters
//! in the input language.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::entities::{Classification, CollabType, EmailMessage, ExtractedEntities, Intensity, Strategy};
use crate::error::PipelineResult;
use crate::logging::{log_info, log_warn};
use crate::orchestrator::Orchestrator;
use crate::workspace::{CompanyGroup, CompanyMatch, CompanyRow};

const SUMMARY_MIN_CHARS: usize = 50;
const SUMMARY_MAX_CHARS: usize = 400;
const SUMMARY_MAX_SENTENCES: usize = 4;
const SUMMARY_ATTEMPTS: u32 = 3;

static SENTENCE_END: Lazy<Regex> = Lazy::new(|| Regex::new(r"[.!?…]+").unwrap());

/// Membership of a matched company in the configured groups.
fn group_of(m: &CompanyMatch, companies: &[CompanyRow]) -> Option<CompanyGroup> {
    let page_id = m.page_id.as_deref()?;
    companies
        .iter()
        .find(|row| row.id == page_id)
        .and_then(|row| row.group)
}

/// Derive the collaboration type from company membership.
///
/// A: Portfolio × Affiliate, B: non-portfolio × Affiliate,
/// C: Portfolio × Portfolio, D: everything else. When membership cannot be
/// decided the type is D at confidence 0.5 with a warning.
pub fn classify_type(
    company: &CompanyMatch,
    partner: &CompanyMatch,
    companies: &[CompanyRow],
) -> (CollabType, f64) {
    let company_group = group_of(company, companies);
    let partner_group = group_of(partner, companies);

    match (company_group, partner_group) {
        (Some(a), Some(b)) => {
            let pair = [a, b];
            let collab_type = if pair.contains(&CompanyGroup::Portfolio)
                && pair.contains(&CompanyGroup::Affiliate)
            {
                CollabType::PortfolioAffiliate
            } else if pair == [CompanyGroup::Portfolio, CompanyGroup::Portfolio] {
                CollabType::PortfolioPortfolio
            } else if pair.contains(&CompanyGroup::Affiliate) {
                CollabType::NonPortfolioAffiliate
            } else {
                CollabType::Other
            };
            (collab_type, 1.0)
        }
        // A matched but ungrouped company against an affiliate counterpart
        // is decidable: the ungrouped side is by definition not portfolio.
        (None, Some(CompanyGroup::Affiliate)) if company.page_id.is_some() => {
            (CollabType::NonPortfolioAffiliate, 1.0)
        }
        (Some(CompanyGroup::Affiliate), None) if partner.page_id.is_some() => {
            (CollabType::NonPortfolioAffiliate, 1.0)
        }
        _ => {
            log_warn!(
                company = %company.matched_name,
                partner = %partner.matched_name,
                "Collab type undecidable, defaulting to D"
            );
            (CollabType::Other, 0.5)
        }
    }
}

fn intensity_prompt(entities: &ExtractedEntities) -> String {
    format!(
        r#"Classify the depth of this business collaboration. Answer with exactly
one word from this list and nothing else:

Awareness, Cooperation, Investment, Acquisition

Collaboration: {details}"#,
        details = entities.details
    )
}

/// Classify intensity through the orchestrator.
///
/// Out-of-vocabulary answers fall back to Cooperation at confidence 0.5.
pub async fn classify_intensity(
    orchestrator: &Orchestrator,
    entities: &ExtractedEntities,
    strategy: Strategy,
) -> PipelineResult<(Intensity, f64)> {
    let outcome = orchestrator
        .complete(&intensity_prompt(entities), strategy)
        .await?;
    let answer = outcome
        .response
        .text
        .trim()
        .trim_matches(|c: char| c.is_ascii_punctuation())
        .to_string();

    match Intensity::parse(&answer) {
        Some(intensity) => Ok((intensity, 0.9)),
        None => {
            log_warn!(
                provider = %outcome.provider_name,
                answer = %answer,
                "Out-of-vocabulary intensity, falling back to Cooperation"
            );
            Ok((Intensity::Cooperation, 0.5))
        }
    }
}

/// Produce the full classification for one extraction.
pub async fn classify(
    orchestrator: &Orchestrator,
    entities: &ExtractedEntities,
    company: &CompanyMatch,
    partner: &CompanyMatch,
    companies: &[CompanyRow],
    strategy: Strategy,
) -> PipelineResult<Classification> {
    let (collab_type, type_confidence) = classify_type(company, partner, companies);
    let (intensity, intensity_confidence) =
        classify_intensity(orchestrator, entities, strategy).await?;
    Ok(Classification {
        collab_type,
        intensity,
        type_confidence,
        intensity_confidence,
    })
}

/// Count sentences; text without terminal punctuation is one sentence.
pub fn sentence_count(text: &str) -> usize {
    let terminators = SENTENCE_END.find_iter(text).count();
    if terminators == 0 {
        return 1;
    }
    let last_end = SENTENCE_END
        .find_iter(text)
        .last()
        .map(|m| m.end())
        .unwrap_or(0);
    terminators + usize::from(!text[last_end..].trim().is_empty())
}

/// Is this summary within the shape contract?
pub fn summary_is_valid(text: &str) -> bool {
    let chars = text.trim().chars().count();
    (SUMMARY_MIN_CHARS..=SUMMARY_MAX_CHARS).contains(&chars)
        && (1..=SUMMARY_MAX_SENTENCES).contains(&sentence_count(text.trim()))
}

fn summary_prompt(email: &EmailMessage, entities: &ExtractedEntities) -> String {
    format!(
        r#"Summarize this business collaboration email in 1 to 4 sentences,
between 50 and 400 characters, in the same language as the email. Preserve
the person in charge, both organizations, the collaboration details, and the
date when present. Plain text only.

Known entities: person={person}, company={company}, partner={partner}, date={date}

Email:
{body}"#,
        person = entities.person_in_charge.as_deref().unwrap_or("-"),
        company = entities.company_name.as_deref().unwrap_or("-"),
        partner = entities.partner_org.as_deref().unwrap_or("-"),
        date = entities
            .collab_date
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string()),
        body = email.body_text
    )
}

/// Force an out-of-shape summary into bounds.
fn coerce_summary(text: &str, entities: &ExtractedEntities) -> String {
    let trimmed = text.trim();
    if trimmed.chars().count() > SUMMARY_MAX_CHARS {
        let mut cut: String = trimmed.chars().take(SUMMARY_MAX_CHARS - 1).collect();
        cut.push('…');
        return cut;
    }
    // Too short: pad with the extraction details, then re-truncate.
    let padded = format!("{} {}", trimmed, entities.details);
    let padded = padded.trim().to_string();
    if padded.chars().count() > SUMMARY_MAX_CHARS {
        let mut cut: String = padded.chars().take(SUMMARY_MAX_CHARS - 1).collect();
        cut.push('…');
        cut
    } else {
        padded
    }
}

/// Generate a summary through the orchestrator, retrying shape violations.
///
/// After the attempt budget, the last answer is coerced into bounds and the
/// violation logged at WARNING.
pub async fn summarize(
    orchestrator: &Orchestrator,
    email: &EmailMessage,
    entities: &ExtractedEntities,
    strategy: Strategy,
) -> PipelineResult<String> {
    let prompt = summary_prompt(email, entities);
    let mut last_text = String::new();

    for attempt in 0..SUMMARY_ATTEMPTS {
        let outcome = orchestrator.complete(&prompt, strategy).await?;
        let text = outcome.response.text.trim().to_string();
        if summary_is_valid(&text) {
            log_info!(
                email_id = %email.message_id,
                provider = %outcome.provider_name,
                length = text.chars().count(),
                "Summary accepted"
            );
            return Ok(text);
        }
        log_warn!(
            email_id = %email.message_id,
            provider = %outcome.provider_name,
            attempt = attempt + 1,
            length = text.chars().count(),
            "Summary violated shape contract"
        );
        last_text = text;
    }

    let coerced = coerce_summary(&last_text, entities);
    log_warn!(
        email_id = %email.message_id,
        length = coerced.chars().count(),
        "Persistent summary violation, using coerced text"
    );
    Ok(coerced)
}
