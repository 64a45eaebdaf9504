//! Fuzzy resolution of extracted names against the workspace.
//!
//! Company names resolve against the Companies cache with optional
//! auto-creation; person names resolve against the Users cache, never
//! auto-created, with explicit ambiguity detection. Similarity is
//! Jaro-Winkler over trimmed names; the scan is linear, which stays well
//! inside the per-email budget up to roughly a thousand companies (the
//! worst case is one pass of string comparisons per extracted name).

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::cache::{CompanyRow, WorkspaceCaches, WorkspaceUserType};
use super::client::WorkspaceClient;
use crate::error::{service, PipelineResult};
use crate::logging::{log_info, log_warn};
use crate::retry::{retry, RetryPolicy};

/// Default company acceptance threshold.
pub const COMPANY_THRESHOLD: f64 = 0.85;
/// Default person acceptance threshold.
pub const PERSON_THRESHOLD: f64 = 0.70;
/// Candidates within this margin of the top score count as ambiguous.
const AMBIGUITY_MARGIN: f64 = 0.10;

/// How a match was established.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    Exact,
    Fuzzy,
    Created,
    None,
}

/// Discrete confidence ladder driving downstream policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
    High,
    Medium,
    Low,
    None,
}

/// Result of resolving a company name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompanyMatch {
    pub page_id: Option<String>,
    pub matched_name: String,
    pub similarity: f64,
    pub match_type: MatchType,
    pub confidence_level: ConfidenceLevel,
    pub was_created: bool,
}

impl CompanyMatch {
    pub fn none() -> Self {
        Self {
            page_id: None,
            matched_name: String::new(),
            similarity: 0.0,
            match_type: MatchType::None,
            confidence_level: ConfidenceLevel::None,
            was_created: false,
        }
    }
}

/// A runner-up candidate in an ambiguous person match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonAlternative {
    pub user_id: String,
    pub user_name: String,
    pub similarity: f64,
}

/// Result of resolving a person name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersonMatch {
    pub user_id: Option<String>,
    pub user_name: String,
    pub similarity: f64,
    pub match_type: MatchType,
    pub is_ambiguous: bool,
    pub alternatives: Vec<PersonAlternative>,
}

impl PersonMatch {
    pub fn none() -> Self {
        Self {
            user_id: None,
            user_name: String::new(),
            similarity: 0.0,
            match_type: MatchType::None,
            is_ambiguous: false,
            alternatives: Vec::new(),
        }
    }
}

pub(crate) fn company_confidence_level(match_type: MatchType, similarity: f64) -> ConfidenceLevel {
    match match_type {
        MatchType::Exact | MatchType::Created => ConfidenceLevel::High,
        _ if similarity >= 0.95 => ConfidenceLevel::High,
        _ if similarity >= 0.85 => ConfidenceLevel::Medium,
        _ if similarity >= 0.70 => ConfidenceLevel::Low,
        _ => ConfidenceLevel::None,
    }
}

/// Person ladder: exact & unambiguous high, ≥0.90 unambiguous high,
/// [0.80, 0.90) or ambiguous medium, [0.70, 0.80) low, below none.
pub fn person_confidence_level(
    match_type: MatchType,
    similarity: f64,
    is_ambiguous: bool,
) -> ConfidenceLevel {
    match match_type {
        MatchType::None => ConfidenceLevel::None,
        MatchType::Exact if !is_ambiguous => ConfidenceLevel::High,
        _ if similarity >= 0.90 && !is_ambiguous => ConfidenceLevel::High,
        _ if similarity >= 0.80 || is_ambiguous => ConfidenceLevel::Medium,
        _ if similarity >= 0.70 => ConfidenceLevel::Low,
        _ => ConfidenceLevel::None,
    }
}

/// Resolves company names, creating missing companies when allowed.
#[derive(Debug, Clone)]
pub struct CompanyMatcher {
    caches: Arc<WorkspaceCaches>,
    client: Arc<WorkspaceClient>,
    companies_db_id: String,
}

impl CompanyMatcher {
    pub fn new(caches: Arc<WorkspaceCaches>, client: Arc<WorkspaceClient>) -> Self {
        let companies_db_id = caches.settings().companies_db_id.clone();
        Self {
            caches,
            client,
            companies_db_id,
        }
    }

    /// Resolve `name` to a Companies page.
    ///
    /// Exact (case-sensitive, trimmed) scan first; otherwise the best
    /// Jaro-Winkler candidate wins at or above `threshold`; otherwise the
    /// company is created (when `auto_create`) or the result is none.
    pub async fn match_company(
        &self,
        name: Option<&str>,
        auto_create: bool,
        threshold: f64,
    ) -> PipelineResult<CompanyMatch> {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(CompanyMatch::none());
        };
        let companies = self.caches.companies().await?;

        if let Some(row) = companies.iter().find(|row| row.name.trim() == name) {
            return Ok(CompanyMatch {
                page_id: Some(row.id.clone()),
                matched_name: row.name.clone(),
                similarity: 1.0,
                match_type: MatchType::Exact,
                confidence_level: ConfidenceLevel::High,
                was_created: false,
            });
        }

        let best = companies
            .iter()
            .map(|row| (strsim::jaro_winkler(name, row.name.trim()), row))
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));

        if let Some((similarity, row)) = best {
            if similarity >= threshold {
                let level = company_confidence_level(MatchType::Fuzzy, similarity);
                if level == ConfidenceLevel::Low {
                    log_warn!(
                        query = %name,
                        matched = %row.name,
                        similarity = similarity,
                        "Low-confidence company match"
                    );
                }
                return Ok(CompanyMatch {
                    page_id: Some(row.id.clone()),
                    matched_name: row.name.clone(),
                    similarity,
                    match_type: MatchType::Fuzzy,
                    confidence_level: level,
                    was_created: false,
                });
            }
        }

        if auto_create {
            return self.create_company(name).await;
        }

        let similarity = best.map(|(s, _)| s).unwrap_or(0.0);
        Ok(CompanyMatch {
            similarity,
            confidence_level: company_confidence_level(MatchType::None, similarity),
            ..CompanyMatch::none()
        })
    }

    async fn create_company(&self, name: &str) -> PipelineResult<CompanyMatch> {
        let client = Arc::clone(&self.client);
        let db_id = self.companies_db_id.clone();
        let properties = serde_json::json!({
            "Name": { "title": [ { "text": { "content": name } } ] }
        });
        let page = retry(service::WORKSPACE, &RetryPolicy::workspace(), || {
            let client = Arc::clone(&client);
            let db_id = db_id.clone();
            let properties = properties.clone();
            async move { client.create_page(&db_id, properties).await }
        })
        .await?
        .value;

        log_info!(company = %name, page_id = %page.id, "Company auto-created");
        self.caches
            .note_created_company(CompanyRow {
                id: page.id.clone(),
                name: name.to_string(),
                group: None,
            })
            .await;

        Ok(CompanyMatch {
            page_id: Some(page.id),
            matched_name: name.to_string(),
            similarity: 1.0,
            match_type: MatchType::Created,
            confidence_level: ConfidenceLevel::High,
            was_created: true,
        })
    }
}

/// Resolves person names against workspace users. Users are never invented.
#[derive(Debug, Clone)]
pub struct PersonMatcher {
    caches: Arc<WorkspaceCaches>,
}

impl PersonMatcher {
    pub fn new(caches: Arc<WorkspaceCaches>) -> Self {
        Self { caches }
    }

    /// Resolve `name` to a workspace user id.
    ///
    /// Ambiguity: two or more candidates at or above `threshold` within
    /// 0.10 of the top score. The top candidate is still returned, flagged,
    /// with the runners-up listed.
    pub async fn match_person(
        &self,
        name: Option<&str>,
        threshold: f64,
    ) -> PipelineResult<PersonMatch> {
        let Some(name) = name.map(str::trim).filter(|n| !n.is_empty()) else {
            return Ok(PersonMatch::none());
        };
        let users = self.caches.users().await?;
        let people: Vec<_> = users
            .iter()
            .filter(|u| u.user_type == WorkspaceUserType::Person)
            .collect();

        let mut scored: Vec<(f64, MatchType, &super::cache::WorkspaceUser)> = people
            .iter()
            .map(|user| {
                if user.name.trim() == name {
                    (1.0, MatchType::Exact, *user)
                } else {
                    (strsim::jaro_winkler(name, user.name.trim()), MatchType::Fuzzy, *user)
                }
            })
            .collect();
        scored.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

        let Some(&(top_score, top_type, top_user)) = scored.first() else {
            return Ok(PersonMatch::none());
        };
        if top_score < threshold {
            return Ok(PersonMatch {
                similarity: top_score,
                ..PersonMatch::none()
            });
        }

        let alternatives: Vec<PersonAlternative> = scored
            .iter()
            .skip(1)
            .take_while(|(score, _, _)| *score >= threshold && top_score - *score <= AMBIGUITY_MARGIN)
            .map(|(score, _, user)| PersonAlternative {
                user_id: user.id.clone(),
                user_name: user.name.clone(),
                similarity: *score,
            })
            .collect();
        let is_ambiguous = !alternatives.is_empty();

        if is_ambiguous {
            log_warn!(
                query = %name,
                matched = %top_user.name,
                similarity = top_score,
                alternatives = alternatives.len(),
                "Ambiguous person match"
            );
        }

        Ok(PersonMatch {
            user_id: Some(top_user.id.clone()),
            user_name: top_user.name.clone(),
            similarity: top_score,
            match_type: top_type,
            is_ambiguous,
            alternatives,
        })
    }
}
