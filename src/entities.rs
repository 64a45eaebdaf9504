//! Domain types flowing through the pipeline.
//!
//! An [`EmailMessage`] comes in from the mail adapter, an
//! [`ExtractedEntities`] comes out of the LLM orchestrator, and a
//! [`Classification`] plus summary is attached before the record is written
//! to the workspace.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{PipelineError, PipelineResult};

/// The five extraction fields, in canonical order.
pub const EXTRACTION_FIELDS: [&str; 5] = [
    "person_in_charge",
    "company_name",
    "partner_org",
    "details",
    "collab_date",
];

/// A cleaned email as delivered by the external receiver.
///
/// `message_id` is the opaque, stable identifier from the mail provider and
/// is the key for exactly-once accounting everywhere downstream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EmailMessage {
    pub message_id: String,
    /// Signature- and quote-stripped UTF-8 body.
    pub body_text: String,
    pub received_at: DateTime<Utc>,
}

/// Multi-provider strategy used for one extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
    Failover,
    Consensus,
    BestMatch,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Failover => "failover",
            Self::Consensus => "consensus",
            Self::BestMatch => "best-match",
        };
        f.write_str(label)
    }
}

impl std::str::FromStr for Strategy {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "failover" => Ok(Self::Failover),
            "consensus" => Ok(Self::Consensus),
            "best-match" | "best_match" => Ok(Self::BestMatch),
            other => Err(PipelineError::configuration(format!(
                "unknown strategy: {other}"
            ))),
        }
    }
}

/// Where an extraction came from and what it cost.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Provenance {
    pub provider_name: String,
    pub model_id: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub latency_ms: u64,
    pub strategy: Option<Strategy>,
    /// True when the first-priority provider did not produce this result.
    pub fallback_used: bool,
    /// True when token counts were estimated locally because the provider
    /// response carried no usage block.
    #[serde(default)]
    pub usage_estimated: bool,
}

/// Structured entities extracted from one email.
///
/// Nullable fields obey the confidence law: a field is `None` if and only if
/// its reported confidence is exactly 0.0. [`ExtractedEntities::validate`]
/// enforces this at the adapter boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ExtractedEntities {
    pub person_in_charge: Option<String>,
    pub company_name: Option<String>,
    pub partner_org: Option<String>,
    pub details: String,
    pub collab_date: Option<NaiveDate>,
    /// Per-field confidence in [0.0, 1.0].
    pub per_field_confidence: BTreeMap<String, f64>,
    pub provenance: Provenance,
}

impl ExtractedEntities {
    /// Confidence for one field, 0.0 when unreported.
    pub fn confidence(&self, field: &str) -> f64 {
        self.per_field_confidence.get(field).copied().unwrap_or(0.0)
    }

    fn field_is_null(&self, field: &str) -> bool {
        match field {
            "person_in_charge" => self.person_in_charge.is_none(),
            "company_name" => self.company_name.is_none(),
            "partner_org" => self.partner_org.is_none(),
            "details" => self.details.trim().is_empty(),
            "collab_date" => self.collab_date.is_none(),
            _ => true,
        }
    }

    /// Arithmetic mean of per-field confidences over the non-null fields.
    ///
    /// Used by the best-match strategy to rank whole responses.
    pub fn aggregate_confidence(&self) -> f64 {
        let mut sum = 0.0;
        let mut n = 0u32;
        for field in EXTRACTION_FIELDS {
            if !self.field_is_null(field) {
                sum += self.confidence(field);
                n += 1;
            }
        }
        if n == 0 {
            0.0
        } else {
            sum / f64::from(n)
        }
    }

    /// Fraction of the five extraction fields that are non-null.
    pub fn field_completeness(&self) -> f64 {
        let filled = EXTRACTION_FIELDS
            .iter()
            .filter(|f| !self.field_is_null(f))
            .count();
        filled as f64 / EXTRACTION_FIELDS.len() as f64
    }

    /// Enforce the extraction schema at the adapter boundary.
    ///
    /// Violations are Permanent: a provider that returns out-of-range
    /// confidence or breaks the null ⇔ 0.0 law will keep doing so on retry.
    pub fn validate(&self) -> PipelineResult<()> {
        if self.details.trim().is_empty() {
            return Err(PipelineError::schema_violation(
                &self.provenance.provider_name,
                "required field `details` is empty",
            ));
        }
        for field in EXTRACTION_FIELDS {
            let conf = self.confidence(field);
            if !(0.0..=1.0).contains(&conf) {
                return Err(PipelineError::schema_violation(
                    &self.provenance.provider_name,
                    format!("confidence for `{field}` out of range: {conf}"),
                ));
            }
            let is_null = self.field_is_null(field);
            if is_null && conf != 0.0 {
                return Err(PipelineError::schema_violation(
                    &self.provenance.provider_name,
                    format!("null field `{field}` reported confidence {conf}"),
                ));
            }
            if !is_null && conf == 0.0 {
                return Err(PipelineError::schema_violation(
                    &self.provenance.provider_name,
                    format!("populated field `{field}` reported confidence 0.0"),
                ));
            }
        }
        Ok(())
    }
}

/// Closed classification of a collaboration by portfolio/affiliate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollabType {
    /// A: Portfolio × Affiliate.
    PortfolioAffiliate,
    /// B: Non-portfolio × Affiliate.
    NonPortfolioAffiliate,
    /// C: Portfolio × Portfolio.
    PortfolioPortfolio,
    /// D: everything else, including undecidable.
    Other,
}

impl CollabType {
    /// Single-letter code used in the workspace select option.
    pub fn code(self) -> &'static str {
        match self {
            Self::PortfolioAffiliate => "A",
            Self::NonPortfolioAffiliate => "B",
            Self::PortfolioPortfolio => "C",
            Self::Other => "D",
        }
    }
}

/// Closed classification of collaboration depth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Intensity {
    Awareness,
    Cooperation,
    Investment,
    Acquisition,
}

impl Intensity {
    pub fn label(self) -> &'static str {
        match self {
            Self::Awareness => "Awareness",
            Self::Cooperation => "Cooperation",
            Self::Investment => "Investment",
            Self::Acquisition => "Acquisition",
        }
    }

    /// Parse a model answer against the closed vocabulary.
    ///
    /// Matching is case-insensitive on the exact label; anything else is
    /// out-of-vocabulary and the caller falls back to `Cooperation`.
    pub fn parse(text: &str) -> Option<Self> {
        match text.trim().to_ascii_lowercase().as_str() {
            "awareness" => Some(Self::Awareness),
            "cooperation" => Some(Self::Cooperation),
            "investment" => Some(Self::Investment),
            "acquisition" => Some(Self::Acquisition),
            _ => None,
        }
    }
}

/// Type and intensity with their confidences.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Classification {
    pub collab_type: CollabType,
    pub intensity: Intensity,
    pub type_confidence: f64,
    pub intensity_confidence: f64,
}
