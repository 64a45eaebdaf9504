//! Multi-provider LLM orchestration.
//!
//! [`Orchestrator::extract`] runs one of three strategies over the
//! configured provider adapters:
//!
//! - **failover**: try providers in order (static priority, or quality
//!   ranking when routing is enabled), first success wins;
//! - **consensus**: query all eligible providers in parallel and merge
//!   field-by-field by fuzzy majority, abstaining on low confidence;
//! - **best-match**: parallel query, keep the whole response with the
//!   highest aggregate confidence.
//!
//! Every provider actually called is recorded in the health, cost, and
//! quality trackers, including the ones that failed. Parallel strategies
//! run under a single "gather with overall deadline" primitive that also
//! honors the daemon's shutdown signal: dropping the in-flight futures is
//! the cooperative cancellation.

use futures_util::stream::{FuturesUnordered, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::breaker::ServiceBreakers;
use crate::config::OrchestratorSettings;
use crate::entities::{EmailMessage, ExtractedEntities, Strategy, EXTRACTION_FIELDS};
use crate::error::{service, PipelineError, PipelineResult};
use crate::logging::{log_debug, log_info, log_warn};
use crate::providers::{CompletionResponse, ProviderHandle};
use crate::retry::{retry, RetryPolicy};
use crate::trackers::{CostTracker, HealthTracker, QualityTracker};

/// Minimum successful responses for consensus.
const CONSENSUS_QUORUM: usize = 2;

/// Completion result with the provider that produced it.
#[derive(Debug, Clone)]
pub struct CompletionOutcome {
    pub response: CompletionResponse,
    pub provider_name: String,
}

/// Coordinates provider adapters, resilience, and metric recording.
pub struct Orchestrator {
    providers: Vec<ProviderHandle>,
    settings: OrchestratorSettings,
    breakers: Arc<ServiceBreakers>,
    health: Arc<HealthTracker>,
    cost: Arc<CostTracker>,
    quality: Arc<QualityTracker>,
    shutdown: watch::Receiver<bool>,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        providers: Vec<ProviderHandle>,
        settings: OrchestratorSettings,
        breakers: Arc<ServiceBreakers>,
        health: Arc<HealthTracker>,
        cost: Arc<CostTracker>,
        quality: Arc<QualityTracker>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            providers,
            settings,
            breakers,
            health,
            cost,
            quality,
            shutdown,
        }
    }

    /// Extract entities from `email` under the given strategy.
    pub async fn extract(
        &self,
        email: &EmailMessage,
        strategy: Strategy,
    ) -> PipelineResult<ExtractedEntities> {
        match strategy {
            Strategy::Failover => self.extract_failover(email).await,
            Strategy::Consensus => self.extract_consensus(email).await,
            Strategy::BestMatch => self.extract_best_match(email).await,
        }
    }

    /// Run a plain-text prompt under the given strategy.
    ///
    /// Consensus takes a fuzzy majority vote over the returned texts;
    /// best-match keeps the answer from the highest-quality provider.
    pub async fn complete(
        &self,
        prompt: &str,
        strategy: Strategy,
    ) -> PipelineResult<CompletionOutcome> {
        match strategy {
            Strategy::Failover => self.complete_failover(prompt).await,
            Strategy::Consensus | Strategy::BestMatch => {
                let outcomes = self.gather_completions(prompt).await;
                if outcomes.is_empty() {
                    return Err(PipelineError::AllProvidersFailed {
                        attempted: self.providers.iter().map(|p| p.settings.name.clone()).collect(),
                    });
                }
                if strategy == Strategy::Consensus {
                    Ok(self.vote_completion(outcomes).await)
                } else {
                    self.pick_best_completion(outcomes).await
                }
            }
        }
    }

    /// Provider order for this call: quality ranking when routing is on,
    /// otherwise static priority (providers are already priority-sorted).
    async fn provider_order(&self) -> Vec<ProviderHandle> {
        if !self.settings.quality_routing {
            return self.providers.clone();
        }
        let ranked = self
            .quality
            .ranked_providers(
                &self
                    .providers
                    .iter()
                    .map(|p| p.settings.clone())
                    .collect::<Vec<_>>(),
                &self.health,
            )
            .await;
        let mut ordered: Vec<ProviderHandle> = Vec::new();
        for name in ranked {
            if let Some(handle) = self.providers.iter().find(|p| p.settings.name == name) {
                ordered.push(handle.clone());
            }
        }
        // Unranked-but-enabled providers still back the list in priority order.
        for handle in &self.providers {
            if !ordered.iter().any(|h| h.settings.name == handle.settings.name) {
                ordered.push(handle.clone());
            }
        }
        ordered
    }

    /// One provider extraction under retry, recording breaker and health
    /// state per attempt and cost/quality on the final outcome.
    async fn call_extract(
        &self,
        handle: &ProviderHandle,
        email: &EmailMessage,
    ) -> PipelineResult<ExtractedEntities> {
        let name = handle.settings.name.clone();
        let svc = service::llm(&name);
        let policy =
            RetryPolicy::llm_with(handle.settings.max_retries, handle.settings.timeout());

        let result = retry(&svc, &policy, || async {
            match handle.extractor.extract(email).await {
                Ok(entities) => {
                    self.breakers.record_success(&svc);
                    self.health
                        .record_success(&name, entities.provenance.latency_ms)
                        .await;
                    Ok(entities)
                }
                Err(e) => {
                    self.breakers.record_failure(&svc);
                    self.health.record_failure(&name, &e.to_string()).await;
                    Err(e)
                }
            }
        })
        .await;

        match result {
            Ok(outcome) => {
                let entities = outcome.value;
                self.cost
                    .record(
                        &handle.settings,
                        entities.provenance.input_tokens,
                        entities.provenance.output_tokens,
                    )
                    .await;
                self.quality
                    .record(
                        &name,
                        entities.aggregate_confidence(),
                        &entities.per_field_confidence,
                        entities.field_completeness(),
                        true,
                    )
                    .await;
                log_info!(
                    provider = %name,
                    email_id = %email.message_id,
                    retry_count = outcome.retries,
                    latency_ms = entities.provenance.latency_ms,
                    "Extraction succeeded"
                );
                Ok(entities)
            }
            Err(e) => {
                if schema_violation_inside(&e) {
                    self.quality
                        .record(&name, 0.0, &Default::default(), 0.0, false)
                        .await;
                }
                Err(e)
            }
        }
    }

    /// One provider completion under retry, with the same recording rules.
    async fn call_complete(
        &self,
        handle: &ProviderHandle,
        prompt: &str,
    ) -> PipelineResult<CompletionResponse> {
        let name = handle.settings.name.clone();
        let svc = service::llm(&name);
        let policy =
            RetryPolicy::llm_with(handle.settings.max_retries, handle.settings.timeout());

        let result = retry(&svc, &policy, || async {
            match handle.extractor.complete(prompt).await {
                Ok(response) => {
                    self.breakers.record_success(&svc);
                    self.health.record_success(&name, response.latency_ms).await;
                    Ok(response)
                }
                Err(e) => {
                    self.breakers.record_failure(&svc);
                    self.health.record_failure(&name, &e.to_string()).await;
                    Err(e)
                }
            }
        })
        .await;

        let response = result?.value;
        self.cost
            .record(&handle.settings, response.input_tokens, response.output_tokens)
            .await;
        Ok(response)
    }

    // ========================================================================
    // Failover
    // ========================================================================

    async fn extract_failover(&self, email: &EmailMessage) -> PipelineResult<ExtractedEntities> {
        let mut attempted: Vec<String> = Vec::new();
        for (index, handle) in self.provider_order().await.iter().enumerate() {
            let name = handle.settings.name.clone();
            let svc = service::llm(&name);
            if !self.breakers.allow(&svc) {
                log_warn!(
                    provider = %name,
                    email_id = %email.message_id,
                    circuit_state = %self.breakers.state(&svc),
                    "Provider skipped, breaker open"
                );
                attempted.push(name);
                continue;
            }
            match self.call_extract(handle, email).await {
                Ok(mut entities) => {
                    entities.provenance.strategy = Some(Strategy::Failover);
                    entities.provenance.fallback_used = index > 0 || !attempted.is_empty();
                    return Ok(entities);
                }
                Err(e) => {
                    log_warn!(
                        provider = %name,
                        email_id = %email.message_id,
                        category = %e.class(),
                        error = %e,
                        "Provider failed, advancing to next"
                    );
                    attempted.push(name);
                }
            }
        }
        Err(PipelineError::AllProvidersFailed { attempted })
    }

    async fn complete_failover(&self, prompt: &str) -> PipelineResult<CompletionOutcome> {
        let mut attempted: Vec<String> = Vec::new();
        for handle in self.provider_order().await.iter() {
            let name = handle.settings.name.clone();
            let svc = service::llm(&name);
            if !self.breakers.allow(&svc) {
                attempted.push(name);
                continue;
            }
            match self.call_complete(handle, prompt).await {
                Ok(response) => {
                    return Ok(CompletionOutcome {
                        response,
                        provider_name: name,
                    })
                }
                Err(_) => attempted.push(name),
            }
        }
        Err(PipelineError::AllProvidersFailed { attempted })
    }

    // ========================================================================
    // Parallel gather
    // ========================================================================

    /// Providers eligible for a parallel strategy: enabled, healthy, and
    /// not gated by an open breaker.
    async fn eligible_providers(&self) -> Vec<ProviderHandle> {
        let mut eligible = Vec::new();
        for handle in &self.providers {
            let name = &handle.settings.name;
            if !self.breakers.allow(&service::llm(name)) {
                log_debug!(provider = %name, "Excluded from gather, breaker open");
                continue;
            }
            if !self.health.is_healthy(name).await {
                log_debug!(provider = %name, "Excluded from gather, unhealthy");
                continue;
            }
            eligible.push(handle.clone());
        }
        eligible
    }

    /// Query all eligible providers in parallel, bounded by the orchestrator
    /// deadline and the shutdown signal. Returns whatever succeeded.
    async fn gather_extractions(&self, email: &EmailMessage) -> Vec<ExtractedEntities> {
        let eligible = self.eligible_providers().await;
        let deadline = tokio::time::sleep(Duration::from_millis(self.settings.timeout_ms));
        tokio::pin!(deadline);
        let mut shutdown = self.shutdown.clone();

        let mut in_flight: FuturesUnordered<_> = eligible
            .iter()
            .map(|handle| self.call_extract(handle, email))
            .collect();

        let mut successes = Vec::new();
        loop {
            tokio::select! {
                next = in_flight.next() => match next {
                    Some(Ok(entities)) => successes.push(entities),
                    Some(Err(_)) => {} // recorded inside call_extract
                    None => break,
                },
                _ = &mut deadline => {
                    log_warn!(
                        email_id = %email.message_id,
                        timeout_ms = self.settings.timeout_ms,
                        collected = successes.len(),
                        "Gather deadline reached, cancelling in-flight providers"
                    );
                    break;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        log_warn!(
                            email_id = %email.message_id,
                            collected = successes.len(),
                            "Shutdown during gather, returning collected responses"
                        );
                        break;
                    }
                }
            }
        }
        successes
    }

    async fn gather_completions(&self, prompt: &str) -> Vec<CompletionOutcome> {
        let eligible = self.eligible_providers().await;
        let deadline = tokio::time::sleep(Duration::from_millis(self.settings.timeout_ms));
        tokio::pin!(deadline);
        let mut shutdown = self.shutdown.clone();

        let mut in_flight: FuturesUnordered<_> = eligible
            .iter()
            .map(|handle| async move {
                let name = handle.settings.name.clone();
                self.call_complete(handle, prompt)
                    .await
                    .map(|response| CompletionOutcome {
                        response,
                        provider_name: name,
                    })
            })
            .collect();

        let mut successes = Vec::new();
        loop {
            tokio::select! {
                next = in_flight.next() => match next {
                    Some(Ok(outcome)) => successes.push(outcome),
                    Some(Err(_)) => {}
                    None => break,
                },
                _ = &mut deadline => break,
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        successes
    }

    // ========================================================================
    // Consensus
    // ========================================================================

    async fn extract_consensus(&self, email: &EmailMessage) -> PipelineResult<ExtractedEntities> {
        let responses = self.gather_extractions(email).await;
        if responses.len() < CONSENSUS_QUORUM {
            return Err(PipelineError::InsufficientAgreement {
                got: responses.len(),
                required: CONSENSUS_QUORUM,
            });
        }

        let mut quality_by_provider = std::collections::HashMap::new();
        for response in &responses {
            let name = response.provenance.provider_name.clone();
            let score = self.quality.get(&name).await.quality_score();
            quality_by_provider.insert(name, score);
        }

        Ok(merge_consensus(
            email,
            &responses,
            &quality_by_provider,
            self.settings.fuzzy_threshold,
            self.settings.abstention_threshold,
        ))
    }

    async fn extract_best_match(&self, email: &EmailMessage) -> PipelineResult<ExtractedEntities> {
        let responses = self.gather_extractions(email).await;
        let first_choice = self
            .provider_order()
            .await
            .first()
            .map(|h| h.settings.name.clone());
        let mut best = responses
            .into_iter()
            .max_by(|a, b| {
                a.aggregate_confidence()
                    .partial_cmp(&b.aggregate_confidence())
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .ok_or_else(|| PipelineError::AllProvidersFailed {
                attempted: self.providers.iter().map(|p| p.settings.name.clone()).collect(),
            })?;
        best.provenance.strategy = Some(Strategy::BestMatch);
        best.provenance.fallback_used =
            first_choice.as_deref() != Some(best.provenance.provider_name.as_str());
        Ok(best)
    }

    async fn vote_completion(&self, outcomes: Vec<CompletionOutcome>) -> CompletionOutcome {
        let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
        for (index, outcome) in outcomes.iter().enumerate() {
            let norm = normalize_value(&outcome.response.text);
            match groups
                .iter_mut()
                .find(|(rep, _)| strsim::jaro_winkler(rep, &norm) >= self.settings.fuzzy_threshold)
            {
                Some((_, members)) => members.push(index),
                None => groups.push((norm, vec![index])),
            }
        }
        let mut best_group: Vec<usize> = Vec::new();
        let mut best_score = (0usize, 0.0f64);
        for (_, members) in &groups {
            let quality_sum: f64 = futures_util::future::join_all(
                members
                    .iter()
                    .map(|&i| self.quality.get(&outcomes[i].provider_name)),
            )
            .await
            .iter()
            .map(|q| q.quality_score())
            .sum();
            let score = (members.len(), quality_sum);
            if score.0 > best_score.0 || (score.0 == best_score.0 && score.1 > best_score.1) {
                best_score = score;
                best_group = members.clone();
            }
        }
        let winner = best_group.first().copied().unwrap_or(0);
        outcomes.into_iter().nth(winner).expect("non-empty outcomes")
    }

    async fn pick_best_completion(
        &self,
        outcomes: Vec<CompletionOutcome>,
    ) -> PipelineResult<CompletionOutcome> {
        let mut best: Option<(f64, CompletionOutcome)> = None;
        for outcome in outcomes {
            let score = self.quality.get(&outcome.provider_name).await.quality_score();
            match &best {
                Some((current, _)) if *current >= score => {}
                _ => best = Some((score, outcome)),
            }
        }
        best.map(|(_, outcome)| outcome)
            .ok_or_else(|| PipelineError::AllProvidersFailed {
                attempted: self.providers.iter().map(|p| p.settings.name.clone()).collect(),
            })
    }
}

fn schema_violation_inside(error: &PipelineError) -> bool {
    match error {
        PipelineError::SchemaViolation { .. } => true,
        PipelineError::RetriesExhausted { last, .. } => schema_violation_inside(last),
        _ => false,
    }
}

fn normalize_value(raw: &str) -> String {
    raw.trim().to_lowercase()
}

/// A candidate value for one field from one response.
struct FieldVote<'a> {
    value: Option<&'a str>,
    confidence: f64,
    provider_quality: f64,
}

/// Resolve one string field across responses.
///
/// Groups non-null values by Jaro-Winkler similarity, lets null votes form
/// their own abstain group, picks the largest group (ties: aggregate
/// confidence, then historical provider quality), and abstains when the
/// winning group's mean confidence is below the abstention threshold.
fn resolve_field(
    votes: &[FieldVote<'_>],
    fuzzy_threshold: f64,
    abstention_threshold: f64,
) -> (Option<String>, f64) {
    struct Group<'a> {
        representative: Option<String>,
        members: Vec<&'a FieldVote<'a>>,
    }

    let mut groups: Vec<Group<'_>> = Vec::new();
    for vote in votes {
        match vote.value {
            None => {
                match groups.iter_mut().find(|g| g.representative.is_none()) {
                    Some(group) => group.members.push(vote),
                    None => groups.push(Group {
                        representative: None,
                        members: vec![vote],
                    }),
                }
            }
            Some(value) => {
                let norm = normalize_value(value);
                let existing = groups.iter_mut().find(|g| {
                    g.representative
                        .as_deref()
                        .map(|rep| strsim::jaro_winkler(rep, &norm) >= fuzzy_threshold)
                        .unwrap_or(false)
                });
                match existing {
                    Some(group) => group.members.push(vote),
                    None => groups.push(Group {
                        representative: Some(norm),
                        members: vec![vote],
                    }),
                }
            }
        }
    }

    let winner = groups.iter().max_by(|a, b| {
        let size = a.members.len().cmp(&b.members.len());
        let conf = |g: &Group<'_>| g.members.iter().map(|v| v.confidence).sum::<f64>();
        let quality = |g: &Group<'_>| {
            g.members
                .iter()
                .map(|v| v.provider_quality)
                .fold(0.0f64, f64::max)
        };
        size.then(
            conf(a)
                .partial_cmp(&conf(b))
                .unwrap_or(std::cmp::Ordering::Equal),
        )
        .then(
            quality(a)
                .partial_cmp(&quality(b))
                .unwrap_or(std::cmp::Ordering::Equal),
        )
    });

    let Some(winner) = winner else {
        return (None, 0.0);
    };
    if winner.representative.is_none() {
        return (None, 0.0);
    }

    let mean_confidence =
        winner.members.iter().map(|v| v.confidence).sum::<f64>() / winner.members.len() as f64;
    if mean_confidence < abstention_threshold {
        return (None, 0.0);
    }

    // Emit the original (non-normalized) text of the most confident member.
    let best_member = winner
        .members
        .iter()
        .max_by(|a, b| {
            a.confidence
                .partial_cmp(&b.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .expect("winner has members");
    (
        best_member.value.map(str::to_string),
        mean_confidence,
    )
}

/// Collect one field's votes across responses.
fn votes_for<'a>(
    responses: &'a [ExtractedEntities],
    quality_by_provider: &std::collections::HashMap<String, f64>,
    field: &str,
    get: impl Fn(&'a ExtractedEntities) -> Option<&'a str>,
) -> Vec<FieldVote<'a>> {
    responses
        .iter()
        .map(|r| FieldVote {
            value: get(r),
            confidence: r.confidence(field),
            provider_quality: quality_by_provider
                .get(&r.provenance.provider_name)
                .copied()
                .unwrap_or(0.0),
        })
        .collect()
}

/// Merge parallel extraction responses field-by-field.
pub(crate) fn merge_consensus(
    email: &EmailMessage,
    responses: &[ExtractedEntities],
    quality_by_provider: &std::collections::HashMap<String, f64>,
    fuzzy_threshold: f64,
    abstention_threshold: f64,
) -> ExtractedEntities {
    let quality_of = |response: &ExtractedEntities| {
        quality_by_provider
            .get(&response.provenance.provider_name)
            .copied()
            .unwrap_or(0.0)
    };

    let (person_in_charge, person_conf) = resolve_field(
        &votes_for(responses, quality_by_provider, "person_in_charge", |r| {
            r.person_in_charge.as_deref()
        }),
        fuzzy_threshold,
        abstention_threshold,
    );
    let (company_name, company_conf) = resolve_field(
        &votes_for(responses, quality_by_provider, "company_name", |r| {
            r.company_name.as_deref()
        }),
        fuzzy_threshold,
        abstention_threshold,
    );
    let (partner_org, partner_conf) = resolve_field(
        &votes_for(responses, quality_by_provider, "partner_org", |r| {
            r.partner_org.as_deref()
        }),
        fuzzy_threshold,
        abstention_threshold,
    );

    // Dates agree only on exact equality; ISO rendering makes that stable.
    let date_strings: Vec<Option<String>> = responses
        .iter()
        .map(|r| r.collab_date.map(|d| d.to_string()))
        .collect();
    let date_votes: Vec<FieldVote<'_>> = responses
        .iter()
        .zip(date_strings.iter())
        .map(|(r, date)| FieldVote {
            value: date.as_deref(),
            confidence: r.confidence("collab_date"),
            provider_quality: quality_of(r),
        })
        .collect();
    let (date_text, date_conf) = resolve_field(&date_votes, 1.0, abstention_threshold);
    let collab_date = date_text.and_then(|t| t.parse().ok());
    let date_conf = if collab_date.is_some() { date_conf } else { 0.0 };

    // `details` is required: when the vote abstains, fall back to the single
    // most confident details text instead of emitting nothing.
    let (details_value, details_conf) = resolve_field(
        &votes_for(responses, quality_by_provider, "details", |r| {
            Some(r.details.as_str())
        }),
        fuzzy_threshold,
        abstention_threshold,
    );
    let (details, details_conf) = match details_value {
        Some(details) => (details, details_conf),
        None => {
            let best = responses
                .iter()
                .max_by(|a, b| {
                    a.confidence("details")
                        .partial_cmp(&b.confidence("details"))
                        .unwrap_or(std::cmp::Ordering::Equal)
                })
                .expect("consensus requires responses");
            (best.details.clone(), best.confidence("details"))
        }
    };

    let mut per_field_confidence = std::collections::BTreeMap::new();
    for (field, conf) in EXTRACTION_FIELDS.iter().zip([
        person_conf,
        company_conf,
        partner_conf,
        details_conf,
        date_conf,
    ]) {
        per_field_confidence.insert((*field).to_string(), conf);
    }

    let mut providers: Vec<&str> = responses
        .iter()
        .map(|r| r.provenance.provider_name.as_str())
        .collect();
    providers.sort_unstable();
    providers.dedup();
    let models: Vec<&str> = responses
        .iter()
        .map(|r| r.provenance.model_id.as_str())
        .collect();

    let merged = ExtractedEntities {
        person_in_charge,
        company_name,
        partner_org,
        details,
        collab_date,
        per_field_confidence,
        provenance: crate::entities::Provenance {
            provider_name: format!("consensus({})", providers.join("+")),
            model_id: models.join("+"),
            input_tokens: responses.iter().map(|r| r.provenance.input_tokens).sum(),
            output_tokens: responses.iter().map(|r| r.provenance.output_tokens).sum(),
            latency_ms: responses
                .iter()
                .map(|r| r.provenance.latency_ms)
                .max()
                .unwrap_or(0),
            strategy: Some(Strategy::Consensus),
            fallback_used: false,
            usage_estimated: responses.iter().any(|r| r.provenance.usage_estimated),
        },
    };

    log_info!(
        email_id = %email.message_id,
        providers = %merged.provenance.provider_name,
        aggregate_confidence = merged.aggregate_confidence(),
        "Consensus merged"
    );
    merged
}
