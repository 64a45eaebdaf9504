//! Provider health, cost, and quality tracking.
//!
//! Three trackers, each a mutex-guarded in-memory map persisted to
//! `data/health/{health,cost,quality}.json` after every update. They feed
//! the `status` CLI, the failover skip decisions, and, when quality
//! routing is enabled, the provider ordering itself.
//!
//! Rolling latency and the quality components use an EWMA with α = 0.2.
//! Persistence is best-effort: a failed write is logged at WARNING and the
//! in-memory numbers stay authoritative for the life of the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use tokio::sync::Mutex;

use crate::config::ProviderSettings;
use crate::internals::fs::{atomic_write_json, read_json};
use crate::logging::{log_debug, log_warn};

/// EWMA smoothing factor for rolling means.
const EWMA_ALPHA: f64 = 0.2;

/// A provider is considered healthy below this many consecutive failures.
const HEALTHY_CONSECUTIVE_FAILURES: u32 = 3;

fn ewma(current: f64, sample: f64) -> f64 {
    if current == 0.0 {
        sample
    } else {
        EWMA_ALPHA * sample + (1.0 - EWMA_ALPHA) * current
    }
}

// ============================================================================
// Health
// ============================================================================

/// Success/failure accounting for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderHealth {
    pub success_count: u64,
    pub failure_count: u64,
    pub consecutive_failures: u32,
    pub avg_latency_ms: f64,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ProviderHealth {
    pub fn success_rate(&self) -> f64 {
        let total = self.success_count + self.failure_count;
        if total == 0 {
            1.0
        } else {
            self.success_count as f64 / total as f64
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.consecutive_failures < HEALTHY_CONSECUTIVE_FAILURES
    }
}

/// Persisted map of provider → health.
#[derive(Debug)]
pub struct HealthTracker {
    path: PathBuf,
    inner: Mutex<HashMap<String, ProviderHealth>>,
}

impl HealthTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Load persisted counters from a previous run, if any.
    pub async fn load(path: PathBuf) -> Self {
        let initial = match read_json::<HashMap<String, ProviderHealth>>(&path).await {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(e) => {
                log_warn!(path = %path.display(), error = %e, "Health file unreadable, starting fresh");
                HashMap::new()
            }
        };
        Self {
            path,
            inner: Mutex::new(initial),
        }
    }

    pub async fn record_success(&self, provider: &str, latency_ms: u64) {
        let snapshot = {
            let mut map = self.inner.lock().await;
            let health = map.entry(provider.to_string()).or_default();
            health.success_count += 1;
            health.consecutive_failures = 0;
            health.avg_latency_ms = ewma(health.avg_latency_ms, latency_ms as f64);
            health.last_success_at = Some(Utc::now());
            map.clone()
        };
        self.persist(&snapshot).await;
    }

    pub async fn record_failure(&self, provider: &str, error_text: &str) {
        let snapshot = {
            let mut map = self.inner.lock().await;
            let health = map.entry(provider.to_string()).or_default();
            health.failure_count += 1;
            health.consecutive_failures += 1;
            health.last_failure_at = Some(Utc::now());
            // Truncate: provider error bodies can be arbitrarily large.
            health.last_error = Some(error_text.chars().take(500).collect());
            map.clone()
        };
        self.persist(&snapshot).await;
    }

    pub async fn get(&self, provider: &str) -> ProviderHealth {
        self.inner
            .lock()
            .await
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all(&self) -> HashMap<String, ProviderHealth> {
        self.inner.lock().await.clone()
    }

    pub async fn is_healthy(&self, provider: &str) -> bool {
        self.get(provider).await.is_healthy()
    }

    async fn persist(&self, snapshot: &HashMap<String, ProviderHealth>) {
        if let Err(e) = atomic_write_json(&self.path, snapshot).await {
            log_warn!(path = %self.path.display(), error = %e, "Health persistence failed");
        }
    }
}

// ============================================================================
// Cost
// ============================================================================

/// Token and dollar totals for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderCost {
    pub api_calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
}

impl ProviderCost {
    pub fn total_tokens(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn avg_cost_per_call(&self) -> f64 {
        if self.api_calls == 0 {
            0.0
        } else {
            self.total_cost_usd / self.api_calls as f64
        }
    }
}

/// Persisted map of provider → cost totals.
#[derive(Debug)]
pub struct CostTracker {
    path: PathBuf,
    inner: Mutex<HashMap<String, ProviderCost>>,
}

impl CostTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(path: PathBuf) -> Self {
        let initial = match read_json::<HashMap<String, ProviderCost>>(&path).await {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(e) => {
                log_warn!(path = %path.display(), error = %e, "Cost file unreadable, starting fresh");
                HashMap::new()
            }
        };
        Self {
            path,
            inner: Mutex::new(initial),
        }
    }

    /// Record one API call's token usage priced per the provider settings.
    pub async fn record(&self, settings: &ProviderSettings, input_tokens: u32, output_tokens: u32) {
        let call_cost = f64::from(input_tokens) / 1_000_000.0 * settings.input_price_per_mtok
            + f64::from(output_tokens) / 1_000_000.0 * settings.output_price_per_mtok;
        let snapshot = {
            let mut map = self.inner.lock().await;
            let cost = map.entry(settings.name.clone()).or_default();
            cost.api_calls += 1;
            cost.input_tokens += u64::from(input_tokens);
            cost.output_tokens += u64::from(output_tokens);
            cost.total_cost_usd += call_cost;
            map.clone()
        };
        log_debug!(
            provider = %settings.name,
            input_tokens = input_tokens,
            output_tokens = output_tokens,
            call_cost_usd = call_cost,
            "Cost recorded"
        );
        if let Err(e) = atomic_write_json(&self.path, &snapshot).await {
            log_warn!(path = %self.path.display(), error = %e, "Cost persistence failed");
        }
    }

    pub async fn get(&self, provider: &str) -> ProviderCost {
        self.inner
            .lock()
            .await
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all(&self) -> HashMap<String, ProviderCost> {
        self.inner.lock().await.clone()
    }
}

// ============================================================================
// Quality
// ============================================================================

/// Rolling extraction-quality signals for one provider.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ProviderQuality {
    /// EWMA of aggregate confidence over extractions.
    pub avg_confidence: f64,
    /// EWMA per extraction field.
    pub field_confidence: HashMap<String, f64>,
    /// EWMA of field completeness.
    pub avg_completeness: f64,
    pub validation_attempts: u64,
    pub validation_successes: u64,
}

impl ProviderQuality {
    pub fn validation_rate(&self) -> f64 {
        if self.validation_attempts == 0 {
            1.0
        } else {
            self.validation_successes as f64 / self.validation_attempts as f64
        }
    }

    /// Composite score: 0.4·confidence + 0.3·completeness + 0.3·validation.
    pub fn quality_score(&self) -> f64 {
        0.4 * self.avg_confidence + 0.3 * self.avg_completeness + 0.3 * self.validation_rate()
    }
}

/// Persisted map of provider → quality, plus the routing computation.
#[derive(Debug)]
pub struct QualityTracker {
    path: PathBuf,
    inner: Mutex<HashMap<String, ProviderQuality>>,
}

impl QualityTracker {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub async fn load(path: PathBuf) -> Self {
        let initial = match read_json::<HashMap<String, ProviderQuality>>(&path).await {
            Ok(Some(map)) => map,
            Ok(None) => HashMap::new(),
            Err(e) => {
                log_warn!(path = %path.display(), error = %e, "Quality file unreadable, starting fresh");
                HashMap::new()
            }
        };
        Self {
            path,
            inner: Mutex::new(initial),
        }
    }

    /// Record one extraction's quality signals.
    ///
    /// `validated` is whether downstream schema validation accepted the
    /// response; confidence/completeness are only folded in when it did.
    pub async fn record(
        &self,
        provider: &str,
        aggregate_confidence: f64,
        field_confidence: &std::collections::BTreeMap<String, f64>,
        completeness: f64,
        validated: bool,
    ) {
        let snapshot = {
            let mut map = self.inner.lock().await;
            let quality = map.entry(provider.to_string()).or_default();
            quality.validation_attempts += 1;
            if validated {
                quality.validation_successes += 1;
                quality.avg_confidence = ewma(quality.avg_confidence, aggregate_confidence);
                quality.avg_completeness = ewma(quality.avg_completeness, completeness);
                for (field, conf) in field_confidence {
                    let entry = quality.field_confidence.entry(field.clone()).or_insert(0.0);
                    *entry = ewma(*entry, *conf);
                }
            }
            map.clone()
        };
        if let Err(e) = atomic_write_json(&self.path, &snapshot).await {
            log_warn!(path = %self.path.display(), error = %e, "Quality persistence failed");
        }
    }

    pub async fn get(&self, provider: &str) -> ProviderQuality {
        self.inner
            .lock()
            .await
            .get(provider)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn all(&self) -> HashMap<String, ProviderQuality> {
        self.inner.lock().await.clone()
    }

    /// Quality-to-cost value score used for reporting.
    ///
    /// Free-tier providers are charged a nominal floor cost so the ratio
    /// stays finite while still favoring them heavily.
    pub fn value_score(quality: &ProviderQuality, cost: &ProviderCost, free_tier: bool) -> f64 {
        let per_call = if free_tier {
            0.0
        } else {
            cost.avg_cost_per_call()
        };
        quality.quality_score() / (per_call + 0.001)
    }

    /// Enabled, healthy providers ranked for quality routing.
    ///
    /// Order: quality score descending, then lower priority number, then
    /// provider name.
    pub async fn ranked_providers(
        &self,
        configured: &[ProviderSettings],
        health: &HealthTracker,
    ) -> Vec<String> {
        let mut candidates: Vec<(f64, u8, String)> = Vec::new();
        for settings in configured.iter().filter(|p| p.enabled) {
            if !health.is_healthy(&settings.name).await {
                continue;
            }
            let score = self.get(&settings.name).await.quality_score();
            candidates.push((score, settings.priority, settings.name.clone()));
        }
        candidates.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.1.cmp(&b.1))
                .then(a.2.cmp(&b.2))
        });
        candidates.into_iter().map(|(_, _, name)| name).collect()
    }
}
