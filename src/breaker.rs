//! Per-service circuit breakers.
//!
//! One breaker per service key (`mail`, `llm.<provider>`, `workspace`,
//! `secrets`), held in a [`ServiceBreakers`] registry that the daemon
//! controller owns and injects wherever outbound calls are made. Breakers
//! are in-process only; a restart legitimately resets them.
//!
//! State machine:
//! - closed → open after `failure_threshold` consecutive failures
//! - open → half-open once `cooldown` has elapsed (decided lazily in
//!   [`ServiceBreakers::allow`])
//! - half-open → closed after `success_threshold` consecutive successes
//! - half-open → open on any failure

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::logging::{log_critical, log_debug, log_info};

/// Breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(label)
    }
}

/// Thresholds for one breaker.
#[derive(Debug, Clone)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_millis(60_000),
        }
    }
}

impl BreakerSettings {
    /// Secrets fail faster and recover sooner than remote APIs.
    pub fn secrets() -> Self {
        Self {
            failure_threshold: 3,
            cooldown: Duration::from_millis(30_000),
            ..Self::default()
        }
    }

    fn for_service(service: &str) -> Self {
        if service == crate::error::service::SECRETS {
            Self::secrets()
        } else {
            Self::default()
        }
    }
}

#[derive(Debug)]
struct CircuitBreaker {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_at: Option<Instant>,
    open_since: Option<Instant>,
    settings: BreakerSettings,
}

impl CircuitBreaker {
    fn new(settings: BreakerSettings) -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_at: None,
            open_since: None,
            settings,
        }
    }

    fn allow(&mut self, service: &str) -> bool {
        match self.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = self
                    .open_since
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.settings.cooldown {
                    log_debug!(
                        service = %service,
                        circuit_state = "half-open",
                        "Breaker cooldown elapsed, admitting probe"
                    );
                    self.state = CircuitState::HalfOpen;
                    self.success_count = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self, service: &str) {
        match self.state {
            CircuitState::HalfOpen => {
                self.success_count += 1;
                if self.success_count >= self.settings.success_threshold {
                    log_info!(
                        service = %service,
                        circuit_state = "closed",
                        "Breaker recovered"
                    );
                    self.state = CircuitState::Closed;
                    self.failure_count = 0;
                    self.success_count = 0;
                    self.open_since = None;
                }
            }
            _ => {
                self.failure_count = 0;
            }
        }
    }

    fn record_failure(&mut self, service: &str) {
        self.failure_count += 1;
        self.last_failure_at = Some(Instant::now());

        let should_open = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.failure_count >= self.settings.failure_threshold,
            CircuitState::Open => false,
        };
        if should_open && self.state != CircuitState::Open {
            log_critical!(
                service = %service,
                circuit_state = "open",
                failure_count = self.failure_count,
                cooldown_ms = self.settings.cooldown.as_millis() as u64,
                "Breaker opened"
            );
            self.state = CircuitState::Open;
            self.open_since = Some(Instant::now());
            self.success_count = 0;
        }
    }
}

/// Read-only view of one breaker for status output and log fields.
#[derive(Debug, Clone, serde::Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
    pub success_count: u32,
    /// Milliseconds since the most recent failure, if any.
    pub last_failure_age_ms: Option<u64>,
    /// Milliseconds the breaker has been open, if open.
    pub open_for_ms: Option<u64>,
}

/// Registry of breakers keyed by service.
///
/// All operations are O(1) under one mutex; none of them await.
#[derive(Debug, Default)]
pub struct ServiceBreakers {
    inner: Mutex<HashMap<String, CircuitBreaker>>,
}

impl ServiceBreakers {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_breaker<R>(&self, service: &str, f: impl FnOnce(&mut CircuitBreaker) -> R) -> R {
        let mut map = self.inner.lock().expect("breaker registry poisoned");
        let breaker = map
            .entry(service.to_string())
            .or_insert_with(|| CircuitBreaker::new(BreakerSettings::for_service(service)));
        f(breaker)
    }

    /// Install explicit thresholds for one service, replacing any existing
    /// breaker state. Used for non-default services and in tests.
    pub fn configure(&self, service: &str, settings: BreakerSettings) {
        let mut map = self.inner.lock().expect("breaker registry poisoned");
        map.insert(service.to_string(), CircuitBreaker::new(settings));
    }

    /// May a call to `service` proceed right now?
    ///
    /// Open breakers transition to half-open here once their cooldown has
    /// elapsed, admitting a single probe.
    pub fn allow(&self, service: &str) -> bool {
        self.with_breaker(service, |b| b.allow(service))
    }

    pub fn record_success(&self, service: &str) {
        self.with_breaker(service, |b| b.record_success(service));
    }

    pub fn record_failure(&self, service: &str) {
        self.with_breaker(service, |b| b.record_failure(service));
    }

    pub fn snapshot(&self, service: &str) -> BreakerSnapshot {
        self.with_breaker(service, |b| BreakerSnapshot {
            state: b.state,
            failure_count: b.failure_count,
            success_count: b.success_count,
            last_failure_age_ms: b
                .last_failure_at
                .map(|t| t.elapsed().as_millis() as u64),
            open_for_ms: b.open_since.map(|t| t.elapsed().as_millis() as u64),
        })
    }

    pub fn state(&self, service: &str) -> CircuitState {
        self.with_breaker(service, |b| b.state)
    }
}
