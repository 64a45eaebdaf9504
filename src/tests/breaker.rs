use crate::breaker::{CircuitState, ServiceBreakers};
use crate::error::service;

// Unit Tests for ServiceBreakers
//
// UNIT UNDER TEST: ServiceBreakers (per-service circuit breaker registry)
//
// BUSINESS RESPONSIBILITY:
//   - Opens a service's circuit after the failure threshold is reached
//   - Blocks all outbound calls while open and before cooldown (breaker
//     safety property)
//   - Admits a probe after cooldown and closes again only after the
//     success threshold
//   - Keeps services independent: one provider's outage never gates another
//
// TEST COVERAGE:
//   - closed → open → half-open → closed round trip
//   - half-open falling straight back to open on a probe failure
//   - success resetting the consecutive-failure count
//   - secrets service using its tighter thresholds

#[test]
fn test_breaker_opens_at_failure_threshold() {
    let breakers = ServiceBreakers::new();
    let svc = service::WORKSPACE;

    for _ in 0..4 {
        breakers.record_failure(svc);
        assert_eq!(breakers.state(svc), CircuitState::Closed);
    }
    breakers.record_failure(svc);
    assert_eq!(breakers.state(svc), CircuitState::Open);
    assert!(!breakers.allow(svc), "open breaker must block calls");
}

#[test]
fn test_success_resets_consecutive_failures() {
    let breakers = ServiceBreakers::new();
    let svc = service::MAIL;

    for _ in 0..4 {
        breakers.record_failure(svc);
    }
    breakers.record_success(svc);
    for _ in 0..4 {
        breakers.record_failure(svc);
    }
    assert_eq!(
        breakers.state(svc),
        CircuitState::Closed,
        "a success in between must reset the failure streak"
    );
}

#[test]
fn test_services_are_independent() {
    let breakers = ServiceBreakers::new();
    for _ in 0..5 {
        breakers.record_failure(&service::llm("gemini"));
    }
    assert_eq!(breakers.state(&service::llm("gemini")), CircuitState::Open);
    assert_eq!(breakers.state(&service::llm("openai")), CircuitState::Closed);
    assert!(breakers.allow(service::WORKSPACE));
}

#[test]
fn test_secrets_breaker_uses_tighter_threshold() {
    let breakers = ServiceBreakers::new();
    breakers.record_failure(service::SECRETS);
    breakers.record_failure(service::SECRETS);
    assert_eq!(breakers.state(service::SECRETS), CircuitState::Closed);
    breakers.record_failure(service::SECRETS);
    assert_eq!(breakers.state(service::SECRETS), CircuitState::Open);
}

#[test]
fn test_half_open_failure_reopens_immediately() {
    let breakers = ServiceBreakers::new();
    let svc = service::WORKSPACE;
    for _ in 0..5 {
        breakers.record_failure(svc);
    }
    // Without waiting out the cooldown the breaker stays open; force the
    // half-open path by simulating a probe failure once admitted. Since the
    // cooldown is wall-clock, assert the open/blocked behavior here.
    assert!(!breakers.allow(svc));
    assert_eq!(breakers.snapshot(svc).state, CircuitState::Open);
}

fn fast_breaker(breakers: &ServiceBreakers, svc: &str) {
    breakers.configure(
        svc,
        crate::breaker::BreakerSettings {
            failure_threshold: 3,
            success_threshold: 2,
            cooldown: std::time::Duration::from_millis(20),
        },
    );
}

#[test]
fn test_cooldown_admits_probe_then_success_threshold_closes() {
    let breakers = ServiceBreakers::new();
    let svc = "workspace";
    fast_breaker(&breakers, svc);

    for _ in 0..3 {
        breakers.record_failure(svc);
    }
    assert!(!breakers.allow(svc));

    std::thread::sleep(std::time::Duration::from_millis(30));
    assert!(breakers.allow(svc), "cooldown elapsed, probe admitted");
    assert_eq!(breakers.state(svc), CircuitState::HalfOpen);

    breakers.record_success(svc);
    assert_eq!(breakers.state(svc), CircuitState::HalfOpen);
    breakers.record_success(svc);
    assert_eq!(
        breakers.state(svc),
        CircuitState::Closed,
        "two consecutive probe successes close the breaker"
    );
}

#[test]
fn test_half_open_probe_failure_reopens() {
    let breakers = ServiceBreakers::new();
    let svc = "workspace";
    fast_breaker(&breakers, svc);
    for _ in 0..3 {
        breakers.record_failure(svc);
    }
    std::thread::sleep(std::time::Duration::from_millis(30));
    assert!(breakers.allow(svc));

    breakers.record_failure(svc);
    assert_eq!(breakers.state(svc), CircuitState::Open);
    assert!(!breakers.allow(svc));
}
