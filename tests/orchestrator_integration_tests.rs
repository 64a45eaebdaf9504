//! Orchestrator strategy tests over live HTTP stubs.

mod common;

use common::{bonbom_extraction, fixture_email, ProviderKind};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use collabiq::config::OrchestratorSettings;
use collabiq::entities::Strategy;
use collabiq::error::PipelineError;
use collabiq::orchestrator::Orchestrator;
use collabiq::providers::ProviderHandle;
use collabiq::trackers::{CostTracker, HealthTracker, QualityTracker};
use collabiq::ServiceBreakers;

struct Harness {
    orchestrator: Orchestrator,
    health: Arc<HealthTracker>,
    cost: Arc<CostTracker>,
    shutdown_tx: watch::Sender<bool>,
    _tempdir: tempfile::TempDir,
}

fn harness(handles: Vec<ProviderHandle>, settings: OrchestratorSettings) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let health = Arc::new(HealthTracker::new(dir.path().join("health.json")));
    let cost = Arc::new(CostTracker::new(dir.path().join("cost.json")));
    let quality = Arc::new(QualityTracker::new(dir.path().join("quality.json")));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let orchestrator = Orchestrator::new(
        handles,
        settings,
        Arc::new(ServiceBreakers::new()),
        Arc::clone(&health),
        Arc::clone(&cost),
        quality,
        shutdown_rx,
    );
    Harness {
        orchestrator,
        health,
        cost,
        shutdown_tx,
        _tempdir: dir,
    }
}

/// Scenario: the first-priority provider 503s through its whole retry
/// budget; the second succeeds. The row comes from the second provider and
/// the first's failure streak is visible in the health tracker.
#[tokio::test]
async fn test_failover_advances_past_exhausted_provider() {
    let failing = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ProviderKind::Gemini.endpoint()))
        .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
        .mount(&failing)
        .await;

    let healthy = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ProviderKind::OpenAi.endpoint()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ProviderKind::OpenAi.extraction_body(&bonbom_extraction())),
        )
        .mount(&healthy)
        .await;

    let h = harness(
        vec![
            ProviderKind::Gemini.handle(&failing.uri(), 1),
            ProviderKind::OpenAi.handle(&healthy.uri(), 2),
        ],
        OrchestratorSettings::default(),
    );

    let entities = h
        .orchestrator
        .extract(&fixture_email("m1", "본봄 킥오프"), Strategy::Failover)
        .await
        .expect("second provider must carry the extraction");

    assert_eq!(entities.provenance.provider_name, "openai");
    assert_eq!(entities.provenance.strategy, Some(Strategy::Failover));
    assert!(entities.provenance.fallback_used);

    let gemini = h.health.get("gemini").await;
    assert_eq!(gemini.consecutive_failures, 3, "one per retry attempt");
    assert_eq!(gemini.success_count, 0);
    let openai = h.health.get("openai").await;
    assert_eq!(openai.success_count, 1);
    assert_eq!(openai.consecutive_failures, 0);

    // Cost is recorded only for the provider that returned usage.
    assert_eq!(h.cost.get("openai").await.api_calls, 1);
    assert_eq!(h.cost.get("gemini").await.api_calls, 0);
}

#[tokio::test]
async fn test_failover_with_all_providers_down_raises() {
    let failing = MockServer::start().await;
    for kind in [ProviderKind::Gemini, ProviderKind::OpenAi] {
        Mock::given(method("POST"))
            .and(path(kind.endpoint()))
            .respond_with(ResponseTemplate::new(500))
            .mount(&failing)
            .await;
    }

    let h = harness(
        vec![
            ProviderKind::Gemini.handle(&failing.uri(), 1),
            ProviderKind::OpenAi.handle(&failing.uri(), 2),
        ],
        OrchestratorSettings::default(),
    );

    let err = h
        .orchestrator
        .extract(&fixture_email("m2", "본봄"), Strategy::Failover)
        .await
        .expect_err("nothing can succeed");
    match err {
        PipelineError::AllProvidersFailed { attempted } => {
            assert_eq!(attempted, vec!["gemini", "openai"]);
        }
        other => panic!("expected AllProvidersFailed, got {other:?}"),
    }
}

/// Scenario: two providers agree on the company name, one abstains with a
/// null. The majority value wins and the merged response records the
/// consensus strategy.
#[tokio::test]
async fn test_consensus_majority_with_abstainer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ProviderKind::Gemini.endpoint()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ProviderKind::Gemini.extraction_body(&bonbom_extraction())),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ProviderKind::OpenAi.endpoint()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ProviderKind::OpenAi.extraction_body(&bonbom_extraction())),
        )
        .mount(&server)
        .await;
    let abstaining = json!({
        "person_in_charge": null,
        "company_name": null,
        "partner_org": null,
        "details": "킥오프 미팅이 있었다.",
        "collab_date": null,
        "confidence": {
            "person_in_charge": 0.0,
            "company_name": 0.0,
            "partner_org": 0.0,
            "details": 0.4,
            "collab_date": 0.0
        }
    });
    Mock::given(method("POST"))
        .and(path(ProviderKind::Anthropic.endpoint()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ProviderKind::Anthropic.extraction_body(&abstaining)),
        )
        .mount(&server)
        .await;

    let h = harness(
        vec![
            ProviderKind::Gemini.handle(&server.uri(), 1),
            ProviderKind::OpenAi.handle(&server.uri(), 2),
            ProviderKind::Anthropic.handle(&server.uri(), 3),
        ],
        OrchestratorSettings::default(),
    );

    let merged = h
        .orchestrator
        .extract(&fixture_email("m3", "본봄 킥오프"), Strategy::Consensus)
        .await
        .expect("quorum of three");

    assert_eq!(merged.company_name.as_deref(), Some("본봄"));
    assert_eq!(merged.partner_org.as_deref(), Some("신세계"));
    assert_eq!(merged.provenance.strategy, Some(Strategy::Consensus));
    assert!(merged.provenance.provider_name.starts_with("consensus("));
}

#[tokio::test]
async fn test_consensus_below_quorum_raises_insufficient_agreement() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(ProviderKind::Gemini.endpoint()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ProviderKind::Gemini.extraction_body(&bonbom_extraction())),
        )
        .mount(&server)
        .await;

    let h = harness(
        vec![ProviderKind::Gemini.handle(&server.uri(), 1)],
        OrchestratorSettings::default(),
    );

    let err = h
        .orchestrator
        .extract(&fixture_email("m4", "본봄"), Strategy::Consensus)
        .await
        .expect_err("one response is below quorum");
    assert!(matches!(
        err,
        PipelineError::InsufficientAgreement { got: 1, required: 2 }
    ));
}

#[tokio::test]
async fn test_best_match_picks_highest_aggregate_confidence() {
    let server = MockServer::start().await;
    let mut low = bonbom_extraction();
    low["confidence"] = json!({
        "person_in_charge": 0.3,
        "company_name": 0.3,
        "partner_org": 0.3,
        "details": 0.3,
        "collab_date": 0.3
    });
    Mock::given(method("POST"))
        .and(path(ProviderKind::Gemini.endpoint()))
        .respond_with(
            ResponseTemplate::new(200).set_body_json(ProviderKind::Gemini.extraction_body(&low)),
        )
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(ProviderKind::OpenAi.endpoint()))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(ProviderKind::OpenAi.extraction_body(&bonbom_extraction())),
        )
        .mount(&server)
        .await;

    let h = harness(
        vec![
            ProviderKind::Gemini.handle(&server.uri(), 1),
            ProviderKind::OpenAi.handle(&server.uri(), 2),
        ],
        OrchestratorSettings::default(),
    );

    let best = h
        .orchestrator
        .extract(&fixture_email("m5", "본봄"), Strategy::BestMatch)
        .await
        .unwrap();
    assert_eq!(best.provenance.provider_name, "openai");
    assert_eq!(best.provenance.strategy, Some(Strategy::BestMatch));
    assert!(best.provenance.fallback_used, "winner was not first priority");
}

/// Scenario: shutdown arrives while providers are still in flight. The
/// gather returns what it has; with nothing collected the consensus rule
/// fails fast instead of waiting out slow providers.
#[tokio::test]
async fn test_shutdown_during_consensus_returns_promptly() {
    let server = MockServer::start().await;
    for kind in [ProviderKind::Gemini, ProviderKind::OpenAi] {
        Mock::given(method("POST"))
            .and(path(kind.endpoint()))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(kind.extraction_body(&bonbom_extraction()))
                    .set_delay(Duration::from_secs(30)),
            )
            .mount(&server)
            .await;
    }

    let h = harness(
        vec![
            ProviderKind::Gemini.handle(&server.uri(), 1),
            ProviderKind::OpenAi.handle(&server.uri(), 2),
        ],
        OrchestratorSettings::default(),
    );
    h.shutdown_tx.send(true).unwrap();

    let started = std::time::Instant::now();
    let err = h
        .orchestrator
        .extract(&fixture_email("m6", "본봄"), Strategy::Consensus)
        .await
        .expect_err("no responses were collected before shutdown");
    assert!(matches!(err, PipelineError::InsufficientAgreement { .. }));
    assert!(
        started.elapsed() < Duration::from_secs(5),
        "shutdown must cancel in-flight providers, took {:?}",
        started.elapsed()
    );
}
