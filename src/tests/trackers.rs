use crate::config::ProviderSettings;
use crate::trackers::{CostTracker, HealthTracker, QualityTracker};

// Unit Tests for the health, cost, and quality trackers
//
// UNIT UNDER TEST: HealthTracker / CostTracker / QualityTracker
//
// BUSINESS RESPONSIBILITY:
//   - Health: success/failure counters, consecutive-failure streaks, EWMA
//     latency, persisted across restarts
//   - Cost: token totals priced per provider configuration
//   - Quality: composite quality score and quality-ranked routing order
//
// TEST COVERAGE:
//   - consecutive failures reset on success (health monotonicity)
//   - EWMA latency moves toward new samples without jumping
//   - cost arithmetic in USD per million tokens
//   - quality score composition and ranked_providers ordering/tie-breaks
//   - persisted files reload with identical counters

fn provider(name: &str, priority: u8, in_price: f64, out_price: f64) -> ProviderSettings {
    ProviderSettings {
        name: name.to_string(),
        model_id: format!("{name}-model"),
        base_url: "http://localhost".to_string(),
        enabled: true,
        priority,
        timeout_ms: 60_000,
        max_retries: 3,
        input_price_per_mtok: in_price,
        output_price_per_mtok: out_price,
        free_tier: in_price == 0.0,
    }
}

#[tokio::test]
async fn test_consecutive_failures_reset_on_success() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = HealthTracker::new(dir.path().join("health.json"));

    tracker.record_failure("gemini", "503").await;
    tracker.record_failure("gemini", "503").await;
    assert_eq!(tracker.get("gemini").await.consecutive_failures, 2);

    tracker.record_success("gemini", 300).await;
    let health = tracker.get("gemini").await;
    assert_eq!(health.consecutive_failures, 0);
    assert_eq!(health.failure_count, 2, "totals are never reset");
    assert_eq!(health.success_count, 1);
    assert!(health.last_success_at.is_some());
}

#[tokio::test]
async fn test_health_flags_unhealthy_after_streak() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = HealthTracker::new(dir.path().join("health.json"));

    assert!(tracker.is_healthy("openai").await, "unknown providers start healthy");
    for _ in 0..3 {
        tracker.record_failure("openai", "timeout").await;
    }
    assert!(!tracker.is_healthy("openai").await);
}

#[tokio::test]
async fn test_latency_ewma_moves_toward_samples() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = HealthTracker::new(dir.path().join("health.json"));

    tracker.record_success("gemini", 1000).await;
    assert_eq!(tracker.get("gemini").await.avg_latency_ms, 1000.0);

    tracker.record_success("gemini", 2000).await;
    let avg = tracker.get("gemini").await.avg_latency_ms;
    // EWMA α=0.2: 0.2·2000 + 0.8·1000 = 1200
    assert!((avg - 1200.0).abs() < 1e-6, "got {avg}");
}

#[tokio::test]
async fn test_health_persists_and_reloads() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("health.json");
    {
        let tracker = HealthTracker::new(path.clone());
        tracker.record_success("anthropic", 500).await;
        tracker.record_failure("anthropic", "429").await;
    }
    let reloaded = HealthTracker::load(path).await;
    let health = reloaded.get("anthropic").await;
    assert_eq!(health.success_count, 1);
    assert_eq!(health.failure_count, 1);
}

#[tokio::test]
async fn test_cost_is_priced_per_million_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = CostTracker::new(dir.path().join("cost.json"));
    let settings = provider("openai", 2, 0.15, 0.60);

    tracker.record(&settings, 1_000_000, 500_000).await;
    let cost = tracker.get("openai").await;
    assert_eq!(cost.api_calls, 1);
    assert_eq!(cost.input_tokens, 1_000_000);
    assert_eq!(cost.output_tokens, 500_000);
    // 1M·$0.15/M + 0.5M·$0.60/M = 0.15 + 0.30
    assert!((cost.total_cost_usd - 0.45).abs() < 1e-9);
    assert!((cost.avg_cost_per_call() - 0.45).abs() < 1e-9);
}

#[tokio::test]
async fn test_quality_score_composition() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = QualityTracker::new(dir.path().join("quality.json"));
    let mut field_conf = std::collections::BTreeMap::new();
    field_conf.insert("company_name".to_string(), 0.9);

    tracker.record("gemini", 0.8, &field_conf, 1.0, true).await;
    let quality = tracker.get("gemini").await;
    // 0.4·0.8 + 0.3·1.0 + 0.3·1.0
    assert!((quality.quality_score() - 0.92).abs() < 1e-9);
    assert_eq!(quality.validation_attempts, 1);
    assert_eq!(quality.validation_successes, 1);
}

#[tokio::test]
async fn test_failed_validation_drags_quality_down() {
    let dir = tempfile::tempdir().unwrap();
    let tracker = QualityTracker::new(dir.path().join("quality.json"));
    let empty = std::collections::BTreeMap::new();

    tracker.record("openai", 0.9, &empty, 1.0, true).await;
    let before = tracker.get("openai").await.quality_score();
    tracker.record("openai", 0.0, &empty, 0.0, false).await;
    let after = tracker.get("openai").await.quality_score();
    assert!(after < before, "validation failures must lower the score");
}

#[tokio::test]
async fn test_ranked_providers_orders_by_quality_then_priority_then_name() {
    let dir = tempfile::tempdir().unwrap();
    let quality = QualityTracker::new(dir.path().join("quality.json"));
    let health = HealthTracker::new(dir.path().join("health.json"));
    let empty = std::collections::BTreeMap::new();

    let configs = vec![
        provider("gemini", 1, 0.0, 0.0),
        provider("openai", 2, 0.15, 0.60),
        provider("anthropic", 3, 0.80, 4.00),
    ];

    // openai earns the best quality; gemini and anthropic stay tied at zero
    // history, so priority breaks the tie.
    quality.record("openai", 0.95, &empty, 1.0, true).await;

    let ranked = quality.ranked_providers(&configs, &health).await;
    assert_eq!(ranked, vec!["openai", "gemini", "anthropic"]);
}

#[tokio::test]
async fn test_ranked_providers_drops_unhealthy() {
    let dir = tempfile::tempdir().unwrap();
    let quality = QualityTracker::new(dir.path().join("quality.json"));
    let health = HealthTracker::new(dir.path().join("health.json"));
    let empty = std::collections::BTreeMap::new();

    let configs = vec![provider("gemini", 1, 0.0, 0.0), provider("openai", 2, 0.15, 0.60)];
    quality.record("gemini", 0.99, &empty, 1.0, true).await;
    for _ in 0..3 {
        health.record_failure("gemini", "500").await;
    }

    let ranked = quality.ranked_providers(&configs, &health).await;
    assert_eq!(ranked, vec!["openai"], "unhealthy providers are not routed to");
}
