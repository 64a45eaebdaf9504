use crate::config::{
    AppConfig, DaemonSettings, DuplicateBehavior, OrchestratorSettings, ProviderSettings,
    WorkspaceSettings,
};
use crate::entities::Strategy;

// Unit Tests for configuration validation
//
// UNIT UNDER TEST: AppConfig::validate + from_env
//
// BUSINESS RESPONSIBILITY:
//   - Rejects invalid configuration at startup instead of mid-cycle
//   - Enforces unique provider priorities, positive intervals, threshold
//     bounds, and the presence of the workspace database ids
//
// TEST COVERAGE: each rejection rule plus a passing baseline, and the
// env-driven loader under controlled variables.

fn provider(name: &str, priority: u8) -> ProviderSettings {
    ProviderSettings {
        name: name.to_string(),
        model_id: format!("{name}-model"),
        base_url: "http://localhost".to_string(),
        enabled: true,
        priority,
        timeout_ms: 60_000,
        max_retries: 3,
        input_price_per_mtok: 0.1,
        output_price_per_mtok: 0.4,
        free_tier: false,
    }
}

fn valid_config() -> AppConfig {
    AppConfig {
        providers: vec![provider("gemini", 1), provider("openai", 2)],
        orchestrator: OrchestratorSettings::default(),
        workspace: WorkspaceSettings {
            companies_db_id: "companies-db".to_string(),
            users_db_id: "users-db".to_string(),
            collaborations_db_id: "collabs-db".to_string(),
            ..WorkspaceSettings::default()
        },
        daemon: DaemonSettings::default(),
    }
}

#[test]
fn test_valid_config_passes() {
    valid_config().validate().expect("baseline config is valid");
}

#[test]
fn test_no_enabled_provider_is_rejected() {
    let mut config = valid_config();
    for p in &mut config.providers {
        p.enabled = false;
    }
    assert!(config.validate().is_err());
}

#[test]
fn test_duplicate_priorities_are_rejected() {
    let mut config = valid_config();
    config.providers[1].priority = config.providers[0].priority;
    assert!(config.validate().is_err());
}

#[test]
fn test_disabled_provider_priority_may_collide() {
    let mut config = valid_config();
    config.providers[1].priority = config.providers[0].priority;
    config.providers[1].enabled = false;
    config
        .validate()
        .expect("priorities only need to be unique among enabled providers");
}

#[test]
fn test_zero_timeout_is_rejected() {
    let mut config = valid_config();
    config.providers[0].timeout_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_threshold_bounds_are_enforced() {
    let mut config = valid_config();
    config.orchestrator.fuzzy_threshold = 1.2;
    assert!(config.validate().is_err());

    let mut config = valid_config();
    config.orchestrator.abstention_threshold = -0.1;
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_database_ids_are_rejected() {
    let mut config = valid_config();
    config.workspace.collaborations_db_id = String::new();
    assert!(config.validate().is_err());
}

#[test]
fn test_zero_cycle_interval_is_rejected() {
    let mut config = valid_config();
    config.daemon.cycle_interval_ms = 0;
    assert!(config.validate().is_err());
}

#[test]
fn test_default_orchestrator_settings() {
    let settings = OrchestratorSettings::default();
    assert_eq!(settings.strategy, Strategy::Failover);
    assert_eq!(settings.timeout_ms, 90_000);
    assert!((settings.fuzzy_threshold - 0.85).abs() < 1e-9);
    assert!((settings.abstention_threshold - 0.25).abs() < 1e-9);
    assert!(!settings.quality_routing);
}

#[test]
#[serial_test::serial]
fn test_from_env_reads_overrides() {
    let vars = [
        ("COLLABIQ_STRATEGY", "consensus"),
        ("COLLABIQ_DUPLICATE_BEHAVIOR", "update"),
        ("COLLABIQ_CYCLE_INTERVAL_MS", "60000"),
        ("GEMINI_PRIORITY", "5"),
        ("OPENAI_PRIORITY", "6"),
        ("ANTHROPIC_PRIORITY", "7"),
        ("WORKSPACE_COMPANIES_DB", "companies-db"),
        ("WORKSPACE_USERS_DB", "users-db"),
        ("WORKSPACE_COLLABS_DB", "collabs-db"),
    ];
    for (key, value) in vars {
        std::env::set_var(key, value);
    }

    let config = AppConfig::from_env().expect("env config is valid");
    assert_eq!(config.orchestrator.strategy, Strategy::Consensus);
    assert_eq!(
        config.workspace.duplicate_behavior,
        DuplicateBehavior::Update
    );
    assert_eq!(config.daemon.cycle_interval_ms, 60_000);
    assert_eq!(config.provider("gemini").unwrap().priority, 5);

    for (key, _) in vars {
        std::env::remove_var(key);
    }
}

#[test]
#[serial_test::serial]
fn test_from_env_rejects_garbage_values() {
    std::env::set_var("COLLABIQ_CYCLE_INTERVAL_MS", "not-a-number");
    let result = AppConfig::from_env();
    std::env::remove_var("COLLABIQ_CYCLE_INTERVAL_MS");
    assert!(result.is_err());
}
