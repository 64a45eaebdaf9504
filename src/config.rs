//! Configuration for the collabiq pipeline.
//!
//! All settings are environment-driven with a `.env` fallback (loaded once by
//! [`crate::secrets::SecretStore`]). [`AppConfig::from_env`] assembles and
//! validates the full configuration; a validation failure is fatal at
//! startup (non-zero exit), never discovered mid-cycle.
//!
//! # Environment variables
//!
//! | Variable | Default | Meaning |
//! |----------|---------|---------|
//! | `COLLABIQ_DATA_DIR` | `data` | Root for state/health/cache/dlq files |
//! | `COLLABIQ_CYCLE_INTERVAL_MS` | `300000` | Daemon cycle cadence |
//! | `COLLABIQ_STRATEGY` | `failover` | failover \| consensus \| best-match |
//! | `COLLABIQ_DUPLICATE_BEHAVIOR` | `skip` | skip \| update |
//! | `COLLABIQ_QUALITY_ROUTING` | `false` | Quality-ranked provider order |
//! | `WORKSPACE_BASE_URL` | `https://api.notion.com` | Workspace API root |
//! | `WORKSPACE_COMPANIES_DB` / `_USERS_DB` / `_COLLABS_DB` | (required) | Database ids |
//! | `<PROVIDER>_ENABLED` / `_MODEL` / `_PRIORITY` / `_TIMEOUT_MS` | per-provider | See [`ProviderSettings`] |

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::entities::Strategy;
use crate::error::{PipelineError, PipelineResult};

/// Per-provider configuration block.
///
/// One block per LLM provider; `priority` orders failover and must be unique
/// across enabled providers.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProviderSettings {
    /// Provider identifier: "gemini", "openai", "anthropic".
    pub name: String,
    pub model_id: String,
    /// API root; overridable per provider for self-hosted gateways.
    pub base_url: String,
    pub enabled: bool,
    /// Lower is tried first in failover order.
    pub priority: u8,
    pub timeout_ms: u64,
    pub max_retries: u32,
    /// USD per million input tokens.
    pub input_price_per_mtok: f64,
    /// USD per million output tokens.
    pub output_price_per_mtok: f64,
    /// Free-tier providers are favored by the value score.
    pub free_tier: bool,
}

impl ProviderSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Environment key holding this provider's API key.
    pub fn api_key_env(&self) -> String {
        format!("{}_API_KEY", self.name.to_ascii_uppercase())
    }
}

/// Orchestrator-level tunables.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrchestratorSettings {
    pub strategy: Strategy,
    /// Overall deadline for the parallel strategies.
    pub timeout_ms: u64,
    /// Jaro-Winkler threshold for grouping consensus values.
    pub fuzzy_threshold: f64,
    /// Winning groups below this weighted confidence abstain to null.
    pub abstention_threshold: f64,
    /// Rank providers by quality score instead of static priority.
    pub quality_routing: bool,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            strategy: Strategy::Failover,
            timeout_ms: 90_000,
            fuzzy_threshold: 0.85,
            abstention_threshold: 0.25,
            quality_routing: false,
        }
    }
}

/// What to do when a message id is already recorded in the workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DuplicateBehavior {
    Skip,
    Update,
}

/// Workspace (Notion) connection settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkspaceSettings {
    pub base_url: String,
    pub companies_db_id: String,
    pub users_db_id: String,
    pub collaborations_db_id: String,
    /// Token-bucket refill rate shared by all in-process consumers.
    pub requests_per_second: u32,
    pub duplicate_behavior: DuplicateBehavior,
}

impl Default for WorkspaceSettings {
    fn default() -> Self {
        Self {
            base_url: "https://api.notion.com".to_string(),
            companies_db_id: String::new(),
            users_db_id: String::new(),
            collaborations_db_id: String::new(),
            requests_per_second: 3,
            duplicate_behavior: DuplicateBehavior::Skip,
        }
    }
}

/// Daemon cadence and storage layout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DaemonSettings {
    pub cycle_interval_ms: u64,
    pub data_dir: PathBuf,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            cycle_interval_ms: 300_000,
            data_dir: PathBuf::from("data"),
        }
    }
}

impl DaemonSettings {
    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn state_path(&self) -> PathBuf {
        self.data_dir.join("state").join("daemon.json")
    }

    pub fn health_dir(&self) -> PathBuf {
        self.data_dir.join("health")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.data_dir.join("cache")
    }

    pub fn dlq_dir(&self) -> PathBuf {
        self.data_dir.join("dlq")
    }
}

/// Complete pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub providers: Vec<ProviderSettings>,
    pub orchestrator: OrchestratorSettings,
    pub workspace: WorkspaceSettings,
    pub daemon: DaemonSettings,
}

fn env_var(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> PipelineResult<T> {
    match env_var(key) {
        Some(raw) => raw
            .parse::<T>()
            .map_err(|_| PipelineError::configuration(format!("invalid value for {key}: {raw}"))),
        None => Ok(default),
    }
}

fn env_bool(key: &str, default: bool) -> PipelineResult<bool> {
    match env_var(key).as_deref() {
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(raw) => Err(PipelineError::configuration(format!(
            "invalid boolean for {key}: {raw}"
        ))),
        None => Ok(default),
    }
}

fn provider_from_env(
    name: &str,
    default_model: &str,
    default_base_url: &str,
    default_priority: u8,
    free_tier: bool,
    default_in_price: f64,
    default_out_price: f64,
) -> PipelineResult<ProviderSettings> {
    let upper = name.to_ascii_uppercase();
    Ok(ProviderSettings {
        name: name.to_string(),
        model_id: env_var(&format!("{upper}_MODEL")).unwrap_or_else(|| default_model.to_string()),
        base_url: env_var(&format!("{upper}_BASE_URL"))
            .unwrap_or_else(|| default_base_url.to_string()),
        enabled: env_bool(&format!("{upper}_ENABLED"), true)?,
        priority: env_parse(&format!("{upper}_PRIORITY"), default_priority)?,
        timeout_ms: env_parse(&format!("{upper}_TIMEOUT_MS"), 60_000u64)?,
        max_retries: env_parse(&format!("{upper}_MAX_RETRIES"), 3u32)?,
        input_price_per_mtok: env_parse(&format!("{upper}_INPUT_PRICE_MTOK"), default_in_price)?,
        output_price_per_mtok: env_parse(&format!("{upper}_OUTPUT_PRICE_MTOK"), default_out_price)?,
        free_tier,
    })
}

impl AppConfig {
    /// Assemble configuration from the environment and validate it.
    pub fn from_env() -> PipelineResult<Self> {
        let providers = vec![
            provider_from_env(
                "gemini",
                "gemini-2.0-flash",
                "https://generativelanguage.googleapis.com",
                1,
                true,
                0.10,
                0.40,
            )?,
            provider_from_env(
                "openai",
                "gpt-4o-mini",
                "https://api.openai.com",
                2,
                false,
                0.15,
                0.60,
            )?,
            provider_from_env(
                "anthropic",
                "claude-3-5-haiku-latest",
                "https://api.anthropic.com",
                3,
                false,
                0.80,
                4.00,
            )?,
        ];

        let strategy = match env_var("COLLABIQ_STRATEGY") {
            Some(raw) => raw.parse::<Strategy>()?,
            None => Strategy::Failover,
        };

        let duplicate_behavior = match env_var("COLLABIQ_DUPLICATE_BEHAVIOR").as_deref() {
            Some("update") => DuplicateBehavior::Update,
            Some("skip") | None => DuplicateBehavior::Skip,
            Some(other) => {
                return Err(PipelineError::configuration(format!(
                    "invalid COLLABIQ_DUPLICATE_BEHAVIOR: {other}"
                )))
            }
        };

        let config = Self {
            providers,
            orchestrator: OrchestratorSettings {
                strategy,
                timeout_ms: env_parse("COLLABIQ_ORCHESTRATOR_TIMEOUT_MS", 90_000u64)?,
                fuzzy_threshold: env_parse("CONSENSUS_FUZZY_THRESHOLD", 0.85f64)?,
                abstention_threshold: env_parse("CONSENSUS_ABSTENTION_THRESHOLD", 0.25f64)?,
                quality_routing: env_bool("COLLABIQ_QUALITY_ROUTING", false)?,
            },
            workspace: WorkspaceSettings {
                base_url: env_var("WORKSPACE_BASE_URL")
                    .unwrap_or_else(|| "https://api.notion.com".to_string()),
                companies_db_id: env_var("WORKSPACE_COMPANIES_DB").unwrap_or_default(),
                users_db_id: env_var("WORKSPACE_USERS_DB").unwrap_or_default(),
                collaborations_db_id: env_var("WORKSPACE_COLLABS_DB").unwrap_or_default(),
                requests_per_second: env_parse("WORKSPACE_REQUESTS_PER_SECOND", 3u32)?,
                duplicate_behavior,
            },
            daemon: DaemonSettings {
                cycle_interval_ms: env_parse("COLLABIQ_CYCLE_INTERVAL_MS", 300_000u64)?,
                data_dir: PathBuf::from(
                    env_var("COLLABIQ_DATA_DIR").unwrap_or_else(|| "data".to_string()),
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> PipelineResult<()> {
        let enabled: Vec<&ProviderSettings> =
            self.providers.iter().filter(|p| p.enabled).collect();
        if enabled.is_empty() {
            return Err(PipelineError::configuration(
                "at least one LLM provider must be enabled",
            ));
        }

        let mut priorities: Vec<u8> = enabled.iter().map(|p| p.priority).collect();
        priorities.sort_unstable();
        priorities.dedup();
        if priorities.len() != enabled.len() {
            return Err(PipelineError::configuration(
                "provider priorities must be unique across enabled providers",
            ));
        }

        for p in &self.providers {
            if p.timeout_ms == 0 {
                return Err(PipelineError::configuration(format!(
                    "{}: timeout_ms must be positive",
                    p.name
                )));
            }
            if p.input_price_per_mtok < 0.0 || p.output_price_per_mtok < 0.0 {
                return Err(PipelineError::configuration(format!(
                    "{}: token prices must be non-negative",
                    p.name
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.orchestrator.fuzzy_threshold) {
            return Err(PipelineError::configuration(
                "fuzzy_threshold must be within [0.0, 1.0]",
            ));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.abstention_threshold) {
            return Err(PipelineError::configuration(
                "abstention_threshold must be within [0.0, 1.0]",
            ));
        }

        if self.workspace.requests_per_second == 0 {
            return Err(PipelineError::configuration(
                "workspace requests_per_second must be positive",
            ));
        }
        for (label, id) in [
            ("WORKSPACE_COMPANIES_DB", &self.workspace.companies_db_id),
            ("WORKSPACE_USERS_DB", &self.workspace.users_db_id),
            ("WORKSPACE_COLLABS_DB", &self.workspace.collaborations_db_id),
        ] {
            if id.is_empty() {
                return Err(PipelineError::configuration(format!("{label} is not set")));
            }
        }

        if self.daemon.cycle_interval_ms == 0 {
            return Err(PipelineError::configuration(
                "cycle_interval_ms must be positive",
            ));
        }

        Ok(())
    }

    /// Settings block for a provider by name.
    pub fn provider(&self, name: &str) -> Option<&ProviderSettings> {
        self.providers.iter().find(|p| p.name == name)
    }
}
