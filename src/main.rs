//! collabiq command-line entry point.
//!
//! `run` executes one cycle (or loops forever with `--daemon`), `dlq`
//! inspects and replays parked operations, and `status` summarizes daemon
//! state, provider health, and recent cost.

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::sync::Arc;
use tokio::sync::watch;

use collabiq::config::AppConfig;
use collabiq::daemon::{install_signal_handlers, DaemonController, DaemonState};
use collabiq::dlq::{DeadLetterQueue, OperationType, ReplaySummary, ReplayTarget};
use collabiq::mail::JsonDropAdapter;
use collabiq::orchestrator::Orchestrator;
use collabiq::providers::build_providers;
use collabiq::replay::{LlmExtractReplayer, PipelineReplayer, WorkspaceWriteReplayer};
use collabiq::secrets::SecretStore;
use collabiq::trackers::{CostTracker, HealthTracker, QualityTracker};
use collabiq::workspace::{CompanyMatcher, PersonMatcher, WorkspaceCaches, WorkspaceClient, Writer};
use collabiq::ServiceBreakers;

#[derive(Parser)]
#[command(name = "collabiq", version, about = "Collaboration email pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one cycle, or loop forever with --daemon.
    Run {
        /// Keep running on the configured interval until signalled.
        #[arg(long)]
        daemon: bool,
        /// Override the cycle interval, in seconds.
        #[arg(long)]
        interval: Option<u64>,
    },
    /// Inspect and replay the dead-letter queue.
    Dlq {
        #[command(subcommand)]
        command: DlqCommand,
    },
    /// Summarize daemon state, provider health, and recent cost.
    Status,
}

#[derive(Subcommand)]
enum DlqCommand {
    /// List all entries.
    List,
    /// Show one entry in full.
    Show { id: String },
    /// Replay entries against the workspace.
    Retry {
        /// Replay every replayable entry.
        #[arg(long, conflicts_with = "id")]
        all: bool,
        /// Replay a single entry.
        #[arg(long)]
        id: Option<String>,
    },
}

/// Fully wired pipeline components, shared by `run` and `dlq retry`.
struct Components {
    config: AppConfig,
    breakers: Arc<ServiceBreakers>,
    client: Arc<WorkspaceClient>,
    caches: Arc<WorkspaceCaches>,
    orchestrator: Arc<Orchestrator>,
    company_matcher: CompanyMatcher,
    person_matcher: PersonMatcher,
    dlq: DeadLetterQueue,
    writer: Writer,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

async fn load_trackers(config: &AppConfig) -> (HealthTracker, CostTracker, QualityTracker) {
    let dir = config.daemon.health_dir();
    (
        HealthTracker::load(dir.join("health.json")).await,
        CostTracker::load(dir.join("cost.json")).await,
        QualityTracker::load(dir.join("quality.json")).await,
    )
}

async fn build_components(config: AppConfig, secrets: &SecretStore) -> anyhow::Result<Components> {
    let (health, cost, quality) = load_trackers(&config).await;
    let health = Arc::new(health);
    let cost = Arc::new(cost);
    let quality = Arc::new(quality);

    let breakers = Arc::new(ServiceBreakers::new());
    let providers = build_providers(&config.providers, secrets)?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let orchestrator = Arc::new(Orchestrator::new(
        providers,
        config.orchestrator.clone(),
        Arc::clone(&breakers),
        health,
        cost,
        quality,
        shutdown_rx.clone(),
    ));

    let client = Arc::new(WorkspaceClient::new(&config.workspace, secrets)?);
    let caches = Arc::new(WorkspaceCaches::new(
        config.daemon.cache_dir(),
        Arc::clone(&client),
        config.workspace.clone(),
    ));
    let company_matcher = CompanyMatcher::new(Arc::clone(&caches), Arc::clone(&client));
    let person_matcher = PersonMatcher::new(Arc::clone(&caches));
    let dlq = DeadLetterQueue::new(config.daemon.dlq_dir());
    let writer = Writer::new(
        Arc::clone(&client),
        config.workspace.clone(),
        Arc::clone(&breakers),
        dlq.clone(),
    );

    Ok(Components {
        config,
        breakers,
        client,
        caches,
        orchestrator,
        company_matcher,
        person_matcher,
        dlq,
        writer,
        shutdown_tx,
        shutdown_rx,
    })
}

fn build_replayer(components: &Components) -> Arc<PipelineReplayer> {
    Arc::new(PipelineReplayer::new(
        Arc::clone(&components.orchestrator),
        Arc::clone(&components.caches),
        components.company_matcher.clone(),
        components.person_matcher.clone(),
        Arc::clone(&components.client),
        components.config.workspace.clone(),
        components.config.orchestrator.strategy,
    ))
}

/// Structured logging: JSON to stdout (env-filtered) plus one append-only
/// JSON-lines file per severity under `data/logs/{severity}/`.
fn init_logging(data_dir: &std::path::Path) -> anyhow::Result<()> {
    use tracing_subscriber::filter::filter_fn;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;
    use tracing_subscriber::{EnvFilter, Layer, Registry};

    let stdout_layer = tracing_subscriber::fmt::layer()
        .json()
        .with_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        );

    let mut file_layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    for (name, level) in [
        ("debug", tracing::Level::DEBUG),
        ("info", tracing::Level::INFO),
        ("warning", tracing::Level::WARN),
        ("error", tracing::Level::ERROR),
    ] {
        let dir = data_dir.join("logs").join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("creating log directory {}", dir.display()))?;
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("collabiq.jsonl"))
            .with_context(|| format!("opening log file under {}", dir.display()))?;
        let layer = tracing_subscriber::fmt::layer()
            .json()
            .with_ansi(false)
            .with_writer(Arc::new(file))
            .with_filter(filter_fn(move |meta| *meta.level() == level))
            .boxed();
        file_layers.push(layer);
    }

    tracing_subscriber::registry()
        .with(file_layers)
        .with(stdout_layer)
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let secrets = SecretStore::default();
    let mut config = AppConfig::from_env().context("configuration invalid")?;
    init_logging(&config.daemon.data_dir)?;

    match cli.command {
        Command::Run { daemon, interval } => {
            if let Some(seconds) = interval {
                config.daemon.cycle_interval_ms = seconds.saturating_mul(1000);
            }
            run_pipeline(config, &secrets, daemon).await
        }
        Command::Dlq { command } => run_dlq(config, &secrets, command).await,
        Command::Status => run_status(config).await,
    }
}

async fn run_pipeline(config: AppConfig, secrets: &SecretStore, daemon: bool) -> anyhow::Result<()> {
    let components = build_components(config, secrets).await?;
    let mail = Arc::new(JsonDropAdapter::new(
        components.config.daemon.data_dir.join("inbox"),
    ));

    let shutdown_tx = components.shutdown_tx.clone();
    let controller = DaemonController::new(
        components.config,
        mail,
        components.orchestrator,
        components.caches,
        components.company_matcher,
        components.person_matcher,
        components.writer,
        components.dlq,
        components.shutdown_tx,
        components.shutdown_rx,
    );

    if daemon {
        install_signal_handlers(shutdown_tx);
        controller.run_forever().await?;
    } else {
        let report = controller.run_once().await?;
        println!(
            "cycle complete: fetched={} written={} skipped={} parked={}",
            report.fetched, report.written, report.skipped, report.parked
        );
    }
    Ok(())
}

fn print_replay_summary(label: &str, summary: ReplaySummary) {
    println!(
        "{label}: completed={} updated={} failed={} skipped={} noop={}",
        summary.completed, summary.updated, summary.failed, summary.skipped, summary.noop
    );
}

async fn run_dlq(config: AppConfig, secrets: &SecretStore, command: DlqCommand) -> anyhow::Result<()> {
    let dlq = DeadLetterQueue::new(config.daemon.dlq_dir());
    match command {
        DlqCommand::List => {
            let entries = dlq.list().await?;
            if entries.is_empty() {
                println!("dead-letter queue is empty");
                return Ok(());
            }
            for entry in entries {
                println!(
                    "{}  {}  {:?}  {}  retries={}",
                    entry.dlq_id,
                    entry.operation_type.dir_name(),
                    entry.status,
                    entry.created_at.to_rfc3339(),
                    entry.error_details.retry_count,
                );
            }
        }
        DlqCommand::Show { id } => match dlq.get(&id).await? {
            Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
            None => {
                eprintln!("no DLQ entry with id {id}");
                std::process::exit(1);
            }
        },
        DlqCommand::Retry { all, id } => {
            let components = build_components(config, secrets).await?;
            let core = build_replayer(&components);
            let workspace_target = WorkspaceWriteReplayer::new(Arc::clone(&core));
            let llm_target = LlmExtractReplayer::new(core);

            if all {
                let writes = components
                    .dlq
                    .replay_all(&workspace_target, &components.breakers)
                    .await?;
                print_replay_summary("workspace_write", writes);
                let extracts = components
                    .dlq
                    .replay_all(&llm_target, &components.breakers)
                    .await?;
                print_replay_summary("llm_extract", extracts);
            } else if let Some(id) = id {
                let Some(entry) = components.dlq.get(&id).await? else {
                    eprintln!("no DLQ entry with id {id}");
                    std::process::exit(1);
                };
                let target: &dyn ReplayTarget = match entry.operation_type {
                    OperationType::WorkspaceWrite => &workspace_target,
                    OperationType::LlmExtract => &llm_target,
                    OperationType::MailFetch | OperationType::SecretFetch => {
                        eprintln!(
                            "{} entries are not replayed here; they re-enter on the daemon's next cycle",
                            entry.operation_type.dir_name()
                        );
                        std::process::exit(1);
                    }
                };
                let outcome = components
                    .dlq
                    .replay_entry(&entry, target, &components.breakers)
                    .await?;
                println!("replay outcome: {outcome:?}");
            } else {
                eprintln!("dlq retry requires --all or --id <id>");
                std::process::exit(2);
            }
        }
    }
    Ok(())
}

async fn run_status(config: AppConfig) -> anyhow::Result<()> {
    println!("daemon:");
    match DaemonState::peek(&config.daemon.state_path()).await {
        Some(state) => {
            println!("  status: {:?}", state.current_status);
            println!(
                "  cursor: {}",
                state.last_processed_message_id.as_deref().unwrap_or("-")
            );
            println!("  cycles: {}", state.cycles_completed);
            println!("  emails processed: {}", state.emails_processed);
            println!("  errors: {}", state.error_count);
        }
        None => println!("  status: never started"),
    }

    let (health, cost, quality) = load_trackers(&config).await;
    let health_map = health.all().await;
    let cost_map = cost.all().await;

    println!("providers:");
    for settings in &config.providers {
        let health = health_map.get(&settings.name).cloned().unwrap_or_default();
        let cost = cost_map.get(&settings.name).cloned().unwrap_or_default();
        let provider_quality = quality.get(&settings.name).await;
        let value = QualityTracker::value_score(&provider_quality, &cost, settings.free_tier);
        println!(
            "  {:<10} enabled={} success_rate={:.2} avg_latency={:.0}ms calls={} cost=${:.4} quality={:.2} value={:.1}",
            settings.name,
            settings.enabled,
            health.success_rate(),
            health.avg_latency_ms,
            cost.api_calls,
            cost.total_cost_usd,
            provider_quality.quality_score(),
            value,
        );
    }

    let dlq = DeadLetterQueue::new(config.daemon.dlq_dir());
    let entries = dlq.list().await?;
    let pending = entries
        .iter()
        .filter(|e| e.status != collabiq::DlqStatus::Completed)
        .count();
    println!("dlq: {} entries ({} open)", entries.len(), pending);
    Ok(())
}
