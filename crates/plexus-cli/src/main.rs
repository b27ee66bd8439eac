use clap::{Parser, Subcommand, ValueEnum};
use plexus_orchestrator::{
    LocalActionRegistry, MetricsSnapshot, OrchestrationResponse, Orchestrator,
    OrchestratorConfig, Plan, PlanningContext, RuleBasedStrategy, Task, VerificationLevel,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "plexus", about = "Plexus — task decomposition and orchestration engine")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "plexus.toml")]
    config: PathBuf,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Json)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Json,
    Pretty,
}

#[derive(Subcommand)]
enum Commands {
    /// Decompose a request and print the plan
    Plan {
        /// The request to decompose
        request: String,
    },
    /// Plan, execute with dry-run actions, and verify a request
    Run {
        /// The request to run
        request: String,
        /// Verification level (overrides config)
        #[arg(long)]
        level: Option<VerificationLevel>,
    },
    /// Print the effective configuration
    Config,
}

#[derive(Serialize)]
struct PlanView<'a> {
    plan_id: String,
    fingerprint: &'a str,
    cache_hit: bool,
    strategy: String,
    confidence: f64,
    reasoning: &'a [String],
    /// In topological order.
    tasks: Vec<&'a Task>,
}

#[derive(Serialize)]
struct RunView<'a> {
    response: &'a OrchestrationResponse,
    metrics: MetricsSnapshot,
}

fn plan_view<'a>(
    plan: &'a Plan,
    fingerprint: &'a str,
    cache_hit: bool,
) -> anyhow::Result<PlanView<'a>> {
    let tasks = plan
        .graph
        .topological_order()?
        .iter()
        .filter_map(|id| plan.graph.get(id.as_str()))
        .collect();
    Ok(PlanView {
        plan_id: plan.id.to_string(),
        fingerprint,
        cache_hit,
        strategy: plan.strategy_used.to_string(),
        confidence: plan.confidence,
        reasoning: &plan.reasoning_trace,
        tasks,
    })
}

async fn load_config(path: &Path) -> anyhow::Result<OrchestratorConfig> {
    OrchestratorConfig::load(path)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to load config file '{}': {}", path.display(), e))
}

/// Orchestrator wired with a registry that echoes every action the rule
/// vocabulary can produce.
async fn dry_run_orchestrator(config: OrchestratorConfig) -> anyhow::Result<Orchestrator> {
    let rules = RuleBasedStrategy::new();
    let registry = LocalActionRegistry::dry_run(rules.known_actions());
    info!(actions = registry.action_count(), "Dry-run registry ready");
    let orchestrator = Orchestrator::builder(config)
        .registry(Arc::new(registry))
        .rules(rules)
        .build()
        .await?;
    Ok(orchestrator)
}

fn init_tracing(format: LogFormat) {
    let builder = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.pretty().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let config = load_config(&cli.config).await?;

    match cli.command {
        Commands::Plan { request } => {
            let orchestrator = dry_run_orchestrator(config).await?;
            let planned = orchestrator
                .planner()
                .plan(&request, &PlanningContext::default())
                .await?;
            let view = plan_view(&planned.plan, planned.fingerprint.as_str(), planned.cache_hit)?;
            println!("{}", serde_json::to_string_pretty(&view)?);
            orchestrator.shutdown().await;
        }
        Commands::Run { request, level } => {
            let level = level.unwrap_or(config.verifier.level);
            let orchestrator = dry_run_orchestrator(config).await?;
            let maintenance = orchestrator.spawn_maintenance();

            // Ctrl-C cancels the run; in-flight tasks get the grace period.
            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("Interrupted, cancelling run");
                    on_signal.cancel();
                }
            });

            let response = orchestrator
                .run_with(&request, &PlanningContext::default(), level, cancel)
                .await?;
            let view = RunView {
                response: &response,
                metrics: orchestrator.metrics(),
            };
            println!("{}", serde_json::to_string_pretty(&view)?);

            if let Some(handle) = maintenance {
                handle.abort();
            }
            let succeeded = response.outcome.is_success();
            orchestrator.shutdown().await;
            if !succeeded {
                std::process::exit(1);
            }
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
