mod bootstrap;

use clap::{Parser, Subcommand};
use paperflow_core::{telemetry, PaperflowConfig};
use paperflow_orchestrator::{ExecutionOptions, TaskGraph, WorkflowCatalog, WorkflowResult};
use paperflow_usage::{RunningTotal, UsageFilter};
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "paperflow", about = "Paperflow — AI agent orchestration for research papers")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "paperflow.toml")]
    config: PathBuf,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Load and validate the config file
    Validate,
    /// Print the task graph a workflow would run
    Plan {
        /// Workflow name
        workflow: String,
        /// Workflow parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,
    },
    /// Execute a workflow
    Run {
        /// Workflow name
        workflow: String,
        /// Workflow parameters as JSON
        #[arg(long, default_value = "{}")]
        params: String,
        /// User the run belongs to (needed for chat)
        #[arg(long)]
        user: Option<String>,
        /// Overall deadline (overrides config)
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
}

#[derive(Serialize)]
struct RunReport<'a> {
    result: &'a WorkflowResult,
    usage_by_provider: BTreeMap<String, RunningTotal>,
}

fn parse_params(raw: &str) -> anyhow::Result<Value> {
    serde_json::from_str(raw).map_err(|e| anyhow::anyhow!("--params is not valid JSON: {e}"))
}

fn print_plan(workflow: &str, graph: &TaskGraph) {
    println!("Workflow '{workflow}' ({} task(s)):", graph.len());
    for task in graph.tasks() {
        let marker = if task.required { " [required]" } else { "" };
        println!(
            "  {} — {}{marker}, retries: {}",
            task.id,
            task.capability,
            graph.retry_budget(task)
        );
        if !task.depends_on.is_empty() {
            println!("    after: {}", task.depends_on.join(", "));
        }
        if !task.optional_depends_on.is_empty() {
            println!("    optionally after: {}", task.optional_depends_on.join(", "));
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(cli.json_logs)?;

    let config = PaperflowConfig::load(&cli.config)?;

    match cli.command {
        Commands::Validate => {
            println!(
                "Configuration OK: {} provider(s), {} agent(s), {} metadata source(s)",
                config.providers.len(),
                config.agents.len(),
                config.metadata_sources.len()
            );
        }
        Commands::Plan { workflow, params } => {
            let params = parse_params(&params)?;
            let mut graph = WorkflowCatalog::with_builtins().build(&workflow, &params)?;
            graph.set_default_max_retries(config.orchestrator.max_retries);
            print_plan(&workflow, &graph);
        }
        Commands::Run {
            workflow,
            params,
            user,
            timeout_secs,
        } => {
            let params = parse_params(&params)?;
            let runtime = bootstrap::build_runtime(&config)?;
            let orchestrator = &runtime.orchestrator;

            let mut options = ExecutionOptions::new();
            if let Some(user) = &user {
                options = options.for_user(user.clone());
            }
            if let Some(secs) = timeout_secs {
                options = options.with_timeout(Duration::from_secs(secs));
            }

            info!(workflow = %workflow, "Running workflow");
            let result = orchestrator.execute(&workflow, &params, options).await;

            if let Some(user) = &user {
                let ended = orchestrator.registry().end_session(user).await;
                info!(user = %user, agents = ended, "Session ended");
            }

            let result = result?;
            let usage_by_provider = orchestrator
                .accountant()
                .by_provider(&UsageFilter::all().correlation(result.correlation_id));
            let report = RunReport {
                result: &result,
                usage_by_provider,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);

            let cache = runtime.cache.stats();
            info!(
                status = %result.status,
                cost_usd = result.usage.cost_usd(),
                cache_hits = cache.hits,
                cache_misses = cache.misses,
                "Workflow finished"
            );
        }
    }

    Ok(())
}
