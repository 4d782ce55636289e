#![allow(missing_docs)]

//! Straylight CLI — start and monitor security assessment workflows.
//!
//! `run` drives one workflow end-to-end and prints its event stream as
//! JSON lines; `rules` and `catalog` print the effective configuration.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use straylight::bus::{BusItem, EventBus};
use straylight::catalog::ToolCatalog;
use straylight::config::OrchestratorConfig;
use straylight::engine::ExecutionEngine;
use straylight::phase::PhaseExecutor;
use straylight::planner::http::ReasoningServiceClient;
use straylight::planner::{PlannerClient, ReasoningApi};
use straylight::restraint::RestraintEvaluator;
use straylight::runner::docker::DockerRunner;
use straylight::runner::{ContainerRunner, RunnerHealth};
use straylight::store::EventStore;
use straylight::types::{Constraints, Credentials, EnvironmentTag, WorkflowRequest, WorkflowStatus};
use straylight::workflow::approval::ApprovalLedger;
use straylight::workflow::WorkflowController;

#[derive(Parser)]
#[command(name = "straylight", about = "AI-planned security assessment orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a workflow and stream its events until it finishes.
    Run {
        /// Target URL or hostname.
        #[arg(long)]
        target: String,
        /// What the assessment should accomplish, in plain language.
        #[arg(long)]
        intent: String,
        /// Target environment: development, staging, or production.
        #[arg(long)]
        environment: Option<EnvironmentTag>,
        /// Scope allow-list entries (repeatable).
        #[arg(long = "scope")]
        scope: Vec<String>,
        /// Tools to exclude (repeatable).
        #[arg(long = "exclude-tool")]
        exclude_tools: Vec<String>,
        /// Overall wall-clock budget in minutes.
        #[arg(long)]
        time_budget_mins: Option<u64>,
        /// Skip the durable event sink even if configured.
        #[arg(long)]
        no_persist: bool,
    },
    /// Print the effective restraint rule set.
    Rules,
    /// List the tool catalog.
    Catalog,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            target,
            intent,
            environment,
            scope,
            exclude_tools,
            time_budget_mins,
            no_persist,
        } => {
            let config = OrchestratorConfig::load()?;
            let _guard = straylight::logging::init_production(Path::new(&config.paths.logs_dir))?;
            let options = RunOptions {
                target,
                intent,
                environment,
                scope,
                exclude_tools,
                time_budget_mins,
                no_persist,
            };
            run_workflow(config, options).await
        }
        Command::Rules => {
            straylight::logging::init_cli();
            let config = OrchestratorConfig::load()?;
            print_rules(&config);
            Ok(())
        }
        Command::Catalog => {
            straylight::logging::init_cli();
            print_catalog();
            Ok(())
        }
    }
}

struct RunOptions {
    target: String,
    intent: String,
    environment: Option<EnvironmentTag>,
    scope: Vec<String>,
    exclude_tools: Vec<String>,
    time_budget_mins: Option<u64>,
    no_persist: bool,
}

async fn run_workflow(config: OrchestratorConfig, options: RunOptions) -> Result<()> {
    info!("straylight starting");

    // Shared infrastructure.
    let bus = Arc::new(EventBus::new());
    let catalog = Arc::new(ToolCatalog::builtin());
    let restraint = Arc::new(load_restraint(&config));

    let runner: Arc<dyn ContainerRunner> = Arc::new(
        DockerRunner::new(config.sandbox.registry_mirror.clone())
            .context("failed to connect to the container runtime")?,
    );
    match runner.health_check().await {
        RunnerHealth::Healthy { details } => info!(%details, "container runtime ready"),
        RunnerHealth::Unavailable { details } => {
            warn!(%details, "container runtime unreachable; tool runs will fail");
        }
    }

    let planner = Arc::new(build_planner(&config));
    let engine = ExecutionEngine::new(
        Arc::clone(&bus),
        Arc::clone(&catalog),
        Arc::clone(&restraint),
        runner,
        config.engine.clone(),
        config.sandbox.clone(),
    );
    let approvals = Arc::new(ApprovalLedger::new(Duration::from_secs(
        config.approval.timeout_seconds,
    )));
    let executor = Arc::new(PhaseExecutor::new(
        Arc::clone(&bus),
        engine.clone(),
        Arc::clone(&planner),
        Arc::clone(&catalog),
        Arc::clone(&approvals),
        config.phases.clone(),
    ));
    let controller = WorkflowController::new(
        Arc::clone(&bus),
        engine,
        planner,
        executor,
        approvals,
        Duration::from_secs(config.retention.workflow_hours.saturating_mul(3600)),
    );
    controller.spawn_retention_sweep(Duration::from_secs(3600));

    let store = if options.no_persist || config.paths.events_db.is_empty() {
        None
    } else {
        match EventStore::open(Path::new(&config.paths.events_db)).await {
            Ok(store) => Some(Arc::new(store)),
            Err(e) => {
                warn!(error = %e, "event sink unavailable; continuing in memory only");
                None
            }
        }
    };

    // Start the workflow.
    let request = WorkflowRequest {
        target: options.target,
        user_intent: options.intent,
        constraints: Some(Constraints {
            scope: options.scope,
            environment: options.environment,
            time_budget_ms: options.time_budget_mins.map(|mins| mins.saturating_mul(60_000)),
            exclude_tools: options.exclude_tools,
        }),
        credentials: credentials_from_env(),
    };
    let workflow_id = controller.start_workflow(request).await?;
    eprintln!("workflow {workflow_id}");

    if let Some(store) = &store {
        let subscription = controller.subscribe(workflow_id).await?;
        EventStore::spawn_persister(Arc::clone(store), workflow_id, subscription);
    }

    // Stream events to stdout; ctrl-c cancels the workflow.
    let mut subscription = controller.subscribe(workflow_id).await?;
    loop {
        tokio::select! {
            item = subscription.recv() => match item {
                Some(BusItem::Event(event)) => {
                    println!("{}", serde_json::to_string(&event)?);
                }
                Some(BusItem::Lagged(n)) => {
                    eprintln!("warning: output stream lagged, {n} events dropped");
                }
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("cancelling workflow {workflow_id}");
                let _ = controller.cancel(workflow_id).await;
            }
        }
    }

    // Final summary on stderr; exit code mirrors the terminal status.
    let view = controller.status(workflow_id).await?;
    if let Some(store) = &store {
        let snapshot = controller.snapshot(workflow_id).await?;
        if let Err(e) = store.upsert_workflow(&snapshot).await {
            warn!(error = %e, "failed to persist final workflow row");
        }
    }

    eprintln!(
        "workflow {} {}: {} findings across {} phases",
        view.id,
        view.status,
        view.findings.total,
        view.phases.len()
    );

    match view.status {
        WorkflowStatus::Completed => Ok(()),
        WorkflowStatus::Aborted => std::process::exit(130),
        _ => std::process::exit(1),
    }
}

fn load_restraint(config: &OrchestratorConfig) -> RestraintEvaluator {
    match &config.paths.rules_file {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(raw) => RestraintEvaluator::from_toml_or_defaults(&raw),
            Err(e) => {
                warn!(path, error = %e, "rules file unreadable, using defaults");
                RestraintEvaluator::default()
            }
        },
        None => RestraintEvaluator::default(),
    }
}

fn build_planner(config: &OrchestratorConfig) -> PlannerClient {
    match &config.planner.base_url {
        Some(base_url) => {
            info!(%base_url, "reasoning service configured");
            let api: Arc<dyn ReasoningApi> = Arc::new(ReasoningServiceClient::new(
                base_url,
                config.planner.api_key.clone(),
            ));
            PlannerClient::new(api, config.planner.clone())
        }
        None => {
            warn!("no reasoning service configured; fallback recommender only");
            PlannerClient::fallback_only(config.planner.clone())
        }
    }
}

/// Credentials for auth-required tools, read from the environment so
/// they never appear in shell history.
fn credentials_from_env() -> Option<Credentials> {
    let username = std::env::var("STRAYLIGHT_AUTH_USERNAME").ok();
    let password = std::env::var("STRAYLIGHT_AUTH_PASSWORD").ok();
    let token = std::env::var("STRAYLIGHT_AUTH_TOKEN").ok();
    if username.is_none() && password.is_none() && token.is_none() {
        return None;
    }
    Some(Credentials {
        username,
        password,
        token,
    })
}

fn print_rules(config: &OrchestratorConfig) {
    let evaluator = load_restraint(config);
    let snapshot = evaluator.snapshot();
    for rule in snapshot.rules() {
        println!(
            "{:<32} {:<18} {}",
            rule.config.id,
            format!("{:?}", rule.config.action).to_lowercase(),
            rule.config.reason
        );
    }
}

fn print_catalog() {
    let catalog = ToolCatalog::builtin();
    for name in catalog.names() {
        if let Some(spec) = catalog.get(&name) {
            let phases: Vec<&str> = spec.phases.iter().map(|p| p.as_str()).collect();
            println!(
                "{:<20} {:<44} [{}] {}",
                spec.name,
                spec.image,
                phases.join(","),
                spec.description
            );
        }
    }
}
