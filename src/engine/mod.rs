//! Execution engine: a bounded worker pool that drives each planned
//! invocation through restraint, substitution, container execution, and
//! finding extraction.
//!
//! Scheduling is strictly concurrent up to the configured width. When
//! multiple requests wait for a worker, higher-priority requests are
//! dispatched first, FIFO within a priority. There is no preemption.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::sync::{oneshot, Mutex, Notify, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventKind};
use crate::catalog::{ToolCatalog, ToolSpec};
use crate::config::{EngineConfig, SandboxConfig};
use crate::restraint::{apply_overrides, ApprovalCache, DraftContext, RestraintEvaluator};
use crate::runner::{
    ContainerRunner, NetworkPosture, ResourceLimits, RunRequest, RunStatus, RunnerError,
};
use crate::subst::{substitute_params, ResultsMap, StoredResult};
use crate::types::{
    Credentials, Disposition, EnvironmentTag, Invocation, InvocationOutcome, ParamMap, PhaseName,
    Recommendation, SafetyCheck,
};

/// Number of priority lanes (critical, high, medium, low).
const PRIORITY_LANES: usize = 4;

/// One invocation request submitted by the phase executor.
pub struct ExecutionRequest {
    pub workflow_id: Uuid,
    pub phase: PhaseName,
    pub environment: Option<EnvironmentTag>,
    /// The workflow's top-level target, used when the recommendation
    /// carries no `target` parameter.
    pub workflow_target: String,
    pub recommendation: Recommendation,
    /// Remaining phase/workflow budget; the per-run deadline is the
    /// minimum of this and the tool's default timeout.
    pub remaining_budget: Duration,
    /// Findings accumulated so far (restraint predicates may key on it).
    pub prior_findings: u64,
    pub credentials: Option<Credentials>,
    /// Workflow-scoped cancellation.
    pub cancel: CancellationToken,
    /// The workflow's approval cache.
    pub approval_cache: Arc<StdMutex<ApprovalCache>>,
}

struct Job {
    request: ExecutionRequest,
    tx: oneshot::Sender<Invocation>,
}

struct Queues {
    lanes: [VecDeque<Job>; PRIORITY_LANES],
}

impl Queues {
    fn new() -> Self {
        Self {
            lanes: [
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
                VecDeque::new(),
            ],
        }
    }

    fn push(&mut self, job: Job) {
        let lane = job.request.recommendation.priority.lane();
        self.lanes[lane.min(PRIORITY_LANES.saturating_sub(1))].push_back(job);
    }

    fn pop_highest(&mut self) -> Option<Job> {
        self.lanes.iter_mut().find_map(VecDeque::pop_front)
    }
}

/// Per-workflow results map for parameter substitution.
///
/// Writes happen on invocation completion; reads at substitution time.
#[derive(Default)]
pub struct ResultsStore {
    inner: Mutex<HashMap<Uuid, ResultsMap>>,
}

impl ResultsStore {
    /// Snapshot a workflow's results map.
    pub async fn snapshot(&self, workflow_id: Uuid) -> ResultsMap {
        let inner = self.inner.lock().await;
        inner.get(&workflow_id).cloned().unwrap_or_default()
    }

    /// Store the last result of a tool in a workflow.
    pub async fn record(&self, workflow_id: Uuid, tool: &str, result: StoredResult) {
        let mut inner = self.inner.lock().await;
        inner
            .entry(workflow_id)
            .or_default()
            .insert(tool.to_owned(), result);
    }

    /// Drop a workflow's results (retention sweep).
    pub async fn forget(&self, workflow_id: Uuid) {
        let mut inner = self.inner.lock().await;
        inner.remove(&workflow_id);
    }
}

struct EngineInner {
    bus: Arc<EventBus>,
    catalog: Arc<ToolCatalog>,
    restraint: Arc<RestraintEvaluator>,
    runner: Arc<dyn ContainerRunner>,
    engine_config: EngineConfig,
    sandbox: SandboxConfig,
    queues: StdMutex<Queues>,
    notify: Notify,
    permits: Arc<Semaphore>,
    results: ResultsStore,
}

/// Handle to the execution engine. Cheap to clone.
#[derive(Clone)]
pub struct ExecutionEngine {
    inner: Arc<EngineInner>,
}

impl ExecutionEngine {
    /// Build the engine and start its dispatcher.
    pub fn new(
        bus: Arc<EventBus>,
        catalog: Arc<ToolCatalog>,
        restraint: Arc<RestraintEvaluator>,
        runner: Arc<dyn ContainerRunner>,
        engine_config: EngineConfig,
        sandbox: SandboxConfig,
    ) -> Self {
        let width = engine_config.max_concurrent.max(1);
        let inner = Arc::new(EngineInner {
            bus,
            catalog,
            restraint,
            runner,
            engine_config,
            sandbox,
            queues: StdMutex::new(Queues::new()),
            notify: Notify::new(),
            permits: Arc::new(Semaphore::new(width)),
            results: ResultsStore::default(),
        });

        let dispatcher = Arc::clone(&inner);
        tokio::spawn(async move {
            dispatch_loop(dispatcher).await;
        });

        Self { inner }
    }

    /// Enqueue an invocation request.
    ///
    /// The returned receiver yields the settled [`Invocation`] exactly
    /// once, after `invocation:complete` is published.
    pub fn submit(&self, request: ExecutionRequest) -> oneshot::Receiver<Invocation> {
        let (tx, rx) = oneshot::channel();
        {
            let mut queues = lock_queues(&self.inner.queues);
            queues.push(Job { request, tx });
        }
        self.inner.notify.notify_one();
        rx
    }

    /// Access the substitution results store.
    pub fn results(&self) -> &ResultsStore {
        &self.inner.results
    }

    /// Worker pool width.
    pub fn width(&self) -> usize {
        self.inner.engine_config.max_concurrent.max(1)
    }

    /// Drop per-workflow engine state (retention sweep).
    pub async fn forget(&self, workflow_id: Uuid) {
        self.inner.results.forget(workflow_id).await;
    }
}

fn lock_queues(queues: &StdMutex<Queues>) -> std::sync::MutexGuard<'_, Queues> {
    queues
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

async fn dispatch_loop(inner: Arc<EngineInner>) {
    loop {
        // Take a worker permit first, then the best waiting job, so a
        // high-priority arrival can still win the next free worker.
        let Ok(permit) = Arc::clone(&inner.permits).acquire_owned().await else {
            return;
        };

        let job = loop {
            let popped = lock_queues(&inner.queues).pop_highest();
            match popped {
                Some(job) => break job,
                None => inner.notify.notified().await,
            }
        };

        let worker = Arc::clone(&inner);
        tokio::spawn(async move {
            run_job(worker, job).await;
            drop(permit);
        });
    }
}

async fn run_job(inner: Arc<EngineInner>, job: Job) {
    let Job { request, tx } = job;
    let workflow_id = request.workflow_id;
    let rec = request.recommendation.clone();

    let mut invocation = Invocation::draft(&rec.tool, rec.params.clone(), rec.priority);
    invocation.started_at = Some(Utc::now());

    publish(
        &inner.bus,
        workflow_id,
        EventKind::InvocationStart,
        json!({
            "invocationId": invocation.id,
            "tool": invocation.tool,
            "phase": request.phase,
            "priority": rec.priority,
        }),
    )
    .await;

    if request.cancel.is_cancelled() {
        finalize(
            &inner.bus,
            workflow_id,
            invocation,
            InvocationOutcome::Skipped,
            Some("cancelled".to_owned()),
            tx,
        )
        .await;
        return;
    }

    let Some(spec) = inner.catalog.get(&rec.tool).cloned() else {
        finalize(
            &inner.bus,
            workflow_id,
            invocation,
            InvocationOutcome::Skipped,
            Some(format!("tool not in catalog: {}", rec.tool)),
            tx,
        )
        .await;
        return;
    };

    // Declared safety checks tighten parameters before restraint runs.
    apply_safety_checks(&mut invocation.params, &rec.safety_checks);

    let rendered_target = invocation
        .params
        .get("target")
        .map(crate::types::render_param_value)
        .unwrap_or_else(|| request.workflow_target.clone());

    let decision = {
        let cache = request
            .approval_cache
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        inner.restraint.evaluate(
            &DraftContext {
                workflow_id,
                tool: &rec.tool,
                safety_class: spec.safety_class,
                phase: request.phase,
                environment: request.environment,
                target: &rendered_target,
                prior_findings: request.prior_findings,
            },
            &cache,
        )
    };

    publish(
        &inner.bus,
        workflow_id,
        EventKind::RestraintDecision,
        json!({
            "invocationId": invocation.id,
            "tool": invocation.tool,
            "disposition": decision.disposition,
            "reasons": decision.reasons,
            "matchedRules": decision.matched_rules,
            "monitorTags": decision.monitor_tags,
            "overrides": decision.overrides,
        }),
    )
    .await;

    invocation.disposition = decision.disposition;
    match decision.disposition {
        Disposition::Denied => {
            finalize(
                &inner.bus,
                workflow_id,
                invocation,
                InvocationOutcome::Skipped,
                Some(decision.reasons.join("; ")),
                tx,
            )
            .await;
            return;
        }
        Disposition::AwaitingApproval => {
            // The phase executor owns the approval protocol; this draft
            // settles as skipped and may be resubmitted once resolved.
            finalize(
                &inner.bus,
                workflow_id,
                invocation,
                InvocationOutcome::Skipped,
                Some("awaiting approval".to_owned()),
                tx,
            )
            .await;
            return;
        }
        Disposition::Allowed | Disposition::AllowedWithMitigations => {}
    }

    apply_overrides(&mut invocation.params, &decision.overrides);

    // Resolve {{tool.property}} references against prior results.
    let results_snapshot = inner.results.snapshot(workflow_id).await;
    let (resolved, unresolved) = substitute_params(&invocation.params, &results_snapshot);
    invocation.params = resolved;
    for placeholder in &unresolved {
        warn!(
            workflow_id = %workflow_id,
            tool = %invocation.tool,
            placeholder = %placeholder,
            "substitution reference unresolved, keeping placeholder"
        );
    }

    let deadline = spec.default_timeout.min(request.remaining_budget);
    let outcome = execute_resolved(&inner, &request, &spec, &mut invocation, deadline).await;

    // Attach the catalog / planner OWASP hint to findings without one.
    let hint = rec.owasp_hint.clone().or_else(|| spec.owasp.clone());
    if let Some(hint) = hint {
        for finding in &mut invocation.findings {
            if finding.owasp.is_none() {
                finding.owasp = Some(hint.clone());
            }
        }
    }

    // Store the parsed result for future substitutions.
    let targets: Vec<String> = {
        let mut seen = std::collections::HashSet::new();
        invocation
            .findings
            .iter()
            .filter_map(|f| f.target_value.clone())
            .filter(|t| seen.insert(t.clone()))
            .collect()
    };
    inner
        .results
        .record(
            workflow_id,
            &invocation.tool,
            StoredResult {
                targets,
                output: invocation.output.clone(),
            },
        )
        .await;

    let (final_outcome, error) = outcome;
    finalize(&inner.bus, workflow_id, invocation, final_outcome, error, tx).await;
}

/// Execute the resolved invocation, fanning out per element when the
/// `target` parameter is a list and the tool is not batch-capable.
async fn execute_resolved(
    inner: &Arc<EngineInner>,
    request: &ExecutionRequest,
    spec: &ToolSpec,
    invocation: &mut Invocation,
    deadline: Duration,
) -> (InvocationOutcome, Option<String>) {
    let elements: Option<Vec<String>> = match invocation.params.get("target") {
        Some(serde_json::Value::Array(items)) if !spec.batch_capable => Some(
            items
                .iter()
                .map(crate::types::render_param_value)
                .filter(|t| !t.is_empty())
                .collect(),
        ),
        _ => None,
    };

    let runs: Vec<ParamMap> = match elements {
        Some(targets) if targets.is_empty() => {
            return (
                InvocationOutcome::Failed,
                Some("target list resolved to no elements".to_owned()),
            );
        }
        Some(targets) => targets
            .into_iter()
            .map(|target| {
                let mut params = invocation.params.clone();
                params.insert("target".to_owned(), serde_json::Value::String(target));
                params
            })
            .collect(),
        None => vec![invocation.params.clone()],
    };

    let fanout = runs.len() > 1;
    let sub_limit = inner.engine_config.fanout_concurrent.max(1);
    let sub_permits = Arc::new(Semaphore::new(sub_limit));
    let mut join_set = tokio::task::JoinSet::new();

    for (index, params) in runs.into_iter().enumerate() {
        let run_request = RunRequest {
            image: spec.image.clone(),
            argv: (spec.argv)(&params),
            env: credential_env(request.credentials.as_ref(), spec.auth_required),
            limits: ResourceLimits {
                memory_mb: inner.sandbox.memory_mb,
                cpu_percent: inner.sandbox.cpu_percent,
            },
            deadline,
            network: if request.phase == PhaseName::Exploit {
                NetworkPosture::Isolated
            } else {
                NetworkPosture::Bridge
            },
            invocation_id: if fanout {
                // Distinct container names per element.
                Uuid::new_v4()
            } else {
                invocation.id
            },
        };

        let runner = Arc::clone(&inner.runner);
        let cancel = request.cancel.clone();
        let permits = Arc::clone(&sub_permits);
        join_set.spawn(async move {
            let _permit = permits.acquire_owned().await;
            (index, runner.run(run_request, &cancel).await)
        });
    }

    let mut outputs: Vec<(usize, String)> = Vec::new();
    let mut timed_out = false;
    let mut failed = false;
    let mut cancelled = false;
    let mut errors: Vec<String> = Vec::new();

    while let Some(joined) = join_set.join_next().await {
        let Ok((index, result)) = joined else {
            failed = true;
            errors.push("worker task panicked".to_owned());
            continue;
        };
        match result {
            Ok(output) => {
                match output.status {
                    RunStatus::Completed { exit_code: 0 } => {}
                    RunStatus::Completed { exit_code } => {
                        failed = true;
                        errors.push(format!("exit code {exit_code}"));
                    }
                    RunStatus::TimedOut => timed_out = true,
                }
                if fanout {
                    publish(
                        &inner.bus,
                        request.workflow_id,
                        EventKind::InvocationProgress,
                        json!({
                            "invocationId": invocation.id,
                            "element": index,
                            "status": match output.status {
                                RunStatus::Completed { exit_code } => format!("exit {exit_code}"),
                                RunStatus::TimedOut => "timeout".to_owned(),
                            },
                        }),
                    )
                    .await;
                }
                outputs.push((index, output.output));
            }
            Err(RunnerError::Cancelled) => cancelled = true,
            Err(e) => {
                if matches!(e, RunnerError::Host(_)) {
                    publish(
                        &inner.bus,
                        request.workflow_id,
                        EventKind::Error,
                        json!({
                            "severity": "warning",
                            "invocationId": invocation.id,
                            "error": e.to_string(),
                        }),
                    )
                    .await;
                }
                failed = true;
                errors.push(e.to_string());
            }
        }
    }

    // Concatenate element outputs in submission order.
    outputs.sort_by_key(|(index, _)| *index);
    invocation.output = outputs
        .into_iter()
        .map(|(_, output)| output)
        .collect::<Vec<_>>()
        .join("\n");

    invocation.findings = (spec.parser)(&invocation.output);

    if cancelled {
        (InvocationOutcome::Skipped, Some("cancelled".to_owned()))
    } else if timed_out {
        (InvocationOutcome::Timeout, Some("deadline expired".to_owned()))
    } else if failed {
        (InvocationOutcome::Failed, Some(errors.join("; ")))
    } else {
        (InvocationOutcome::Success, None)
    }
}

/// Translate declared safety checks into parameter overrides.
///
/// Runs before restraint evaluation; overrides only ever tighten.
fn apply_safety_checks(params: &mut ParamMap, checks: &[SafetyCheck]) {
    for check in checks {
        match check {
            SafetyCheck::RateLimiting => {
                let mut cap = ParamMap::new();
                cap.insert("rate_limit".to_owned(), json!(60));
                apply_overrides(params, &cap);
            }
            SafetyCheck::NonIntrusive => {
                let mut cap = ParamMap::new();
                cap.insert("intrusive_level".to_owned(), json!(1));
                apply_overrides(params, &cap);
            }
            SafetyCheck::ReadOnly => {
                params.retain(|key, _| !is_write_param(key));
            }
            SafetyCheck::TestAccount => {
                if let Some(serde_json::Value::String(username)) = params.get_mut("username") {
                    if !username.starts_with("test_") {
                        *username = format!("test_{username}");
                    }
                }
            }
            SafetyCheck::PayloadLimit => {
                let mut cap = ParamMap::new();
                cap.insert("payload_limit".to_owned(), json!(1024));
                apply_overrides(params, &cap);
            }
        }
    }
}

const WRITE_VERBS: &[&str] = &["write", "update", "delete", "insert", "modify", "put", "post"];

fn is_write_param(key: &str) -> bool {
    let lowered = key.to_lowercase();
    WRITE_VERBS.iter().any(|verb| lowered.contains(verb))
}

fn credential_env(credentials: Option<&Credentials>, auth_required: bool) -> Vec<(String, String)> {
    let Some(credentials) = credentials else {
        return Vec::new();
    };
    if !auth_required {
        return Vec::new();
    }
    let mut env = Vec::new();
    if let Some(username) = &credentials.username {
        env.push(("AUTH_USERNAME".to_owned(), username.clone()));
    }
    if let Some(password) = &credentials.password {
        env.push(("AUTH_PASSWORD".to_owned(), password.clone()));
    }
    if let Some(token) = &credentials.token {
        env.push(("AUTH_TOKEN".to_owned(), token.clone()));
    }
    env
}

async fn publish(bus: &EventBus, workflow_id: Uuid, kind: EventKind, data: serde_json::Value) {
    if let Err(e) = bus.publish(workflow_id, kind, data).await {
        debug!(workflow_id = %workflow_id, error = %e, "event dropped (channel closed)");
    }
}

async fn finalize(
    bus: &EventBus,
    workflow_id: Uuid,
    mut invocation: Invocation,
    outcome: InvocationOutcome,
    error: Option<String>,
    tx: oneshot::Sender<Invocation>,
) {
    invocation.outcome = Some(outcome);
    invocation.error = error;
    invocation.ended_at = Some(Utc::now());

    info!(
        workflow_id = %workflow_id,
        invocation_id = %invocation.id,
        tool = %invocation.tool,
        outcome = ?outcome,
        findings = invocation.findings.len(),
        "invocation settled"
    );

    publish(
        bus,
        workflow_id,
        EventKind::InvocationComplete,
        serde_json::to_value(&invocation).unwrap_or_else(|_| json!({"invocationId": invocation.id})),
    )
    .await;

    // The phase executor may have given up on this invocation (workflow
    // aborted); a dropped receiver is fine.
    let _ = tx.send(invocation);
}
