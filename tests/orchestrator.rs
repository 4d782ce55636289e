//! End-to-end orchestrator scenarios driven through the public
//! controller surface, with a scripted container runner and a scripted
//! reasoning service standing in for the outside world.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use straylight::bus::{BusItem, Event, EventBus, EventKind};
use straylight::catalog::ToolCatalog;
use straylight::config::{EngineConfig, PhaseBudgetConfig, PlannerConfig, SandboxConfig};
use straylight::engine::ExecutionEngine;
use straylight::phase::PhaseExecutor;
use straylight::planner::{PlanContext, PlannerClient, PlannerError, ReasoningApi, Strategy};
use straylight::restraint::{RestraintEvaluator, RuleSet};
use straylight::runner::{
    ContainerRunner, RunOutput, RunRequest, RunStatus, RunnerError, RunnerHealth,
};
use straylight::types::{
    Constraints, EnvironmentTag, InvocationOutcome, ParamMap, PhaseName, Priority, Recommendation,
    WorkflowRequest, WorkflowStatus,
};
use straylight::workflow::approval::ApprovalLedger;
use straylight::workflow::{WorkflowController, WorkflowError};

// ── Scripted container runner ──

struct ScriptedRunner {
    outputs: HashMap<String, String>,
    delay: Duration,
    calls: StdMutex<Vec<String>>,
}

impl ScriptedRunner {
    fn new(delay: Duration, entries: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            outputs: entries
                .iter()
                .map(|(image, stdout)| ((*image).to_owned(), (*stdout).to_owned()))
                .collect(),
            delay,
            calls: StdMutex::new(Vec::new()),
        })
    }

    fn calls_for(&self, image: &str) -> usize {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .filter(|called| called.as_str() == image)
            .count()
    }
}

#[async_trait]
impl ContainerRunner for ScriptedRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        if cancel.is_cancelled() {
            return Err(RunnerError::Cancelled);
        }
        self.calls.lock().expect("lock").push(request.image.clone());

        tokio::select! {
            () = tokio::time::sleep(self.delay) => {}
            () = cancel.cancelled() => return Err(RunnerError::Cancelled),
        }

        Ok(RunOutput {
            status: RunStatus::Completed { exit_code: 0 },
            output: self.outputs.get(&request.image).cloned().unwrap_or_default(),
            truncated: false,
            duration: self.delay,
            metrics: None,
        })
    }

    async fn health_check(&self) -> RunnerHealth {
        RunnerHealth::Healthy {
            details: "scripted".to_owned(),
        }
    }
}

// ── Scripted reasoning service ──

// Serves each phase's plan once (and again on a critique retry).
// The first adaptation call per phase serves the `adapting` script,
// subsequent ones an empty strategy.
struct ScriptedPlanner {
    by_phase: HashMap<PhaseName, Vec<Recommendation>>,
    adapt_by_phase: StdMutex<HashMap<PhaseName, Vec<Recommendation>>>,
    served: StdMutex<std::collections::HashSet<PhaseName>>,
    fail: bool,
}

impl ScriptedPlanner {
    fn new() -> Self {
        Self {
            by_phase: HashMap::new(),
            adapt_by_phase: StdMutex::new(HashMap::new()),
            served: StdMutex::new(std::collections::HashSet::new()),
            fail: false,
        }
    }

    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::new()
        }
    }

    fn with(mut self, phase: PhaseName, recs: Vec<Recommendation>) -> Self {
        self.by_phase.insert(phase, recs);
        self
    }

    fn adapting(self, phase: PhaseName, recs: Vec<Recommendation>) -> Self {
        self.adapt_by_phase
            .lock()
            .expect("lock")
            .insert(phase, recs);
        self
    }
}

#[async_trait]
impl ReasoningApi for ScriptedPlanner {
    async fn plan(&self, ctx: &PlanContext) -> Result<Strategy, PlannerError> {
        if self.fail {
            return Err(PlannerError::Unavailable("HTTP 500".to_owned()));
        }
        let fresh = self.served.lock().expect("lock").insert(ctx.phase);
        let recommendations = if fresh || ctx.critique.is_some() {
            self.by_phase.get(&ctx.phase).cloned().unwrap_or_default()
        } else {
            // Adaptation call.
            self.adapt_by_phase
                .lock()
                .expect("lock")
                .remove(&ctx.phase)
                .unwrap_or_default()
        };
        Ok(Strategy {
            reasoning: "scripted strategy".to_owned(),
            recommendations,
            confidence: 0.9,
            expected_duration_ms: 1_000,
            safety_considerations: Vec::new(),
        })
    }
}

fn rec(tool: &str, target: &str) -> Recommendation {
    let mut params = ParamMap::new();
    params.insert("target".to_owned(), json!(target));
    Recommendation {
        tool: tool.to_owned(),
        purpose: "scripted".to_owned(),
        expected_outcome: String::new(),
        params,
        safety_checks: Vec::new(),
        priority: Priority::Medium,
        owasp_hint: None,
    }
}

fn recon_baseline(target: &str) -> Vec<Recommendation> {
    vec![
        rec("subdomain-scanner", target),
        rec("port-scanner", target),
        rec("directory-scanner", target),
        rec("tech-fingerprint", target),
    ]
}

// ── Stack assembly ──

struct Stack {
    controller: Arc<WorkflowController>,
    runner: Arc<ScriptedRunner>,
    approvals: Arc<ApprovalLedger>,
}

fn stack(planner: ScriptedPlanner, runner: Arc<ScriptedRunner>, rules: RuleSet) -> Stack {
    stack_full(
        planner,
        runner,
        rules,
        Duration::from_secs(30),
        PlannerConfig::default(),
    )
}

fn stack_full(
    planner: ScriptedPlanner,
    runner: Arc<ScriptedRunner>,
    rules: RuleSet,
    approval_ttl: Duration,
    planner_config: PlannerConfig,
) -> Stack {
    let bus = Arc::new(EventBus::new());
    let catalog = Arc::new(ToolCatalog::builtin());
    let restraint = Arc::new(RestraintEvaluator::new(rules));
    let engine = ExecutionEngine::new(
        Arc::clone(&bus),
        Arc::clone(&catalog),
        restraint,
        Arc::clone(&runner) as Arc<dyn ContainerRunner>,
        EngineConfig::default(),
        SandboxConfig::default(),
    );
    let planner_client = Arc::new(PlannerClient::new(
        Arc::new(planner) as Arc<dyn ReasoningApi>,
        planner_config,
    ));
    let approvals = Arc::new(ApprovalLedger::new(approval_ttl));
    let executor = Arc::new(PhaseExecutor::new(
        Arc::clone(&bus),
        engine.clone(),
        Arc::clone(&planner_client),
        Arc::clone(&catalog),
        Arc::clone(&approvals),
        PhaseBudgetConfig::default(),
    ));
    let controller = WorkflowController::new(
        bus,
        engine,
        planner_client,
        executor,
        Arc::clone(&approvals),
        Duration::from_secs(24 * 3600),
    );
    Stack {
        controller,
        runner,
        approvals,
    }
}

fn empty_rules() -> RuleSet {
    RuleSet::compile(vec![]).expect("empty rule set")
}

fn request(target: &str, intent: &str) -> WorkflowRequest {
    WorkflowRequest {
        target: target.to_owned(),
        user_intent: intent.to_owned(),
        constraints: None,
        credentials: None,
    }
}

/// Drain the event stream to end-of-stream (terminal event closes it).
async fn collect_events(stack: &Stack, workflow_id: Uuid) -> Vec<Event> {
    let mut subscription = stack
        .controller
        .subscribe(workflow_id)
        .await
        .expect("subscribe");
    let mut events = Vec::new();
    loop {
        match tokio::time::timeout(Duration::from_secs(10), subscription.recv()).await {
            Ok(Some(BusItem::Event(event))) => events.push(event),
            Ok(Some(BusItem::Lagged(_))) => {}
            Ok(None) => break,
            Err(_) => panic!("event stream did not terminate"),
        }
    }
    events
}

fn count(events: &[Event], kind: EventKind) -> usize {
    events.iter().filter(|e| e.kind == kind).count()
}

// ── Scenario 1: recon-only, no findings ──

#[tokio::test]
async fn scenario_recon_only_no_findings() {
    let runner = ScriptedRunner::new(Duration::from_millis(1), &[]);
    let planner =
        ScriptedPlanner::new().with(PhaseName::Recon, recon_baseline("example.invalid"));
    let stack = stack(planner, runner, empty_rules());

    let workflow_id = stack
        .controller
        .start_workflow(request("example.invalid", "scan"))
        .await
        .expect("start");
    let events = collect_events(&stack, workflow_id).await;

    // Sequence numbers are 1..N with no gaps.
    let seqs: Vec<u64> = events.iter().map(|e| e.seq).collect();
    let expected: Vec<u64> = (1..=u64::try_from(seqs.len()).expect("len")).collect();
    assert_eq!(seqs, expected);

    // Exactly one recon phase, four invocations, then completion.
    assert_eq!(count(&events, EventKind::PhaseStart), 1);
    assert_eq!(count(&events, EventKind::InvocationStart), 4);
    assert_eq!(count(&events, EventKind::InvocationComplete), 4);
    assert_eq!(count(&events, EventKind::PhaseComplete), 1);

    // The terminal status event is last.
    let last = events.last().expect("events");
    assert_eq!(last.kind, EventKind::WorkflowStatus);
    assert_eq!(last.data["status"], "completed");

    let view = stack.controller.status(workflow_id).await.expect("status");
    assert_eq!(view.status, WorkflowStatus::Completed);
    assert_eq!(view.phases.len(), 1);
    assert_eq!(view.phases[0].name, PhaseName::Recon);
    assert_eq!(view.findings.total, 0);
}

// ── Scenario 2: substitution chains recon results into fan-out ──

#[tokio::test]
async fn scenario_substitution_fans_out_discovered_subdomains() {
    let runner = ScriptedRunner::new(
        Duration::from_millis(1),
        &[
            (
                "projectdiscovery/subfinder:latest",
                "a.example.com\nb.example.com\n",
            ),
            (
                "projectdiscovery/httpx:latest",
                "https://a.example.com [200] [nginx]",
            ),
        ],
    );
    // The planner's follow-up recommendation references the scanner's
    // results; it arrives through the adaptation loop once findings
    // exist, so the reference always resolves.
    let mut urgent = rec("tech-fingerprint", "{{subdomain-scanner.results}}");
    urgent.priority = Priority::High;
    let planner = ScriptedPlanner::new()
        .with(PhaseName::Recon, vec![rec("subdomain-scanner", "example.com")])
        .adapting(PhaseName::Recon, vec![urgent]);
    let stack = stack_full(
        planner,
        runner,
        empty_rules(),
        Duration::from_secs(30),
        PlannerConfig {
            recon_floor: 1,
            analyze_floor: 0,
            exploit_floor: 0,
            ..Default::default()
        },
    );

    let workflow_id = stack
        .controller
        .start_workflow(request("example.com", "scan"))
        .await
        .expect("start");
    let events = collect_events(&stack, workflow_id).await;

    // tech-fingerprint ran once per discovered subdomain.
    assert_eq!(
        stack.runner.calls_for("projectdiscovery/httpx:latest"),
        2,
        "fan-out must run the tool once per subdomain"
    );
    // Per-element progress markers were published.
    assert!(count(&events, EventKind::InvocationProgress) >= 2);

    // Surface findings advanced the workflow into analyze.
    let view = stack.controller.status(workflow_id).await.expect("status");
    assert!(
        view.phases.iter().any(|p| p.name == PhaseName::Analyze),
        "tech findings must trigger the analyze phase"
    );
    assert_eq!(view.status, WorkflowStatus::Completed);
}

// ── Scenario 3 surface: resolveApproval drives the exploit gate ──

#[tokio::test]
async fn scenario_approval_denial_skips_exploit() {
    let critical =
        r#"[{"type":"sql-injection","severity":"critical","title":"SQLi","confidence":0.95}]"#;
    let runner = ScriptedRunner::new(
        Duration::from_millis(1),
        &[
            ("projectdiscovery/subfinder:latest", "a.example.com\n"),
            ("parrotsec/sqlmap:latest", critical),
        ],
    );
    let planner = ScriptedPlanner::new()
        .with(PhaseName::Recon, vec![rec("subdomain-scanner", "example.com")])
        .with(
            PhaseName::Analyze,
            vec![rec("sql-injection", "https://example.com")],
        )
        .with(
            PhaseName::Exploit,
            vec![rec("api-fuzzer", "https://example.com")],
        );
    let stack = stack(planner, runner, empty_rules());

    let workflow_id = stack
        .controller
        .start_workflow(request("example.com", "test for sql injection"))
        .await
        .expect("start");

    // Deny the exploit gate as soon as it appears.
    let controller = Arc::clone(&stack.controller);
    let approvals = Arc::clone(&stack.approvals);
    tokio::spawn(async move {
        loop {
            let pending = approvals.pending_for(workflow_id);
            if let Some(gate) = pending.first() {
                controller
                    .resolve_approval(
                        workflow_id,
                        gate.approval_id,
                        false,
                        Some("outside the change window".to_owned()),
                    )
                    .await
                    .expect("resolve");
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    let events = collect_events(&stack, workflow_id).await;

    let resolved = events
        .iter()
        .find(|e| e.kind == EventKind::ApprovalResolved)
        .expect("approval resolved");
    assert_eq!(resolved.data["outcome"], "denied");

    let view = stack.controller.status(workflow_id).await.expect("status");
    assert_eq!(view.status, WorkflowStatus::Completed);
    let exploit = view
        .phases
        .iter()
        .find(|p| p.name == PhaseName::Exploit)
        .expect("exploit phase recorded");
    for invocation in &exploit.invocations {
        assert_eq!(invocation.outcome, Some(InvocationOutcome::Skipped));
    }
    // The exploit tool never reached a container.
    assert_eq!(stack.runner.calls_for("ffuf/ffuf:latest"), 0);
}

// ── Scenario 4: cancellation mid-run ──

#[tokio::test]
async fn scenario_cancellation_mid_run() {
    // Slow containers so cancellation lands while runs are in flight.
    let runner = ScriptedRunner::new(Duration::from_secs(5), &[]);
    let planner = ScriptedPlanner::new().with(
        PhaseName::Recon,
        vec![
            rec("subdomain-scanner", "example.com"),
            rec("port-scanner", "example.com"),
        ],
    );
    let stack = stack(planner, runner, empty_rules());

    let workflow_id = stack
        .controller
        .start_workflow(request("example.com", "scan"))
        .await
        .expect("start");

    // Give the first invocations time to enter containers.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(stack.controller.cancel(workflow_id).await.expect("cancel"));
    // Idempotent: the second call is accepted-or-not but never produces
    // a second terminal event.
    let _ = stack.controller.cancel(workflow_id).await;

    let events = collect_events(&stack, workflow_id).await;

    let aborted: Vec<&Event> = events
        .iter()
        .filter(|e| e.kind == EventKind::WorkflowStatus && e.data["status"] == "aborted")
        .collect();
    assert_eq!(aborted.len(), 1, "exactly one aborted event");
    assert_eq!(
        events.last().expect("events").seq,
        aborted[0].seq,
        "no events after the terminal abort"
    );

    let view = stack.controller.status(workflow_id).await.expect("status");
    assert_eq!(view.status, WorkflowStatus::Aborted);
    for phase in &view.phases {
        for invocation in &phase.invocations {
            assert_eq!(
                invocation.outcome,
                Some(InvocationOutcome::Skipped),
                "in-flight invocations settle as skipped on cancel"
            );
        }
    }
}

// ── Scenario 5: planner failure activates the fallback ──

#[tokio::test]
async fn scenario_planner_failure_fallback() {
    let runner = ScriptedRunner::new(Duration::from_millis(1), &[]);
    let stack = stack(ScriptedPlanner::failing(), runner, empty_rules());

    let workflow_id = stack
        .controller
        .start_workflow(request("example.invalid", "scan"))
        .await
        .expect("start");
    let events = collect_events(&stack, workflow_id).await;

    // A warning-severity error event marks the degradation.
    assert!(events
        .iter()
        .any(|e| e.kind == EventKind::Error && e.data["severity"] == "warning"));

    // The synthesized baseline (4 enumeration tools) still ran.
    assert_eq!(count(&events, EventKind::InvocationStart), 4);
    let last = events.last().expect("events");
    assert_eq!(last.data["status"], "completed");
}

// ── Scenario 6: slow subscriber lags without disturbing others ──

#[tokio::test]
async fn scenario_slow_subscriber_lags() {
    let bus = EventBus::with_capacities(1024, 16);
    let workflow_id = Uuid::new_v4();

    let mut slow = bus.subscribe(workflow_id).await;
    let mut fast = bus.subscribe(workflow_id).await;

    // Slow subscriber accepts exactly one event, then stalls.
    bus.publish(workflow_id, EventKind::InvocationProgress, json!({ "n": 0 }))
        .await
        .expect("publish");
    let first = slow.recv().await;
    assert!(matches!(first, Some(BusItem::Event(_))));
    let _ = fast.recv().await;

    // A thousand more events arrive while the slow subscriber stalls.
    for n in 1..=1000u64 {
        bus.publish(workflow_id, EventKind::InvocationProgress, json!({ "n": n }))
            .await
            .expect("publish");
        if let Some(BusItem::Event(event)) = fast.recv().await {
            assert_eq!(event.seq, n.checked_add(1).expect("seq"));
        }
    }
    bus.close(workflow_id).await;

    let mut lagged_total = 0_u64;
    let mut observed = 0_u64;
    while let Some(item) = slow.recv().await {
        match item {
            BusItem::Lagged(n) => lagged_total = lagged_total.saturating_add(n),
            BusItem::Event(_) => observed = observed.saturating_add(1),
        }
    }
    assert!(
        lagged_total >= 1000 - 16,
        "expected at least {} dropped events, got {lagged_total}",
        1000 - 16
    );
    assert!(observed <= 17, "only the queue tail survives");
}

// ── Restraint soundness through the full stack ──

#[tokio::test]
async fn production_rules_rate_cap_applies() {
    let runner = ScriptedRunner::new(Duration::from_millis(1), &[]);
    let planner =
        ScriptedPlanner::new().with(PhaseName::Recon, recon_baseline("example.com"));
    let stack = stack(planner, runner, RuleSet::defaults());

    let workflow_id = stack
        .controller
        .start_workflow(WorkflowRequest {
            target: "example.com".to_owned(),
            user_intent: "scan".to_owned(),
            constraints: Some(Constraints {
                environment: Some(EnvironmentTag::Production),
                ..Default::default()
            }),
            credentials: None,
        })
        .await
        .expect("start");
    let events = collect_events(&stack, workflow_id).await;

    // Every restraint decision carried the production rate cap.
    let decisions: Vec<&Event> = events
        .iter()
        .filter(|e| e.kind == EventKind::RestraintDecision)
        .collect();
    assert!(!decisions.is_empty());
    for decision in &decisions {
        assert_eq!(decision.data["overrides"]["rate_limit"], 30);
    }

    // The cap landed in the final invocation parameters.
    let view = stack.controller.status(workflow_id).await.expect("status");
    for invocation in &view.phases[0].invocations {
        assert_eq!(invocation.params.get("rate_limit"), Some(&json!(30)));
    }
}

// ── Controller surface errors ──

#[tokio::test]
async fn invalid_requests_rejected_synchronously() {
    let runner = ScriptedRunner::new(Duration::from_millis(1), &[]);
    let stack = stack(ScriptedPlanner::new(), runner, empty_rules());

    let bad_target = stack
        .controller
        .start_workflow(request("not a target", "scan"))
        .await;
    assert!(matches!(bad_target, Err(WorkflowError::InvalidTarget(_))));

    let bad_intent = stack
        .controller
        .start_workflow(request("example.com", ""))
        .await;
    assert!(matches!(bad_intent, Err(WorkflowError::EmptyIntent)));

    let unknown = stack.controller.status(Uuid::new_v4()).await;
    assert!(matches!(unknown, Err(WorkflowError::UnknownWorkflow(_))));
}
