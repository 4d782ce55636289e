//! Phase executor: drives one workflow through the
//! recon → analyze → exploit state machine.
//!
//! Each phase plans with the reasoning service, pushes every
//! recommendation through the execution engine within the phase budget,
//! folds findings back into the planner for adaptation, and evaluates
//! the advance predicate at phase end. The exploit phase is entered
//! only after a phase-gate approval has been resolved; a rejected gate
//! still appends the exploit phase, with every planned invocation
//! finalized as skipped.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::bus::{EventBus, EventKind};
use crate::catalog::ToolCatalog;
use crate::config::PhaseBudgetConfig;
use crate::engine::{ExecutionEngine, ExecutionRequest};
use crate::planner::{PlanContext, PlannerClient};
use crate::types::{
    Disposition, Finding, Invocation, InvocationOutcome, Phase, PhaseName, Priority,
    Recommendation, Severity, WorkflowStatus,
};
use crate::workflow::approval::{ApprovalLedger, ApprovalOutcome};
use crate::workflow::WorkflowHandle;

/// Confidence floor for medium-severity findings to count toward the
/// analyze → exploit predicate.
const MEDIUM_CONFIDENCE_FLOOR: f64 = 0.7;

/// Exploit gate state carried into the exploit phase.
#[derive(Debug, Clone, PartialEq, Eq)]
enum GateState {
    /// Not an exploit phase; no gate applies.
    NotRequired,
    /// Gate approved; invocations dispatch normally.
    Approved,
    /// Gate denied or expired; invocations are recorded but never run.
    Rejected(String),
}

/// Result of one phase, used for the advance decision.
#[derive(Debug, Default)]
struct PhaseReport {
    surface_found: bool,
    severity_met: bool,
    budget_exhausted: bool,
}

/// Drives workflows through their phases. Stateless between workflows.
pub struct PhaseExecutor {
    bus: Arc<EventBus>,
    engine: ExecutionEngine,
    planner: Arc<PlannerClient>,
    catalog: Arc<ToolCatalog>,
    approvals: Arc<ApprovalLedger>,
    budgets: PhaseBudgetConfig,
}

impl PhaseExecutor {
    pub fn new(
        bus: Arc<EventBus>,
        engine: ExecutionEngine,
        planner: Arc<PlannerClient>,
        catalog: Arc<ToolCatalog>,
        approvals: Arc<ApprovalLedger>,
        budgets: PhaseBudgetConfig,
    ) -> Self {
        Self {
            bus,
            engine,
            planner,
            catalog,
            approvals,
            budgets,
        }
    }

    /// Run the workflow's phase loop to a terminal status.
    ///
    /// The caller (the controller) publishes the terminal
    /// `workflow:status` event and closes the bus channel.
    pub async fn run(&self, handle: &WorkflowHandle) -> WorkflowStatus {
        let overall_deadline = {
            let workflow = handle.state.lock().await;
            workflow
                .constraints
                .time_budget_ms
                .and_then(|ms| Instant::now().checked_add(Duration::from_millis(ms)))
        };

        let mut phase_name = PhaseName::Recon;
        let mut gate = GateState::NotRequired;

        loop {
            if handle.cancel.is_cancelled() {
                return WorkflowStatus::Aborted;
            }

            let report = self
                .run_phase(handle, phase_name, &gate, overall_deadline)
                .await;

            if handle.cancel.is_cancelled() {
                return WorkflowStatus::Aborted;
            }

            match phase_name {
                PhaseName::Recon => {
                    if report.surface_found {
                        phase_name = PhaseName::Analyze;
                    } else {
                        return WorkflowStatus::Completed;
                    }
                }
                PhaseName::Analyze => {
                    if report.severity_met {
                        match self.request_phase_gate(handle).await {
                            Some(outcome) if outcome.approved() => {
                                gate = GateState::Approved;
                            }
                            Some(outcome) => {
                                gate = GateState::Rejected(outcome.as_str().to_owned());
                            }
                            None => return WorkflowStatus::Aborted,
                        }
                        phase_name = PhaseName::Exploit;
                    } else {
                        return WorkflowStatus::Completed;
                    }
                }
                PhaseName::Exploit => return WorkflowStatus::Completed,
            }
        }
    }

    /// Request the exploit phase-gate approval.
    ///
    /// Returns `None` when the workflow was cancelled mid-wait.
    async fn request_phase_gate(&self, handle: &WorkflowHandle) -> Option<ApprovalOutcome> {
        let target = {
            let workflow = handle.state.lock().await;
            workflow.target.clone()
        };

        let (request, rx) = self.approvals.submit(
            handle.id,
            PhaseName::Exploit,
            None,
            target,
            "entering the exploit phase requires sign-off".to_owned(),
        );

        self.publish(
            handle,
            EventKind::ApprovalRequest,
            json!({
                "approvalId": request.approval_id,
                "phase": PhaseName::Exploit,
                "target": request.target,
                "reason": request.reason,
                "expiresAt": request.expires_at,
            }),
        )
        .await;
        self.set_status(handle, WorkflowStatus::AwaitingApproval).await;

        let ttl = self.approvals.default_ttl();
        let outcome = tokio::select! {
            resolved = rx => resolved.unwrap_or(ApprovalOutcome::Expired),
            () = tokio::time::sleep(ttl) => {
                self.approvals.expire(request.approval_id);
                ApprovalOutcome::Expired
            }
            () = handle.cancel.cancelled() => {
                self.approvals.expire(request.approval_id);
                return None;
            }
        };

        self.publish(
            handle,
            EventKind::ApprovalResolved,
            json!({
                "approvalId": request.approval_id,
                "phase": PhaseName::Exploit,
                "outcome": outcome.as_str(),
            }),
        )
        .await;
        self.set_status(handle, WorkflowStatus::Running).await;

        Some(outcome)
    }

    async fn run_phase(
        &self,
        handle: &WorkflowHandle,
        name: PhaseName,
        gate: &GateState,
        overall_deadline: Option<Instant>,
    ) -> PhaseReport {
        self.publish(handle, EventKind::PhaseStart, json!({ "phase": name }))
            .await;

        {
            let mut workflow = handle.state.lock().await;
            workflow.phases.push(Phase::begin(name));
        }

        let phase_deadline = {
            let by_budget = Instant::now()
                .checked_add(self.budgets.budget(name))
                .unwrap_or_else(Instant::now);
            match overall_deadline {
                Some(overall) => by_budget.min(overall),
                None => by_budget,
            }
        };

        let ctx = self.plan_context(handle, name).await;
        let (strategy, degraded) = self.planner.plan(ctx, &self.catalog).await;
        if degraded {
            self.publish(
                handle,
                EventKind::Error,
                json!({
                    "severity": "warning",
                    "phase": name,
                    "error": "reasoning service unavailable; fallback recommender active",
                }),
            )
            .await;
        }
        self.publish(
            handle,
            EventKind::PlannerStrategy,
            json!({
                "phase": name,
                "reasoning": strategy.reasoning,
                "confidence": strategy.confidence,
                "recommendations": strategy.recommendations.len(),
                "safetyConsiderations": strategy.safety_considerations,
                "fallback": degraded,
            }),
        )
        .await;

        let mut seen_keys: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<Recommendation> = VecDeque::new();
        for rec in strategy.recommendations {
            if self
                .admit(handle, name, &rec, &mut seen_keys)
                .await
            {
                queue.push_back(rec);
            }
        }

        let mut report = PhaseReport::default();

        // Rejected exploit gate: the plan is recorded, nothing runs.
        if let GateState::Rejected(reason) = gate {
            for rec in queue.drain(..) {
                let invocation = self.record_unapproved(handle, &rec, reason).await;
                self.record_invocation(handle, invocation).await;
            }
            self.finish_phase(handle, name, &mut report).await;
            return report;
        }

        // Submission window: up to W invocations in flight at once.
        // Completions settle in any order; adaptation splices new work
        // ahead of the queue while earlier submissions keep running.
        let width = self.engine.width();
        let (done_tx, mut done_rx) =
            tokio::sync::mpsc::unbounded_channel::<(Recommendation, Option<Invocation>)>();
        let mut outstanding: usize = 0;

        loop {
            while outstanding < width {
                if Instant::now() >= phase_deadline {
                    if !queue.is_empty() {
                        report.budget_exhausted = true;
                        warn!(
                            workflow_id = %handle.id,
                            phase = %name,
                            dropped = queue.len(),
                            "phase budget exhausted, dropping remaining recommendations"
                        );
                        queue.clear();
                    }
                    break;
                }
                let Some(rec) = queue.pop_front() else {
                    break;
                };
                let remaining = phase_deadline.duration_since(Instant::now());
                let rx = self
                    .engine
                    .submit(self.execution_request(handle, name, &rec, remaining).await);
                let tx = done_tx.clone();
                tokio::spawn(async move {
                    let settled = rx.await.ok();
                    let _ = tx.send((rec, settled));
                });
                outstanding = outstanding.saturating_add(1);
            }

            if outstanding == 0 {
                break;
            }

            let Some((rec, settled)) = done_rx.recv().await else {
                break;
            };
            outstanding = outstanding.saturating_sub(1);
            let Some(mut invocation) = settled else {
                debug!(workflow_id = %handle.id, tool = %rec.tool, "engine dropped invocation");
                continue;
            };

            if invocation.disposition == Disposition::AwaitingApproval
                && !handle.cancel.is_cancelled()
            {
                invocation = self
                    .run_invocation_approval(handle, name, &rec, invocation, phase_deadline)
                    .await;
            }

            let findings = invocation.findings.clone();
            let succeeded = invocation.outcome == Some(InvocationOutcome::Success);
            self.record_invocation(handle, invocation).await;

            if succeeded && !findings.is_empty() && !handle.cancel.is_cancelled() {
                self.adapt_and_splice(handle, name, &mut queue, &mut seen_keys)
                    .await;
            }
        }

        self.finish_phase(handle, name, &mut report).await;
        report
    }

    /// Filters one recommendation into the phase queue.
    async fn admit(
        &self,
        handle: &WorkflowHandle,
        name: PhaseName,
        rec: &Recommendation,
        seen_keys: &mut HashSet<String>,
    ) -> bool {
        let Some(spec) = self.catalog.get(&rec.tool) else {
            self.publish(
                handle,
                EventKind::Error,
                json!({
                    "severity": "warning",
                    "phase": name,
                    "error": format!("planner recommended unknown tool: {}", rec.tool),
                }),
            )
            .await;
            return false;
        };
        if !spec.allowed_in(name) {
            debug!(
                workflow_id = %handle.id,
                tool = %rec.tool,
                phase = %name,
                "dropping recommendation outside the phase toolset"
            );
            return false;
        }
        let excluded = {
            let workflow = handle.state.lock().await;
            workflow.constraints.exclude_tools.contains(&rec.tool)
        };
        if excluded {
            debug!(workflow_id = %handle.id, tool = %rec.tool, "tool excluded by workflow constraints");
            return false;
        }
        seen_keys.insert(rec.dedup_key())
    }

    /// Record an exploit invocation under a rejected gate: planned,
    /// published, never dispatched.
    async fn record_unapproved(
        &self,
        handle: &WorkflowHandle,
        rec: &Recommendation,
        gate_reason: &str,
    ) -> Invocation {
        let mut invocation = Invocation::draft(&rec.tool, rec.params.clone(), rec.priority);
        invocation.disposition = Disposition::AwaitingApproval;
        invocation.outcome = Some(InvocationOutcome::Skipped);
        invocation.error = Some(format!("exploit phase approval {gate_reason}"));
        invocation.started_at = Some(Utc::now());
        invocation.ended_at = invocation.started_at;

        self.publish(
            handle,
            EventKind::InvocationStart,
            json!({
                "invocationId": invocation.id,
                "tool": invocation.tool,
                "phase": PhaseName::Exploit,
                "priority": invocation.priority,
            }),
        )
        .await;
        self.publish(
            handle,
            EventKind::InvocationComplete,
            serde_json::to_value(&invocation)
                .unwrap_or_else(|_| json!({"invocationId": invocation.id})),
        )
        .await;
        invocation
    }

    /// Per-invocation approval protocol: one fresh approval id, a
    /// single-shot wait bounded by the ledger TTL, then either a
    /// resubmission (approved) or a final skip.
    async fn run_invocation_approval(
        &self,
        handle: &WorkflowHandle,
        name: PhaseName,
        rec: &Recommendation,
        mut invocation: Invocation,
        phase_deadline: Instant,
    ) -> Invocation {
        let target = invocation
            .params
            .get("target")
            .map(crate::types::render_param_value)
            .unwrap_or_default();

        let (request, rx) = self.approvals.submit(
            handle.id,
            name,
            Some(rec.tool.clone()),
            target.clone(),
            invocation
                .error
                .clone()
                .unwrap_or_else(|| "restraint requires approval".to_owned()),
        );

        self.publish(
            handle,
            EventKind::ApprovalRequest,
            json!({
                "approvalId": request.approval_id,
                "invocationId": invocation.id,
                "tool": rec.tool,
                "target": request.target,
                "reason": request.reason,
                "expiresAt": request.expires_at,
            }),
        )
        .await;
        self.set_status(handle, WorkflowStatus::AwaitingApproval).await;

        let ttl = self.approvals.default_ttl();
        let outcome = tokio::select! {
            resolved = rx => resolved.unwrap_or(ApprovalOutcome::Expired),
            () = tokio::time::sleep(ttl) => {
                self.approvals.expire(request.approval_id);
                ApprovalOutcome::Expired
            }
            () = handle.cancel.cancelled() => {
                self.approvals.expire(request.approval_id);
                invocation.error = Some("cancelled".to_owned());
                return invocation;
            }
        };

        self.publish(
            handle,
            EventKind::ApprovalResolved,
            json!({
                "approvalId": request.approval_id,
                "invocationId": invocation.id,
                "outcome": outcome.as_str(),
            }),
        )
        .await;

        {
            let mut cache = handle
                .approval_cache
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            cache.record(&rec.tool, &target, outcome.approved());
        }
        self.set_status(handle, WorkflowStatus::Running).await;

        if outcome.approved() {
            let remaining = phase_deadline.duration_since(Instant::now());
            let rx = self
                .engine
                .submit(self.execution_request(handle, name, rec, remaining).await);
            match rx.await {
                Ok(resubmitted) => resubmitted,
                Err(_) => invocation,
            }
        } else {
            invocation.error = Some(format!("approval {}", outcome.as_str()));
            invocation
        }
    }

    /// Call the planner's adapt operation and splice critical/high
    /// recommendations ahead of the queue.
    async fn adapt_and_splice(
        &self,
        handle: &WorkflowHandle,
        name: PhaseName,
        queue: &mut VecDeque<Recommendation>,
        seen_keys: &mut HashSet<String>,
    ) {
        let ctx = self.plan_context(handle, name).await;
        let strategy = self.planner.adapt(ctx, &self.catalog).await;
        if strategy.recommendations.is_empty() {
            return;
        }

        let mut spliced = Vec::new();
        for rec in strategy.recommendations {
            if rec.priority < Priority::High {
                continue;
            }
            if self.admit(handle, name, &rec, seen_keys).await {
                spliced.push(rec);
            }
        }

        if spliced.is_empty() {
            return;
        }

        info!(
            workflow_id = %handle.id,
            phase = %name,
            spliced = spliced.len(),
            "adaptation spliced urgent recommendations ahead"
        );
        self.publish(
            handle,
            EventKind::PlannerStrategy,
            json!({
                "phase": name,
                "adapted": true,
                "spliced": spliced.len(),
            }),
        )
        .await;

        for rec in spliced.into_iter().rev() {
            queue.push_front(rec);
        }
    }

    async fn plan_context(&self, handle: &WorkflowHandle, name: PhaseName) -> PlanContext {
        let workflow = handle.state.lock().await;
        let prior_findings: Vec<Finding> = workflow
            .phases
            .iter()
            .flat_map(|phase| phase.invocations.iter())
            .flat_map(|invocation| invocation.findings.iter().cloned())
            .collect();
        let mut seen_tools = HashSet::new();
        let completed_tools: Vec<String> = workflow
            .phases
            .iter()
            .flat_map(|phase| phase.invocations.iter())
            .filter(|invocation| invocation.outcome == Some(InvocationOutcome::Success))
            .map(|invocation| invocation.tool.clone())
            .filter(|tool| seen_tools.insert(tool.clone()))
            .collect();

        PlanContext {
            workflow_id: workflow.id,
            target: workflow.target.clone(),
            user_intent: workflow.user_intent.clone(),
            phase: name,
            prior_findings,
            completed_tools,
            available_tools: self.catalog.names_for_phase(name),
            constraints: workflow.constraints.clone(),
            critique: None,
        }
    }

    async fn execution_request(
        &self,
        handle: &WorkflowHandle,
        name: PhaseName,
        rec: &Recommendation,
        remaining_budget: Duration,
    ) -> ExecutionRequest {
        let (environment, workflow_target, credentials, prior_findings) = {
            let workflow = handle.state.lock().await;
            (
                workflow.constraints.environment,
                workflow.target.clone(),
                workflow.credentials.clone(),
                workflow.digest.total,
            )
        };
        let mut recommendation = rec.clone();
        if !recommendation.params.contains_key("target") {
            recommendation.params.insert(
                "target".to_owned(),
                serde_json::Value::String(workflow_target.clone()),
            );
        }
        ExecutionRequest {
            workflow_id: handle.id,
            phase: name,
            environment,
            workflow_target,
            recommendation,
            remaining_budget,
            prior_findings,
            credentials,
            cancel: handle.cancel.clone(),
            approval_cache: Arc::clone(&handle.approval_cache),
        }
    }

    async fn record_invocation(&self, handle: &WorkflowHandle, invocation: Invocation) {
        let mut workflow = handle.state.lock().await;
        let findings = invocation.findings.clone();
        workflow.digest.record_all(&findings);
        if let Some(phase) = workflow.phases.last_mut() {
            phase.summary.record_all(&findings);
            phase.invocations.push(invocation);
        }
    }

    async fn finish_phase(&self, handle: &WorkflowHandle, name: PhaseName, report: &mut PhaseReport) {
        let (summary, advanced, reason) = {
            let mut workflow = handle.state.lock().await;
            let cancelled = handle.cancel.is_cancelled();
            let Some(phase) = workflow.phases.last_mut() else {
                return;
            };

            report.surface_found = phase
                .invocations
                .iter()
                .flat_map(|invocation| invocation.findings.iter())
                .any(Finding::is_surface);
            report.severity_met = phase
                .invocations
                .iter()
                .flat_map(|invocation| invocation.findings.iter())
                .any(|finding| {
                    finding.severity >= Severity::High
                        || (finding.severity == Severity::Medium
                            && finding.confidence >= MEDIUM_CONFIDENCE_FLOOR)
                });

            let (advanced, reason) = if cancelled {
                (false, "workflow cancelled".to_owned())
            } else {
                match name {
                    PhaseName::Recon if report.surface_found => {
                        (true, "attack surface discovered".to_owned())
                    }
                    PhaseName::Recon => (false, "no attack surface discovered".to_owned()),
                    PhaseName::Analyze if report.severity_met => (
                        true,
                        "exploitable-severity findings present; exploit gate follows".to_owned(),
                    ),
                    PhaseName::Analyze => {
                        (false, "no findings met the exploit threshold".to_owned())
                    }
                    PhaseName::Exploit => (false, "final phase".to_owned()),
                }
            };

            phase.ended_at = Some(Utc::now());
            phase.advanced = advanced;
            phase.advance_reason = reason.clone();
            (phase.summary.clone(), advanced, reason)
        };

        self.publish(
            handle,
            EventKind::PhaseComplete,
            json!({
                "phase": name,
                "summary": summary,
                "advanced": advanced,
                "reason": reason,
                "budgetExhausted": report.budget_exhausted,
            }),
        )
        .await;
    }

    async fn set_status(&self, handle: &WorkflowHandle, status: WorkflowStatus) {
        let changed = {
            let mut workflow = handle.state.lock().await;
            workflow.transition(status)
        };
        if changed {
            self.publish(
                handle,
                EventKind::WorkflowStatus,
                json!({ "status": status }),
            )
            .await;
        }
    }

    async fn publish(&self, handle: &WorkflowHandle, kind: EventKind, data: serde_json::Value) {
        if let Err(e) = self.bus.publish(handle.id, kind, data).await {
            debug!(workflow_id = %handle.id, error = %e, "event dropped (channel closed)");
        }
    }
}
