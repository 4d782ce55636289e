//! Workflow controller: the public surface of the orchestrator.
//!
//! Owns the workflow registry. Each workflow's mutable state is only
//! reachable through its [`WorkflowHandle`]; the phase executor drives
//! it under the handle's lock, and the controller publishes the single
//! terminal `workflow:status` event before closing the bus channel.

pub mod approval;

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, EventKind, Subscription};
use crate::engine::ExecutionEngine;
use crate::phase::PhaseExecutor;
use crate::planner::PlannerClient;
use crate::restraint::ApprovalCache;
use crate::types::{
    FindingsSummary, Phase, Workflow, WorkflowRequest, WorkflowStatus,
};
use approval::{ApprovalError, ApprovalLedger, ApprovalRequest};

/// Handle to one workflow's mutable state.
///
/// The only way to reach the aggregate; cloning shares the same state,
/// cancellation token, and approval cache.
#[derive(Clone)]
pub struct WorkflowHandle {
    pub id: Uuid,
    pub state: Arc<Mutex<Workflow>>,
    pub cancel: CancellationToken,
    pub approval_cache: Arc<StdMutex<ApprovalCache>>,
}

impl WorkflowHandle {
    fn new(workflow: Workflow) -> Self {
        Self {
            id: workflow.id,
            state: Arc::new(Mutex::new(workflow)),
            cancel: CancellationToken::new(),
            approval_cache: Arc::new(StdMutex::new(ApprovalCache::new())),
        }
    }
}

/// User-facing controller errors.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// The target is not a URL or plausible hostname.
    #[error("invalid target: {0}")]
    InvalidTarget(String),
    /// The user intent was empty.
    #[error("user intent must not be empty")]
    EmptyIntent,
    /// No workflow with this id.
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(Uuid),
    /// Approval resolution failed.
    #[error(transparent)]
    Approval(#[from] ApprovalError),
}

/// Read-only snapshot returned by `status`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowView {
    pub id: Uuid,
    pub status: WorkflowStatus,
    pub target: String,
    pub phases: Vec<Phase>,
    pub findings: FindingsSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub pending_approvals: Vec<ApprovalRequest>,
}

/// Top-level controller wiring the bus, engine, planner, and phase
/// executor together.
pub struct WorkflowController {
    bus: Arc<EventBus>,
    engine: ExecutionEngine,
    planner: Arc<PlannerClient>,
    executor: Arc<PhaseExecutor>,
    approvals: Arc<ApprovalLedger>,
    registry: Mutex<HashMap<Uuid, WorkflowHandle>>,
    retention: Duration,
}

impl WorkflowController {
    pub fn new(
        bus: Arc<EventBus>,
        engine: ExecutionEngine,
        planner: Arc<PlannerClient>,
        executor: Arc<PhaseExecutor>,
        approvals: Arc<ApprovalLedger>,
        retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            bus,
            engine,
            planner,
            executor,
            approvals,
            registry: Mutex::new(HashMap::new()),
            retention,
        })
    }

    /// Validate a request, create the workflow, and spawn its driver.
    ///
    /// Returns immediately after validation; all further progress is
    /// observable through the event stream or `status`.
    ///
    /// # Errors
    ///
    /// Validation failures; no workflow record is created for them.
    pub async fn start_workflow(
        self: &Arc<Self>,
        request: WorkflowRequest,
    ) -> Result<Uuid, WorkflowError> {
        validate_request(&request)?;

        let workflow = Workflow::from_request(request);
        let id = workflow.id;
        let handle = WorkflowHandle::new(workflow);

        {
            let mut registry = self.registry.lock().await;
            registry.insert(id, handle.clone());
        }

        {
            let mut workflow = handle.state.lock().await;
            workflow.transition(WorkflowStatus::Running);
        }
        self.publish_status(id, WorkflowStatus::Running, None).await;
        info!(workflow_id = %id, "workflow started");

        let controller = Arc::clone(self);
        tokio::spawn(async move {
            controller.drive(handle).await;
        });

        Ok(id)
    }

    /// Drive the phase executor to completion and publish the terminal
    /// event. A panicking driver fails the workflow rather than
    /// wedging it.
    async fn drive(self: Arc<Self>, handle: WorkflowHandle) {
        let executor = Arc::clone(&self.executor);
        let run_handle = handle.clone();
        let driver = tokio::spawn(async move { executor.run(&run_handle).await });

        let (status, error) = match driver.await {
            Ok(status) => (status, None),
            Err(e) => {
                error!(workflow_id = %handle.id, error = %e, "phase driver failed");
                (
                    WorkflowStatus::Failed,
                    Some(format!("phase driver failed: {e}")),
                )
            }
        };

        let final_error = {
            let mut workflow = handle.state.lock().await;
            if let Some(message) = &error {
                workflow.error = Some(message.clone());
            }
            workflow.transition(status);
            workflow.error.clone()
        };

        // Terminal event, then close: always the last event published.
        self.publish_status(handle.id, status, final_error).await;
        self.bus.close(handle.id).await;
        self.approvals.forget_workflow(handle.id);
        info!(workflow_id = %handle.id, status = %status, "workflow finished");
    }

    async fn publish_status(&self, id: Uuid, status: WorkflowStatus, error: Option<String>) {
        let mut data = json!({ "status": status });
        if let Some(error) = error {
            data["error"] = json!(error);
        }
        if let Err(e) = self.bus.publish(id, EventKind::WorkflowStatus, data).await {
            warn!(workflow_id = %id, error = %e, "failed to publish status event");
        }
    }

    /// Subscribe to a workflow's event stream (replay + live).
    pub async fn subscribe(&self, id: Uuid) -> Result<Subscription, WorkflowError> {
        self.lookup(id).await?;
        Ok(self.bus.subscribe(id).await)
    }

    /// Request cancellation. Returns whether the request was accepted
    /// (`false` once the workflow is terminal). Idempotent: repeated
    /// calls never produce a second terminal event.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, WorkflowError> {
        let handle = self.lookup(id).await?;
        let accepted = {
            let workflow = handle.state.lock().await;
            !workflow.status.is_terminal()
        };
        if accepted {
            info!(workflow_id = %id, "cancellation requested");
            handle.cancel.cancel();
        }
        Ok(accepted)
    }

    /// Current state snapshot.
    pub async fn status(&self, id: Uuid) -> Result<WorkflowView, WorkflowError> {
        let handle = self.lookup(id).await?;
        let workflow = handle.state.lock().await;
        Ok(WorkflowView {
            id,
            status: workflow.status,
            target: workflow.target.clone(),
            phases: workflow.phases.clone(),
            findings: workflow.digest.clone(),
            error: workflow.error.clone(),
            pending_approvals: self.approvals.pending_for(id),
        })
    }

    /// Resolve a pending approval on behalf of an operator.
    ///
    /// # Errors
    ///
    /// Unknown workflow, unknown approval id, or workflow mismatch.
    pub async fn resolve_approval(
        &self,
        workflow_id: Uuid,
        approval_id: Uuid,
        approved: bool,
        reason: Option<String>,
    ) -> Result<(), WorkflowError> {
        self.lookup(workflow_id).await?;
        self.approvals
            .resolve(workflow_id, approval_id, approved, reason)?;
        Ok(())
    }

    /// Full clone of a workflow's current state (persistence sink).
    pub async fn snapshot(&self, id: Uuid) -> Result<Workflow, WorkflowError> {
        let handle = self.lookup(id).await?;
        let workflow = handle.state.lock().await;
        Ok(workflow.clone())
    }

    async fn lookup(&self, id: Uuid) -> Result<WorkflowHandle, WorkflowError> {
        let registry = self.registry.lock().await;
        registry
            .get(&id)
            .cloned()
            .ok_or(WorkflowError::UnknownWorkflow(id))
    }

    /// Drop terminal workflows older than the retention window,
    /// together with their bus channels and engine state.
    pub async fn sweep_retention(&self) {
        let cutoff = chrono::TimeDelta::from_std(self.retention)
            .unwrap_or_else(|_| chrono::TimeDelta::hours(24));
        let now = Utc::now();

        let expired: Vec<Uuid> = {
            let registry = self.registry.lock().await;
            let mut expired = Vec::new();
            for (id, handle) in registry.iter() {
                let workflow = handle.state.lock().await;
                let age = now.signed_duration_since(workflow.created_at);
                if workflow.status.is_terminal() && age > cutoff {
                    expired.push(*id);
                }
            }
            expired
        };

        for id in expired {
            info!(workflow_id = %id, "retention sweep dropping workflow");
            let mut registry = self.registry.lock().await;
            registry.remove(&id);
            drop(registry);
            self.bus.remove(id).await;
            self.engine.forget(id).await;
            self.planner.forget(id).await;
            self.approvals.forget_workflow(id);
        }
    }

    /// Spawn the periodic retention sweep.
    pub fn spawn_retention_sweep(self: &Arc<Self>, interval: Duration) {
        let controller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                controller.sweep_retention().await;
            }
        });
    }
}

/// Validate a start request: target must look like a URL or hostname,
/// intent must be non-empty.
fn validate_request(request: &WorkflowRequest) -> Result<(), WorkflowError> {
    if request.user_intent.trim().is_empty() {
        return Err(WorkflowError::EmptyIntent);
    }

    let target = request.target.trim();
    if target.is_empty() || target.contains(char::is_whitespace) {
        return Err(WorkflowError::InvalidTarget(request.target.clone()));
    }

    // Accept full URLs and bare hostnames (tried as https://<target>).
    // A bare `host:port` parses as scheme+path, so anything without a
    // host goes through the https retry.
    let parsed = match url::Url::parse(target) {
        Ok(parsed) if parsed.host_str().is_some() => parsed,
        _ => url::Url::parse(&format!("https://{target}"))
            .map_err(|_| WorkflowError::InvalidTarget(request.target.clone()))?,
    };
    if parsed.host_str().is_none() {
        return Err(WorkflowError::InvalidTarget(request.target.clone()));
    }

    Ok(())
}
