//! Planner client: a thin, stateless wrapper around the external
//! reasoning service, plus the validation the core imposes on whatever
//! comes back.
//!
//! The service must emit one recommendation per discrete target. When a
//! strategy comes back below the phase's floor the client re-plans once
//! with an explicit critique directive, then synthesizes the missing
//! per-target recommendations by cross-producting enumeration tools
//! with discovered targets. Service failures of any kind degrade to the
//! keyword fallback recommender; planning never fails the workflow.

pub mod fallback;
pub mod http;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog::ToolCatalog;
use crate::config::PlannerConfig;
use crate::types::{Constraints, Finding, ParamMap, PhaseName, Priority, Recommendation};

/// Request context sent to the reasoning service.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanContext {
    pub workflow_id: Uuid,
    pub target: String,
    pub user_intent: String,
    pub phase: PhaseName,
    pub prior_findings: Vec<Finding>,
    pub completed_tools: Vec<String>,
    pub available_tools: Vec<String>,
    pub constraints: Constraints,
    /// Critique directive attached on the floor-retry call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub critique: Option<String>,
}

/// Normalized strategy from the reasoning service.
#[derive(Debug, Clone, Default)]
pub struct Strategy {
    pub reasoning: String,
    pub recommendations: Vec<Recommendation>,
    /// Service-reported confidence in `[0, 1]`.
    pub confidence: f64,
    /// Service-estimated duration in milliseconds.
    pub expected_duration_ms: u64,
    pub safety_considerations: Vec<String>,
}

/// Planner errors. All of them are recovered locally with the fallback.
#[derive(Debug, Error)]
pub enum PlannerError {
    /// Service unreachable or returned a non-success status.
    #[error("planner unavailable: {0}")]
    Unavailable(String),
    /// Service responded with an unusable body.
    #[error("planner returned malformed strategy: {0}")]
    Malformed(String),
    /// The per-call deadline expired.
    #[error("planner call timed out after {0:?}")]
    Timeout(Duration),
}

/// Wire interface to a reasoning service implementation.
#[async_trait]
pub trait ReasoningApi: Send + Sync {
    /// Produce a strategy for the given context.
    async fn plan(&self, ctx: &PlanContext) -> Result<Strategy, PlannerError>;
}

/// Client wrapping a [`ReasoningApi`] with timeout, per-workflow call
/// serialization, floor validation, and fallback.
pub struct PlannerClient {
    api: Option<Arc<dyn ReasoningApi>>,
    config: PlannerConfig,
    /// One outgoing call in flight per workflow.
    locks: Mutex<HashMap<Uuid, Arc<Mutex<()>>>>,
}

impl PlannerClient {
    /// Client over a live reasoning service.
    pub fn new(api: Arc<dyn ReasoningApi>, config: PlannerConfig) -> Self {
        Self {
            api: Some(api),
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Client with no service configured; every plan uses the fallback.
    pub fn fallback_only(config: PlannerConfig) -> Self {
        Self {
            api: None,
            config,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn workflow_lock(&self, workflow_id: Uuid) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        Arc::clone(locks.entry(workflow_id).or_default())
    }

    /// Drop a workflow's call lock (retention sweep).
    pub async fn forget(&self, workflow_id: Uuid) {
        let mut locks = self.locks.lock().await;
        locks.remove(&workflow_id);
    }

    async fn call(&self, ctx: &PlanContext) -> Result<Strategy, PlannerError> {
        let Some(api) = &self.api else {
            return Err(PlannerError::Unavailable(
                "no reasoning service configured".to_owned(),
            ));
        };

        let lock = self.workflow_lock(ctx.workflow_id).await;
        let _guard = lock.lock().await;

        let deadline = Duration::from_secs(self.config.timeout_seconds);
        match tokio::time::timeout(deadline, api.plan(ctx)).await {
            Ok(result) => result,
            Err(_) => Err(PlannerError::Timeout(deadline)),
        }
    }

    /// Plan a phase.
    ///
    /// Infallible by design: service errors degrade to the fallback
    /// recommender, and under-floor strategies are topped up by the
    /// critique retry and then the synthesized cross-product. The
    /// returned flag is `true` when the fallback produced the strategy.
    pub async fn plan(&self, mut ctx: PlanContext, catalog: &ToolCatalog) -> (Strategy, bool) {
        let (mut strategy, degraded) = match self.call(&ctx).await {
            Ok(strategy) => (strategy, false),
            Err(e) => {
                warn!(workflow_id = %ctx.workflow_id, error = %e, "planner failed, using fallback");
                (fallback::baseline(&ctx, catalog), true)
            }
        };

        normalize(&mut strategy, catalog);

        let floor = self.config.floor(ctx.phase);
        if !degraded && strategy.recommendations.len() < floor {
            info!(
                workflow_id = %ctx.workflow_id,
                got = strategy.recommendations.len(),
                floor,
                "strategy below floor, re-planning with critique"
            );
            ctx.critique = Some(format!(
                "Previous strategy contained {} recommendations but at least {} are expected \
                 for the {} phase. Emit one recommendation per discrete target; do not group \
                 targets into a single recommendation.",
                strategy.recommendations.len(),
                floor,
                ctx.phase
            ));
            if let Ok(mut retried) = self.call(&ctx).await {
                normalize(&mut retried, catalog);
                if retried.recommendations.len() > strategy.recommendations.len() {
                    strategy = retried;
                }
            }
        }

        if strategy.recommendations.len() < floor {
            let synthesized = synthesize(&ctx, catalog, &strategy.recommendations, floor);
            if !synthesized.is_empty() {
                info!(
                    workflow_id = %ctx.workflow_id,
                    added = synthesized.len(),
                    "synthesized per-target recommendations to reach the floor"
                );
                strategy.recommendations.extend(synthesized);
            }
        }

        (strategy, degraded)
    }

    /// Fold new findings into an adapted strategy.
    ///
    /// Semantically a `plan` with prior findings augmented; no floor is
    /// enforced, and a failure yields an empty strategy rather than the
    /// baseline (the phase already has its plan).
    pub async fn adapt(&self, ctx: PlanContext, catalog: &ToolCatalog) -> Strategy {
        match self.call(&ctx).await {
            Ok(mut strategy) => {
                normalize(&mut strategy, catalog);
                strategy
            }
            Err(e) => {
                warn!(workflow_id = %ctx.workflow_id, error = %e, "adapt call failed, keeping current plan");
                Strategy::default()
            }
        }
    }
}

/// Normalize a raw strategy: clamp confidence, default the target
/// parameter, and dedup by tool + target while preserving order.
fn normalize(strategy: &mut Strategy, _catalog: &ToolCatalog) {
    strategy.confidence = if strategy.confidence.is_finite() {
        strategy.confidence.clamp(0.0, 1.0)
    } else {
        0.0
    };

    let mut seen = std::collections::HashSet::new();
    strategy
        .recommendations
        .retain(|rec| !rec.tool.is_empty() && seen.insert(rec.dedup_key()));
}

/// Cross-product enumeration tools with discovered targets to fill a
/// strategy up to the floor.
fn synthesize(
    ctx: &PlanContext,
    catalog: &ToolCatalog,
    existing: &[Recommendation],
    floor: usize,
) -> Vec<Recommendation> {
    let mut targets: Vec<String> = vec![ctx.target.clone()];
    for finding in &ctx.prior_findings {
        if let Some(value) = &finding.target_value {
            if finding.is_surface() && !targets.contains(value) {
                targets.push(value.clone());
            }
        }
    }

    let mut seen: std::collections::HashSet<String> =
        existing.iter().map(Recommendation::dedup_key).collect();
    let mut synthesized = Vec::new();
    let missing = floor.saturating_sub(existing.len());

    'outer: for tool in catalog.names_for_phase(ctx.phase) {
        for target in &targets {
            if synthesized.len() >= missing {
                break 'outer;
            }
            let mut params = ParamMap::new();
            params.insert(
                "target".to_owned(),
                serde_json::Value::String(target.clone()),
            );
            let rec = Recommendation {
                tool: tool.clone(),
                purpose: format!("baseline {} coverage of {target}", ctx.phase),
                expected_outcome: String::new(),
                params,
                safety_checks: Vec::new(),
                priority: Priority::Medium,
                owasp_hint: None,
            };
            if seen.insert(rec.dedup_key()) {
                synthesized.push(rec);
            }
        }
    }

    synthesized
}
