//! Approval correlation table: human-in-the-loop gating.
//!
//! Each pending approval is a request record paired with a single-shot
//! channel. The waiting side (the phase executor) blocks on the
//! receiver while racing the expiry deadline; the resolving side (the
//! controller's `resolve_approval`) or the expiry fires the channel
//! exactly once. Restarting the orchestrator loses in-memory waits by
//! design; persisted requests can be replayed by an operator post-hoc.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{info, warn};
use uuid::Uuid;

use crate::types::PhaseName;

/// A pending approval request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalRequest {
    pub approval_id: Uuid,
    pub workflow_id: Uuid,
    pub phase: PhaseName,
    /// Tool the approval covers; `None` for a phase-gate approval.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    pub target: String,
    pub reason: String,
    pub requested_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// How a pending approval was settled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApprovalOutcome {
    Approved,
    Denied {
        /// Optional operator-supplied reason.
        reason: Option<String>,
    },
    /// The expiry deadline passed with no decision; a rejection.
    Expired,
}

impl ApprovalOutcome {
    /// `true` only for an explicit grant.
    pub fn approved(&self) -> bool {
        matches!(self, Self::Approved)
    }

    /// Stable name used in `approval:resolved` events.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Denied { .. } => "denied",
            Self::Expired => "expired",
        }
    }
}

/// Ledger errors.
#[derive(Debug, Error)]
pub enum ApprovalError {
    /// No pending request with this id.
    #[error("approval request not found: {0}")]
    NotFound(Uuid),
    /// The id exists but belongs to a different workflow.
    #[error("approval {approval_id} does not belong to workflow {workflow_id}")]
    WrongWorkflow {
        /// Approval id given.
        approval_id: Uuid,
        /// Workflow id given.
        workflow_id: Uuid,
    },
}

struct PendingEntry {
    request: ApprovalRequest,
    sender: oneshot::Sender<ApprovalOutcome>,
}

/// Correlation table keyed by approval id.
pub struct ApprovalLedger {
    pending: Mutex<HashMap<Uuid, PendingEntry>>,
    default_ttl: Duration,
}

impl ApprovalLedger {
    /// Ledger with the given default time-to-live for new requests.
    pub fn new(default_ttl: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            default_ttl,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, PendingEntry>> {
        self.pending
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Default time-to-live for new requests.
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Open a new pending approval.
    ///
    /// Returns the stored request (with fresh id and expiry) and the
    /// receiver the waiting side blocks on.
    pub fn submit(
        &self,
        workflow_id: Uuid,
        phase: PhaseName,
        tool: Option<String>,
        target: String,
        reason: String,
    ) -> (ApprovalRequest, oneshot::Receiver<ApprovalOutcome>) {
        let now = Utc::now();
        let ttl = chrono::TimeDelta::from_std(self.default_ttl)
            .unwrap_or_else(|_| chrono::TimeDelta::seconds(1800));
        let request = ApprovalRequest {
            approval_id: Uuid::new_v4(),
            workflow_id,
            phase,
            tool,
            target,
            reason,
            requested_at: now,
            expires_at: now.checked_add_signed(ttl).unwrap_or(now),
        };

        info!(
            approval_id = %request.approval_id,
            workflow_id = %workflow_id,
            phase = %phase,
            tool = request.tool.as_deref().unwrap_or("<phase gate>"),
            "approval requested"
        );

        let (tx, rx) = oneshot::channel();
        self.lock().insert(
            request.approval_id,
            PendingEntry {
                request: request.clone(),
                sender: tx,
            },
        );
        (request, rx)
    }

    /// Resolve a pending approval on behalf of an operator.
    ///
    /// The workflow id must match the stored request, so an id leaked
    /// across workflows cannot resolve someone else's gate.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`] when the id has no pending entry
    /// (already resolved, expired, or never existed);
    /// [`ApprovalError::WrongWorkflow`] on a workflow mismatch.
    pub fn resolve(
        &self,
        workflow_id: Uuid,
        approval_id: Uuid,
        approved: bool,
        reason: Option<String>,
    ) -> Result<ApprovalRequest, ApprovalError> {
        let mut pending = self.lock();

        let entry = pending
            .get(&approval_id)
            .ok_or(ApprovalError::NotFound(approval_id))?;
        if entry.request.workflow_id != workflow_id {
            return Err(ApprovalError::WrongWorkflow {
                approval_id,
                workflow_id,
            });
        }

        let entry = pending
            .remove(&approval_id)
            .ok_or(ApprovalError::NotFound(approval_id))?;
        drop(pending);

        let outcome = if approved {
            ApprovalOutcome::Approved
        } else {
            ApprovalOutcome::Denied { reason }
        };
        info!(
            approval_id = %approval_id,
            workflow_id = %workflow_id,
            outcome = outcome.as_str(),
            "approval resolved"
        );

        // A dropped receiver means the waiter gave up (cancelled); fine.
        let _ = entry.sender.send(outcome);
        Ok(entry.request)
    }

    /// Expire a pending approval. Called by the waiting side when its
    /// deadline fires; a no-op if the request was already resolved.
    pub fn expire(&self, approval_id: Uuid) {
        if let Some(entry) = self.lock().remove(&approval_id) {
            warn!(
                approval_id = %approval_id,
                workflow_id = %entry.request.workflow_id,
                "approval expired without a decision"
            );
            let _ = entry.sender.send(ApprovalOutcome::Expired);
        }
    }

    /// Pending requests for one workflow (status display).
    pub fn pending_for(&self, workflow_id: Uuid) -> Vec<ApprovalRequest> {
        self.lock()
            .values()
            .filter(|entry| entry.request.workflow_id == workflow_id)
            .map(|entry| entry.request.clone())
            .collect()
    }

    /// Drop all pending requests of a workflow (cancellation/retention),
    /// expiring their waiters.
    pub fn forget_workflow(&self, workflow_id: Uuid) {
        let drained: Vec<PendingEntry> = {
            let mut pending = self.lock();
            let ids: Vec<Uuid> = pending
                .iter()
                .filter(|(_, entry)| entry.request.workflow_id == workflow_id)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter().filter_map(|id| pending.remove(&id)).collect()
        };
        for entry in drained {
            let _ = entry.sender.send(ApprovalOutcome::Expired);
        }
    }
}
