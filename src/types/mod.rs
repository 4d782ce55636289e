// Core data model: workflows, phases, invocations, findings, recommendations.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a workflow.
///
/// Transitions are monotone except that `AwaitingApproval` may return to
/// `Running`; the three terminal states are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WorkflowStatus {
    /// Created, phase loop not yet started.
    Pending,
    /// Phase loop in progress.
    Running,
    /// Suspended on a human approval decision.
    AwaitingApproval,
    /// Finished normally (with or without findings).
    Completed,
    /// Terminated by an unrecoverable error.
    Failed,
    /// Terminated by an operator cancel.
    Aborted,
}

impl WorkflowStatus {
    /// Returns `true` for the absorbing states.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Aborted)
    }

    /// Whether a transition from `self` to `next` is legal.
    pub fn can_transition_to(self, next: Self) -> bool {
        if self == next {
            return false;
        }
        match self {
            Self::Pending => matches!(next, Self::Running | Self::Failed | Self::Aborted),
            Self::Running => matches!(
                next,
                Self::AwaitingApproval | Self::Completed | Self::Failed | Self::Aborted
            ),
            Self::AwaitingApproval => matches!(
                next,
                Self::Running | Self::Completed | Self::Failed | Self::Aborted
            ),
            Self::Completed | Self::Failed | Self::Aborted => false,
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Running => f.write_str("running"),
            Self::AwaitingApproval => f.write_str("awaiting-approval"),
            Self::Completed => f.write_str("completed"),
            Self::Failed => f.write_str("failed"),
            Self::Aborted => f.write_str("aborted"),
        }
    }
}

/// Deployment environment of the assessment target.
///
/// Restraint rules key off this: production targets get the most
/// conservative dispositions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentTag {
    Development,
    Staging,
    Production,
}

impl std::fmt::Display for EnvironmentTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Development => f.write_str("development"),
            Self::Staging => f.write_str("staging"),
            Self::Production => f.write_str("production"),
        }
    }
}

impl std::str::FromStr for EnvironmentTag {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "development" | "dev" => Ok(Self::Development),
            "staging" => Ok(Self::Staging),
            "production" | "prod" => Ok(Self::Production),
            other => Err(anyhow::anyhow!("unknown environment tag: {other}")),
        }
    }
}

/// Assessment phases, ordered `Recon < Analyze < Exploit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PhaseName {
    /// Surface enumeration: subdomains, ports, endpoints, technologies.
    Recon,
    /// Vulnerability analysis against the enumerated surface.
    Analyze,
    /// Active exploitation. Gated on an explicit approval record.
    Exploit,
}

impl PhaseName {
    /// Successor phase, or `None` after `Exploit`.
    pub fn next(self) -> Option<Self> {
        match self {
            Self::Recon => Some(Self::Analyze),
            Self::Analyze => Some(Self::Exploit),
            Self::Exploit => None,
        }
    }

    /// Stable lowercase name used in events and config keys.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Recon => "recon",
            Self::Analyze => "analyze",
            Self::Exploit => "exploit",
        }
    }
}

impl std::fmt::Display for PhaseName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Finding severity, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => f.write_str("info"),
            Self::Low => f.write_str("low"),
            Self::Medium => f.write_str("medium"),
            Self::High => f.write_str("high"),
            Self::Critical => f.write_str("critical"),
        }
    }
}

impl std::str::FromStr for Severity {
    type Err = anyhow::Error;

    /// Parse a severity, accepting the aliases scanners commonly emit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "info" | "informational" | "none" => Ok(Self::Info),
            "low" | "minor" => Ok(Self::Low),
            "medium" | "moderate" | "warning" => Ok(Self::Medium),
            "high" | "major" => Ok(Self::High),
            "critical" | "severe" => Ok(Self::Critical),
            other => Err(anyhow::anyhow!("unknown severity: {other}")),
        }
    }
}

/// Planner-assigned priority of a recommendation, ordered lowest to highest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Queue index with `Critical` first.
    pub fn lane(self) -> usize {
        match self {
            Self::Critical => 0,
            Self::High => 1,
            Self::Medium => 2,
            Self::Low => 3,
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            "critical" => Ok(Self::Critical),
            other => Err(anyhow::anyhow!("unknown priority: {other}")),
        }
    }
}

/// Restraint decision attached to an invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Disposition {
    Allowed,
    AllowedWithMitigations,
    Denied,
    AwaitingApproval,
}

impl std::fmt::Display for Disposition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Allowed => f.write_str("allowed"),
            Self::AllowedWithMitigations => f.write_str("allowed-with-mitigations"),
            Self::Denied => f.write_str("denied"),
            Self::AwaitingApproval => f.write_str("awaiting-approval"),
        }
    }
}

/// Final outcome of a tool invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvocationOutcome {
    /// Container exited 0 and output parsed.
    Success,
    /// Container exited non-zero or could not start.
    Failed,
    /// Deadline expired; container was killed.
    Timeout,
    /// Never dispatched: denied, unapproved, or cancelled.
    Skipped,
}

/// Safety checks a planner may declare on a recommendation (closed set).
///
/// Each tag maps to a parameter override applied before restraint
/// evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SafetyCheck {
    /// Cap requests per minute.
    RateLimiting,
    /// Force the tool's non-intrusive mode.
    NonIntrusive,
    /// Strip parameters carrying write verbs.
    ReadOnly,
    /// Prefix the username parameter with a test-account marker.
    TestAccount,
    /// Cap payload sizes.
    PayloadLimit,
}

impl std::str::FromStr for SafetyCheck {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "rate-limiting" | "rate_limiting" => Ok(Self::RateLimiting),
            "non-intrusive" | "non_intrusive" => Ok(Self::NonIntrusive),
            "read-only" | "read_only" => Ok(Self::ReadOnly),
            "test-account" | "test_account" => Ok(Self::TestAccount),
            "payload-limit" | "payload_limit" => Ok(Self::PayloadLimit),
            other => Err(anyhow::anyhow!("unknown safety check: {other}")),
        }
    }
}

/// Parameter map for a tool invocation.
///
/// `BTreeMap` keeps serialization order stable for event payloads and
/// dedup keys.
pub type ParamMap = BTreeMap<String, serde_json::Value>;

/// An observation extracted from a tool run. Immutable once parsed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// Short type tag, e.g. `subdomain`, `open-port`, `tech`, `sql-injection`.
    pub kind: String,
    pub severity: Severity,
    /// Parser confidence in `[0, 1]`.
    pub confidence: f64,
    pub title: String,
    pub description: String,
    /// Component the finding affects, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affected: Option<String>,
    /// Bounded raw evidence excerpt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence: Option<String>,
    /// OWASP category, e.g. `A03:2021`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owasp: Option<String>,
    /// Compliance control codes touched by this finding.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub controls: Vec<String>,
    /// For enumeration findings: the discovered subdomain, port, URL, etc.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_value: Option<String>,
}

impl Finding {
    /// Whether this finding satisfies the recon→analyze advance predicate
    /// (a concrete piece of attack surface was discovered).
    pub fn is_surface(&self) -> bool {
        matches!(
            self.kind.as_str(),
            "service" | "endpoint" | "technology" | "tech" | "subdomain" | "port" | "open-port"
        )
    }
}

/// A planner-proposed invocation, prior to restraint and substitution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recommendation {
    /// Catalog tool name.
    pub tool: String,
    /// Planner's rationale for this run.
    pub purpose: String,
    /// What the planner expects the run to surface.
    #[serde(default)]
    pub expected_outcome: String,
    /// Parameters; string values may carry `{{tool.property}}` references.
    #[serde(default)]
    pub params: ParamMap,
    /// Declared safety checks from the closed set.
    #[serde(default)]
    pub safety_checks: Vec<SafetyCheck>,
    pub priority: Priority,
    /// OWASP category hint for findings this run may produce.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owasp_hint: Option<String>,
}

impl Recommendation {
    /// Dedup key: tool plus the rendered `target` parameter.
    pub fn dedup_key(&self) -> String {
        let target = self
            .params
            .get("target")
            .map(render_param_value)
            .unwrap_or_default();
        format!("{}\u{1f}{target}", self.tool)
    }
}

/// Render a parameter value the way it would appear on a command line.
pub fn render_param_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(render_param_value).collect();
            parts.join(",")
        }
        other => other.to_string(),
    }
}

/// One planned execution of one tool.
///
/// Created by the phase executor; result fields are written once by the
/// execution engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invocation {
    pub id: Uuid,
    pub tool: String,
    /// Parameters after substitution and restraint mitigation.
    pub params: ParamMap,
    pub disposition: Disposition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<InvocationOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    /// Combined stdout+stderr, bounded by the runner.
    #[serde(default)]
    pub output: String,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub priority: Priority,
}

impl Invocation {
    /// Fresh invocation draft for a tool, before restraint evaluation.
    pub fn draft(tool: &str, params: ParamMap, priority: Priority) -> Self {
        Self {
            id: Uuid::new_v4(),
            tool: tool.to_owned(),
            params,
            disposition: Disposition::Allowed,
            outcome: None,
            started_at: None,
            ended_at: None,
            output: String::new(),
            findings: Vec::new(),
            error: None,
            priority,
        }
    }
}

/// Aggregate findings rollup, used per phase and for the workflow digest.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FindingsSummary {
    pub total: u64,
    /// Counts keyed by severity name.
    #[serde(default)]
    pub by_severity: BTreeMap<Severity, u64>,
    /// Counts keyed by OWASP category.
    #[serde(default)]
    pub by_owasp: BTreeMap<String, u64>,
    /// Compliance controls covered so far.
    #[serde(default)]
    pub controls: BTreeSet<String>,
    /// The critical-severity subset, carried verbatim.
    #[serde(default)]
    pub critical: Vec<Finding>,
}

impl FindingsSummary {
    /// Fold one finding into the rollup.
    pub fn record(&mut self, finding: &Finding) {
        self.total = self.total.saturating_add(1);
        let count = self.by_severity.entry(finding.severity).or_insert(0);
        *count = count.saturating_add(1);
        if let Some(owasp) = &finding.owasp {
            let count = self.by_owasp.entry(owasp.clone()).or_insert(0);
            *count = count.saturating_add(1);
        }
        self.controls.extend(finding.controls.iter().cloned());
        if finding.severity == Severity::Critical {
            self.critical.push(finding.clone());
        }
    }

    /// Fold every finding of an invocation.
    pub fn record_all(&mut self, findings: &[Finding]) {
        for finding in findings {
            self.record(finding);
        }
    }

    /// Count of findings at or above the given severity.
    pub fn at_least(&self, floor: Severity) -> u64 {
        self.by_severity
            .iter()
            .filter(|(severity, _)| **severity >= floor)
            .map(|(_, count)| *count)
            .fold(0, u64::saturating_add)
    }
}

/// A named segment of workflow execution.
///
/// Appended by the phase executor; never mutated after the advance
/// decision is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub name: PhaseName,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub invocations: Vec<Invocation>,
    #[serde(default)]
    pub summary: FindingsSummary,
    /// Whether the advance predicate passed at phase end.
    pub advanced: bool,
    /// Human-readable advance / stop reason.
    #[serde(default)]
    pub advance_reason: String,
}

impl Phase {
    /// Open a new phase record.
    pub fn begin(name: PhaseName) -> Self {
        Self {
            name,
            started_at: Utc::now(),
            ended_at: None,
            invocations: Vec::new(),
            summary: FindingsSummary::default(),
            advanced: false,
            advance_reason: String::new(),
        }
    }
}

/// Optional workflow constraints supplied at start.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Constraints {
    /// Scope allow-list: hosts/prefixes tools may touch.
    pub scope: Vec<String>,
    pub environment: Option<EnvironmentTag>,
    /// Overall wall-clock budget in milliseconds.
    pub time_budget_ms: Option<u64>,
    /// Tools that must never run in this workflow.
    pub exclude_tools: Vec<String>,
}

/// Credentials forwarded to auth-required tools.
///
/// `Debug` is implemented by hand so secret material never reaches logs.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// A request to start a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    /// Target URL or hostname.
    pub target: String,
    /// Free-form user intent.
    pub user_intent: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
}

/// Top-level unit of work: one assessment of one target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub id: Uuid,
    pub target: String,
    pub user_intent: String,
    pub constraints: Constraints,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    pub created_at: DateTime<Utc>,
    pub status: WorkflowStatus,
    #[serde(default)]
    pub phases: Vec<Phase>,
    /// Workflow-wide findings digest, folded across phases.
    #[serde(default)]
    pub digest: FindingsSummary,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Workflow {
    /// Create a pending workflow from a validated request.
    pub fn from_request(request: WorkflowRequest) -> Self {
        Self {
            id: Uuid::new_v4(),
            target: request.target,
            user_intent: request.user_intent,
            constraints: request.constraints.unwrap_or_default(),
            credentials: request.credentials,
            created_at: Utc::now(),
            status: WorkflowStatus::Pending,
            phases: Vec::new(),
            digest: FindingsSummary::default(),
            error: None,
        }
    }

    /// Apply a status transition, rejecting illegal moves.
    ///
    /// Returns `true` when the transition was applied.
    pub fn transition(&mut self, next: WorkflowStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            true
        } else {
            false
        }
    }
}
