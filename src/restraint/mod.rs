//! Restraint rule engine: decides allow / deny / rate-limit /
//! require-approval for every prospective tool invocation.
//!
//! Rules are configuration. An ordered list is evaluated against each
//! invocation draft; every predicate runs (for audit) even after a deny
//! short-circuits the action composition. Mitigations from `rate-limit`
//! and `limit-scope` rules merge into one override map, conflicting keys
//! resolved by the strictest value.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::catalog::SafetyClass;
use crate::types::{Disposition, EnvironmentTag, ParamMap, PhaseName};

/// Action taken when a rule's predicate matches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RuleAction {
    Allow,
    Deny,
    RateLimit,
    LimitScope,
    RequireApproval,
    /// Tags the event stream without changing the disposition.
    Monitor,
}

/// Serialized predicate; all present conditions must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RulePredicate {
    /// Tool names; empty matches any. A trailing `*` is a prefix wildcard.
    pub tools: Vec<String>,
    pub phases: Vec<PhaseName>,
    pub environments: Vec<EnvironmentTag>,
    pub safety_classes: Vec<SafetyClass>,
    /// Regex matched against the draft's rendered target.
    pub target_pattern: Option<String>,
    /// Matches only once this many findings have accumulated.
    pub min_prior_findings: Option<u64>,
}

/// Serialized rule, as it appears in `rules.toml` under `[[rule]]`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default)]
    pub predicate: RulePredicate,
    pub action: RuleAction,
    /// Parameter overrides applied under `rate-limit` / `limit-scope`.
    #[serde(default)]
    pub mitigation: ParamMap,
    #[serde(default)]
    pub severity: String,
    pub reason: String,
}

/// Compiled rule ready for evaluation.
#[derive(Debug, Clone)]
pub struct RestraintRule {
    pub config: RuleConfig,
    target_regex: Option<Regex>,
}

/// Everything a predicate may examine about a prospective invocation.
#[derive(Debug, Clone)]
pub struct DraftContext<'a> {
    pub workflow_id: Uuid,
    pub tool: &'a str,
    pub safety_class: SafetyClass,
    pub phase: PhaseName,
    pub environment: Option<EnvironmentTag>,
    /// Rendered target the tool will touch.
    pub target: &'a str,
    /// Findings accumulated in the workflow so far.
    pub prior_findings: u64,
}

/// Composite decision for one draft.
#[derive(Debug, Clone)]
pub struct RestraintDecision {
    pub disposition: Disposition,
    /// Merged mitigation overrides (strictest-wins).
    pub overrides: ParamMap,
    /// Reasons from every action-bearing matched rule, in rule order.
    pub reasons: Vec<String>,
    /// Tags from matched `monitor` rules.
    pub monitor_tags: Vec<String>,
    /// Ids of all matched rules, for audit.
    pub matched_rules: Vec<String>,
}

impl RestraintDecision {
    fn allowed() -> Self {
        Self {
            disposition: Disposition::Allowed,
            overrides: ParamMap::new(),
            reasons: Vec::new(),
            monitor_tags: Vec::new(),
            matched_rules: Vec::new(),
        }
    }
}

/// Rule-set loading errors.
#[derive(Debug, Error)]
pub enum RestraintError {
    /// The rules file could not be parsed.
    #[error("failed to parse rules: {0}")]
    Parse(#[from] toml::de::Error),
    /// A rule carries an invalid target regex.
    #[error("rule {rule}: invalid target pattern: {reason}")]
    InvalidPattern {
        /// Offending rule id.
        rule: String,
        /// Regex compile error.
        reason: String,
    },
}

/// An ordered, compiled rule list.
#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: Vec<RestraintRule>,
}

impl RuleSet {
    /// Compile a list of rule configs, rejecting invalid patterns.
    ///
    /// # Errors
    ///
    /// Returns [`RestraintError::InvalidPattern`] for an uncompilable
    /// target regex; the caller decides whether to fall back.
    pub fn compile(configs: Vec<RuleConfig>) -> Result<Self, RestraintError> {
        let mut rules = Vec::with_capacity(configs.len());
        for config in configs {
            let target_regex = match &config.predicate.target_pattern {
                Some(pattern) => {
                    Some(
                        Regex::new(pattern).map_err(|e| RestraintError::InvalidPattern {
                            rule: config.id.clone(),
                            reason: e.to_string(),
                        })?,
                    )
                }
                None => None,
            };
            rules.push(RestraintRule {
                config,
                target_regex,
            });
        }
        Ok(Self { rules })
    }

    /// The compiled rules, in evaluation order.
    pub fn rules(&self) -> &[RestraintRule] {
        &self.rules
    }

    /// Parse and compile `[[rule]]` tables from TOML.
    ///
    /// # Errors
    ///
    /// Returns a parse or pattern error; see [`RuleSet::compile`].
    pub fn from_toml(raw: &str) -> Result<Self, RestraintError> {
        #[derive(Deserialize)]
        struct File {
            #[serde(default, rename = "rule")]
            rules: Vec<RuleConfig>,
        }
        let file: File = toml::from_str(raw)?;
        Self::compile(file.rules)
    }

    /// The built-in conservative default set.
    pub fn defaults() -> Self {
        let configs = vec![
            RuleConfig {
                id: "production-exploit-approval".to_owned(),
                predicate: RulePredicate {
                    phases: vec![PhaseName::Exploit],
                    environments: vec![EnvironmentTag::Production],
                    ..Default::default()
                },
                action: RuleAction::RequireApproval,
                mitigation: ParamMap::new(),
                severity: "high".to_owned(),
                reason: "exploit-phase tooling against a production target requires sign-off"
                    .to_owned(),
            },
            RuleConfig {
                id: "intrusive-rate-cap".to_owned(),
                predicate: RulePredicate {
                    safety_classes: vec![SafetyClass::Intrusive],
                    ..Default::default()
                },
                action: RuleAction::RateLimit,
                mitigation: param_map(&[("rate_limit", serde_json::json!(60))]),
                severity: "medium".to_owned(),
                reason: "intrusive tools are rate-capped".to_owned(),
            },
            RuleConfig {
                id: "production-rate-cap".to_owned(),
                predicate: RulePredicate {
                    environments: vec![EnvironmentTag::Production],
                    ..Default::default()
                },
                action: RuleAction::RateLimit,
                mitigation: param_map(&[("rate_limit", serde_json::json!(30))]),
                severity: "medium".to_owned(),
                reason: "production targets are rate-capped".to_owned(),
            },
            RuleConfig {
                id: "destructive-path-exclusion".to_owned(),
                predicate: RulePredicate {
                    safety_classes: vec![SafetyClass::Active, SafetyClass::Intrusive],
                    ..Default::default()
                },
                action: RuleAction::LimitScope,
                mitigation: param_map(&[(
                    "exclude_paths",
                    serde_json::json!(["/logout", "/admin/delete", "/account/close"]),
                )]),
                severity: "medium".to_owned(),
                reason: "state-destroying paths are excluded from probing".to_owned(),
            },
            RuleConfig {
                id: "monitor-intrusive".to_owned(),
                predicate: RulePredicate {
                    safety_classes: vec![SafetyClass::Intrusive],
                    ..Default::default()
                },
                action: RuleAction::Monitor,
                mitigation: ParamMap::new(),
                severity: "info".to_owned(),
                reason: "intrusive tool execution is monitored".to_owned(),
            },
        ];
        Self::compile(configs).unwrap_or_else(|_| Self { rules: Vec::new() })
    }

    fn matches(&self, rule: &RestraintRule, ctx: &DraftContext<'_>) -> bool {
        let p = &rule.config.predicate;

        if !p.tools.is_empty() && !p.tools.iter().any(|pat| tool_matches(ctx.tool, pat)) {
            return false;
        }
        if !p.phases.is_empty() && !p.phases.contains(&ctx.phase) {
            return false;
        }
        if !p.environments.is_empty() {
            match ctx.environment {
                Some(env) if p.environments.contains(&env) => {}
                _ => return false,
            }
        }
        if !p.safety_classes.is_empty() && !p.safety_classes.contains(&ctx.safety_class) {
            return false;
        }
        if let Some(regex) = &rule.target_regex {
            if !regex.is_match(ctx.target) {
                return false;
            }
        }
        if let Some(floor) = p.min_prior_findings {
            if ctx.prior_findings < floor {
                return false;
            }
        }
        true
    }

    /// Evaluate the full rule list against a draft.
    ///
    /// Pure: no locking, no side effects beyond tracing.
    pub fn evaluate(&self, ctx: &DraftContext<'_>) -> RestraintDecision {
        let mut decision = RestraintDecision::allowed();
        let mut denied = false;
        let mut needs_approval = false;
        let mut mitigated = false;

        for rule in &self.rules {
            if !self.matches(rule, ctx) {
                continue;
            }
            decision.matched_rules.push(rule.config.id.clone());

            // A deny freezes the action composition, but later predicates
            // still run so the audit trail lists every matched rule.
            if denied {
                continue;
            }

            match rule.config.action {
                RuleAction::Deny => {
                    denied = true;
                    decision.reasons.push(rule.config.reason.clone());
                }
                RuleAction::RequireApproval => {
                    needs_approval = true;
                    decision.reasons.push(rule.config.reason.clone());
                }
                RuleAction::RateLimit | RuleAction::LimitScope => {
                    mitigated = true;
                    decision.reasons.push(rule.config.reason.clone());
                    merge_strictest(&mut decision.overrides, &rule.config.mitigation);
                }
                RuleAction::Monitor => {
                    decision.monitor_tags.push(rule.config.id.clone());
                }
                RuleAction::Allow => {}
            }
        }

        decision.disposition = if denied {
            Disposition::Denied
        } else if needs_approval {
            Disposition::AwaitingApproval
        } else if mitigated {
            Disposition::AllowedWithMitigations
        } else {
            Disposition::Allowed
        };
        decision
    }
}

/// Exact tool match, or prefix match when the pattern ends with `*`.
fn tool_matches(tool: &str, pattern: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => tool.starts_with(prefix),
        None => tool == pattern,
    }
}

fn param_map(entries: &[(&str, serde_json::Value)]) -> ParamMap {
    entries
        .iter()
        .map(|(key, value)| ((*key).to_owned(), value.clone()))
        .collect()
}

/// Merge `incoming` mitigation values into `merged`, keeping the
/// strictest value on key conflicts: minimum for numbers, union for
/// exclude lists, intersection for include lists.
fn merge_strictest(merged: &mut ParamMap, incoming: &ParamMap) {
    for (key, value) in incoming {
        match merged.get_mut(key) {
            None => {
                merged.insert(key.clone(), value.clone());
            }
            Some(existing) => {
                *existing = strictest(key, existing, value);
            }
        }
    }
}

fn strictest(key: &str, a: &serde_json::Value, b: &serde_json::Value) -> serde_json::Value {
    use serde_json::Value;
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let fx = x.as_f64().unwrap_or(f64::MAX);
            let fy = y.as_f64().unwrap_or(f64::MAX);
            if fy < fx { b.clone() } else { a.clone() }
        }
        (Value::Array(x), Value::Array(y)) => {
            if key.contains("exclude") {
                // Union, preserving first-seen order.
                let mut union = x.clone();
                for item in y {
                    if !union.contains(item) {
                        union.push(item.clone());
                    }
                }
                Value::Array(union)
            } else {
                // Include lists / scopes intersect.
                let intersection: Vec<Value> =
                    x.iter().filter(|item| y.contains(item)).cloned().collect();
                Value::Array(intersection)
            }
        }
        // Incomparable shapes: keep the earlier rule's value.
        _ => a.clone(),
    }
}

/// Apply mitigation overrides onto invocation parameters.
///
/// Strictly tightens: an override never relaxes a user-supplied value.
/// Idempotent: applying the same overrides twice is a no-op.
pub fn apply_overrides(params: &mut ParamMap, overrides: &ParamMap) {
    for (key, value) in overrides {
        match params.get_mut(key) {
            None => {
                params.insert(key.clone(), value.clone());
            }
            Some(existing) => {
                *existing = strictest(key, value, existing);
            }
        }
    }
}

/// Per-workflow approval cache keyed on `(tool, target)`.
///
/// Once an identical draft is granted or denied within a workflow,
/// subsequent drafts reuse the decision. Never shared across workflows.
#[derive(Debug, Default)]
pub struct ApprovalCache {
    decisions: HashMap<(String, String), bool>,
}

impl ApprovalCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a resolution for a `(tool, target)` pair.
    pub fn record(&mut self, tool: &str, target: &str, approved: bool) {
        self.decisions
            .insert((tool.to_owned(), target.to_owned()), approved);
    }

    /// Cached decision, if any.
    pub fn lookup(&self, tool: &str, target: &str) -> Option<bool> {
        self.decisions
            .get(&(tool.to_owned(), target.to_owned()))
            .copied()
    }
}

/// Evaluator holding an atomically swappable rule-set snapshot.
///
/// Readers clone the `Arc` and evaluate without holding any lock.
pub struct RestraintEvaluator {
    rules: RwLock<Arc<RuleSet>>,
}

impl Default for RestraintEvaluator {
    fn default() -> Self {
        Self::new(RuleSet::defaults())
    }
}

impl RestraintEvaluator {
    pub fn new(rules: RuleSet) -> Self {
        Self {
            rules: RwLock::new(Arc::new(rules)),
        }
    }

    /// Load rules from TOML, falling back to the defaults on any error.
    pub fn from_toml_or_defaults(raw: &str) -> Self {
        match RuleSet::from_toml(raw) {
            Ok(rules) => Self::new(rules),
            Err(e) => {
                warn!(error = %e, "failed to load restraint rules, using defaults");
                Self::new(RuleSet::defaults())
            }
        }
    }

    /// Current rule-set snapshot.
    pub fn snapshot(&self) -> Arc<RuleSet> {
        self.rules
            .read()
            .map(|guard| Arc::clone(&guard))
            .unwrap_or_else(|poisoned| Arc::clone(&poisoned.into_inner()))
    }

    /// Replace the rule set atomically.
    pub fn replace(&self, rules: RuleSet) {
        let next = Arc::new(rules);
        match self.rules.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
    }

    /// Evaluate a draft against the current snapshot, consulting the
    /// workflow's approval cache for previously settled drafts.
    pub fn evaluate(&self, ctx: &DraftContext<'_>, cache: &ApprovalCache) -> RestraintDecision {
        let mut decision = self.snapshot().evaluate(ctx);

        if decision.disposition == Disposition::AwaitingApproval {
            match cache.lookup(ctx.tool, ctx.target) {
                Some(true) => {
                    decision.disposition = if decision.overrides.is_empty() {
                        Disposition::Allowed
                    } else {
                        Disposition::AllowedWithMitigations
                    };
                    decision
                        .reasons
                        .push("approval previously granted in this workflow".to_owned());
                }
                Some(false) => {
                    decision.disposition = Disposition::Denied;
                    decision
                        .reasons
                        .push("approval previously denied in this workflow".to_owned());
                }
                None => {}
            }
        }

        decision
    }
}
