//! Keyword fallback recommender.
//!
//! When the reasoning service is unavailable or malformed, this
//! produces the minimal exhaustive enumeration set for recon and a
//! keyword-matched analysis set, enough to keep a workflow moving
//! without any external intelligence.

use crate::catalog::ToolCatalog;
use crate::types::{ParamMap, PhaseName, Priority, Recommendation};

use super::{PlanContext, Strategy};

/// Baseline enumeration tools that drive the recon phase.
const RECON_BASELINE: &[&str] = &[
    "subdomain-scanner",
    "port-scanner",
    "directory-scanner",
    "tech-fingerprint",
];

/// Analysis tools that apply to almost any web target.
const ANALYZE_BASELINE: &[&str] = &["ssl-checker", "header-analyzer", "tech-fingerprint"];

/// Intent keywords mapped to extra tools for the analyze phase.
const KEYWORD_TOOLS: &[(&str, &str)] = &[
    ("sql", "sql-injection"),
    ("injection", "sql-injection"),
    ("xss", "xss-scanner"),
    ("script", "xss-scanner"),
    ("api", "api-discovery"),
    ("rest", "api-discovery"),
    ("graphql", "api-discovery"),
    ("jwt", "jwt-analyzer"),
    ("token", "jwt-analyzer"),
    ("auth", "jwt-analyzer"),
    ("tls", "ssl-checker"),
    ("ssl", "ssl-checker"),
    ("certificate", "ssl-checker"),
];

/// Produce a minimal strategy without consulting any service.
pub fn baseline(ctx: &PlanContext, catalog: &ToolCatalog) -> Strategy {
    let mut tools: Vec<&str> = Vec::new();

    match ctx.phase {
        PhaseName::Recon => {
            tools.extend_from_slice(RECON_BASELINE);
            // Keyword matches widen recon when they name recon-capable tools.
            tools.extend(keyword_matches(&ctx.user_intent));
        }
        PhaseName::Analyze => {
            tools.extend_from_slice(ANALYZE_BASELINE);
            tools.extend(keyword_matches(&ctx.user_intent));
        }
        // Exploitation is never improvised: without a planner the
        // exploit phase gets no recommendations and the workflow
        // completes after analysis.
        PhaseName::Exploit => {}
    }

    let mut seen = std::collections::HashSet::new();
    let recommendations: Vec<Recommendation> = tools
        .into_iter()
        .filter(|tool| seen.insert(*tool))
        .filter(|tool| {
            catalog
                .get(tool)
                .is_some_and(|spec| spec.allowed_in(ctx.phase))
        })
        .map(|tool| {
            let mut params = ParamMap::new();
            params.insert(
                "target".to_owned(),
                serde_json::Value::String(ctx.target.clone()),
            );
            Recommendation {
                tool: tool.to_owned(),
                purpose: format!("baseline {} coverage", ctx.phase),
                expected_outcome: "enumerated attack surface".to_owned(),
                params,
                safety_checks: Vec::new(),
                priority: Priority::Medium,
                owasp_hint: None,
            }
        })
        .collect();

    Strategy {
        reasoning: "reasoning service unavailable; using keyword baseline".to_owned(),
        recommendations,
        confidence: 0.3,
        expected_duration_ms: 0,
        safety_considerations: vec!["baseline set only; no adaptive planning".to_owned()],
    }
}

fn keyword_matches(intent: &str) -> Vec<&'static str> {
    let lowered = intent.to_lowercase();
    KEYWORD_TOOLS
        .iter()
        .filter(|(keyword, _)| lowered.contains(keyword))
        .map(|(_, tool)| *tool)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Constraints;
    use uuid::Uuid;

    fn ctx(phase: PhaseName, intent: &str) -> PlanContext {
        PlanContext {
            workflow_id: Uuid::nil(),
            target: "example.com".to_owned(),
            user_intent: intent.to_owned(),
            phase,
            prior_findings: Vec::new(),
            completed_tools: Vec::new(),
            available_tools: Vec::new(),
            constraints: Constraints::default(),
            critique: None,
        }
    }

    #[test]
    fn test_recon_baseline_set() {
        let strategy = baseline(&ctx(PhaseName::Recon, "scan"), &ToolCatalog::builtin());
        let tools: Vec<&str> = strategy
            .recommendations
            .iter()
            .map(|r| r.tool.as_str())
            .collect();
        assert_eq!(
            tools,
            vec![
                "subdomain-scanner",
                "port-scanner",
                "directory-scanner",
                "tech-fingerprint"
            ]
        );
    }

    #[test]
    fn test_analyze_keywords_add_tools() {
        let strategy = baseline(
            &ctx(PhaseName::Analyze, "check for SQL injection in the API"),
            &ToolCatalog::builtin(),
        );
        let tools: Vec<&str> = strategy
            .recommendations
            .iter()
            .map(|r| r.tool.as_str())
            .collect();
        assert!(tools.contains(&"sql-injection"));
        assert!(tools.contains(&"api-discovery"));
        assert!(tools.contains(&"ssl-checker"), "baseline still present");
    }

    #[test]
    fn test_exploit_fallback_is_empty() {
        let strategy = baseline(&ctx(PhaseName::Exploit, "exploit it"), &ToolCatalog::builtin());
        assert!(strategy.recommendations.is_empty());
    }

    #[test]
    fn test_all_recommendations_target_the_workflow_target() {
        let strategy = baseline(&ctx(PhaseName::Recon, "scan"), &ToolCatalog::builtin());
        for rec in &strategy.recommendations {
            assert_eq!(
                rec.params.get("target"),
                Some(&serde_json::Value::String("example.com".to_owned()))
            );
        }
    }

    #[test]
    fn test_phase_ineligible_keyword_tools_dropped() {
        // sql-injection is not recon-eligible; the keyword must not
        // smuggle it into recon.
        let strategy = baseline(
            &ctx(PhaseName::Recon, "look for sql injection"),
            &ToolCatalog::builtin(),
        );
        assert!(!strategy
            .recommendations
            .iter()
            .any(|r| r.tool == "sql-injection"));
    }
}
