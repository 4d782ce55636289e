//! HTTP implementation of the reasoning service contract.
//!
//! POSTs the plan context as JSON and walks the response body
//! defensively: a structurally broken body is `Malformed`, but benign
//! oddities (unknown safety checks, missing optional fields) are
//! tolerated and logged so a chatty service cannot stall a workflow.

use serde_json::Value;
use tracing::warn;

use crate::types::{ParamMap, Priority, Recommendation};

use super::{PlanContext, PlannerError, ReasoningApi, Strategy};

/// Reasoning service client over HTTP.
#[derive(Debug, Clone)]
pub struct ReasoningServiceClient {
    base_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl ReasoningServiceClient {
    /// Create a client for the service at `base_url`.
    pub fn new(base_url: &str, api_key: Option<String>) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait::async_trait]
impl ReasoningApi for ReasoningServiceClient {
    async fn plan(&self, ctx: &PlanContext) -> Result<Strategy, PlannerError> {
        let url = format!("{}/v1/plan", self.base_url);

        let mut request = self.client.post(&url).json(ctx);
        if let Some(key) = &self.api_key {
            request = request.header("authorization", format!("Bearer {key}"));
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                PlannerError::Unavailable("request timed out".to_owned())
            } else {
                PlannerError::Unavailable(e.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(PlannerError::Unavailable(format!("HTTP {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| PlannerError::Malformed(e.to_string()))?;

        parse_strategy(&body)
    }
}

/// Parse the service response shape:
/// `{ reasoning, recommendations[], confidenceLevel, estimatedDuration,
///    safetyConsiderations[], nextPhaseConditions?[] }`.
pub fn parse_strategy(body: &Value) -> Result<Strategy, PlannerError> {
    let Some(raw_recommendations) = body.get("recommendations").and_then(Value::as_array) else {
        return Err(PlannerError::Malformed(
            "missing recommendations array".to_owned(),
        ));
    };

    let recommendations: Vec<Recommendation> = raw_recommendations
        .iter()
        .filter_map(parse_recommendation)
        .collect();

    Ok(Strategy {
        reasoning: body
            .get("reasoning")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        recommendations,
        confidence: body
            .get("confidenceLevel")
            .and_then(Value::as_f64)
            .unwrap_or(0.5),
        expected_duration_ms: body
            .get("estimatedDuration")
            .and_then(Value::as_u64)
            .unwrap_or(0),
        safety_considerations: body
            .get("safetyConsiderations")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .map(ToOwned::to_owned)
                    .collect()
            })
            .unwrap_or_default(),
    })
}

fn parse_recommendation(value: &Value) -> Option<Recommendation> {
    let tool = value.get("tool").and_then(Value::as_str)?;
    if tool.is_empty() {
        return None;
    }

    let params: ParamMap = value
        .get("parameters")
        .and_then(Value::as_object)
        .map(|object| {
            object
                .iter()
                .map(|(key, val)| (key.clone(), val.clone()))
                .collect()
        })
        .unwrap_or_default();

    let safety_checks = value
        .get("safetyChecks")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .filter_map(|tag| match tag.parse() {
                    Ok(check) => Some(check),
                    Err(_) => {
                        warn!(tag, "dropping unknown safety check from planner");
                        None
                    }
                })
                .collect()
        })
        .unwrap_or_default();

    let priority = value
        .get("priority")
        .and_then(Value::as_str)
        .and_then(|p| p.parse::<Priority>().ok())
        .unwrap_or(Priority::Medium);

    Some(Recommendation {
        tool: tool.to_owned(),
        purpose: value
            .get("purpose")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        expected_outcome: value
            .get("expectedOutcome")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned(),
        params,
        safety_checks,
        priority,
        owasp_hint: value
            .get("owaspCategory")
            .and_then(Value::as_str)
            .map(ToOwned::to_owned),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SafetyCheck;
    use serde_json::json;

    #[test]
    fn test_parse_full_strategy() {
        let body = json!({
            "reasoning": "start with the surface",
            "recommendations": [
                {
                    "tool": "subdomain-scanner",
                    "purpose": "map the subdomain surface",
                    "expectedOutcome": "list of live subdomains",
                    "parameters": {"target": "example.com"},
                    "safetyChecks": ["rate-limiting", "non-intrusive"],
                    "priority": "high",
                    "owaspCategory": "A05:2021"
                }
            ],
            "confidenceLevel": 0.85,
            "estimatedDuration": 300000,
            "safetyConsiderations": ["passive techniques only"]
        });

        let strategy = parse_strategy(&body).expect("parse");
        assert_eq!(strategy.reasoning, "start with the surface");
        assert_eq!(strategy.confidence, 0.85);
        assert_eq!(strategy.expected_duration_ms, 300_000);
        assert_eq!(strategy.safety_considerations.len(), 1);

        let rec = &strategy.recommendations[0];
        assert_eq!(rec.tool, "subdomain-scanner");
        assert_eq!(rec.priority, Priority::High);
        assert_eq!(
            rec.safety_checks,
            vec![SafetyCheck::RateLimiting, SafetyCheck::NonIntrusive]
        );
        assert_eq!(rec.owasp_hint.as_deref(), Some("A05:2021"));
        assert_eq!(rec.params.get("target"), Some(&json!("example.com")));
    }

    #[test]
    fn test_missing_recommendations_is_malformed() {
        let body = json!({"reasoning": "hmm"});
        assert!(matches!(
            parse_strategy(&body),
            Err(PlannerError::Malformed(_))
        ));
    }

    #[test]
    fn test_unknown_safety_checks_dropped_not_fatal() {
        let body = json!({
            "recommendations": [
                {
                    "tool": "port-scanner",
                    "safetyChecks": ["rate-limiting", "quantum-stealth"],
                    "priority": "medium"
                }
            ]
        });
        let strategy = parse_strategy(&body).expect("parse");
        assert_eq!(
            strategy.recommendations[0].safety_checks,
            vec![SafetyCheck::RateLimiting]
        );
    }

    #[test]
    fn test_toolless_recommendation_skipped() {
        let body = json!({
            "recommendations": [
                {"purpose": "no tool named"},
                {"tool": "port-scanner"}
            ]
        });
        let strategy = parse_strategy(&body).expect("parse");
        assert_eq!(strategy.recommendations.len(), 1);
    }

    #[test]
    fn test_unknown_priority_defaults_to_medium() {
        let body = json!({
            "recommendations": [{"tool": "port-scanner", "priority": "urgent!!"}]
        });
        let strategy = parse_strategy(&body).expect("parse");
        assert_eq!(strategy.recommendations[0].priority, Priority::Medium);
    }

    #[test]
    fn test_defaults_for_missing_optional_fields() {
        let body = json!({"recommendations": []});
        let strategy = parse_strategy(&body).expect("parse");
        assert_eq!(strategy.confidence, 0.5);
        assert_eq!(strategy.expected_duration_ms, 0);
        assert!(strategy.reasoning.is_empty());
    }
}
