//! `{{tool.property}}` parameter substitution.
//!
//! String parameter values are parsed once into a typed expression
//! (literal and tool-result-reference segments) and evaluated against
//! the workflow's results map. A reference that cannot be resolved
//! keeps its placeholder text verbatim; downstream tooling is expected
//! to fail gracefully on it.

use std::collections::HashMap;
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::types::ParamMap;

/// Properties addressable on a prior tool result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Property {
    /// Target values extracted from the tool's findings.
    Results,
    /// The tool's raw stdout.
    Output,
}

/// One segment of a parsed parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    /// A `{{tool.property}}` reference, with its original source text
    /// retained for the keep-placeholder rule.
    Ref {
        tool: String,
        property: Property,
        source: String,
    },
}

/// A parsed parameter value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Expression {
    segments: Vec<Segment>,
}

fn reference_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_-]+)\.(results|output)\s*\}\}").expect("static regex")
    })
}

impl Expression {
    /// Parse a string value into literal and reference segments.
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut cursor = 0;

        for caps in reference_regex().captures_iter(input) {
            let whole = caps.get(0).expect("capture 0 always present");
            if whole.start() > cursor {
                segments.push(Segment::Literal(
                    input.get(cursor..whole.start()).unwrap_or_default().to_owned(),
                ));
            }
            let tool = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let property = match caps.get(2).map(|m| m.as_str()) {
                Some("output") => Property::Output,
                _ => Property::Results,
            };
            segments.push(Segment::Ref {
                tool: tool.to_owned(),
                property,
                source: whole.as_str().to_owned(),
            });
            cursor = whole.end();
        }

        if cursor < input.len() {
            segments.push(Segment::Literal(
                input.get(cursor..).unwrap_or_default().to_owned(),
            ));
        }
        if segments.is_empty() {
            segments.push(Segment::Literal(String::new()));
        }

        Self { segments }
    }

    /// Whether the expression contains any reference segment.
    pub fn has_references(&self) -> bool {
        self.segments
            .iter()
            .any(|segment| matches!(segment, Segment::Ref { .. }))
    }

    /// Evaluate against the results map.
    ///
    /// An expression that is exactly one `results` reference evaluates to
    /// the list of target values, which downstream activates per-element
    /// fan-out. Everything else renders to a string; unresolved
    /// references render their placeholder text.
    pub fn resolve(&self, results: &ResultsMap, unresolved: &mut Vec<String>) -> Value {
        if let [Segment::Ref {
            tool,
            property: Property::Results,
            source,
        }] = self.segments.as_slice()
        {
            return match results.get(tool) {
                Some(stored) => Value::Array(
                    stored
                        .targets
                        .iter()
                        .map(|t| Value::String(t.clone()))
                        .collect(),
                ),
                None => {
                    unresolved.push(source.clone());
                    Value::String(source.clone())
                }
            };
        }

        let mut rendered = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => rendered.push_str(text),
                Segment::Ref {
                    tool,
                    property,
                    source,
                } => match (results.get(tool), property) {
                    (Some(stored), Property::Results) => {
                        rendered.push_str(&stored.targets.join(","));
                    }
                    (Some(stored), Property::Output) => rendered.push_str(&stored.output),
                    (None, _) => {
                        unresolved.push(source.clone());
                        rendered.push_str(source);
                    }
                },
            }
        }
        Value::String(rendered)
    }
}

/// Stored result of the last invocation of one tool in one workflow.
#[derive(Debug, Clone, Default)]
pub struct StoredResult {
    /// Target values extracted from the invocation's findings.
    pub targets: Vec<String>,
    /// Raw stdout.
    pub output: String,
}

/// Per-workflow map: tool name → last stored result.
pub type ResultsMap = HashMap<String, StoredResult>;

/// Substitute every string-valued parameter in a map.
///
/// Array values are substituted element-wise; other value types pass
/// through untouched. Returns the resolved map and the list of
/// placeholder texts that could not be resolved.
pub fn substitute_params(params: &ParamMap, results: &ResultsMap) -> (ParamMap, Vec<String>) {
    let mut resolved = ParamMap::new();
    let mut unresolved = Vec::new();

    for (key, value) in params {
        let next = substitute_value(value, results, &mut unresolved);
        resolved.insert(key.clone(), next);
    }

    (resolved, unresolved)
}

fn substitute_value(value: &Value, results: &ResultsMap, unresolved: &mut Vec<String>) -> Value {
    match value {
        Value::String(text) => Expression::parse(text).resolve(results, unresolved),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| substitute_value(item, results, unresolved))
                .collect(),
        ),
        other => other.clone(),
    }
}
