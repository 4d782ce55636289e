//! Static tool catalog: image references, argv builders, output parsers,
//! and safety metadata for every tool the orchestrator can run.
//!
//! The catalog is immutable after load and is the injection seam for
//! tests: a fake container runner plus these specs fully describes an
//! executable tool without touching a registry.

pub mod parsers;

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::types::{Finding, ParamMap, PhaseName};

/// How aggressive a tool is toward the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SafetyClass {
    /// Observes without sending attack traffic (DNS, TLS metadata).
    Passive,
    /// Sends probe traffic but no exploit payloads.
    Active,
    /// Sends exploit payloads; only legal in the exploit phase.
    Intrusive,
}

/// Builds the container argv from a resolved parameter map.
pub type ArgvBuilder = fn(&ParamMap) -> Vec<String>;

/// Parses tool stdout into typed findings.
pub type OutputParser = fn(&str) -> Vec<Finding>;

/// One catalog entry.
#[derive(Debug, Clone)]
pub struct ToolSpec {
    pub name: String,
    /// Container image reference, without registry mirror prefix.
    pub image: String,
    pub description: String,
    /// Phases in which this tool may be scheduled.
    pub phases: Vec<PhaseName>,
    pub safety_class: SafetyClass,
    /// OWASP category attached to findings that carry none of their own.
    pub owasp: Option<String>,
    /// Whether the tool needs workflow credentials to be useful.
    pub auth_required: bool,
    /// Batch-capable tools receive a joined target list in one run;
    /// all others get per-element fan-out.
    pub batch_capable: bool,
    pub default_timeout: Duration,
    pub argv: ArgvBuilder,
    pub parser: OutputParser,
}

impl ToolSpec {
    /// Whether the tool is allowed in the given phase.
    pub fn allowed_in(&self, phase: PhaseName) -> bool {
        self.phases.contains(&phase)
    }
}

/// Immutable-after-load table of tool specs.
#[derive(Debug, Clone, Default)]
pub struct ToolCatalog {
    tools: HashMap<String, ToolSpec>,
}

impl ToolCatalog {
    /// Empty catalog (tests register their own specs).
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in production tool set.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        for spec in builtin_specs() {
            catalog.register(spec);
        }
        catalog
    }

    /// Register or replace a tool spec.
    pub fn register(&mut self, spec: ToolSpec) {
        self.tools.insert(spec.name.clone(), spec);
    }

    /// Look up a tool by name.
    pub fn get(&self, name: &str) -> Option<&ToolSpec> {
        self.tools.get(name)
    }

    /// Whether a tool exists.
    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Sorted tool names (stable output for planner requests and CLI).
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of tools allowed in a phase, sorted.
    pub fn names_for_phase(&self, phase: PhaseName) -> Vec<String> {
        let mut names: Vec<String> = self
            .tools
            .values()
            .filter(|spec| spec.allowed_in(phase))
            .map(|spec| spec.name.clone())
            .collect();
        names.sort();
        names
    }
}

/// Fetch a string parameter, rendering lists to comma-joined form.
fn param(params: &ParamMap, key: &str) -> Option<String> {
    params.get(key).map(crate::types::render_param_value)
}

fn param_or(params: &ParamMap, key: &str, default: &str) -> String {
    param(params, key).unwrap_or_else(|| default.to_owned())
}

fn builtin_specs() -> Vec<ToolSpec> {
    vec![
        ToolSpec {
            name: "subdomain-scanner".to_owned(),
            image: "projectdiscovery/subfinder:latest".to_owned(),
            description: "Passive subdomain enumeration".to_owned(),
            phases: vec![PhaseName::Recon],
            safety_class: SafetyClass::Passive,
            owasp: None,
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(300),
            argv: |p| {
                vec![
                    "-d".to_owned(),
                    param_or(p, "target", ""),
                    "-silent".to_owned(),
                ]
            },
            parser: parsers::parse_subdomains,
        },
        ToolSpec {
            name: "port-scanner".to_owned(),
            image: "instrumentisto/nmap:latest".to_owned(),
            description: "TCP port and service discovery".to_owned(),
            phases: vec![PhaseName::Recon],
            safety_class: SafetyClass::Active,
            owasp: None,
            auth_required: false,
            batch_capable: true,
            default_timeout: Duration::from_secs(600),
            argv: |p| {
                let mut argv = vec![
                    "-sT".to_owned(),
                    "-sV".to_owned(),
                    "--top-ports".to_owned(),
                    param_or(p, "top_ports", "1000"),
                ];
                if let Some(rate) = param(p, "rate_limit") {
                    argv.push("--max-rate".to_owned());
                    argv.push(rate);
                }
                argv.push(param_or(p, "target", ""));
                argv
            },
            parser: parsers::parse_ports,
        },
        ToolSpec {
            name: "directory-scanner".to_owned(),
            image: "ghcr.io/oj/gobuster:latest".to_owned(),
            description: "Directory and file brute-forcing".to_owned(),
            phases: vec![PhaseName::Recon, PhaseName::Analyze],
            safety_class: SafetyClass::Active,
            owasp: Some("A01:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(600),
            argv: |p| {
                let mut argv = vec![
                    "dir".to_owned(),
                    "-u".to_owned(),
                    param_or(p, "target", ""),
                    "-w".to_owned(),
                    param_or(p, "wordlist", "/wordlists/common.txt"),
                    "-q".to_owned(),
                ];
                if let Some(rate) = param(p, "rate_limit") {
                    argv.push("--delay".to_owned());
                    argv.push(format!("{rate}ms"));
                }
                argv
            },
            parser: parsers::parse_directories,
        },
        ToolSpec {
            name: "tech-fingerprint".to_owned(),
            image: "projectdiscovery/httpx:latest".to_owned(),
            description: "HTTP technology fingerprinting".to_owned(),
            phases: vec![PhaseName::Recon, PhaseName::Analyze],
            safety_class: SafetyClass::Passive,
            owasp: Some("A06:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(180),
            argv: |p| {
                vec![
                    "-u".to_owned(),
                    param_or(p, "target", ""),
                    "-td".to_owned(),
                    "-sc".to_owned(),
                    "-silent".to_owned(),
                ]
            },
            parser: parsers::parse_tech,
        },
        ToolSpec {
            name: "ssl-checker".to_owned(),
            image: "drwetter/testssl.sh:latest".to_owned(),
            description: "TLS configuration and vulnerability assessment".to_owned(),
            phases: vec![PhaseName::Analyze],
            safety_class: SafetyClass::Passive,
            owasp: Some("A02:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(300),
            argv: |p| {
                vec![
                    "--quiet".to_owned(),
                    "--severity".to_owned(),
                    "LOW".to_owned(),
                    param_or(p, "target", ""),
                ]
            },
            parser: parsers::parse_ssl,
        },
        ToolSpec {
            name: "header-analyzer".to_owned(),
            image: "ghcr.io/straylight/header-audit:latest".to_owned(),
            description: "Security header audit".to_owned(),
            phases: vec![PhaseName::Analyze],
            safety_class: SafetyClass::Passive,
            owasp: Some("A05:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(120),
            argv: |p| vec!["--url".to_owned(), param_or(p, "target", "")],
            parser: parsers::parse_headers,
        },
        ToolSpec {
            name: "api-discovery".to_owned(),
            image: "ghcr.io/straylight/api-discovery:latest".to_owned(),
            description: "REST/GraphQL endpoint discovery".to_owned(),
            phases: vec![PhaseName::Analyze],
            safety_class: SafetyClass::Active,
            owasp: Some("A01:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(300),
            argv: |p| {
                vec![
                    "--base-url".to_owned(),
                    param_or(p, "target", ""),
                    "--format".to_owned(),
                    "json".to_owned(),
                ]
            },
            parser: parsers::parse_json_findings,
        },
        ToolSpec {
            name: "sql-injection".to_owned(),
            image: "parrotsec/sqlmap:latest".to_owned(),
            description: "SQL injection detection and exploitation".to_owned(),
            phases: vec![PhaseName::Analyze, PhaseName::Exploit],
            safety_class: SafetyClass::Intrusive,
            owasp: Some("A03:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(900),
            argv: |p| {
                let mut argv = vec![
                    "-u".to_owned(),
                    param_or(p, "target", ""),
                    "--batch".to_owned(),
                    "--level".to_owned(),
                    param_or(p, "intrusive_level", "1"),
                ];
                if let Some(rate) = param(p, "rate_limit") {
                    argv.push("--safe-freq".to_owned());
                    argv.push(rate);
                }
                argv
            },
            parser: parsers::parse_json_findings,
        },
        ToolSpec {
            name: "xss-scanner".to_owned(),
            image: "hahwul/dalfox:latest".to_owned(),
            description: "Reflected and stored XSS scanning".to_owned(),
            phases: vec![PhaseName::Analyze, PhaseName::Exploit],
            safety_class: SafetyClass::Intrusive,
            owasp: Some("A03:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(600),
            argv: |p| {
                vec![
                    "url".to_owned(),
                    param_or(p, "target", ""),
                    "--format".to_owned(),
                    "json".to_owned(),
                ]
            },
            parser: parsers::parse_json_findings,
        },
        ToolSpec {
            name: "jwt-analyzer".to_owned(),
            image: "ticarpi/jwt_tool:latest".to_owned(),
            description: "JWT structure and signature weakness analysis".to_owned(),
            phases: vec![PhaseName::Analyze],
            safety_class: SafetyClass::Passive,
            owasp: Some("A07:2021".to_owned()),
            auth_required: true,
            batch_capable: false,
            default_timeout: Duration::from_secs(120),
            argv: |p| {
                vec![
                    "-t".to_owned(),
                    param_or(p, "target", ""),
                    "-M".to_owned(),
                    "pb".to_owned(),
                ]
            },
            parser: parsers::parse_json_findings,
        },
        ToolSpec {
            name: "auth-bypass".to_owned(),
            image: "ghcr.io/straylight/auth-probe:latest".to_owned(),
            description: "Authentication and access-control bypass probing".to_owned(),
            phases: vec![PhaseName::Exploit],
            safety_class: SafetyClass::Intrusive,
            owasp: Some("A01:2021".to_owned()),
            auth_required: true,
            batch_capable: false,
            default_timeout: Duration::from_secs(600),
            argv: |p| {
                let mut argv = vec!["--url".to_owned(), param_or(p, "target", "")];
                if let Some(username) = param(p, "username") {
                    argv.push("--user".to_owned());
                    argv.push(username);
                }
                argv
            },
            parser: parsers::parse_json_findings,
        },
        ToolSpec {
            name: "api-fuzzer".to_owned(),
            image: "ffuf/ffuf:latest".to_owned(),
            description: "API parameter and payload fuzzing".to_owned(),
            phases: vec![PhaseName::Exploit],
            safety_class: SafetyClass::Intrusive,
            owasp: Some("A03:2021".to_owned()),
            auth_required: false,
            batch_capable: false,
            default_timeout: Duration::from_secs(900),
            argv: |p| {
                let mut argv = vec![
                    "-u".to_owned(),
                    format!("{}/FUZZ", param_or(p, "target", "")),
                    "-w".to_owned(),
                    param_or(p, "wordlist", "/wordlists/api.txt"),
                    "-of".to_owned(),
                    "json".to_owned(),
                ];
                if let Some(limit) = param(p, "payload_limit") {
                    argv.push("-maxlen".to_owned());
                    argv.push(limit);
                }
                if let Some(rate) = param(p, "rate_limit") {
                    argv.push("-rate".to_owned());
                    argv.push(rate);
                }
                argv
            },
            parser: parsers::parse_json_findings,
        },
    ]
}
