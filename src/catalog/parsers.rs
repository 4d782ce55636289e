//! Tool output parsers: raw stdout → typed findings.
//!
//! Every parser is total. Unrecognized output yields an empty finding
//! list, never an error; the invocation itself still records the raw
//! output for operators.

use regex::Regex;
use serde::Deserialize;

use crate::types::{Finding, Severity};

/// Maximum characters of raw evidence carried on a single finding.
const EVIDENCE_MAX_CHARS: usize = 2000;

/// Truncate evidence to a bounded, char-safe excerpt.
fn bound_evidence(raw: &str) -> String {
    raw.chars().take(EVIDENCE_MAX_CHARS).collect()
}

fn clamp_confidence(value: f64) -> f64 {
    if value.is_finite() {
        value.clamp(0.0, 1.0)
    } else {
        0.5
    }
}

/// Parse newline-separated hostnames from a subdomain enumerator.
pub fn parse_subdomains(stdout: &str) -> Vec<Finding> {
    let hostname =
        Regex::new(r"^[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?(\.[a-zA-Z0-9]([a-zA-Z0-9-]*[a-zA-Z0-9])?)+$")
            .expect("static regex");

    stdout
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && hostname.is_match(line))
        .map(|host| Finding {
            kind: "subdomain".to_owned(),
            severity: Severity::Info,
            confidence: 1.0,
            title: format!("Subdomain discovered: {host}"),
            description: format!("{host} resolved during passive enumeration"),
            affected: None,
            evidence: None,
            owasp: None,
            controls: Vec::new(),
            target_value: Some(host.to_owned()),
        })
        .collect()
}

/// Services whose exposure is itself a weakness.
const RISKY_SERVICES: &[&str] = &["telnet", "ftp", "rlogin", "vnc", "rdp", "smb"];

/// Parse nmap-style service lines: `80/tcp open http nginx 1.25`.
pub fn parse_ports(stdout: &str) -> Vec<Finding> {
    let line_re =
        Regex::new(r"(?m)^(\d{1,5})/(tcp|udp)\s+open\s+(\S+)?(?:\s+(.*))?$").expect("static regex");

    line_re
        .captures_iter(stdout)
        .map(|caps| {
            let port = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            let service = caps.get(3).map(|m| m.as_str().to_owned());
            let banner = caps.get(4).map(|m| m.as_str().trim().to_owned());

            let risky = service
                .as_deref()
                .is_some_and(|s| RISKY_SERVICES.contains(&s));
            let severity = if risky { Severity::Medium } else { Severity::Info };
            let title = match &service {
                Some(s) => format!("Open port {port} ({s})"),
                None => format!("Open port {port}"),
            };

            Finding {
                kind: "open-port".to_owned(),
                severity,
                confidence: 0.9,
                title,
                description: if risky {
                    "Legacy clear-text or remote-access service exposed".to_owned()
                } else {
                    "Service responding on scanned port".to_owned()
                },
                affected: service.clone(),
                evidence: banner.filter(|b| !b.is_empty()).map(|b| bound_evidence(&b)),
                owasp: None,
                controls: Vec::new(),
                target_value: Some(port.to_owned()),
            }
        })
        .collect()
}

/// Paths whose exposure warrants more than informational severity.
const SENSITIVE_PATHS: &[&str] = &["admin", "backup", ".git", ".env", "config", "debug"];

/// Parse gobuster-style hits: `/admin (Status: 200) [Size: 1234]`.
pub fn parse_directories(stdout: &str) -> Vec<Finding> {
    let line_re =
        Regex::new(r"(?m)^(/\S*)\s+\(Status:\s*(\d{3})\)").expect("static regex");

    line_re
        .captures_iter(stdout)
        .filter_map(|caps| {
            let path = caps.get(1)?.as_str();
            let status: u16 = caps.get(2)?.as_str().parse().ok()?;
            if !(200..400).contains(&status) {
                return None;
            }

            let sensitive = SENSITIVE_PATHS
                .iter()
                .any(|marker| path.to_lowercase().contains(marker));
            Some(Finding {
                kind: "endpoint".to_owned(),
                severity: if sensitive { Severity::Medium } else { Severity::Info },
                confidence: 0.9,
                title: format!("Accessible path {path} ({status})"),
                description: if sensitive {
                    "Sensitive-looking path responds without rejection".to_owned()
                } else {
                    "Path enumerated via wordlist".to_owned()
                },
                affected: Some(path.to_owned()),
                evidence: None,
                owasp: sensitive.then(|| "A01:2021".to_owned()),
                controls: Vec::new(),
                target_value: Some(path.to_owned()),
            })
        })
        .collect()
}

/// Parse httpx-style fingerprint lines: `https://a.example.com [200] [nginx,PHP]`.
pub fn parse_tech(stdout: &str) -> Vec<Finding> {
    let bracket_re = Regex::new(r"\[([^\]]+)\]").expect("static regex");
    let mut findings = Vec::new();

    for line in stdout.lines() {
        let url = line.split_whitespace().next().unwrap_or_default();
        for caps in bracket_re.captures_iter(line) {
            let inner = caps.get(1).map(|m| m.as_str()).unwrap_or_default();
            // Skip status-code brackets.
            if inner.chars().all(|c| c.is_ascii_digit()) {
                continue;
            }
            for tech in inner.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                findings.push(Finding {
                    kind: "technology".to_owned(),
                    severity: Severity::Info,
                    confidence: 0.8,
                    title: format!("Technology detected: {tech}"),
                    description: format!("{tech} fingerprinted on {url}"),
                    affected: Some(url.to_owned()),
                    evidence: None,
                    owasp: None,
                    controls: Vec::new(),
                    target_value: Some(tech.to_owned()),
                });
            }
        }
    }

    findings
}

/// Parse testssl-style assessment lines.
///
/// Lines containing `VULNERABLE` map to high severity; deprecated or
/// weak offerings map to medium.
pub fn parse_ssl(stdout: &str) -> Vec<Finding> {
    let mut findings = Vec::new();

    for line in stdout.lines() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let upper = trimmed.to_uppercase();
        let severity = if upper.contains("VULNERABLE") && !upper.contains("NOT VULNERABLE") {
            Some(Severity::High)
        } else if upper.contains("DEPRECATED") || upper.contains("WEAK") {
            Some(Severity::Medium)
        } else {
            None
        };

        if let Some(severity) = severity {
            let subject = trimmed
                .split_whitespace()
                .take(2)
                .collect::<Vec<_>>()
                .join(" ");
            findings.push(Finding {
                kind: "tls-weakness".to_owned(),
                severity,
                confidence: 0.85,
                title: format!("TLS weakness: {subject}"),
                description: trimmed.to_owned(),
                affected: None,
                evidence: Some(bound_evidence(trimmed)),
                owasp: Some("A02:2021".to_owned()),
                controls: vec!["CC6.7".to_owned()],
                target_value: None,
            });
        }
    }

    findings
}

/// Parse header-audit output lines: `missing: Strict-Transport-Security`.
pub fn parse_headers(stdout: &str) -> Vec<Finding> {
    stdout
        .lines()
        .filter_map(|line| {
            let header = line.trim().strip_prefix("missing:")?.trim();
            if header.is_empty() {
                return None;
            }
            let severity = if header.eq_ignore_ascii_case("strict-transport-security") {
                Severity::Medium
            } else {
                Severity::Low
            };
            Some(Finding {
                kind: "missing-header".to_owned(),
                severity,
                confidence: 1.0,
                title: format!("Missing security header: {header}"),
                description: format!("{header} is not set on responses"),
                affected: Some(header.to_owned()),
                evidence: None,
                owasp: Some("A05:2021".to_owned()),
                controls: Vec::new(),
                target_value: None,
            })
        })
        .collect()
}

/// Wire shape for scanners that emit structured findings.
#[derive(Debug, Deserialize)]
struct RawFinding {
    #[serde(alias = "kind")]
    #[serde(rename = "type")]
    type_tag: Option<String>,
    severity: Option<String>,
    title: Option<String>,
    #[serde(default)]
    description: String,
    affected: Option<String>,
    confidence: Option<f64>,
    evidence: Option<String>,
    owasp: Option<String>,
    #[serde(default)]
    controls: Vec<String>,
    target: Option<String>,
}

impl RawFinding {
    fn normalize(self) -> Finding {
        let severity = self
            .severity
            .as_deref()
            .and_then(|s| s.parse::<Severity>().ok())
            .unwrap_or(Severity::Info);
        let kind = self.type_tag.unwrap_or_else(|| "observation".to_owned());
        let title = self.title.unwrap_or_else(|| kind.clone());
        Finding {
            kind,
            severity,
            confidence: clamp_confidence(self.confidence.unwrap_or(0.5)),
            title,
            description: self.description,
            affected: self.affected,
            evidence: self.evidence.map(|e| bound_evidence(&e)),
            owasp: self.owasp,
            controls: self.controls,
            target_value: self.target,
        }
    }
}

/// Parse structured scanner output: a JSON array, an object with a
/// `findings` array, or JSON-lines. Non-JSON output parses to nothing.
pub fn parse_json_findings(stdout: &str) -> Vec<Finding> {
    let trimmed = stdout.trim();

    if let Ok(raw) = serde_json::from_str::<Vec<RawFinding>>(trimmed) {
        return raw.into_iter().map(RawFinding::normalize).collect();
    }

    #[derive(Deserialize)]
    struct Wrapper {
        findings: Vec<RawFinding>,
    }
    if let Ok(wrapper) = serde_json::from_str::<Wrapper>(trimmed) {
        return wrapper
            .findings
            .into_iter()
            .map(RawFinding::normalize)
            .collect();
    }

    trimmed
        .lines()
        .filter_map(|line| serde_json::from_str::<RawFinding>(line.trim()).ok())
        .map(RawFinding::normalize)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_subdomains() {
        let stdout = "a.example.com\nb.example.com\n\nnot a hostname!\napi.example.com\n";
        let findings = parse_subdomains(stdout);
        assert_eq!(findings.len(), 3);
        assert_eq!(findings[0].kind, "subdomain");
        assert_eq!(findings[0].target_value.as_deref(), Some("a.example.com"));
        assert_eq!(findings[2].target_value.as_deref(), Some("api.example.com"));
    }

    #[test]
    fn test_parse_ports_with_risky_service() {
        let stdout = "\
PORT     STATE    SERVICE  VERSION
22/tcp   open     ssh      OpenSSH 9.6
23/tcp   open     telnet
80/tcp   open     http     nginx 1.25.3
443/tcp  filtered https
";
        let findings = parse_ports(stdout);
        assert_eq!(findings.len(), 3, "filtered ports must not count");
        assert_eq!(findings[0].target_value.as_deref(), Some("22"));
        assert_eq!(findings[1].severity, Severity::Medium, "telnet is risky");
        assert_eq!(findings[2].evidence.as_deref(), Some("nginx 1.25.3"));
    }

    #[test]
    fn test_parse_directories() {
        let stdout = "\
/index.html (Status: 200) [Size: 1024]
/admin (Status: 200) [Size: 890]
/missing (Status: 404) [Size: 0]
/login (Status: 302) [Size: 0]
";
        let findings = parse_directories(stdout);
        assert_eq!(findings.len(), 3, "404 must be excluded");
        let admin = findings
            .iter()
            .find(|f| f.target_value.as_deref() == Some("/admin"))
            .expect("admin finding");
        assert_eq!(admin.severity, Severity::Medium);
        assert_eq!(admin.owasp.as_deref(), Some("A01:2021"));
    }

    #[test]
    fn test_parse_tech() {
        let stdout = "https://a.example.com [200] [nginx,PHP 8.2]\n";
        let findings = parse_tech(stdout);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].target_value.as_deref(), Some("nginx"));
        assert_eq!(findings[1].target_value.as_deref(), Some("PHP 8.2"));
        assert_eq!(findings[0].affected.as_deref(), Some("https://a.example.com"));
    }

    #[test]
    fn test_parse_ssl() {
        let stdout = "\
 SWEET32 (CVE-2016-2183)    VULNERABLE, uses 64 bit block ciphers
 Heartbleed (CVE-2014-0160) not vulnerable (OK)
 TLS 1.0                    offered (deprecated)
 TLS 1.3                    offered (OK)
";
        let findings = parse_ssl(stdout);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::High);
        assert_eq!(findings[1].severity, Severity::Medium);
        assert_eq!(findings[0].owasp.as_deref(), Some("A02:2021"));
    }

    #[test]
    fn test_parse_headers() {
        let stdout = "\
present: X-Frame-Options
missing: Content-Security-Policy
missing: Strict-Transport-Security
";
        let findings = parse_headers(stdout);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Low);
        assert_eq!(findings[1].severity, Severity::Medium);
    }

    #[test]
    fn test_parse_json_findings_array() {
        let stdout = r#"[
            {"type":"sql-injection","severity":"critical","title":"SQLi in id param",
             "description":"boolean-based blind","affected":"/item?id=1","confidence":0.95},
            {"type":"xss","severity":"bogus-severity","title":"reflected"}
        ]"#;
        let findings = parse_json_findings(stdout);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].severity, Severity::Critical);
        assert_eq!(findings[0].kind, "sql-injection");
        assert_eq!(
            findings[1].severity,
            Severity::Info,
            "unknown severities normalize to info"
        );
    }

    #[test]
    fn test_parse_json_findings_wrapper_and_lines() {
        let wrapped = r#"{"findings":[{"type":"jwt-weak-secret","severity":"high","title":"HS256 brute-forceable"}]}"#;
        assert_eq!(parse_json_findings(wrapped).len(), 1);

        let jsonl = "\
{\"type\":\"endpoint\",\"severity\":\"info\",\"title\":\"/v1/users\",\"target\":\"/v1/users\"}
garbage line
{\"type\":\"endpoint\",\"severity\":\"info\",\"title\":\"/v1/orders\",\"target\":\"/v1/orders\"}
";
        let findings = parse_json_findings(jsonl);
        assert_eq!(findings.len(), 2);
        assert_eq!(findings[0].target_value.as_deref(), Some("/v1/users"));
    }

    #[test]
    fn test_parse_json_findings_non_json() {
        assert!(parse_json_findings("plain text output").is_empty());
    }

    #[test]
    fn test_confidence_clamped() {
        let stdout = r#"[{"type":"x","severity":"low","title":"t","confidence":7.5}]"#;
        let findings = parse_json_findings(stdout);
        assert_eq!(findings[0].confidence, 1.0);
    }

    #[test]
    fn test_evidence_bounded() {
        let big = "x".repeat(10_000);
        let stdout = format!(
            r#"[{{"type":"x","severity":"low","title":"t","evidence":"{big}"}}]"#
        );
        let findings = parse_json_findings(&stdout);
        let evidence = findings[0].evidence.as_ref().expect("evidence");
        assert_eq!(evidence.chars().count(), EVIDENCE_MAX_CHARS);
    }
}
