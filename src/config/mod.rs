//! Configuration loading and management.
//!
//! Loads orchestrator configuration from `./config.toml` (or
//! `$STRAYLIGHT_CONFIG_PATH`). Environment variables override file
//! values; file values override defaults.
//!
//! Precedence: env vars > config file > defaults.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::types::PhaseName;

// ── Top-level config ────────────────────────────────────────────

/// Top-level orchestrator configuration loaded from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Execution engine settings (`[engine]`).
    pub engine: EngineConfig,
    /// Container sandbox settings (`[sandbox]`).
    pub sandbox: SandboxConfig,
    /// Per-phase wall-clock budgets (`[phases]`).
    pub phases: PhaseBudgetConfig,
    /// Reasoning service settings (`[planner]`).
    pub planner: PlannerConfig,
    /// Approval gate settings (`[approval]`).
    pub approval: ApprovalConfig,
    /// Retention and persistence settings (`[retention]`, `[paths]`).
    pub retention: RetentionConfig,
    /// Filesystem paths (`[paths]`).
    pub paths: PathsConfig,
}

impl OrchestratorConfig {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$STRAYLIGHT_CONFIG_PATH` or `./config.toml`.
    /// A missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error when a present config file cannot be read or
    /// parsed.
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    fn load_from_file() -> Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: OrchestratorConfig =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(OrchestratorConfig::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        match env("STRAYLIGHT_CONFIG_PATH") {
            Some(p) => PathBuf::from(p),
            None => PathBuf::from("config.toml"),
        }
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability. Invalid values are
    /// ignored with a warning, never fatal.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Engine.
        override_parse(&env, "MAX_CONCURRENT", &mut self.engine.max_concurrent);

        // Sandbox.
        override_parse(&env, "CONTAINER_MEMORY_MB", &mut self.sandbox.memory_mb);
        override_parse(&env, "CONTAINER_CPU_PCT", &mut self.sandbox.cpu_percent);
        if let Some(v) = env("REGISTRY_MIRROR") {
            self.sandbox.registry_mirror = Some(v);
        }

        // Phase budgets.
        override_parse(&env, "PHASE_TIMEOUT_RECON_MS", &mut self.phases.recon_ms);
        override_parse(&env, "PHASE_TIMEOUT_ANALYZE_MS", &mut self.phases.analyze_ms);
        override_parse(&env, "PHASE_TIMEOUT_EXPLOIT_MS", &mut self.phases.exploit_ms);

        // Planner.
        if let Some(v) = env("STRAYLIGHT_PLANNER_URL") {
            self.planner.base_url = Some(v);
        }
        if let Some(v) = env("STRAYLIGHT_PLANNER_API_KEY") {
            self.planner.api_key = Some(v);
        }

        // Approval.
        override_parse(
            &env,
            "STRAYLIGHT_APPROVAL_TIMEOUT_SECS",
            &mut self.approval.timeout_seconds,
        );

        // Retention.
        override_parse(
            &env,
            "WORKFLOW_RETENTION_HOURS",
            &mut self.retention.workflow_hours,
        );

        // Paths.
        if let Some(v) = env("STRAYLIGHT_EVENTS_DB") {
            self.paths.events_db = v;
        }
        if let Some(v) = env("STRAYLIGHT_RULES_FILE") {
            self.paths.rules_file = Some(v);
        }
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML does not parse.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: OrchestratorConfig =
            toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }
}

fn override_parse<T: std::str::FromStr>(
    env: impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(parsed) => *slot = parsed,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Engine config ───────────────────────────────────────────────

/// Execution engine settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Worker pool width: maximum containers running per workflow.
    pub max_concurrent: usize,
    /// Concurrency cap for per-element fan-out inside one invocation.
    pub fanout_concurrent: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 3,
            fanout_concurrent: 4,
        }
    }
}

// ── Sandbox config ──────────────────────────────────────────────

/// Container sandbox settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Per-container memory cap in MiB.
    pub memory_mb: u32,
    /// Per-container CPU quota as a percentage of one core.
    pub cpu_percent: u32,
    /// Optional registry prefix for image pulls.
    pub registry_mirror: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_percent: 50,
            registry_mirror: None,
        }
    }
}

// ── Phase budgets ───────────────────────────────────────────────

/// Wall-clock budget per phase, in milliseconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PhaseBudgetConfig {
    pub recon_ms: u64,
    pub analyze_ms: u64,
    pub exploit_ms: u64,
}

impl Default for PhaseBudgetConfig {
    fn default() -> Self {
        Self {
            recon_ms: 15 * 60 * 1000,
            analyze_ms: 30 * 60 * 1000,
            exploit_ms: 45 * 60 * 1000,
        }
    }
}

impl PhaseBudgetConfig {
    /// Budget for the given phase.
    pub fn budget(&self, phase: PhaseName) -> Duration {
        let ms = match phase {
            PhaseName::Recon => self.recon_ms,
            PhaseName::Analyze => self.analyze_ms,
            PhaseName::Exploit => self.exploit_ms,
        };
        Duration::from_millis(ms)
    }
}

// ── Planner config ──────────────────────────────────────────────

/// Reasoning service settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PlannerConfig {
    /// Base URL of the reasoning service; `None` runs fallback-only.
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    /// Per-call timeout in seconds.
    pub timeout_seconds: u64,
    /// Minimum recommendations expected per phase before the critique
    /// retry and synthesized cross-product kick in.
    pub recon_floor: usize,
    pub analyze_floor: usize,
    pub exploit_floor: usize,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            timeout_seconds: 60,
            recon_floor: 5,
            analyze_floor: 3,
            exploit_floor: 1,
        }
    }
}

impl PlannerConfig {
    /// Recommendation floor for the given phase.
    pub fn floor(&self, phase: PhaseName) -> usize {
        match phase {
            PhaseName::Recon => self.recon_floor,
            PhaseName::Analyze => self.analyze_floor,
            PhaseName::Exploit => self.exploit_floor,
        }
    }
}

// ── Approval config ─────────────────────────────────────────────

/// Approval gate settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Seconds a pending approval waits before expiring as rejected.
    pub timeout_seconds: u64,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30 * 60,
        }
    }
}

// ── Retention config ────────────────────────────────────────────

/// Workflow retention settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Hours a terminal workflow is kept before the sweep drops it.
    pub workflow_hours: u64,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { workflow_hours: 24 }
    }
}

// ── Paths config ────────────────────────────────────────────────

/// Filesystem paths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database path for the durable event sink; empty disables
    /// persistence.
    pub events_db: String,
    /// Directory for rotated JSON logs.
    pub logs_dir: String,
    /// Optional TOML file with restraint rules.
    pub rules_file: Option<String>,
}

impl Default for PathsConfig {
    fn default() -> Self {
        let data_dir = directories::ProjectDirs::from("com", "straylight", "straylight")
            .map(|dirs| dirs.data_local_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("./straylight-data"));
        Self {
            events_db: data_dir.join("events.db").display().to_string(),
            logs_dir: data_dir.join("logs").display().to_string(),
            rules_file: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = OrchestratorConfig::default();
        assert_eq!(config.engine.max_concurrent, 3);
        assert_eq!(config.sandbox.memory_mb, 512);
        assert_eq!(config.sandbox.cpu_percent, 50);
        assert_eq!(config.approval.timeout_seconds, 1800);
        assert_eq!(config.retention.workflow_hours, 24);
        assert_eq!(
            config.phases.budget(PhaseName::Recon),
            Duration::from_secs(15 * 60)
        );
        assert_eq!(
            config.phases.budget(PhaseName::Exploit),
            Duration::from_secs(45 * 60)
        );
        assert_eq!(config.planner.floor(PhaseName::Recon), 5);
    }

    #[test]
    fn test_from_toml() {
        let config = OrchestratorConfig::from_toml(
            r#"
[engine]
max_concurrent = 8

[sandbox]
memory_mb = 1024
registry_mirror = "mirror.internal:5000"

[phases]
recon_ms = 60000

[planner]
base_url = "http://planner:8080"
recon_floor = 3
"#,
        )
        .expect("parse");

        assert_eq!(config.engine.max_concurrent, 8);
        assert_eq!(config.sandbox.memory_mb, 1024);
        assert_eq!(
            config.sandbox.registry_mirror.as_deref(),
            Some("mirror.internal:5000")
        );
        assert_eq!(config.phases.budget(PhaseName::Recon), Duration::from_secs(60));
        // Unset sections keep defaults.
        assert_eq!(config.phases.analyze_ms, 30 * 60 * 1000);
        assert_eq!(config.planner.base_url.as_deref(), Some("http://planner:8080"));
        assert_eq!(config.planner.recon_floor, 3);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = OrchestratorConfig::default();
        config.apply_overrides(|key| match key {
            "MAX_CONCURRENT" => Some("6".to_owned()),
            "CONTAINER_MEMORY_MB" => Some("256".to_owned()),
            "PHASE_TIMEOUT_RECON_MS" => Some("120000".to_owned()),
            "REGISTRY_MIRROR" => Some("mirror.local".to_owned()),
            "WORKFLOW_RETENTION_HOURS" => Some("48".to_owned()),
            "STRAYLIGHT_PLANNER_URL" => Some("http://reasoner:9000".to_owned()),
            _ => None,
        });

        assert_eq!(config.engine.max_concurrent, 6);
        assert_eq!(config.sandbox.memory_mb, 256);
        assert_eq!(config.phases.recon_ms, 120_000);
        assert_eq!(config.sandbox.registry_mirror.as_deref(), Some("mirror.local"));
        assert_eq!(config.retention.workflow_hours, 48);
        assert_eq!(
            config.planner.base_url.as_deref(),
            Some("http://reasoner:9000")
        );
    }

    #[test]
    fn test_invalid_env_override_ignored() {
        let mut config = OrchestratorConfig::default();
        config.apply_overrides(|key| match key {
            "MAX_CONCURRENT" => Some("not-a-number".to_owned()),
            _ => None,
        });
        assert_eq!(config.engine.max_concurrent, 3, "invalid override ignored");
    }

    #[test]
    fn test_config_path_resolution() {
        let path = OrchestratorConfig::config_path_with(|key| {
            (key == "STRAYLIGHT_CONFIG_PATH").then(|| "/etc/straylight.toml".to_owned())
        });
        assert_eq!(path, PathBuf::from("/etc/straylight.toml"));

        let default_path = OrchestratorConfig::config_path_with(|_| None);
        assert_eq!(default_path, PathBuf::from("config.toml"));
    }
}
