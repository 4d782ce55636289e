//! Container execution abstractions and implementations.

pub mod docker;

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Combined stdout+stderr cap per run; excess is truncated with a marker.
pub const OUTPUT_MAX_BYTES: usize = 16 * 1024 * 1024;

/// Marker appended once when output is clipped.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Resource caps applied to a tool container.
#[derive(Debug, Clone, Copy)]
pub struct ResourceLimits {
    /// Memory cap in MiB.
    pub memory_mb: u32,
    /// CPU quota as a percentage of one core.
    pub cpu_percent: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpu_percent: 50,
        }
    }
}

/// Network posture of a tool container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkPosture {
    /// Default bridge network.
    Bridge,
    /// No network; exploit-phase tools run here unless a rule relaxes it.
    Isolated,
}

/// A single container run request.
#[derive(Debug, Clone)]
pub struct RunRequest {
    /// Image reference without any registry mirror prefix.
    pub image: String,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub limits: ResourceLimits,
    /// Hard wall-clock deadline; expiry kills the container.
    pub deadline: Duration,
    pub network: NetworkPosture,
    /// Correlates the container name with the owning invocation.
    pub invocation_id: Uuid,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    /// Container exited on its own.
    Completed {
        /// Raw process exit code.
        exit_code: i64,
    },
    /// Deadline expired; the container was killed.
    TimedOut,
}

/// Last-observed resource usage, best-effort.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunMetrics {
    pub memory_bytes: u64,
    pub cpu_total_usage: u64,
}

/// Captured result of a container run.
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub status: RunStatus,
    /// Combined stdout+stderr, bounded by [`OUTPUT_MAX_BYTES`].
    pub output: String,
    pub truncated: bool,
    pub duration: Duration,
    /// Absent when the stats endpoint raced container exit.
    pub metrics: Option<RunMetrics>,
}

impl RunOutput {
    /// `true` when the container exited zero within the deadline.
    pub fn success(&self) -> bool {
        matches!(self.status, RunStatus::Completed { exit_code: 0 })
    }
}

/// Runner health, checked at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunnerHealth {
    /// Runtime reachable.
    Healthy {
        /// Human-readable diagnostics.
        details: String,
    },
    /// Runtime not reachable; runs will fail with `Host` errors.
    Unavailable {
        /// Human-readable diagnostics.
        details: String,
    },
}

/// Errors produced by runner operations.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The image could not be pulled after retries.
    #[error("image pull failed for {image}: {reason}")]
    ImagePull {
        /// Image reference that failed to pull.
        image: String,
        /// Last error from the registry.
        reason: String,
    },
    /// Container creation or start failed.
    #[error("container start failed: {0}")]
    Start(String),
    /// The container runtime itself failed mid-run.
    #[error("container runtime error: {0}")]
    Host(String),
    /// The workflow's cancellation token fired during the run.
    #[error("run cancelled")]
    Cancelled,
}

/// A runtime capable of executing one bounded, sandboxed container run.
#[async_trait]
pub trait ContainerRunner: Send + Sync {
    /// Run a container to completion, honoring the deadline and the
    /// workflow cancellation token.
    async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, RunnerError>;

    /// Check whether the runtime is reachable.
    async fn health_check(&self) -> RunnerHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = ResourceLimits::default();
        assert_eq!(limits.memory_mb, 512);
        assert_eq!(limits.cpu_percent, 50);
    }

    #[test]
    fn test_run_output_success() {
        let output = RunOutput {
            status: RunStatus::Completed { exit_code: 0 },
            output: String::new(),
            truncated: false,
            duration: Duration::from_secs(1),
            metrics: None,
        };
        assert!(output.success());

        let failed = RunOutput {
            status: RunStatus::Completed { exit_code: 2 },
            ..output.clone()
        };
        assert!(!failed.success());

        let timed_out = RunOutput {
            status: RunStatus::TimedOut,
            ..output
        };
        assert!(!timed_out.success());
    }
}
