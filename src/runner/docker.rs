//! Docker-backed container runner with hardening defaults.
//!
//! Each invocation gets a fresh, short-lived container: read-only root
//! filesystem with a writable `/tmp` tmpfs, all capabilities dropped,
//! `no-new-privileges`, memory and CPU caps, and either bridge or
//! fully isolated networking. Containers are always removed, including
//! after kills.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, InspectContainerOptions,
    KillContainerOptions, LogsOptions, RemoveContainerOptions, StartContainerOptions,
    StatsOptions, WaitContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::Docker;
use rand::Rng;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    ContainerRunner, NetworkPosture, RunMetrics, RunOutput, RunRequest, RunStatus, RunnerError,
    RunnerHealth, OUTPUT_MAX_BYTES, TRUNCATION_MARKER,
};

/// Base delay between pull retries; doubles per attempt with jitter.
const PULL_BACKOFF_BASE_MS: u64 = 500;

/// Maximum pull attempts before the invocation fails.
const PULL_MAX_ATTEMPTS: u32 = 4;

/// Docker-backed runner.
#[derive(Debug, Clone)]
pub struct DockerRunner {
    docker: Docker,
    /// Optional registry prefix for image pulls (mirror support).
    registry_mirror: Option<String>,
}

impl DockerRunner {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns [`RunnerError::Host`] when the daemon socket is not
    /// reachable.
    pub fn new(registry_mirror: Option<String>) -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::Host(e.to_string()))?;
        Ok(Self {
            docker,
            registry_mirror,
        })
    }

    /// Returns true if a Docker daemon is reachable.
    pub async fn docker_available() -> bool {
        match Docker::connect_with_local_defaults() {
            Ok(docker) => docker.ping().await.is_ok(),
            Err(_) => false,
        }
    }

    /// Apply the registry mirror prefix, if configured.
    fn image_ref(&self, image: &str) -> String {
        match &self.registry_mirror {
            Some(mirror) => format!("{}/{image}", mirror.trim_end_matches('/')),
            None => image.to_owned(),
        }
    }

    /// Ensure the image is present locally, pulling with backoff if not.
    async fn ensure_image(&self, image: &str) -> Result<(), RunnerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        let mut last_error = String::new();
        for attempt in 0..PULL_MAX_ATTEMPTS {
            if attempt > 0 {
                let backoff = PULL_BACKOFF_BASE_MS.saturating_mul(2_u64.saturating_pow(attempt.min(8)));
                let jitter = rand::thread_rng().gen_range(0..=backoff / 2);
                tokio::time::sleep(Duration::from_millis(backoff.saturating_add(jitter))).await;
            }

            debug!(image, attempt, "pulling image");
            let options = CreateImageOptions {
                from_image: image.to_owned(),
                ..Default::default()
            };
            let mut stream = self.docker.create_image(Some(options), None, None);
            let mut failed = None;
            while let Some(progress) = stream.next().await {
                if let Err(e) = progress {
                    failed = Some(e.to_string());
                    break;
                }
            }

            match failed {
                None => return Ok(()),
                Some(reason) => {
                    warn!(image, attempt, %reason, "image pull attempt failed");
                    last_error = reason;
                }
            }
        }

        Err(RunnerError::ImagePull {
            image: image.to_owned(),
            reason: last_error,
        })
    }

    /// Kill a container, tolerating already-exited containers.
    async fn kill(&self, name: &str) {
        let result = self
            .docker
            .kill_container(name, Some(KillContainerOptions { signal: "SIGKILL" }))
            .await;
        if let Err(e) = result {
            debug!(container = name, error = %e, "kill returned error (likely already exited)");
        }
    }

    /// Remove a container. Idempotent; errors are logged, never surfaced.
    async fn remove(&self, name: &str) {
        let options = RemoveContainerOptions {
            force: true,
            ..Default::default()
        };
        match self.docker.remove_container(name, Some(options)).await {
            Ok(()) => {}
            Err(BollardError::DockerResponseServerError {
                status_code: 404, ..
            }) => {}
            Err(e) => warn!(container = name, error = %e, "container remove failed"),
        }
    }

    /// One best-effort stats sample.
    async fn sample_stats(&self, name: &str) -> Option<RunMetrics> {
        let options = StatsOptions {
            stream: false,
            one_shot: true,
        };
        let mut stream = self.docker.stats(name, Some(options));
        let stats = stream.next().await?.ok()?;
        Some(RunMetrics {
            memory_bytes: stats.memory_stats.usage.unwrap_or(0),
            cpu_total_usage: stats.cpu_stats.cpu_usage.total_usage,
        })
    }

    /// Start the container and collect its combined output until exit,
    /// deadline expiry, or cancellation.
    async fn drive(
        &self,
        name: &str,
        request: &RunRequest,
        cancel: &CancellationToken,
    ) -> Result<(RunStatus, String, bool, Option<RunMetrics>), RunnerError> {
        self.docker
            .start_container(name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| RunnerError::Start(e.to_string()))?;

        let logs_options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        let mut logs = self.docker.logs(name, Some(logs_options));

        let mut output = String::new();
        let mut truncated = false;
        let deadline = tokio::time::sleep(request.deadline);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                chunk = logs.next() => match chunk {
                    Some(Ok(log)) => {
                        let text = String::from_utf8_lossy(&log.into_bytes()).into_owned();
                        if output.len() < OUTPUT_MAX_BYTES {
                            output.push_str(&text);
                            if output.len() >= OUTPUT_MAX_BYTES {
                                output.truncate(floor_char_boundary(&output, OUTPUT_MAX_BYTES));
                                output.push_str(TRUNCATION_MARKER);
                                truncated = true;
                            }
                        }
                        // Keep draining past the cap so the container is
                        // never blocked on a full log pipe.
                    }
                    Some(Err(e)) => {
                        warn!(container = name, error = %e, "log stream error");
                        break;
                    }
                    None => break,
                },
                () = &mut deadline => {
                    let metrics = self.sample_stats(name).await;
                    self.kill(name).await;
                    return Ok((RunStatus::TimedOut, output, truncated, metrics));
                }
                () = cancel.cancelled() => {
                    self.kill(name).await;
                    return Err(RunnerError::Cancelled);
                }
            }
        }

        let metrics = self.sample_stats(name).await;
        let exit_code = self.wait_exit_code(name).await;
        Ok((
            RunStatus::Completed { exit_code },
            output,
            truncated,
            metrics,
        ))
    }

    /// Read the container's exit code after its log stream ended.
    async fn wait_exit_code(&self, name: &str) -> i64 {
        let mut wait = self
            .docker
            .wait_container(name, None::<WaitContainerOptions<String>>);
        match wait.next().await {
            Some(Ok(response)) => return response.status_code,
            // Some daemon versions surface non-zero exits as a wait error.
            Some(Err(BollardError::DockerContainerWaitError { code, .. })) => return code,
            _ => {}
        }

        // wait_container races removal on some daemons; fall back to inspect.
        let inspected = self
            .docker
            .inspect_container(name, None::<InspectContainerOptions>)
            .await;
        inspected
            .ok()
            .and_then(|state| state.state)
            .and_then(|state| state.exit_code)
            .unwrap_or(-1)
    }
}

#[async_trait::async_trait]
impl ContainerRunner for DockerRunner {
    async fn run(
        &self,
        request: RunRequest,
        cancel: &CancellationToken,
    ) -> Result<RunOutput, RunnerError> {
        let start = Instant::now();
        let image = self.image_ref(&request.image);
        self.ensure_image(&image).await?;

        let name = format!("straylight-{}", request.invocation_id);
        let config = build_container_config(&image, &request);
        let options = CreateContainerOptions {
            name: name.clone(),
            platform: None,
        };
        self.docker
            .create_container(Some(options), config)
            .await
            .map_err(|e| RunnerError::Start(e.to_string()))?;

        let driven = self.drive(&name, &request, cancel).await;

        // Removal is unconditional: kills, timeouts, and cancellations
        // must never leak a container.
        self.remove(&name).await;

        let (status, output, truncated, metrics) = driven?;
        Ok(RunOutput {
            status,
            output,
            truncated,
            duration: start.elapsed(),
            metrics,
        })
    }

    async fn health_check(&self) -> RunnerHealth {
        match self.docker.ping().await {
            Ok(_) => RunnerHealth::Healthy {
                details: "docker daemon reachable".to_owned(),
            },
            Err(e) => RunnerHealth::Unavailable {
                details: e.to_string(),
            },
        }
    }
}

/// Largest index `<= max` that is a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut index = max.min(s.len());
    while index > 0 && !s.is_char_boundary(index) {
        index = index.saturating_sub(1);
    }
    index
}

/// Build the hardened container configuration for one run.
fn build_container_config(image: &str, request: &RunRequest) -> ContainerConfig<String> {
    let memory_limit = i64::from(request.limits.memory_mb)
        .saturating_mul(1024)
        .saturating_mul(1024);

    // 100% of one core == 1e9 nano-CPUs.
    let nano_cpus = i64::from(request.limits.cpu_percent).saturating_mul(10_000_000);

    let mut tmpfs: HashMap<String, String> = HashMap::new();
    tmpfs.insert("/tmp".to_owned(), "rw,size=256m".to_owned());

    let network_mode = match request.network {
        NetworkPosture::Bridge => "bridge",
        NetworkPosture::Isolated => "none",
    };

    let host_config = HostConfig {
        network_mode: Some(network_mode.to_owned()),
        readonly_rootfs: Some(true),
        cap_drop: Some(vec!["ALL".to_owned()]),
        security_opt: Some(vec!["no-new-privileges:true".to_owned()]),
        pids_limit: Some(256),
        memory: Some(memory_limit),
        nano_cpus: Some(nano_cpus),
        tmpfs: Some(tmpfs),
        auto_remove: Some(false),
        ..Default::default()
    };

    let env: Vec<String> = request
        .env
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    ContainerConfig {
        image: Some(image.to_owned()),
        cmd: Some(request.argv.clone()),
        env: Some(env),
        host_config: Some(host_config),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::ResourceLimits;
    use uuid::Uuid;

    fn request(network: NetworkPosture) -> RunRequest {
        RunRequest {
            image: "example/tool:latest".to_owned(),
            argv: vec!["--target".to_owned(), "example.com".to_owned()],
            env: vec![("SCAN_MODE".to_owned(), "passive".to_owned())],
            limits: ResourceLimits::default(),
            deadline: Duration::from_secs(60),
            network,
            invocation_id: Uuid::nil(),
        }
    }

    #[test]
    fn test_container_config_hardening() {
        let config = build_container_config("example/tool:latest", &request(NetworkPosture::Bridge));
        let host = config.host_config.expect("host config");

        assert_eq!(host.readonly_rootfs, Some(true));
        assert_eq!(host.cap_drop, Some(vec!["ALL".to_owned()]));
        assert_eq!(
            host.security_opt,
            Some(vec!["no-new-privileges:true".to_owned()])
        );
        assert_eq!(host.pids_limit, Some(256));
        assert_eq!(host.memory, Some(512 * 1024 * 1024));
        assert_eq!(host.nano_cpus, Some(500_000_000));
        assert_eq!(host.network_mode.as_deref(), Some("bridge"));
        assert!(host.tmpfs.expect("tmpfs").contains_key("/tmp"));
    }

    #[test]
    fn test_isolated_network_mode() {
        let config = build_container_config("example/tool:latest", &request(NetworkPosture::Isolated));
        let host = config.host_config.expect("host config");
        assert_eq!(host.network_mode.as_deref(), Some("none"));
    }

    #[test]
    fn test_env_rendering() {
        let config = build_container_config("example/tool:latest", &request(NetworkPosture::Bridge));
        assert_eq!(config.env, Some(vec!["SCAN_MODE=passive".to_owned()]));
        assert_eq!(
            config.cmd,
            Some(vec!["--target".to_owned(), "example.com".to_owned()])
        );
    }

    #[test]
    fn test_image_ref_mirror() {
        let runner = DockerRunner {
            docker: Docker::connect_with_local_defaults().map_or_else(
                |_| panic!("docker client construction should not require a daemon"),
                |d| d,
            ),
            registry_mirror: Some("mirror.internal:5000/".to_owned()),
        };
        assert_eq!(
            runner.image_ref("projectdiscovery/subfinder:latest"),
            "mirror.internal:5000/projectdiscovery/subfinder:latest"
        );
    }

    #[test]
    fn test_floor_char_boundary() {
        let s = "héllo";
        // Index 2 falls inside the two-byte é.
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 100), s.len());
        assert_eq!(floor_char_boundary(s, 0), 0);
    }
}
