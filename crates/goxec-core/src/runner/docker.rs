//! Docker-backed container runner.

use async_trait::async_trait;
use bollard::container::LogOutput;
use bollard::models::{ContainerCreateBody, HostConfig};
use bollard::query_parameters::{
    CreateContainerOptions, CreateImageOptions, LogsOptions, RemoveContainerOptions,
    StartContainerOptions, WaitContainerOptions,
};
use bollard::Docker;
use futures_util::StreamExt;
use tokio::time::Instant;
use uuid::Uuid;

use crate::core_types::RunOutput;
use crate::errors::RunnerError;
use crate::runner::{ContainerRunner, Language};

/// Appended once when a captured stream exceeds its cap.
pub const TRUNCATION_MARKER: &str = "\n<LOG TRUNCATED>";

/// Resource caps applied to every execution container.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Hard memory limit per container.
    pub memory_limit: i64,
    /// Process-count cap, defeating fork bombs.
    pub pids_limit: i64,
    /// Per-stream capture cap for stdout and stderr.
    pub log_cap: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            memory_limit: 512 * 1024 * 1024,
            pids_limit: 64,
            log_cap: 1024 * 1024,
        }
    }
}

impl RunnerConfig {
    pub fn with_memory_limit(mut self, bytes: i64) -> Self {
        self.memory_limit = bytes;
        self
    }

    pub fn with_pids_limit(mut self, limit: i64) -> Self {
        self.pids_limit = limit;
        self
    }

    pub fn with_log_cap(mut self, bytes: usize) -> Self {
        self.log_cap = bytes;
        self
    }
}

/// Executes snippets inside ephemeral Docker containers.
///
/// Containers run with no network, a memory cap, and a pids cap; stdout and
/// stderr are demultiplexed into size-capped buffers. Every created
/// container is force-removed on every exit path via a drop guard.
#[derive(Clone)]
pub struct DockerRunner {
    docker: Docker,
    config: RunnerConfig,
}

impl DockerRunner {
    /// Connect to the local Docker daemon and fail fast if it is
    /// unreachable.
    pub async fn connect(config: RunnerConfig) -> Result<Self, RunnerError> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| RunnerError::RuntimeError(format!("docker connect failed: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| RunnerError::RuntimeError(format!("docker ping failed: {}", e)))?;
        log::info!("Docker daemon reachable");
        Ok(Self { docker, config })
    }

    /// Pull the image unless it is already present, draining the pull
    /// stream completely so the daemon is never left mid-pull.
    async fn ensure_image(&self, image: &str) -> Result<(), RunnerError> {
        if self.docker.inspect_image(image).await.is_ok() {
            return Ok(());
        }

        log::info!("Pulling image {}", image);
        let options = CreateImageOptions {
            from_image: Some(image.to_string()),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            progress.map_err(|e| RunnerError::ImagePullFailed {
                image: image.to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

#[async_trait]
impl ContainerRunner for DockerRunner {
    async fn run(
        &self,
        job_id: &str,
        code: &str,
        language: &str,
        deadline: Instant,
    ) -> Result<RunOutput, RunnerError> {
        let language = Language::from_tag(language)
            .ok_or_else(|| RunnerError::LanguageUnsupported(language.to_string()))?;
        let image = language.image();

        self.ensure_image(image).await?;

        let options = CreateContainerOptions {
            name: Some(format!("goxec-{}", Uuid::new_v4())),
            ..Default::default()
        };
        let body = ContainerCreateBody {
            image: Some(image.to_string()),
            cmd: Some(language.command(code)),
            // Tty must stay off so stdout/stderr remain multiplexed.
            tty: Some(false),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            network_disabled: Some(true),
            host_config: Some(HostConfig {
                memory: Some(self.config.memory_limit),
                pids_limit: Some(self.config.pids_limit),
                ..Default::default()
            }),
            ..Default::default()
        };

        let created = self
            .docker
            .create_container(Some(options), body)
            .await
            .map_err(RunnerError::ContainerCreateFailed)?;
        log::debug!("Created container {} for job {}", created.id, job_id);

        // Armed before start: from here on, every exit path removes the
        // container on a detached task, so a cancelled or timed-out job
        // cannot leak it.
        let _guard = ContainerGuard::new(self.docker.clone(), created.id.clone());

        self.docker
            .start_container(&created.id, None::<StartContainerOptions>)
            .await
            .map_err(RunnerError::ContainerStartFailed)?;

        let mut wait = self
            .docker
            .wait_container(&created.id, None::<WaitContainerOptions>);
        let exit_code = tokio::select! {
            outcome = wait.next() => match outcome {
                Some(Ok(response)) => response.status_code,
                // Bollard reports a non-zero exit through this error kind;
                // the snippet failing is not a runner failure.
                Some(Err(bollard::errors::Error::DockerContainerWaitError { code, .. })) => code,
                Some(Err(e)) => return Err(RunnerError::RuntimeError(e.to_string())),
                None => {
                    return Err(RunnerError::RuntimeError(
                        "container wait stream ended unexpectedly".to_string(),
                    ))
                }
            },
            _ = tokio::time::sleep_until(deadline) => {
                log::warn!("Job {} exceeded its deadline", job_id);
                return Err(RunnerError::Timeout);
            }
        };

        let mut logs = self.docker.logs(
            &created.id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut stdout = CappedBuffer::new(self.config.log_cap);
        let mut stderr = CappedBuffer::new(self.config.log_cap);
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(LogOutput::StdOut { message }) => stdout.write(&message),
                Ok(LogOutput::StdErr { message }) => stderr.write(&message),
                Ok(_) => {}
                Err(e) => return Err(RunnerError::RuntimeError(e.to_string())),
            }
        }

        Ok(RunOutput {
            output: stdout.into_string() + &stderr.into_string(),
            exit_code,
        })
    }
}

/// Removes the container when dropped, on a task detached from the job's
/// own cancellation scope. Must be dropped inside the tokio runtime.
struct ContainerGuard {
    docker: Docker,
    container_id: String,
}

impl ContainerGuard {
    fn new(docker: Docker, container_id: String) -> Self {
        Self {
            docker,
            container_id,
        }
    }
}

impl Drop for ContainerGuard {
    fn drop(&mut self) {
        let docker = self.docker.clone();
        let container_id = std::mem::take(&mut self.container_id);
        tokio::spawn(async move {
            log::debug!("Removing container {}", container_id);
            let options = RemoveContainerOptions {
                force: true,
                ..Default::default()
            };
            if let Err(e) = docker.remove_container(&container_id, Some(options)).await {
                log::error!("Failed to remove container {}: {}", container_id, e);
            }
        });
    }
}

/// Byte buffer with a hard cap; appends a truncation marker exactly once
/// and then drops further writes.
struct CappedBuffer {
    buf: Vec<u8>,
    cap: usize,
    truncated: bool,
}

impl CappedBuffer {
    fn new(cap: usize) -> Self {
        Self {
            buf: Vec::new(),
            cap,
            truncated: false,
        }
    }

    fn write(&mut self, chunk: &[u8]) {
        if self.truncated {
            return;
        }
        if self.buf.len() + chunk.len() > self.cap {
            let remaining = self.cap - self.buf.len();
            self.buf.extend_from_slice(&chunk[..remaining]);
            self.buf.extend_from_slice(TRUNCATION_MARKER.as_bytes());
            self.truncated = true;
            return;
        }
        self.buf.extend_from_slice(chunk);
    }

    fn into_string(self) -> String {
        String::from_utf8_lossy(&self.buf).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capped_buffer_passthrough_below_cap() {
        let mut buf = CappedBuffer::new(16);
        buf.write(b"hello ");
        buf.write(b"world");
        assert_eq!(buf.into_string(), "hello world");
    }

    #[test]
    fn test_capped_buffer_truncates_once() {
        let mut buf = CappedBuffer::new(8);
        buf.write(b"0123456789");
        buf.write(b"more");
        buf.write(b"even more");

        let out = buf.into_string();
        assert_eq!(out, format!("01234567{}", TRUNCATION_MARKER));
        // Bounded by cap plus the marker, no matter how much was written.
        assert!(out.len() <= 8 + TRUNCATION_MARKER.len());
    }

    #[test]
    fn test_capped_buffer_exact_fit_is_not_truncated() {
        let mut buf = CappedBuffer::new(4);
        buf.write(b"abcd");
        assert_eq!(buf.into_string(), "abcd");
    }
}
