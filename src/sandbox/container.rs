//! Container-backed provider driving the `docker` CLI.
//!
//! Each instance is a long-lived container started with `sh` on stdin;
//! commands run through `docker exec` and transfers through `docker cp`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::channel::{run_child_with_timeout, ExecResult, ExecutionChannel};
use super::config::{NetworkPolicy, SandboxConfig};
use super::provider::{BackendKind, HandleData, ProviderHandle, SandboxProvider};
use crate::error::{SandboxError, TransferError};

pub(crate) struct ContainerHandle {
    pub container_id: String,
}

pub struct ContainerProvider;

impl ContainerProvider {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ContainerProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Run a docker CLI invocation to completion, surfacing stderr on failure.
async fn docker(args: &[&str]) -> Result<std::process::Output, SandboxError> {
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .map_err(|e| SandboxError::Provision(format!("docker not available: {e}")))?;
    Ok(output)
}

fn classify_transfer_failure(stderr: &str, remote_path: &str) -> TransferError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("no such container") || lowered.contains("is not running") {
        TransferError::Unreachable(stderr.trim().to_string())
    } else if lowered.contains("no such file") || lowered.contains("could not find the file") {
        TransferError::NotFound(remote_path.to_string())
    } else {
        TransferError::Io(stderr.trim().to_string())
    }
}

#[async_trait]
impl SandboxProvider for ContainerProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn create(
        &self,
        id: &str,
        config: &SandboxConfig,
    ) -> Result<ProviderHandle, SandboxError> {
        let name = format!("cowork_{id}");
        let cpus = config.vcpus.to_string();
        let memory = format!("{}m", config.memory_mib);
        let network = match config.network {
            NetworkPolicy::None => "none",
            NetworkPolicy::Restricted => "bridge",
            NetworkPolicy::Full => "host",
        };

        let output = docker(&[
            "run", "-d", "--rm", "-i", "--name", &name, "--cpus", &cpus, "--memory", &memory,
            "--network", network, &config.image, "sh",
        ])
        .await?;

        if !output.status.success() {
            return Err(SandboxError::Provision(format!(
                "docker run failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let container_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
        debug!(instance = id, container = %container_id, "container sandbox created");
        Ok(ProviderHandle {
            id: id.to_string(),
            data: HandleData::Container(ContainerHandle { container_id }),
        })
    }

    async fn destroy(&self, handle: ProviderHandle) -> Result<(), SandboxError> {
        let HandleData::Container(container) = handle.data else {
            return Err(SandboxError::Execution(
                "handle does not belong to the container provider".to_string(),
            ));
        };
        let output = docker(&["stop", &container.container_id]).await?;
        if !output.status.success() {
            return Err(SandboxError::Execution(format!(
                "docker stop failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    async fn open_channel(
        &self,
        handle: &ProviderHandle,
    ) -> Result<Arc<dyn ExecutionChannel>, SandboxError> {
        let HandleData::Container(container) = &handle.data else {
            return Err(SandboxError::Execution(
                "handle does not belong to the container provider".to_string(),
            ));
        };
        Ok(Arc::new(ContainerChannel {
            container_id: container.container_id.clone(),
        }))
    }
}

struct ContainerChannel {
    container_id: String,
}

impl ContainerChannel {
    /// Scratch path on the host for staging `docker cp` transfers.
    fn staging_path(&self) -> PathBuf {
        std::env::temp_dir().join(format!("cowork-cp-{}", uuid::Uuid::now_v7()))
    }
}

#[async_trait]
impl ExecutionChannel for ContainerChannel {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let mut cmd = Command::new("docker");
        cmd.args(["exec", &self.container_id, "sh", "-c", command]);
        run_child_with_timeout(&mut cmd, timeout).await
    }

    async fn put(&self, bytes: &[u8], remote_path: &str) -> Result<(), SandboxError> {
        let staging = self.staging_path();
        tokio::fs::write(&staging, bytes)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;

        let staging_str = staging.to_string_lossy().into_owned();
        let dest = format!("{}:{}", self.container_id, remote_path);
        let output = docker(&["cp", &staging_str, &dest]).await;
        let _ = tokio::fs::remove_file(&staging).await;

        let output = output?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_transfer_failure(&stderr, remote_path).into());
        }
        Ok(())
    }

    async fn get(&self, remote_path: &str) -> Result<Vec<u8>, SandboxError> {
        let staging = self.staging_path();
        let staging_str = staging.to_string_lossy().into_owned();
        let src = format!("{}:{}", self.container_id, remote_path);

        let output = docker(&["cp", &src, &staging_str]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let _ = tokio::fs::remove_file(&staging).await;
            return Err(classify_transfer_failure(&stderr, remote_path).into());
        }

        let bytes = tokio::fs::read(&staging)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        let _ = tokio::fs::remove_file(&staging).await;
        Ok(bytes)
    }
}
