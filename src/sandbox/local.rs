//! Local process provider.
//!
//! Runs commands through `sh -c` inside a per-instance scratch directory.
//! There is no real isolation boundary here; this backend exists for
//! development and tests, where booting a microVM or pulling a container
//! image would be pure overhead.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::channel::{run_child_with_timeout, ExecResult, ExecutionChannel};
use super::config::SandboxConfig;
use super::provider::{BackendKind, HandleData, ProviderHandle, SandboxProvider};
use crate::error::{SandboxError, TransferError};

pub(crate) struct LocalHandle {
    pub dir: PathBuf,
}

pub struct LocalProvider {
    root: PathBuf,
}

impl LocalProvider {
    /// Create a provider rooted at `root`, or under the system temp dir
    /// when none is given.
    pub fn new(root: Option<PathBuf>) -> Result<Self, SandboxError> {
        let root = root.unwrap_or_else(|| std::env::temp_dir().join("cowork-sandboxes"));
        std::fs::create_dir_all(&root)
            .map_err(|e| SandboxError::Provision(format!("cannot create {}: {e}", root.display())))?;
        Ok(Self { root })
    }
}

#[async_trait]
impl SandboxProvider for LocalProvider {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn create(
        &self,
        id: &str,
        _config: &SandboxConfig,
    ) -> Result<ProviderHandle, SandboxError> {
        let dir = self.root.join(id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| SandboxError::Provision(format!("cannot create {}: {e}", dir.display())))?;
        debug!(instance = id, dir = %dir.display(), "local sandbox created");
        Ok(ProviderHandle {
            id: id.to_string(),
            data: HandleData::Local(LocalHandle { dir }),
        })
    }

    async fn destroy(&self, handle: ProviderHandle) -> Result<(), SandboxError> {
        let HandleData::Local(local) = handle.data else {
            return Err(SandboxError::Execution(
                "handle does not belong to the local provider".to_string(),
            ));
        };
        tokio::fs::remove_dir_all(&local.dir)
            .await
            .map_err(|e| SandboxError::Execution(format!("cleanup failed: {e}")))
    }

    async fn open_channel(
        &self,
        handle: &ProviderHandle,
    ) -> Result<Arc<dyn ExecutionChannel>, SandboxError> {
        let HandleData::Local(local) = &handle.data else {
            return Err(SandboxError::Execution(
                "handle does not belong to the local provider".to_string(),
            ));
        };
        Ok(Arc::new(LocalChannel {
            dir: local.dir.clone(),
        }))
    }
}

struct LocalChannel {
    dir: PathBuf,
}

impl LocalChannel {
    /// Map a guest-style path onto the scratch directory. Absolute guest
    /// paths are re-rooted so the channel can never escape its sandbox dir.
    fn resolve(&self, remote_path: &str) -> PathBuf {
        self.dir.join(remote_path.trim_start_matches('/'))
    }

    fn check_reachable(&self) -> Result<(), SandboxError> {
        if self.dir.is_dir() {
            Ok(())
        } else {
            Err(TransferError::Unreachable(format!(
                "sandbox dir {} is gone",
                self.dir.display()
            ))
            .into())
        }
    }
}

#[async_trait]
impl ExecutionChannel for LocalChannel {
    async fn run(&self, command: &str, timeout: Duration) -> Result<ExecResult, SandboxError> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command).current_dir(&self.dir);
        run_child_with_timeout(&mut cmd, timeout).await
    }

    async fn put(&self, bytes: &[u8], remote_path: &str) -> Result<(), SandboxError> {
        self.check_reachable()?;
        let target = self.resolve(remote_path);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::Io(e.to_string()))?;
        }
        tokio::fs::write(&target, bytes)
            .await
            .map_err(|e| TransferError::Io(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, remote_path: &str) -> Result<Vec<u8>, SandboxError> {
        self.check_reachable()?;
        let source = self.resolve(remote_path);
        match tokio::fs::read(&source).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(TransferError::NotFound(remote_path.to_string()).into())
            }
            Err(e) => Err(TransferError::Io(e.to_string()).into()),
        }
    }
}
