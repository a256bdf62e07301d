//! Sandbox provider abstraction.
//!
//! Providers are polymorphic over the isolation technology (microVM,
//! container, local process scratch dir). Each variant knows how to create
//! and destroy an environment instance and how to open an execution channel
//! to it. The concrete variant is selected by configuration, never by
//! runtime type inspection.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::channel::ExecutionChannel;
use super::config::SandboxConfig;
use super::container::{ContainerHandle, ContainerProvider};
use super::local::{LocalHandle, LocalProvider};
use super::microvm::{MicroVmConfig, MicroVmHandle, MicroVmProvider};
use crate::error::SandboxError;

/// The isolation technology behind a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    MicroVm,
    Container,
    Local,
}

/// Opaque handle to one provisioned environment. Owned exclusively by the
/// sandbox manager; callers only ever see the instance id.
pub struct ProviderHandle {
    pub id: String,
    pub(crate) data: HandleData,
}

pub(crate) enum HandleData {
    MicroVm(MicroVmHandle),
    Container(ContainerHandle),
    Local(LocalHandle),
}

impl ProviderHandle {
    pub fn backend(&self) -> BackendKind {
        match self.data {
            HandleData::MicroVm(_) => BackendKind::MicroVm,
            HandleData::Container(_) => BackendKind::Container,
            HandleData::Local(_) => BackendKind::Local,
        }
    }
}

impl std::fmt::Debug for ProviderHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderHandle")
            .field("id", &self.id)
            .field("backend", &self.backend())
            .finish()
    }
}

/// Backend abstraction over environment technologies.
#[async_trait]
pub trait SandboxProvider: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Provision a new environment for the given resource profile.
    async fn create(&self, id: &str, config: &SandboxConfig)
        -> Result<ProviderHandle, SandboxError>;

    /// Tear the environment down and release its resources.
    async fn destroy(&self, handle: ProviderHandle) -> Result<(), SandboxError>;

    /// Open a command/data channel to a running environment.
    async fn open_channel(
        &self,
        handle: &ProviderHandle,
    ) -> Result<Arc<dyn ExecutionChannel>, SandboxError>;
}

/// Declarative backend selection, loaded from configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum SandboxBackend {
    MicroVm(MicroVmConfig),
    Container,
    Local { root: Option<PathBuf> },
}

/// Build the provider for the configured backend.
pub fn build_provider(backend: SandboxBackend) -> Result<Arc<dyn SandboxProvider>, SandboxError> {
    match backend {
        SandboxBackend::MicroVm(config) => Ok(Arc::new(MicroVmProvider::new(config))),
        SandboxBackend::Container => Ok(Arc::new(ContainerProvider::new())),
        SandboxBackend::Local { root } => Ok(Arc::new(LocalProvider::new(root)?)),
    }
}
