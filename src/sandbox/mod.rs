//! Sandbox subsystem: isolated execution environments behind a uniform
//! provider interface, pooled and supervised by [`SandboxManager`].

pub mod channel;
pub mod config;
pub mod container;
pub mod instance;
pub mod local;
pub mod manager;
pub mod microvm;
pub mod provider;

pub use channel::{ExecResult, ExecutionChannel};
pub use config::{AdmissionPolicy, BusyPolicy, NetworkPolicy, PoolConfig, SandboxConfig};
pub use instance::{SandboxInstance, SandboxState};
pub use manager::{PoolStats, SandboxManager};
pub use microvm::MicroVmConfig;
pub use provider::{build_provider, BackendKind, SandboxBackend, SandboxProvider};
