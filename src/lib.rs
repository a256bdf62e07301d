//! cowork - sandboxed multi-agent task execution.
//!
//! Two subsystems cooperate here. The sandbox manager pools isolated
//! execution environments (microVMs, containers or plain local scratch
//! directories) behind one provider interface and hands out execution
//! channels for commands and file transfer. The orchestrator drives
//! multi-agent conversations over those sandboxes: a supervisor agent faces
//! the user and delegates bounded sub-tasks to worker agents, whose tool
//! calls the dispatcher routes into pooled instances.
//!
//! # Modules
//!
//! - `sandbox` - instance pool, providers and execution channels
//! - `llm` - chat types and model capabilities (Ollama)
//! - `tools` - tool catalogue and dispatch
//! - `orchestrator` - workflow graphs and the conversation state machine
//! - `metrics` - Prometheus observability
//!
//! # Quick Start
//!
//! ```ignore
//! use cowork::sandbox::{PoolConfig, SandboxConfig, SandboxManager};
//! use cowork::sandbox::local::LocalProvider;
//! use std::sync::Arc;
//!
//! let provider = Arc::new(LocalProvider::new(None)?);
//! let manager = SandboxManager::new(provider, PoolConfig::default());
//! let id = manager.start(SandboxConfig::default(), None).await?;
//! let result = manager.execute(&id, "echo hello", None).await?;
//! ```

pub mod error;
pub mod llm;
pub mod metrics;
pub mod orchestrator;
pub mod sandbox;
pub mod tools;
pub mod tracing;

pub use error::{
    CapabilityError, OrchestratorError, SandboxError, ToolError, TransferError,
};
pub use orchestrator::{Orchestrator, OrchestratorLimits, WorkflowDefinition};
pub use sandbox::{PoolConfig, SandboxConfig, SandboxManager};
