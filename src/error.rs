//! Error taxonomy shared across the sandbox and orchestration subsystems.
//!
//! Each failure domain gets its own enum. Sandbox-level failures are surfaced
//! to the tool dispatcher as structured tool-error results rather than
//! aborting a conversation; only resource-cleanup failures on teardown are
//! logged and swallowed.

use std::time::Duration;

use thiserror::Error;

/// File transfer failures, distinguishing "instance unreachable" from
/// "path not found" on the guest side.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("instance unreachable: {0}")]
    Unreachable(String),

    #[error("path not found: {0}")]
    NotFound(String),

    #[error("transfer I/O error: {0}")]
    Io(String),
}

/// Failures raised by the sandbox manager and providers.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No capacity available or guest boot failure.
    #[error("provisioning failed: {0}")]
    Provision(String),

    /// Guest process failure, distinct from a non-zero exit code.
    #[error("execution failed: {0}")]
    Execution(String),

    /// A bounded wait elapsed before the operation completed.
    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// A second concurrent execute hit an instance configured to reject
    /// rather than queue.
    #[error("instance {0} is busy")]
    Busy(String),

    #[error("unknown instance: {0}")]
    UnknownInstance(String),

    /// The instance was already terminated; only idempotent `stop` is
    /// accepted in that state.
    #[error("instance {0} is terminated")]
    Terminated(String),
}

/// Failures from the opaque LLM capability.
#[derive(Debug, Error)]
pub enum CapabilityError {
    #[error("request error: {0}")]
    Request(String),

    #[error("parse error: {0}")]
    Parse(String),

    #[error("empty response from model")]
    EmptyResponse,
}

impl From<reqwest::Error> for CapabilityError {
    fn from(e: reqwest::Error) -> Self {
        CapabilityError::Request(e.to_string())
    }
}

impl From<serde_json::Error> for CapabilityError {
    fn from(e: serde_json::Error) -> Self {
        CapabilityError::Parse(e.to_string())
    }
}

/// Failures raised while dispatching a single tool call. These are fed back
/// to the calling agent as tool-error results so it can recover.
#[derive(Debug, Error)]
pub enum ToolError {
    #[error("unknown tool: {0}")]
    UnknownTool(String),

    #[error("invalid arguments for {tool}: {reason}")]
    InvalidArguments { tool: String, reason: String },

    #[error("invalid tool descriptor: {0}")]
    InvalidDescriptor(String),

    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    #[error("handler error: {0}")]
    Handler(String),
}

/// Conversation-level failures. Limit violations (depth, iterations, cycles)
/// are reported, never silently truncated.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("invalid workflow: {0}")]
    InvalidWorkflow(String),

    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    /// The target agent is already on the active delegation stack.
    #[error("cyclic delegation to '{0}'")]
    CyclicDelegation(String),

    #[error("delegation depth limit ({0}) exceeded")]
    DepthExceeded(usize),

    #[error("iteration limit ({0}) exceeded")]
    IterationExceeded(usize),

    #[error("capability error: {0}")]
    Capability(#[from] CapabilityError),

    #[error("conversation already ended")]
    Ended,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transfer_errors_are_distinguishable() {
        let unreachable = SandboxError::from(TransferError::Unreachable("sb-1".into()));
        let not_found = SandboxError::from(TransferError::NotFound("/tmp/x".into()));

        assert!(unreachable.to_string().contains("unreachable"));
        assert!(not_found.to_string().contains("not found"));
    }

    #[test]
    fn limit_errors_name_the_limit() {
        assert_eq!(
            OrchestratorError::DepthExceeded(3).to_string(),
            "delegation depth limit (3) exceeded"
        );
        assert_eq!(
            OrchestratorError::CyclicDelegation("supervisor".into()).to_string(),
            "cyclic delegation to 'supervisor'"
        );
    }
}
